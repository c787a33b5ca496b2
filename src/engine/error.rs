use ulid::Ulid;

use crate::model::Span;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    NotFound(Ulid),
    /// `mark_booked` named a span no slot has.
    UnknownSpan(Span),
    UnknownReference(String),
    /// The slot is booked under a different reference.
    AlreadyBooked { slot_id: Ulid, reference: String },
    /// The slot is under another visitor's live hold.
    HeldByOther(Ulid),
    InvalidSpan(Span),
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::NotFound(id) => write!(f, "slot not found: {id}"),
            StorageError::UnknownSpan(span) => {
                write!(f, "no slot for span [{}, {})", span.start, span.end)
            }
            StorageError::UnknownReference(r) => write!(f, "unknown client reference: {r}"),
            StorageError::AlreadyBooked { slot_id, reference } => {
                write!(f, "slot {slot_id} already booked under reference {reference}")
            }
            StorageError::HeldByOther(id) => write!(f, "slot {id} is held by another visitor"),
            StorageError::InvalidSpan(span) => {
                write!(f, "invalid span [{}, {})", span.start, span.end)
            }
            StorageError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            StorageError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StorageError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}
