use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::payment::CheckoutSession;

/// Failure reported by an outbound collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalError {
    /// Worth retrying later (timeouts, 5xx, rate limits).
    Transient(String),
    Permanent(String),
}

impl ExternalError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExternalError::Transient(_))
    }
}

impl std::fmt::Display for ExternalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExternalError::Transient(msg) => write!(f, "transient: {msg}"),
            ExternalError::Permanent(msg) => write!(f, "permanent: {msg}"),
        }
    }
}

impl std::error::Error for ExternalError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingRequest {
    pub attendees: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingStatus {
    /// Whether the calendar confirmed the event.
    pub confirmed: bool,
    pub meeting_url: Option<String>,
}

/// Calendar/meeting creation.
#[async_trait]
pub trait SchedulingApi: Send + Sync {
    async fn create_meeting(&self, request: &MeetingRequest) -> Result<MeetingStatus, ExternalError>;
}

/// Mailing-list subscription used to deliver guides and confirmations.
#[async_trait]
pub trait NotificationApi: Send + Sync {
    async fn subscribe(&self, email: &str, tag: Option<&str>) -> Result<(), ExternalError>;
}

/// Checkout-session lookup for the return path.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn retrieve_session(&self, session_id: &str) -> Result<CheckoutSession, ExternalError>;
}
