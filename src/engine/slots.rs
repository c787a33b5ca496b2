use std::sync::Arc;

use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::ledger::validate_reference;
use super::{Engine, SharedSlot, SlotCell, StorageError};

pub(super) fn validate_span(span: &Span) -> Result<(), StorageError> {
    if span.start >= span.end || span.duration_ms() > MAX_SLOT_DURATION_MS {
        return Err(StorageError::InvalidSpan(*span));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(StorageError::InvalidSpan(*span));
    }
    Ok(())
}

/// `Some(AlreadyBooked)` when the slot is already booked under `reference`,
/// `None` when it may be booked now. Another visitor's live hold blocks the
/// booking unless its token is presented.
fn booking_state(
    slot: &Slot,
    reference: &str,
    hold_token: Option<&HoldToken>,
    now: Ms,
) -> Result<Option<BookOutcome>, StorageError> {
    match slot.client_reference() {
        Some(existing) if existing == reference => return Ok(Some(BookOutcome::AlreadyBooked)),
        Some(existing) => {
            return Err(StorageError::AlreadyBooked {
                slot_id: slot.id,
                reference: existing.to_string(),
            });
        }
        None => {}
    }
    if slot.is_actively_held(now) && slot.hold_token() != hold_token {
        return Err(StorageError::HeldByOther(slot.id));
    }
    Ok(None)
}

impl Engine {
    /// Insert new slots. Spans that already exist (or repeat earlier in the
    /// batch) are skipped. The whole batch is validated before anything is
    /// written; after that each slot is logged on its own.
    pub async fn insert_intervals(&self, spans: &[Span]) -> Result<InsertReport, StorageError> {
        if spans.len() > MAX_BATCH_SIZE {
            return Err(StorageError::LimitExceeded("too many intervals in one batch"));
        }
        for span in spans {
            validate_span(span)?;
        }

        let _barrier = self.barrier.read().await;
        let _gate = self.insert_gate.lock().await;
        let mut report = InsertReport::default();
        for span in spans {
            if self.by_span.contains_key(span) {
                report.skipped += 1;
                continue;
            }
            if self.slots.len() >= MAX_SLOTS {
                return Err(StorageError::LimitExceeded("too many slots"));
            }
            let id = Ulid::new();
            self.wal_append(&Event::SlotCreated { id, span: *span }).await?;
            self.slots
                .insert(id, Arc::new(SlotCell::new(Slot::new(id, *span))));
            self.by_span.insert(*span, id);
            report.inserted += 1;
        }
        debug!(
            inserted = report.inserted,
            skipped = report.skipped,
            "inserted intervals"
        );
        Ok(report)
    }

    /// Unbooked slots starting after `now`, ascending by start. Actively held
    /// slots are included with their expiry.
    pub async fn list_bookable(&self, now: Ms) -> Vec<SlotInfo> {
        let candidates: Vec<SharedSlot> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for slot in candidates {
            let guard = slot.read();
            if guard.is_booked() || guard.span.start <= now {
                continue;
            }
            out.push(SlotInfo {
                id: guard.id,
                start: guard.span.start,
                end: guard.span.end,
                hold_expiry: guard.hold_expiry().filter(|&e| e > now),
            });
        }
        out.sort_by_key(|s| (s.start, s.end));
        out
    }

    fn slot_for_span(&self, span: Span) -> Result<SharedSlot, StorageError> {
        let slot_id = self
            .by_span
            .get(&span)
            .map(|e| *e.value())
            .ok_or(StorageError::UnknownSpan(span))?;
        self.get_slot(&slot_id).ok_or(StorageError::NotFound(slot_id))
    }

    /// Whether `mark_booked` with the same arguments would succeed right now.
    /// Lets a caller refuse before doing external work for a slot it cannot
    /// have. Writes nothing.
    pub fn check_bookable(
        &self,
        span: Span,
        reference: &str,
        hold_token: Option<&HoldToken>,
    ) -> Result<(), StorageError> {
        validate_reference(reference)?;
        let slot = self.slot_for_span(span)?;
        booking_state(&slot.read(), reference, hold_token, self.clock.now_ms()).map(|_| ())
    }

    /// Book the slot with exactly `span` under `reference`, clearing any hold
    /// and marking the matching fulfillment record fulfilled in the same step.
    /// A live hold must be the caller's own, shown by `hold_token`.
    pub async fn mark_booked(
        &self,
        span: Span,
        reference: &str,
        hold_token: Option<&HoldToken>,
    ) -> Result<BookOutcome, StorageError> {
        validate_reference(reference)?;
        let slot = self.slot_for_span(span)?;
        let slot_id = slot.read().id;

        let _barrier = self.barrier.read().await;
        let _gate = slot.lock().await;
        let state = booking_state(&slot.read(), reference, hold_token, self.clock.now_ms())?;
        if let Some(done) = state {
            return Ok(done);
        }

        // Locked even when no record exists yet so a concurrent first insert
        // lands on one side of this booking in both memory and the log.
        let entry = self.entry_or_default(reference);
        let mut entry = entry.lock().await;
        let event = Event::SlotBooked {
            slot_id,
            reference: reference.to_string(),
        };
        self.wal_append(&event).await?;
        slot.apply(&event);
        entry.apply(&event);
        metrics::counter!(observability::SLOTS_BOOKED_TOTAL).increment(1);
        Ok(BookOutcome::Booked)
    }
}
