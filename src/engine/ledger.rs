use tracing::debug;

use crate::limits::{MAX_METADATA_LEN, MAX_REFERENCE_LEN};
use crate::model::*;

use super::{Engine, SharedEntry, StorageError};

/// Ledger slot for one client reference. `record` is `None` only while the
/// first insert for the reference is in flight (or after it failed).
#[derive(Debug, Default)]
pub(crate) struct LedgerEntry {
    pub(super) record: Option<FulfillmentRecord>,
    /// Lease held by the invocation currently performing side effects.
    /// Never persisted.
    pub(super) claim_expires_at: Option<Ms>,
}

impl LedgerEntry {
    pub(super) fn with_record(record: FulfillmentRecord) -> Self {
        Self {
            record: Some(record),
            claim_expires_at: None,
        }
    }

    pub(super) fn apply(&mut self, event: &Event) {
        if let Some(record) = self.record.as_mut() {
            record.apply(event);
        }
    }

    fn claim_active(&self, now: Ms) -> bool {
        self.claim_expires_at.is_some_and(|e| e > now)
    }
}

pub(super) fn validate_reference(reference: &str) -> Result<(), StorageError> {
    if reference.is_empty() {
        return Err(StorageError::InvalidInput("empty client reference"));
    }
    if reference.len() > MAX_REFERENCE_LEN {
        return Err(StorageError::LimitExceeded("client reference too long"));
    }
    Ok(())
}

fn validate_metadata(metadata: &str) -> Result<(), StorageError> {
    if metadata.len() > MAX_METADATA_LEN {
        return Err(StorageError::LimitExceeded("fulfillment metadata too large"));
    }
    serde_json::from_str::<serde_json::Value>(metadata)
        .map(|_| ())
        .map_err(|_| StorageError::InvalidInput("fulfillment metadata is not JSON"))
}

impl Engine {
    /// Create the record if missing. Caller holds the barrier and the entry.
    async fn open_record(
        &self,
        entry: &mut LedgerEntry,
        reference: &str,
        metadata: &str,
        is_fulfilled: bool,
    ) -> Result<(), StorageError> {
        let created_at = self.clock.now_ms();
        self.wal_append(&Event::FulfillmentOpened {
            reference: reference.to_string(),
            metadata: metadata.to_string(),
            is_fulfilled,
            created_at,
        })
        .await?;
        entry.record = Some(FulfillmentRecord {
            reference: reference.to_string(),
            metadata: metadata.to_string(),
            is_fulfilled,
            created_at,
        });
        Ok(())
    }

    fn writable_entry(&self, reference: &str, metadata: &str) -> Result<SharedEntry, StorageError> {
        validate_reference(reference)?;
        validate_metadata(metadata)?;
        Ok(self.entry_or_default(reference))
    }

    /// Insert-if-absent, then read: the current `is_fulfilled` for
    /// `reference`. Metadata from later calls is ignored.
    pub async fn check_or_insert_fulfillment(
        &self,
        reference: &str,
        metadata: &str,
        initial_status: bool,
    ) -> Result<bool, StorageError> {
        let entry = self.writable_entry(reference, metadata)?;
        let _barrier = self.barrier.read().await;
        let mut entry = entry.lock().await;
        if let Some(record) = &entry.record {
            return Ok(record.is_fulfilled);
        }
        self.open_record(&mut entry, reference, metadata, initial_status)
            .await?;
        Ok(initial_status)
    }

    /// Bookkeeping insert that ignores conflicts. Returns whether a record
    /// was created.
    pub async fn insert_fulfillment(
        &self,
        reference: &str,
        metadata: &str,
        status: bool,
    ) -> Result<bool, StorageError> {
        let entry = self.writable_entry(reference, metadata)?;
        let _barrier = self.barrier.read().await;
        let mut entry = entry.lock().await;
        if entry.record.is_some() {
            return Ok(false);
        }
        self.open_record(&mut entry, reference, metadata, status).await?;
        Ok(true)
    }

    /// Check-or-insert plus the fulfillment claim, in one step. Only a
    /// `Claimed` caller may perform side effects; it must finish with
    /// `complete_fulfillment` or `abandon_fulfillment`.
    pub async fn claim_fulfillment(
        &self,
        reference: &str,
        metadata: &str,
    ) -> Result<FulfillmentGate, StorageError> {
        let entry = self.writable_entry(reference, metadata)?;
        let _barrier = self.barrier.read().await;
        let mut entry = entry.lock().await;
        if entry.record.is_none() {
            self.open_record(&mut entry, reference, metadata, false).await?;
        }
        if entry.record.as_ref().is_some_and(|r| r.is_fulfilled) {
            return Ok(FulfillmentGate::AlreadyFulfilled);
        }
        let now = self.clock.now_ms();
        if entry.claim_active(now) {
            debug!(reference, "fulfillment already claimed");
            return Ok(FulfillmentGate::InProgress);
        }
        entry.claim_expires_at = Some(now + self.policy.claim_lease_ms);
        Ok(FulfillmentGate::Claimed)
    }

    /// Mark fulfilled (no-op when already) and drop any claim.
    pub async fn complete_fulfillment(&self, reference: &str) -> Result<(), StorageError> {
        let entry = self
            .get_entry(reference)
            .ok_or_else(|| StorageError::UnknownReference(reference.to_string()))?;
        let _barrier = self.barrier.read().await;
        let mut entry = entry.lock().await;
        let Some(record) = &entry.record else {
            return Err(StorageError::UnknownReference(reference.to_string()));
        };
        if !record.is_fulfilled {
            let event = Event::FulfillmentCompleted {
                reference: reference.to_string(),
            };
            self.wal_append(&event).await?;
            entry.apply(&event);
        }
        entry.claim_expires_at = None;
        Ok(())
    }

    /// Drop the claim and leave `is_fulfilled` as it is, so a later delivery
    /// can retry.
    pub async fn abandon_fulfillment(&self, reference: &str) {
        if let Some(entry) = self.get_entry(reference) {
            entry.lock().await.claim_expires_at = None;
        }
    }

    pub async fn get_fulfillment(&self, reference: &str) -> Option<FulfillmentRecord> {
        let entry = self.get_entry(reference)?;
        let guard = entry.lock().await;
        guard.record.clone()
    }

    /// All records, oldest first. `unfulfilled_only` narrows to
    /// paid-but-undelivered candidates for reconciliation.
    pub async fn list_fulfillments(&self, unfulfilled_only: bool) -> Vec<FulfillmentRecord> {
        let entries: Vec<SharedEntry> = self.ledger.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for entry in entries {
            let guard = entry.lock().await;
            if let Some(record) = &guard.record
                && !(unfulfilled_only && record.is_fulfilled)
            {
                out.push(record.clone());
            }
        }
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.reference.cmp(&b.reference))
        });
        out
    }
}
