use tracing::debug;
use ulid::Ulid;

use crate::limits::MAX_TOKEN_LEN;
use crate::model::*;
use crate::observability;

use super::{Engine, StorageError};

impl Engine {
    /// Lock-and-skip hold acquisition. `None` when the slot is missing, booked,
    /// in the past, actively held, or being changed by another writer right
    /// now. Readers never cause a skip.
    pub async fn acquire_hold(&self, slot_id: Ulid) -> Result<Option<HoldToken>, StorageError> {
        let Some(slot) = self.get_slot(&slot_id) else {
            return Ok(None);
        };
        let _barrier = self.barrier.read().await;
        let Some(_gate) = slot.try_lock() else {
            metrics::counter!(observability::HOLDS_CONTENDED_TOTAL).increment(1);
            debug!(%slot_id, "hold skipped: slot locked");
            return Ok(None);
        };

        let now = self.clock.now_ms();
        if !slot.read().is_acquirable(now) {
            return Ok(None);
        }
        let token = HoldToken::generate();
        let event = Event::HoldAcquired {
            slot_id,
            token: token.clone(),
            expires_at: now + self.policy.initial_hold_ms,
        };
        self.persist_slot(&slot, &event).await?;
        metrics::counter!(observability::HOLDS_ACQUIRED_TOTAL).increment(1);
        Ok(Some(token))
    }

    /// Push the expiry to `now + extension`. Only the token's holder may, and
    /// only while the slot is unbooked.
    pub async fn extend_hold(&self, slot_id: Ulid, token: &HoldToken) -> Result<bool, StorageError> {
        if token.as_str().len() > MAX_TOKEN_LEN {
            return Ok(false);
        }
        let Some(slot) = self.get_slot(&slot_id) else {
            return Ok(false);
        };
        let _barrier = self.barrier.read().await;
        let _gate = slot.lock().await;
        if !slot.read().is_held_by(token) {
            return Ok(false);
        }
        let event = Event::HoldExtended {
            slot_id,
            expires_at: self.clock.now_ms() + self.policy.extension_ms,
        };
        self.persist_slot(&slot, &event).await?;
        Ok(true)
    }

    pub async fn release_hold(&self, slot_id: Ulid, token: &HoldToken) -> Result<bool, StorageError> {
        if token.as_str().len() > MAX_TOKEN_LEN {
            return Ok(false);
        }
        let Some(slot) = self.get_slot(&slot_id) else {
            return Ok(false);
        };
        let _barrier = self.barrier.read().await;
        let _gate = slot.lock().await;
        if !slot.read().is_held_by(token) {
            return Ok(false);
        }
        self.persist_slot(&slot, &Event::HoldReleased { slot_id })
            .await?;
        Ok(true)
    }
}
