use tracing::info;

use crate::model::*;
use crate::observability;

use super::{Engine, SharedEntry, SharedSlot, StorageError};

impl Engine {
    /// Events that rebuild the current state. Slots come first so a replayed
    /// `SlotBooked` never flips a record that was opened after the booking;
    /// each record carries its own `is_fulfilled`.
    async fn snapshot(&self) -> Vec<Event> {
        let slot_arcs: Vec<SharedSlot> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut slots = Vec::with_capacity(slot_arcs.len());
        for slot in slot_arcs {
            slots.push(Slot::clone(&slot.read()));
        }
        slots.sort_by_key(|s| (s.span, s.id));

        let mut events = Vec::with_capacity(slots.len() * 2);
        for slot in slots {
            events.push(Event::SlotCreated {
                id: slot.id,
                span: slot.span,
            });
            match slot.state {
                SlotState::Free => {}
                SlotState::Held { token, expires_at } => events.push(Event::HoldAcquired {
                    slot_id: slot.id,
                    token,
                    expires_at,
                }),
                SlotState::Booked { reference } => events.push(Event::SlotBooked {
                    slot_id: slot.id,
                    reference,
                }),
            }
        }

        let entries: Vec<SharedEntry> = self.ledger.iter().map(|e| e.value().clone()).collect();
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(record) = entry.lock().await.record.clone() {
                records.push(record);
            }
        }
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.reference.cmp(&b.reference))
        });
        events.extend(records.into_iter().map(|r| Event::FulfillmentOpened {
            reference: r.reference,
            metadata: r.metadata,
            is_fulfilled: r.is_fulfilled,
            created_at: r.created_at,
        }));
        events
    }

    /// Rewrite the WAL as a snapshot. Mutations wait on the barrier until the
    /// new file is in place. Returns the snapshot length.
    pub async fn compact(&self) -> Result<usize, StorageError> {
        let _barrier = self.barrier.write().await;
        let snapshot = self.snapshot().await;
        let len = snapshot.len();
        self.wal_rewrite(snapshot).await?;
        metrics::counter!(observability::COMPACTIONS_TOTAL).increment(1);
        info!(events = len, "compacted WAL");
        Ok(len)
    }
}
