mod availability;
mod compact;
mod error;
mod holds;
mod ledger;
mod slots;

pub use availability::{Recurrence, half_hour_slots, repeat};
pub use error::StorageError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard, RwLock, mpsc, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

use ledger::LedgerEntry;

pub type SharedSlot = Arc<SlotCell>;
pub(crate) type SharedEntry = Arc<Mutex<LedgerEntry>>;

/// Hold and claim durations, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldPolicy {
    pub initial_hold_ms: Ms,
    pub extension_ms: Ms,
    pub claim_lease_ms: Ms,
}

impl Default for HoldPolicy {
    fn default() -> Self {
        Self {
            initial_hold_ms: 60_000,
            extension_ms: 30_000,
            claim_lease_ms: 120_000,
        }
    }
}

/// One slot. Mutators serialize on `gate` for their whole check, log and
/// apply cycle. Readers copy out the committed state and never touch the
/// gate, so a listing cannot make `acquire_hold` skip a free slot.
pub struct SlotCell {
    gate: Mutex<()>,
    committed: std::sync::RwLock<Arc<Slot>>,
}

impl SlotCell {
    fn new(slot: Slot) -> Self {
        Self {
            gate: Mutex::new(()),
            committed: std::sync::RwLock::new(Arc::new(slot)),
        }
    }

    /// Committed state. The returned copy does not follow later changes.
    pub fn read(&self) -> Arc<Slot> {
        self.committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn lock(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.gate.try_lock().ok()
    }

    /// Only called by the gate holder, after the event is durable.
    fn apply(&self, event: &Event) {
        let mut committed = self
            .committed
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::make_mut(&mut committed).apply(event);
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Rewrite {
        snapshot: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Each wakeup drains every append already queued and commits
/// them with one fsync; other commands run between batches.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Vec<PendingAppend> = Vec::new();
    while let Some(cmd) = rx.recv().await {
        let mut next = Some(cmd);
        while let Some(cmd) = next.take() {
            match cmd {
                WalCommand::Append { event, response } => {
                    batch.push((event, response));
                    next = rx.try_recv().ok();
                }
                other => {
                    commit_batch(&mut wal, &mut batch);
                    handle_control(&mut wal, other);
                    next = rx.try_recv().ok();
                }
            }
        }
        commit_batch(&mut wal, &mut batch);
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    if batch.is_empty() {
        return;
    }
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stray bytes never ride along with
    // the next batch; the whole batch is reported failed either way.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Rewrite { snapshot, response } => {
            let _ = response.send(wal.rewrite(&snapshot));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

// ── Replay ───────────────────────────────────────────────

/// Current state rebuilt from an event sequence.
#[derive(Debug, Default)]
pub(super) struct Replayed {
    pub slots: HashMap<Ulid, Slot>,
    pub records: HashMap<String, FulfillmentRecord>,
}

pub(super) fn replay_events(events: &[Event]) -> Replayed {
    let mut state = Replayed::default();
    for event in events {
        match event {
            Event::SlotCreated { id, span } => {
                state.slots.entry(*id).or_insert_with(|| Slot::new(*id, *span));
            }
            Event::HoldAcquired { slot_id, .. }
            | Event::HoldExtended { slot_id, .. }
            | Event::HoldReleased { slot_id } => {
                if let Some(slot) = state.slots.get_mut(slot_id) {
                    slot.apply(event);
                }
            }
            Event::SlotBooked { slot_id, reference } => {
                if let Some(slot) = state.slots.get_mut(slot_id) {
                    slot.apply(event);
                }
                if let Some(record) = state.records.get_mut(reference) {
                    record.apply(event);
                }
            }
            Event::FulfillmentOpened {
                reference,
                metadata,
                is_fulfilled,
                created_at,
            } => {
                state
                    .records
                    .entry(reference.clone())
                    .or_insert_with(|| FulfillmentRecord {
                        reference: reference.clone(),
                        metadata: metadata.clone(),
                        is_fulfilled: *is_fulfilled,
                        created_at: *created_at,
                    });
            }
            Event::FulfillmentCompleted { reference } => {
                if let Some(record) = state.records.get_mut(reference) {
                    record.apply(event);
                }
            }
        }
    }
    state
}

// ── Engine ───────────────────────────────────────────────

/// In-memory slot table and fulfillment ledger backed by the WAL.
///
/// Every mutation holds `barrier` for reading from before its first lock
/// until its event is durable and applied; compaction takes it for writing.
/// Lock order: barrier, slot gate, ledger entry.
pub struct Engine {
    pub(super) slots: DashMap<Ulid, SharedSlot>,
    pub(super) by_span: DashMap<Span, Ulid>,
    pub(super) ledger: DashMap<String, SharedEntry>,
    /// Serializes `insert_intervals` so span uniqueness is check-then-insert.
    pub(super) insert_gate: Mutex<()>,
    pub(super) barrier: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) policy: HoldPolicy,
}

impl Engine {
    pub fn new(wal_path: PathBuf, clock: Arc<dyn Clock>, policy: HoldPolicy) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let Replayed { slots, records } = replay_events(&events);
        info!(
            path = %wal_path.display(),
            events = events.len(),
            slots = slots.len(),
            fulfillments = records.len(),
            "replayed WAL"
        );

        let engine = Self {
            slots: DashMap::new(),
            by_span: DashMap::new(),
            ledger: DashMap::new(),
            insert_gate: Mutex::new(()),
            barrier: RwLock::new(()),
            wal_tx,
            clock,
            policy,
        };
        for (id, slot) in slots {
            engine.by_span.insert(slot.span, id);
            engine.slots.insert(id, Arc::new(SlotCell::new(slot)));
        }
        for (reference, record) in records {
            engine
                .ledger
                .insert(reference, Arc::new(Mutex::new(LedgerEntry::with_record(record))));
        }
        Ok(engine)
    }

    pub fn policy(&self) -> HoldPolicy {
        self.policy
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn get_slot(&self, id: &Ulid) -> Option<SharedSlot> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub(super) fn get_entry(&self, reference: &str) -> Option<SharedEntry> {
        self.ledger.get(reference).map(|e| e.value().clone())
    }

    /// Existing entry for `reference`, or a fresh empty one.
    pub(super) fn entry_or_default(&self, reference: &str) -> SharedEntry {
        self.ledger
            .entry(reference.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(LedgerEntry::default())))
            .value()
            .clone()
    }

    /// Send one event to the group-commit writer and wait until it is durable.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), StorageError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StorageError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StorageError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StorageError::WalError(e.to_string()))
    }

    /// Durably log a slot event, then apply it. The caller holds the slot's gate.
    pub(super) async fn persist_slot(
        &self,
        slot: &SlotCell,
        event: &Event,
    ) -> Result<(), StorageError> {
        self.wal_append(event).await?;
        slot.apply(event);
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub(super) async fn wal_rewrite(&self, snapshot: Vec<Event>) -> Result<(), StorageError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Rewrite {
                snapshot,
                response: tx,
            })
            .await
            .map_err(|_| StorageError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StorageError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StorageError::WalError(e.to_string()))
    }
}
