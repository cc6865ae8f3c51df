mod availability;
mod booking;
mod conflict;
mod error;
pub mod interval;
mod mutations;
mod queries;

pub use availability::{merge_plan, split_on_booking, MergePlan};
pub use booking::{BookingParty, BookingRequest};
pub use conflict::{checked_span, now_ms};
pub use error::EngineError;
pub use mutations::{EventDraft, EventPatch};
pub use queries::RangeQuery;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::gate::RelationshipGate;
use crate::ledger::PurchaseLedger;
use crate::model::*;
use crate::wal::Wal;

pub type SharedCalendar = Arc<RwLock<TrainerCalendar>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        change: Change,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        changes: Vec<Change>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends (the batch window).
/// 3. Write and fsync the batch as one unit; a failure leaves no partial records.
/// 4. Send the shared result to every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { change, response } => {
                let mut batch = vec![(change, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { change, response }) => batch.push((change, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Change, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = wal.append_batch(batch.iter().map(|(change, _)| change));
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { changes, response } => {
            let result = Wal::write_compact_file(wal.path(), &changes)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { change, response } => commit_batch(wal, &mut vec![(change, response)]),
    }
}

/// Secondary lookups kept in step with every applied change.
#[derive(Default)]
pub(super) struct Index {
    /// Event id (live event or retired slot) → owning trainer.
    entity_to_trainer: DashMap<Ulid, UserId>,
    /// Workout id → events referencing it.
    workouts: DashMap<Ulid, Vec<Ulid>>,
}

impl Index {
    fn track(&self, event: &ScheduleEvent) {
        self.entity_to_trainer.insert(event.id, event.trainer_id);
        if let Some(wid) = event.workout_id {
            let mut ids = self.workouts.entry(wid).or_default();
            if !ids.contains(&event.id) {
                ids.push(event.id);
            }
        }
    }

    fn untrack_workout(&self, event: &ScheduleEvent) {
        if let Some(wid) = event.workout_id
            && let Some(mut ids) = self.workouts.get_mut(&wid) {
                ids.retain(|id| *id != event.id);
            }
    }

    fn forget(&self, event: &ScheduleEvent) {
        self.entity_to_trainer.remove(&event.id);
        self.untrack_workout(event);
    }
}

/// Apply a change to a calendar (no locking; caller holds the write lock).
fn apply_change(cal: &mut TrainerCalendar, change: &Change, index: &Index) {
    match change {
        Change::EventCreated { event } => {
            cal.upsert_event(event.clone());
            index.track(event);
        }
        Change::EventUpdated { event } => {
            if let Some(old) = cal.remove_event(event.id) {
                index.untrack_workout(&old);
            }
            cal.insert_event(event.clone());
            index.track(event);
        }
        Change::EventDeleted { id, .. } => {
            if let Some(old) = cal.remove_event(*id) {
                index.forget(&old);
            }
        }
        Change::SlotBooked {
            appointment,
            slot_id,
            remainders,
        } => {
            if let Some(old) = cal.remove_event(*slot_id) {
                index.untrack_workout(&old);
            }
            cal.retired_slots.insert(*slot_id, appointment.id);
            cal.insert_event(appointment.clone());
            index.track(appointment);
            for rest in remainders {
                cal.insert_event(rest.clone());
                index.track(rest);
            }
        }
        Change::AvailabilityMerged { survivor, absorbed } => {
            for id in absorbed {
                if let Some(old) = cal.remove_event(*id) {
                    index.forget(&old);
                }
            }
            if let Some(old) = cal.remove_event(survivor.id) {
                index.untrack_workout(&old);
            }
            cal.insert_event(survivor.clone());
            index.track(survivor);
        }
        Change::SlotRetired {
            slot_id,
            trainer_id,
            appointment_id,
        } => {
            cal.retired_slots.insert(*slot_id, *appointment_id);
            index.entity_to_trainer.insert(*slot_id, *trainer_id);
        }
    }
}

pub struct Engine {
    pub(super) calendars: DashMap<UserId, SharedCalendar>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) index: Index,
    pub(super) gate: Arc<dyn RelationshipGate>,
    pub(super) ledger: Arc<dyn PurchaseLedger>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        gate: Arc<dyn RelationshipGate>,
        ledger: Arc<dyn PurchaseLedger>,
    ) -> io::Result<Self> {
        let changes = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            calendars: DashMap::new(),
            wal_tx,
            index: Index::default(),
            gate,
            ledger,
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds. Never use blocking_write here: this may run inside a runtime.
        for change in &changes {
            let cal = engine.calendar_handle(change.trainer_id());
            let Ok(mut guard) = cal.try_write() else {
                return Err(io::Error::other("calendar contended during replay"));
            };
            apply_change(&mut guard, change, &engine.index);
        }
        tracing::info!(
            "replayed {} changes into {} trainer calendars",
            changes.len(),
            engine.calendars.len()
        );
        metrics::gauge!(crate::observability::CALENDARS_LOADED).set(engine.calendars.len() as f64);

        Ok(engine)
    }

    /// Write a change to the WAL via the background group-commit writer.
    async fn wal_append(&self, change: &Change) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                change: change.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_calendar(&self, trainer_id: &UserId) -> Option<SharedCalendar> {
        self.calendars.get(trainer_id).map(|e| e.value().clone())
    }

    pub fn trainer_for_event(&self, event_id: &Ulid) -> Option<UserId> {
        self.index.entity_to_trainer.get(event_id).map(|e| *e.value())
    }

    /// Get the trainer's calendar, creating an empty one on first write.
    fn calendar_handle(&self, trainer_id: UserId) -> SharedCalendar {
        if let Some(cal) = self.get_calendar(&trainer_id) {
            return cal;
        }
        let cal = self
            .calendars
            .entry(trainer_id)
            .or_insert_with(|| Arc::new(RwLock::new(TrainerCalendar::new(trainer_id))))
            .value()
            .clone();
        metrics::gauge!(crate::observability::CALENDARS_LOADED).set(self.calendars.len() as f64);
        cal
    }

    pub(super) async fn calendar_write(&self, trainer_id: UserId) -> OwnedRwLockWriteGuard<TrainerCalendar> {
        self.calendar_handle(trainer_id).write_owned().await
    }

    /// WAL-append then apply, under the caller's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        cal: &mut TrainerCalendar,
        change: &Change,
    ) -> Result<(), EngineError> {
        self.wal_append(change).await?;
        apply_change(cal, change, &self.index);
        Ok(())
    }

    /// Drop stale retired slots from a locked calendar and the index. The log
    /// keeps them until the next compaction skips them.
    pub(super) fn prune_retired(&self, cal: &mut TrainerCalendar, cutoff: Ms) {
        for slot_id in cal.prune_retired(cutoff) {
            self.index.entity_to_trainer.remove(&slot_id);
        }
    }

    /// Lookup event → trainer, acquire that calendar's write lock.
    pub(super) async fn resolve_event_write(
        &self,
        event_id: &Ulid,
    ) -> Result<(UserId, OwnedRwLockWriteGuard<TrainerCalendar>), EngineError> {
        let trainer_id = self
            .trainer_for_event(event_id)
            .ok_or(EngineError::NotFound(*event_id))?;
        let cal = self
            .get_calendar(&trainer_id)
            .ok_or(EngineError::NotFound(*event_id))?;
        Ok((trainer_id, cal.write_owned().await))
    }

    /// Snapshot of every calendar handle; lets callers await without holding map shards.
    pub(super) fn calendar_handles(&self) -> Vec<SharedCalendar> {
        self.calendars.iter().map(|e| e.value().clone()).collect()
    }
}
