use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::conflict::{
    check_capacity, check_no_appointment_overlap, checked_span, now_ms, retired_cutoff, validate_event,
};
use super::{Engine, EngineError, WalCommand};

/// Raw calendar entry authored directly by a trainer.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub span: Span,
    pub event_type: EventType,
    /// Defaults to OPEN for availability, BOOKED otherwise.
    pub status: Option<EventStatus>,
    /// Defaults to MANUAL.
    pub availability_source: Option<AvailabilitySource>,
    pub client_id: Option<UserId>,
    pub custom_client: Option<CustomClient>,
    pub recurrence_rule: Option<String>,
    pub recurrence_group_id: Option<Ulid>,
    pub workout_id: Option<Ulid>,
    pub session_type_id: Option<Ulid>,
    pub title: Option<String>,
    pub notes: Option<String>,
}

impl EventDraft {
    pub fn new(span: Span, event_type: EventType) -> Self {
        Self {
            span,
            event_type,
            status: None,
            availability_source: None,
            client_id: None,
            custom_client: None,
            recurrence_rule: None,
            recurrence_group_id: None,
            workout_id: None,
            session_type_id: None,
            title: None,
            notes: None,
        }
    }
}

/// Field-wise update; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct EventPatch {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub event_type: Option<EventType>,
    pub status: Option<EventStatus>,
    pub client_id: Option<UserId>,
    pub custom_client: Option<CustomClient>,
    pub title: Option<String>,
    pub notes: Option<String>,
    pub workout_id: Option<Ulid>,
    pub session_type_id: Option<Ulid>,
}

fn require_trainer(actor: &Actor, trainer_id: UserId) -> Result<(), EngineError> {
    if actor.role == Role::Trainer && actor.user_id == trainer_id {
        Ok(())
    } else {
        Err(EngineError::Unauthorized(
            "only the owning trainer may edit this calendar".into(),
        ))
    }
}

impl Engine {
    pub async fn create_event(&self, actor: Actor, draft: EventDraft) -> Result<ScheduleEvent, EngineError> {
        if actor.role != Role::Trainer {
            return Err(EngineError::Unauthorized("only trainers create calendar events".into()));
        }
        let span = checked_span(draft.span.start, draft.span.end)?;
        let status = draft.status.unwrap_or(match draft.event_type {
            EventType::Availability => EventStatus::Open,
            _ => EventStatus::Booked,
        });
        let event = ScheduleEvent {
            id: Ulid::new(),
            trainer_id: actor.user_id,
            client_id: draft.client_id,
            span,
            event_type: draft.event_type,
            status,
            availability_source: draft.availability_source.unwrap_or(AvailabilitySource::Manual),
            recurrence_rule: draft.recurrence_rule,
            recurrence_group_id: draft.recurrence_group_id,
            workout_id: draft.workout_id,
            session_type_id: draft.session_type_id,
            custom_client: draft.custom_client,
            title: draft.title,
            notes: draft.notes,
            requested_by: Some(actor.user_id),
            cancelled_by: None,
            version: 1,
        };
        validate_event(&event)?;

        let mut guard = self.calendar_write(actor.user_id).await;
        if event.is_active_appointment() {
            check_no_appointment_overlap(&guard, &event.span, None)?;
        }
        check_capacity(&guard, 1)?;
        let stored = self.store_with_merge(&mut guard, event, true).await?;
        info!("created {:?} {} on trainer {}", stored.event_type, stored.id, stored.trainer_id);
        Ok(stored)
    }

    /// Apply `patch` to an event. With `expected_version` set, fails with
    /// Conflict unless the stored version still matches.
    pub async fn update_event(
        &self,
        actor: Actor,
        event_id: Ulid,
        patch: EventPatch,
        expected_version: Option<u64>,
    ) -> Result<ScheduleEvent, EngineError> {
        let (trainer_id, mut guard) = self.resolve_event_write(&event_id).await?;
        require_trainer(&actor, trainer_id)?;
        let current = guard
            .get(event_id)
            .cloned()
            .ok_or(EngineError::NotFound(event_id))?;
        if let Some(expected) = expected_version
            && expected != current.version
        {
            return Err(EngineError::Conflict(format!(
                "event {event_id} is at version {}, not {expected}",
                current.version
            )));
        }

        let mut updated = current.clone();
        if patch.start.is_some() || patch.end.is_some() {
            updated.span = checked_span(
                patch.start.unwrap_or(current.span.start),
                patch.end.unwrap_or(current.span.end),
            )?;
        }
        if let Some(t) = patch.event_type {
            updated.event_type = t;
        }
        if let Some(s) = patch.status {
            updated.status = s;
            if s == EventStatus::Cancelled && current.status != EventStatus::Cancelled {
                updated.cancelled_by = Some(actor.user_id);
            }
        }
        if patch.client_id.is_some() {
            updated.client_id = patch.client_id;
        }
        if patch.custom_client.is_some() {
            updated.custom_client = patch.custom_client;
        }
        if patch.title.is_some() {
            updated.title = patch.title;
        }
        if patch.notes.is_some() {
            updated.notes = patch.notes;
        }
        if patch.workout_id.is_some() {
            updated.workout_id = patch.workout_id;
        }
        if patch.session_type_id.is_some() {
            updated.session_type_id = patch.session_type_id;
        }
        // Availability never belongs to a client.
        if updated.event_type == EventType::Availability {
            updated.client_id = None;
            updated.custom_client = None;
            updated.requested_by = Some(actor.user_id);
        }
        if updated == current {
            return Ok(current);
        }
        updated.version += 1;
        validate_event(&updated)?;
        if updated.is_active_appointment() {
            check_no_appointment_overlap(&guard, &updated.span, Some(event_id))?;
        }

        self.store_with_merge(&mut guard, updated, false).await
    }

    pub async fn delete_event(&self, actor: Actor, event_id: Ulid) -> Result<ScheduleEvent, EngineError> {
        let (trainer_id, mut guard) = self.resolve_event_write(&event_id).await?;
        require_trainer(&actor, trainer_id)?;
        let current = guard
            .get(event_id)
            .cloned()
            .ok_or(EngineError::NotFound(event_id))?;

        self.persist_and_apply(&mut guard, &Change::EventDeleted { id: event_id, trainer_id })
            .await?;
        info!("deleted event {event_id} from trainer {trainer_id}");
        Ok(current)
    }

    /// Compact the WAL by rewriting it with only the changes needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Hold every read lock until the writer has swapped files, so no
        // append can land in the old log after its calendar was snapshotted.
        let guards = loop {
            let handles = self.calendar_handles();
            let mut guards = Vec::with_capacity(handles.len());
            for cal in handles {
                guards.push(cal.read_owned().await);
            }
            if guards.len() == self.calendars.len() {
                break guards;
            }
        };

        let cutoff = retired_cutoff(now_ms());
        let mut changes = Vec::new();
        for cal in &guards {
            for event in &cal.events {
                changes.push(Change::EventCreated { event: event.clone() });
            }
            for (slot_id, appointment_id) in &cal.retired_slots {
                if retired_before(appointment_id, cutoff) {
                    continue;
                }
                changes.push(Change::SlotRetired {
                    slot_id: *slot_id,
                    trainer_id: cal.trainer_id,
                    appointment_id: *appointment_id,
                });
            }
        }
        let count = changes.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { changes, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        info!("WAL compacted to {count} records");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
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
}
