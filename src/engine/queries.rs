use futures::future::join_all;
use ulid::Ulid;

use crate::ledger::{summarize, SessionSummary};
use crate::model::*;

use super::conflict::validate_query_window;
use super::interval::{merge_overlapping, subtract_intervals};
use super::{Engine, EngineError};

#[derive(Debug, Clone, Copy)]
pub struct RangeQuery {
    /// Required for public views; a client may omit it to see their own schedule.
    pub trainer_id: Option<UserId>,
    /// Trainer-side filter, or the viewing client's own id.
    pub client_id: Option<UserId>,
    pub span: Span,
    pub include_availability: bool,
}

impl RangeQuery {
    pub fn trainer(trainer_id: UserId, span: Span) -> Self {
        Self {
            trainer_id: Some(trainer_id),
            client_id: None,
            span,
            include_availability: true,
        }
    }
}

fn busy(event: &ScheduleEvent) -> CalendarEntry {
    CalendarEntry::Busy(BusyBlock {
        trainer_id: event.trainer_id,
        span: event.span,
    })
}

/// Availability as strangers see it: bounds only, no notes or people.
fn stripped_slot(event: &ScheduleEvent) -> CalendarEntry {
    let mut slot = event.clone();
    slot.client_id = None;
    slot.custom_client = None;
    slot.requested_by = None;
    slot.cancelled_by = None;
    slot.notes = None;
    slot.title = None;
    slot.workout_id = None;
    slot.session_type_id = None;
    CalendarEntry::Event(slot)
}

/// The trainer's full calendar, optionally narrowed to one client.
fn trainer_view(cal: &TrainerCalendar, q: &RangeQuery) -> Vec<CalendarEntry> {
    cal.overlapping(&q.span)
        .filter(|e| q.include_availability || e.event_type != EventType::Availability)
        .filter(|e| match q.client_id {
            Some(c) => e.client_id == Some(c),
            None => true,
        })
        .map(|e| CalendarEntry::Event(e.clone()))
        .collect()
}

/// A client's view of one trainer: own events, bookable slots, everything
/// else reduced to busy blocks.
fn client_view(cal: &TrainerCalendar, client_id: UserId, q: &RangeQuery) -> Vec<CalendarEntry> {
    let mut taken: Vec<Span> = cal
        .overlapping(&q.span)
        .filter(|e| e.is_active_appointment() && e.client_id != Some(client_id))
        .map(|e| e.span)
        .collect();
    taken.sort_by_key(|s| s.start);
    let taken = merge_overlapping(&taken);

    let mut out = Vec::new();
    for e in cal.overlapping(&q.span) {
        if e.client_id == Some(client_id) {
            out.push(CalendarEntry::Event(e.clone()));
        } else if e.is_open_availability() {
            if !q.include_availability {
                continue;
            }
            // A manual slot fully covered by someone else's appointment is stale.
            if e.is_consolidatable() && subtract_intervals(&[e.span], &taken).is_empty() {
                continue;
            }
            out.push(stripped_slot(e));
        } else if e.is_active_appointment()
            || (e.event_type == EventType::Independent && e.status != EventStatus::Cancelled)
        {
            out.push(busy(e));
        }
    }
    out
}

fn public_view(cal: &TrainerCalendar, span: &Span) -> Vec<CalendarEntry> {
    let mut out = Vec::new();
    for e in cal.overlapping(span) {
        if e.status == EventStatus::Cancelled {
            continue;
        }
        match e.event_type {
            EventType::Availability if e.status == EventStatus::Open => out.push(stripped_slot(e)),
            EventType::Appointment | EventType::Independent => out.push(busy(e)),
            EventType::Availability => {}
        }
    }
    out
}

impl Engine {
    /// Calendar entries overlapping the query window, sanitized for `viewer`.
    pub async fn get_schedule_range(
        &self,
        viewer: Viewer,
        q: RangeQuery,
    ) -> Result<Vec<CalendarEntry>, EngineError> {
        validate_query_window(&q.span)?;

        let mut entries = match viewer {
            Viewer::Public => {
                let trainer_id = q
                    .trainer_id
                    .ok_or_else(|| EngineError::Validation("trainerId is required".into()))?;
                self.with_calendar(trainer_id, |cal| public_view(cal, &q.span)).await
            }
            Viewer::Authenticated(actor) if actor.role == Role::Trainer => match q.trainer_id {
                None => self.with_calendar(actor.user_id, |cal| trainer_view(cal, &q)).await,
                Some(t) if t == actor.user_id => {
                    self.with_calendar(t, |cal| trainer_view(cal, &q)).await
                }
                Some(other) => self.with_calendar(other, |cal| public_view(cal, &q.span)).await,
            },
            Viewer::Authenticated(actor) => {
                if q.client_id.is_some_and(|c| c != actor.user_id) {
                    return Err(EngineError::Unauthorized(
                        "clients may only view their own schedule".into(),
                    ));
                }
                match q.trainer_id {
                    None => return self.client_schedule(actor.user_id, &q.span).await,
                    Some(trainer_id) => {
                        self.require_relationship(trainer_id, actor.user_id).await?;
                        self.with_calendar(trainer_id, |cal| client_view(cal, actor.user_id, &q))
                            .await
                    }
                }
            }
        };
        entries.sort_by_key(|e| e.span().start);
        Ok(entries)
    }

    /// A client's own events across every trainer.
    pub async fn client_schedule(
        &self,
        client_id: UserId,
        span: &Span,
    ) -> Result<Vec<CalendarEntry>, EngineError> {
        validate_query_window(span)?;
        let handles = self.calendar_handles();
        let reads = handles.iter().map(|cal| async move {
            let guard = cal.read().await;
            guard
                .overlapping(span)
                .filter(|e| e.client_id == Some(client_id))
                .map(|e| CalendarEntry::Event(e.clone()))
                .collect::<Vec<_>>()
        });
        let mut entries: Vec<CalendarEntry> = join_all(reads).await.into_iter().flatten().collect();
        entries.sort_by_key(|e| e.span().start);
        Ok(entries)
    }

    async fn with_calendar<T: Default>(
        &self,
        trainer_id: UserId,
        f: impl FnOnce(&TrainerCalendar) -> T,
    ) -> T {
        match self.get_calendar(&trainer_id) {
            Some(cal) => f(&*cal.read().await),
            None => T::default(),
        }
    }

    /// Point read, for the trainer or a participant of the event.
    pub async fn get_event(&self, actor: Actor, event_id: Ulid) -> Result<ScheduleEvent, EngineError> {
        let trainer_id = self
            .trainer_for_event(&event_id)
            .ok_or(EngineError::NotFound(event_id))?;
        let cal = self
            .get_calendar(&trainer_id)
            .ok_or(EngineError::NotFound(event_id))?;
        let guard = cal.read().await;
        let event = guard.get(event_id).ok_or(EngineError::NotFound(event_id))?;
        if !event.is_participant(actor.user_id) {
            return Err(EngineError::Unauthorized(format!(
                "not a participant of event {event_id}"
            )));
        }
        Ok(event.clone())
    }

    /// Every event referencing a workout that `actor` participates in.
    pub async fn events_by_workout(
        &self,
        actor: Actor,
        workout_id: Ulid,
    ) -> Result<Vec<ScheduleEvent>, EngineError> {
        let ids: Vec<Ulid> = self
            .index
            .workouts
            .get(&workout_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        if ids.is_empty() {
            return Err(EngineError::NotFound(workout_id));
        }

        let mut found = Vec::new();
        for id in ids {
            let Some(trainer_id) = self.trainer_for_event(&id) else {
                continue;
            };
            let Some(cal) = self.get_calendar(&trainer_id) else {
                continue;
            };
            let guard = cal.read().await;
            if let Some(e) = guard.get(id)
                && e.workout_id == Some(workout_id)
            {
                found.push(e.clone());
            }
        }
        if found.is_empty() {
            return Err(EngineError::NotFound(workout_id));
        }
        found.retain(|e| e.is_participant(actor.user_id));
        if found.is_empty() {
            return Err(EngineError::Unauthorized(format!(
                "not a participant of workout {workout_id}"
            )));
        }
        found.sort_by_key(|e| e.span.start);
        Ok(found)
    }

    /// Purchased versus completed sessions for one trainer-client pair.
    pub async fn session_summary(
        &self,
        actor: Actor,
        trainer_id: UserId,
        client_id: UserId,
        now: Ms,
    ) -> Result<SessionSummary, EngineError> {
        let allowed = match actor.role {
            Role::Trainer => actor.user_id == trainer_id,
            Role::Client => actor.user_id == client_id,
        };
        if !allowed {
            return Err(EngineError::Unauthorized(
                "only the trainer or the client may view this balance".into(),
            ));
        }

        let purchases = self.ledger.purchases(trainer_id, client_id).await?;
        let completed = match self.get_calendar(&trainer_id) {
            Some(cal) => cal
                .read()
                .await
                .events
                .iter()
                .filter(|e| {
                    e.event_type == EventType::Appointment
                        && e.status == EventStatus::Completed
                        && e.client_id == Some(client_id)
                })
                .count() as u64,
            None => 0,
        };
        Ok(summarize(&purchases, completed, now))
    }
}
