use ulid::Ulid;

use crate::model::*;

use super::interval::{merge, subtract};
use super::{Engine, EngineError};

// ── Availability manager ─────────────────────────────────────────

/// Result of consolidating one manual open slot with its neighbours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    /// `event` stretched to the merged bounds.
    pub survivor: ScheduleEvent,
    /// Slots swallowed by the survivor, to be deleted.
    pub absorbed: Vec<Ulid>,
}

/// Plan the merge of `event` with every consolidatable slot that overlaps or
/// touches it. Returns `None` when `event` itself is not consolidatable.
///
/// Candidates are re-collected against the grown span until nothing new
/// touches it, so the survivor is maximal even if the calendar was fragmented.
pub fn merge_plan(cal: &TrainerCalendar, event: &ScheduleEvent) -> Option<MergePlan> {
    if !event.is_consolidatable() {
        return None;
    }
    let mut span = event.span;
    let mut absorbed: Vec<Ulid> = Vec::new();

    loop {
        let candidates: Vec<&ScheduleEvent> = cal
            .touching(&span)
            .filter(|e| {
                e.id != event.id
                    && e.trainer_id == event.trainer_id
                    && e.is_consolidatable()
                    && !absorbed.contains(&e.id)
            })
            .collect();
        if candidates.is_empty() {
            break;
        }
        let mut spans: Vec<Span> = candidates.iter().map(|e| e.span).collect();
        spans.push(span);
        span = merge(&spans).unwrap_or(span);
        absorbed.extend(candidates.iter().map(|e| e.id));
    }

    let mut survivor = event.clone();
    if !absorbed.is_empty() {
        survivor.span = span;
        survivor.version += 1;
    }
    Some(MergePlan { survivor, absorbed })
}

/// Replacement slots left after `booked` is carved out of `slot`.
///
/// Returns `None` for NORMAL or recurring slots, which stay untouched by
/// bookings. Otherwise returns 0–2 fresh OPEN MANUAL slots with no client.
pub fn split_on_booking(slot: &ScheduleEvent, booked: &Span) -> Option<Vec<ScheduleEvent>> {
    if slot.availability_source != AvailabilitySource::Manual || slot.recurrence_rule.is_some() {
        return None;
    }
    Some(
        subtract(&slot.span, booked)
            .into_iter()
            .map(|span| ScheduleEvent::open_slot(slot.trainer_id, span))
            .collect(),
    )
}

impl Engine {
    /// Store `event` (new or replacing a same-id record), merging it with its
    /// neighbours in the same WAL record when it is a manual open slot.
    pub(super) async fn store_with_merge(
        &self,
        cal: &mut TrainerCalendar,
        event: ScheduleEvent,
        is_new: bool,
    ) -> Result<ScheduleEvent, EngineError> {
        let (change, stored) = match merge_plan(cal, &event) {
            Some(plan) => {
                if !plan.absorbed.is_empty() {
                    metrics::counter!(crate::observability::MERGES_TOTAL).increment(1);
                    tracing::debug!(
                        "slot {} absorbs {} neighbours on trainer {}",
                        plan.survivor.id,
                        plan.absorbed.len(),
                        plan.survivor.trainer_id
                    );
                }
                let change = Change::AvailabilityMerged {
                    survivor: plan.survivor.clone(),
                    absorbed: plan.absorbed,
                };
                (change, plan.survivor)
            }
            None if is_new => (Change::EventCreated { event: event.clone() }, event),
            None => (Change::EventUpdated { event: event.clone() }, event),
        };
        self.persist_and_apply(cal, &change).await?;
        Ok(stored)
    }

    /// Re-consolidate a manual open slot. No-op when it is already maximal or
    /// not a consolidatable slot.
    pub async fn merge_open_availability(
        &self,
        actor: Actor,
        event_id: Ulid,
    ) -> Result<ScheduleEvent, EngineError> {
        let (trainer_id, mut guard) = self.resolve_event_write(&event_id).await?;
        if actor.role != Role::Trainer || actor.user_id != trainer_id {
            return Err(EngineError::Unauthorized("only the owning trainer may merge slots".into()));
        }
        let event = guard
            .get(event_id)
            .cloned()
            .ok_or(EngineError::NotFound(event_id))?;

        match merge_plan(&guard, &event) {
            Some(plan) if !plan.absorbed.is_empty() => {
                metrics::counter!(crate::observability::MERGES_TOTAL).increment(1);
                let change = Change::AvailabilityMerged {
                    survivor: plan.survivor.clone(),
                    absorbed: plan.absorbed,
                };
                self.persist_and_apply(&mut guard, &change).await?;
                Ok(plan.survivor)
            }
            _ => Ok(event),
        }
    }
}
