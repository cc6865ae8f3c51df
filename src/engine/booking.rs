use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{booking_outcome, BOOKINGS_TOTAL, SPLITS_TOTAL};

use super::availability::split_on_booking;
use super::conflict::{
    check_capacity, check_no_appointment_overlap, checked_span, now_ms, retired_cutoff, validate_event,
    validate_span,
};
use super::{Engine, EngineError};

/// A request to turn (part of) an availability slot into an appointment.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub trainer_id: UserId,
    pub availability_id: Ulid,
    pub span: Span,
    pub recurring: bool,
    pub workout_id: Option<Ulid>,
    pub session_type_id: Option<Ulid>,
    pub notes: Option<String>,
}

/// Who the appointment is for when the trainer books directly.
#[derive(Debug, Clone)]
pub enum BookingParty {
    Client(UserId),
    /// Someone without a platform account.
    Custom(CustomClient),
}

impl Engine {
    /// Client-initiated booking. The appointment starts out REQUESTED.
    pub async fn request_booking(
        &self,
        actor: Actor,
        req: BookingRequest,
    ) -> Result<ScheduleEvent, EngineError> {
        let result = self.request_booking_inner(actor, req).await;
        record_outcome("client", &result);
        result
    }

    async fn request_booking_inner(
        &self,
        actor: Actor,
        req: BookingRequest,
    ) -> Result<ScheduleEvent, EngineError> {
        if actor.role != Role::Client {
            return Err(EngineError::Unauthorized(
                "trainers book through the direct booking path".into(),
            ));
        }
        validate_span(&req.span)?;
        self.require_relationship(req.trainer_id, actor.user_id).await?;
        self.consume_slot(req, Some(actor.user_id), None, EventStatus::Requested, actor.user_id)
            .await
    }

    /// Trainer-initiated booking, optionally for a client without an account.
    /// The appointment is BOOKED immediately.
    pub async fn trainer_book_availability(
        &self,
        actor: Actor,
        party: BookingParty,
        req: BookingRequest,
    ) -> Result<ScheduleEvent, EngineError> {
        let result = self.trainer_book_inner(actor, party, req).await;
        record_outcome("trainer", &result);
        result
    }

    async fn trainer_book_inner(
        &self,
        actor: Actor,
        party: BookingParty,
        req: BookingRequest,
    ) -> Result<ScheduleEvent, EngineError> {
        if actor.role != Role::Trainer || actor.user_id != req.trainer_id {
            return Err(EngineError::Unauthorized(
                "only the owning trainer may book directly".into(),
            ));
        }
        validate_span(&req.span)?;
        let (client_id, custom) = match party {
            BookingParty::Client(client_id) => {
                self.require_relationship(req.trainer_id, client_id).await?;
                (Some(client_id), None)
            }
            BookingParty::Custom(custom) => {
                if !custom.has_name() {
                    return Err(EngineError::Validation("custom client name is required".into()));
                }
                (None, Some(custom))
            }
        };
        self.consume_slot(req, client_id, custom, EventStatus::Booked, actor.user_id)
            .await
    }

    pub(super) async fn require_relationship(&self, trainer_id: UserId, client_id: UserId) -> Result<(), EngineError> {
        if self.gate.is_accepted(trainer_id, client_id).await? {
            Ok(())
        } else {
            Err(EngineError::Unauthorized(format!(
                "no accepted relationship between trainer {trainer_id} and client {client_id}"
            )))
        }
    }

    /// Check the slot and write the appointment while holding the trainer's
    /// calendar lock, so only one booking can ever consume a given slot.
    async fn consume_slot(
        &self,
        req: BookingRequest,
        client_id: Option<UserId>,
        custom_client: Option<CustomClient>,
        status: EventStatus,
        requested_by: UserId,
    ) -> Result<ScheduleEvent, EngineError> {
        let slot_id = req.availability_id;
        let (trainer_id, mut guard) = self.resolve_event_write(&slot_id).await?;
        if trainer_id != req.trainer_id {
            return Err(EngineError::Unauthorized(
                "availability belongs to another trainer".into(),
            ));
        }
        if let Some(by) = guard.retired_slots.get(&slot_id) {
            return Err(EngineError::Conflict(format!(
                "slot {slot_id} was already booked by appointment {by}"
            )));
        }
        let slot = guard
            .get(slot_id)
            .cloned()
            .ok_or(EngineError::NotFound(slot_id))?;

        if slot.event_type != EventType::Availability {
            return Err(EngineError::Validation(format!("{slot_id} is not an availability slot")));
        }
        if slot.status != EventStatus::Open {
            return Err(EngineError::Conflict(format!("slot {slot_id} is no longer open")));
        }
        if !slot.span.contains_span(&req.span) {
            return Err(EngineError::Validation(
                "requested range is outside the slot bounds".into(),
            ));
        }
        if req.recurring
            && (slot.availability_source != AvailabilitySource::Normal || slot.recurrence_rule.is_none())
        {
            return Err(EngineError::Validation(
                "recurring bookings need a recurring (NORMAL) availability slot".into(),
            ));
        }
        check_no_appointment_overlap(&guard, &req.span, None)?;

        let appointment = ScheduleEvent {
            id: Ulid::new(),
            trainer_id,
            client_id,
            span: req.span,
            event_type: EventType::Appointment,
            status,
            availability_source: slot.availability_source,
            recurrence_rule: if req.recurring { slot.recurrence_rule.clone() } else { None },
            recurrence_group_id: if req.recurring {
                Some(slot.recurrence_group_id.unwrap_or_else(Ulid::new))
            } else {
                None
            },
            workout_id: req.workout_id,
            session_type_id: req.session_type_id,
            custom_client,
            title: None,
            notes: req.notes,
            requested_by: Some(requested_by),
            cancelled_by: None,
            version: 1,
        };
        validate_event(&appointment)?;

        let change = match split_on_booking(&slot, &req.span) {
            Some(remainders) => {
                metrics::counter!(SPLITS_TOTAL).increment(1);
                debug!("slot {slot_id} split into {} remainders", remainders.len());
                Change::SlotBooked {
                    appointment: appointment.clone(),
                    slot_id,
                    remainders,
                }
            }
            None => Change::EventCreated {
                event: appointment.clone(),
            },
        };
        let adding = match &change {
            Change::SlotBooked { remainders, .. } => remainders.len(),
            _ => 1,
        };
        check_capacity(&guard, adding)?;
        self.persist_and_apply(&mut guard, &change).await?;
        self.prune_retired(&mut guard, retired_cutoff(now_ms()));

        info!(
            "appointment {} {:?} on trainer {trainer_id} from slot {slot_id}",
            appointment.id, appointment.status
        );
        Ok(appointment)
    }

    /// Trainer moves an appointment through its lifecycle, optionally rescheduling it.
    pub async fn respond_to_booking(
        &self,
        actor: Actor,
        appointment_id: Ulid,
        new_status: EventStatus,
        new_start: Option<Ms>,
        new_end: Option<Ms>,
    ) -> Result<ScheduleEvent, EngineError> {
        let (trainer_id, mut guard) = self.resolve_event_write(&appointment_id).await?;
        if actor.role != Role::Trainer || actor.user_id != trainer_id {
            return Err(EngineError::Unauthorized(
                "only the owning trainer may respond to bookings".into(),
            ));
        }
        let current = guard
            .get(appointment_id)
            .cloned()
            .ok_or(EngineError::NotFound(appointment_id))?;
        if current.event_type != EventType::Appointment {
            return Err(EngineError::Validation(format!("{appointment_id} is not an appointment")));
        }
        check_transition(current.status, new_status)?;

        let span = if new_start.is_some() || new_end.is_some() {
            checked_span(
                new_start.unwrap_or(current.span.start),
                new_end.unwrap_or(current.span.end),
            )?
        } else {
            current.span
        };
        if span == current.span && new_status == current.status {
            return Ok(current);
        }
        if new_status.is_active_commitment() {
            check_no_appointment_overlap(&guard, &span, Some(appointment_id))?;
        }

        let mut updated = current;
        updated.span = span;
        updated.status = new_status;
        if new_status == EventStatus::Cancelled {
            updated.cancelled_by = Some(actor.user_id);
        }
        updated.version += 1;

        self.persist_and_apply(&mut guard, &Change::EventUpdated { event: updated.clone() })
            .await?;
        info!("appointment {appointment_id} now {:?}", updated.status);
        Ok(updated)
    }

    /// Cancel an event. Allowed for the owning trainer and the booked client.
    /// The originating availability is not restored. Completed events stay completed.
    pub async fn cancel_event(&self, actor: Actor, event_id: Ulid) -> Result<ScheduleEvent, EngineError> {
        let (trainer_id, mut guard) = self.resolve_event_write(&event_id).await?;
        let current = guard
            .get(event_id)
            .cloned()
            .ok_or(EngineError::NotFound(event_id))?;

        let is_owner = actor.role == Role::Trainer && actor.user_id == trainer_id;
        let is_client = current.client_id == Some(actor.user_id);
        if !is_owner && !is_client {
            return Err(EngineError::Unauthorized(
                "only the trainer or the booked client may cancel".into(),
            ));
        }
        match current.status {
            EventStatus::Cancelled => return Ok(current),
            EventStatus::Completed => {
                return Err(EngineError::Conflict(format!(
                    "event {event_id} is already completed"
                )));
            }
            _ => {}
        }

        let mut updated = current;
        updated.status = EventStatus::Cancelled;
        updated.cancelled_by = Some(actor.user_id);
        updated.version += 1;

        self.persist_and_apply(&mut guard, &Change::EventUpdated { event: updated.clone() })
            .await?;
        info!("event {event_id} cancelled by {}", actor.user_id);
        Ok(updated)
    }
}

/// REQUESTED → BOOKED → COMPLETED, and REQUESTED or BOOKED → CANCELLED.
/// Same-status moves are reschedules.
fn check_transition(from: EventStatus, to: EventStatus) -> Result<(), EngineError> {
    use EventStatus::*;
    match (from, to) {
        (Cancelled | Completed, _) => Err(EngineError::Conflict(format!(
            "appointment is already {from:?}"
        ))),
        (a, b) if a == b => Ok(()),
        (Requested, Booked) | (Booked, Completed) | (Requested | Booked, Cancelled) => Ok(()),
        _ => Err(EngineError::Validation(format!("cannot move appointment from {from:?} to {to:?}"))),
    }
}

fn record_outcome(path: &'static str, result: &Result<ScheduleEvent, EngineError>) {
    let outcome = booking_outcome(result);
    metrics::counter!(BOOKINGS_TOTAL, "path" => path, "outcome" => outcome).increment(1);
    if let Err(e) = result {
        debug!("{path} booking rejected: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EventStatus::*;

    #[test]
    fn lifecycle_transitions() {
        assert!(check_transition(Requested, Booked).is_ok());
        assert!(check_transition(Booked, Completed).is_ok());
        assert!(check_transition(Requested, Cancelled).is_ok());
        assert!(check_transition(Booked, Booked).is_ok());
        assert!(matches!(check_transition(Booked, Requested), Err(EngineError::Validation(_))));
        assert!(matches!(check_transition(Requested, Completed), Err(EngineError::Validation(_))));
        assert!(matches!(check_transition(Cancelled, Booked), Err(EngineError::Conflict(_))));
        assert!(matches!(check_transition(Cancelled, Cancelled), Err(EngineError::Conflict(_))));
        assert!(matches!(check_transition(Completed, Cancelled), Err(EngineError::Conflict(_))));
    }
}
