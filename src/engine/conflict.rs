use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Retired slots older than this are forgotten.
pub(crate) fn retired_cutoff(now: Ms) -> Ms {
    now - RETIRED_SLOT_RETENTION_MS
}

/// Build a span from caller input, rejecting empty/inverted and out-of-range bounds.
pub fn checked_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::Validation("end must be after start".into()));
    }
    let span = Span::new(start, end);
    validate_span(&span)?;
    Ok(span)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_query_window(span: &Span) -> Result<(), EngineError> {
    if span.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

fn check_len(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.is_some_and(|v| v.len() > max) {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

pub(crate) fn validate_text(event: &ScheduleEvent) -> Result<(), EngineError> {
    check_len(event.notes.as_deref(), MAX_NOTES_LEN, "notes too long")?;
    check_len(event.title.as_deref(), MAX_NAME_LEN, "title too long")?;
    check_len(event.recurrence_rule.as_deref(), MAX_RECURRENCE_RULE_LEN, "recurrence rule too long")?;
    if let Some(c) = &event.custom_client {
        check_len(c.name.as_deref(), MAX_NAME_LEN, "custom client name too long")?;
        check_len(c.email.as_deref(), MAX_NAME_LEN, "custom client email too long")?;
        check_len(c.phone.as_deref(), MAX_NAME_LEN, "custom client phone too long")?;
    }
    Ok(())
}

/// Shape rules every stored event must satisfy.
pub(crate) fn validate_event(event: &ScheduleEvent) -> Result<(), EngineError> {
    validate_span(&event.span)?;
    validate_text(event)?;
    if event.event_type == EventType::Appointment
        && event.client_id.is_none()
        && !event.custom_client.as_ref().is_some_and(CustomClient::has_name)
    {
        return Err(EngineError::Validation(
            "appointment requires clientId or a custom client name".into(),
        ));
    }
    if event.event_type == EventType::Availability
        && !matches!(event.status, EventStatus::Open | EventStatus::Cancelled)
    {
        return Err(EngineError::Validation(
            "availability status must be OPEN or CANCELLED".into(),
        ));
    }
    if event.event_type == EventType::Availability
        && (event.client_id.is_some() || event.custom_client.is_some())
    {
        return Err(EngineError::Validation(
            "availability cannot carry a client".into(),
        ));
    }
    if event.event_type != EventType::Availability && event.status == EventStatus::Open {
        return Err(EngineError::Validation("only availability can be OPEN".into()));
    }
    Ok(())
}

/// No active appointment (other than `exclude`) may overlap `span`.
pub(crate) fn check_no_appointment_overlap(
    cal: &TrainerCalendar,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    for event in cal.overlapping(span) {
        if Some(event.id) != exclude && event.is_active_appointment() {
            return Err(EngineError::Conflict(format!(
                "overlaps appointment {}",
                event.id
            )));
        }
    }
    Ok(())
}

pub(crate) fn check_capacity(cal: &TrainerCalendar, adding: usize) -> Result<(), EngineError> {
    if cal.events.len() + adding > MAX_EVENTS_PER_TRAINER {
        return Err(EngineError::LimitExceeded("too many events on calendar"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: Ms = 1_717_232_400_000; // 2024-06-01T09:00:00Z
    const H: Ms = 3_600_000;

    fn appointment(trainer: Ulid, start: Ms, end: Ms, status: EventStatus) -> ScheduleEvent {
        let mut e = ScheduleEvent::open_slot(trainer, Span::new(start, end));
        e.event_type = EventType::Appointment;
        e.status = status;
        e.client_id = Some(Ulid::new());
        e
    }

    #[test]
    fn checked_span_rejects_inverted() {
        assert!(matches!(checked_span(T0, T0), Err(EngineError::Validation(_))));
        assert!(matches!(checked_span(T0 + H, T0), Err(EngineError::Validation(_))));
        assert_eq!(checked_span(T0, T0 + H).unwrap(), Span::new(T0, T0 + H));
    }

    #[test]
    fn checked_span_rejects_out_of_range() {
        assert!(matches!(
            checked_span(0, H),
            Err(EngineError::LimitExceeded("timestamp out of range"))
        ));
        assert!(matches!(
            checked_span(T0, T0 + MAX_SPAN_DURATION_MS + 1),
            Err(EngineError::LimitExceeded("span too wide"))
        ));
    }

    #[test]
    fn overlap_ignores_cancelled_and_excluded() {
        let trainer = Ulid::new();
        let mut cal = TrainerCalendar::new(trainer);
        let active = appointment(trainer, T0, T0 + H, EventStatus::Booked);
        cal.insert_event(active.clone());
        cal.insert_event(appointment(trainer, T0 + H, T0 + 2 * H, EventStatus::Cancelled));

        assert!(check_no_appointment_overlap(&cal, &Span::new(T0, T0 + H), None).is_err());
        assert!(check_no_appointment_overlap(&cal, &Span::new(T0, T0 + H), Some(active.id)).is_ok());
        assert!(check_no_appointment_overlap(&cal, &Span::new(T0 + H, T0 + 2 * H), None).is_ok());
    }

    #[test]
    fn appointment_needs_a_client() {
        let mut e = appointment(Ulid::new(), T0, T0 + H, EventStatus::Booked);
        e.client_id = None;
        assert!(matches!(validate_event(&e), Err(EngineError::Validation(_))));
        e.custom_client = Some(CustomClient {
            name: Some("Walk-in".into()),
            ..Default::default()
        });
        assert!(validate_event(&e).is_ok());
    }

    #[test]
    fn availability_rejects_client_fields() {
        let mut slot = ScheduleEvent::open_slot(Ulid::new(), Span::new(T0, T0 + H));
        assert!(validate_event(&slot).is_ok());
        slot.custom_client = Some(CustomClient {
            name: Some("Walk-in".into()),
            ..Default::default()
        });
        assert!(matches!(validate_event(&slot), Err(EngineError::Validation(_))));
        slot.custom_client = None;
        slot.client_id = Some(Ulid::new());
        assert!(matches!(validate_event(&slot), Err(EngineError::Validation(_))));
    }
}
