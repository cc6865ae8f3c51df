use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. Every stored instant uses this type.
pub type Ms = i64;

/// Identity of a platform account (trainer or client).
pub type UserId = Ulid;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Half-open overlap: touching spans do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Overlap with inclusive boundaries, so adjacent spans count.
    pub fn touches(&self, other: &Span) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Availability,
    Appointment,
    Independent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Open,
    Requested,
    Booked,
    Completed,
    Cancelled,
}

impl EventStatus {
    /// Statuses that occupy the trainer's time when attached to an appointment.
    pub fn is_active_commitment(self) -> bool {
        matches!(self, Self::Requested | Self::Booked | Self::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AvailabilitySource {
    /// Materialized from a recurrence template.
    Normal,
    /// Hand-authored single slot.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Trainer,
    Client,
}

/// The acting identity, passed explicitly into every engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn trainer(user_id: UserId) -> Self {
        Self { user_id, role: Role::Trainer }
    }

    pub fn client(user_id: UserId) -> Self {
        Self { user_id, role: Role::Client }
    }
}

/// Who is looking at a calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Viewer {
    Authenticated(Actor),
    Public,
}

/// Contact details for a client without a platform account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomClient {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl CustomClient {
    pub fn has_name(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.trim().is_empty())
    }
}

/// A single calendar entry: availability slots and appointments alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEvent {
    pub id: Ulid,
    pub trainer_id: UserId,
    pub client_id: Option<UserId>,
    pub span: Span,
    pub event_type: EventType,
    pub status: EventStatus,
    pub availability_source: AvailabilitySource,
    pub recurrence_rule: Option<String>,
    pub recurrence_group_id: Option<Ulid>,
    pub workout_id: Option<Ulid>,
    pub session_type_id: Option<Ulid>,
    pub custom_client: Option<CustomClient>,
    pub title: Option<String>,
    pub notes: Option<String>,
    pub requested_by: Option<UserId>,
    pub cancelled_by: Option<UserId>,
    /// Bumped on every in-place transition; used for optimistic updates.
    pub version: u64,
}

impl ScheduleEvent {
    /// A fresh OPEN MANUAL availability slot with no client.
    pub fn open_slot(trainer_id: UserId, span: Span) -> Self {
        Self {
            id: Ulid::new(),
            trainer_id,
            client_id: None,
            span,
            event_type: EventType::Availability,
            status: EventStatus::Open,
            availability_source: AvailabilitySource::Manual,
            recurrence_rule: None,
            recurrence_group_id: None,
            workout_id: None,
            session_type_id: None,
            custom_client: None,
            title: None,
            notes: None,
            requested_by: None,
            cancelled_by: None,
            version: 1,
        }
    }

    pub fn is_open_availability(&self) -> bool {
        self.event_type == EventType::Availability && self.status == EventStatus::Open
    }

    /// Manual, open, non-recurring availability: the only kind that merges and splits.
    pub fn is_consolidatable(&self) -> bool {
        self.is_open_availability()
            && self.availability_source == AvailabilitySource::Manual
            && self.recurrence_rule.is_none()
    }

    /// An appointment that blocks the trainer's time.
    pub fn is_active_appointment(&self) -> bool {
        self.event_type == EventType::Appointment && self.status.is_active_commitment()
    }

    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.trainer_id == user_id || self.client_id == Some(user_id)
    }
}

/// All events of one trainer, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct TrainerCalendar {
    pub trainer_id: UserId,
    pub events: Vec<ScheduleEvent>,
    /// Consumed MANUAL slot id → appointment that consumed it.
    pub retired_slots: HashMap<Ulid, Ulid>,
}

/// True when `appointment_id` was minted before `cutoff`.
pub fn retired_before(appointment_id: &Ulid, cutoff: Ms) -> bool {
    (appointment_id.timestamp_ms() as Ms) < cutoff
}

impl TrainerCalendar {
    pub fn new(trainer_id: UserId) -> Self {
        Self {
            trainer_id,
            events: Vec::new(),
            retired_slots: HashMap::new(),
        }
    }

    /// Insert event maintaining sort order by span.start.
    pub fn insert_event(&mut self, event: ScheduleEvent) {
        let pos = self
            .events
            .binary_search_by_key(&event.span.start, |e| e.span.start)
            .unwrap_or_else(|e| e);
        self.events.insert(pos, event);
    }

    /// Remove event by id.
    pub fn remove_event(&mut self, id: Ulid) -> Option<ScheduleEvent> {
        let pos = self.events.iter().position(|e| e.id == id)?;
        Some(self.events.remove(pos))
    }

    /// Insert or replace (by id), keeping sort order.
    pub fn upsert_event(&mut self, event: ScheduleEvent) {
        self.remove_event(event.id);
        self.insert_event(event);
    }

    /// Forget slots retired before `cutoff`. The retirement time is the
    /// timestamp of the consuming appointment's ULID. Returns the pruned ids.
    pub fn prune_retired(&mut self, cutoff: Ms) -> Vec<Ulid> {
        let stale: Vec<Ulid> = self
            .retired_slots
            .iter()
            .filter(|(_, appt)| retired_before(appt, cutoff))
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.retired_slots.remove(id);
        }
        stale
    }

    pub fn get(&self, id: Ulid) -> Option<&ScheduleEvent> {
        self.events.iter().find(|e| e.id == id)
    }

    /// Return only events whose span overlaps the query window.
    /// Uses binary search to skip events starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &ScheduleEvent> {
        let right_bound = self.events.partition_point(|e| e.span.start < query.end);
        self.events[..right_bound]
            .iter()
            .filter(move |e| e.span.end > query.start)
    }

    /// Events whose span overlaps or touches `query` (inclusive bounds).
    pub fn touching(&self, query: &Span) -> impl Iterator<Item = &ScheduleEvent> {
        let right_bound = self.events.partition_point(|e| e.span.start <= query.end);
        self.events[..right_bound]
            .iter()
            .filter(move |e| e.span.end >= query.start)
    }
}

/// WAL record. Compound transitions are a single record so replay is all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    EventCreated {
        event: ScheduleEvent,
    },
    EventUpdated {
        event: ScheduleEvent,
    },
    EventDeleted {
        id: Ulid,
        trainer_id: UserId,
    },
    /// Appointment written and the manual slot it came from replaced by its remainders.
    SlotBooked {
        appointment: ScheduleEvent,
        slot_id: Ulid,
        remainders: Vec<ScheduleEvent>,
    },
    /// `survivor` is upserted with the merged bounds and `absorbed` slots are removed.
    AvailabilityMerged {
        survivor: ScheduleEvent,
        absorbed: Vec<Ulid>,
    },
    SlotRetired {
        slot_id: Ulid,
        trainer_id: UserId,
        appointment_id: Ulid,
    },
}

impl Change {
    pub fn trainer_id(&self) -> UserId {
        match self {
            Change::EventCreated { event } | Change::EventUpdated { event } => event.trainer_id,
            Change::EventDeleted { trainer_id, .. } | Change::SlotRetired { trainer_id, .. } => {
                *trainer_id
            }
            Change::SlotBooked { appointment, .. } => appointment.trainer_id,
            Change::AvailabilityMerged { survivor, .. } => survivor.trainer_id,
        }
    }
}

// ── Read-side projection ─────────────────────────────────────────

/// Anonymized placeholder for time the viewer may not see details of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyBlock {
    pub trainer_id: UserId,
    pub span: Span,
}

/// One row of a calendar view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarEntry {
    Event(ScheduleEvent),
    Busy(BusyBlock),
}

impl CalendarEntry {
    pub fn span(&self) -> Span {
        match self {
            CalendarEntry::Event(e) => e.span,
            CalendarEntry::Busy(b) => b.span,
        }
    }
}
