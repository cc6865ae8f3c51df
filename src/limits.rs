use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_SPAN_DURATION_MS: Ms = 31 * DAY_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;
/// How long a consumed slot id keeps answering Conflict instead of NotFound.
pub const RETIRED_SLOT_RETENTION_MS: Ms = MAX_QUERY_WINDOW_MS;

pub const MAX_EVENTS_PER_TRAINER: usize = 100_000;

pub const MAX_NOTES_LEN: usize = 4_096;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_RECURRENCE_RULE_LEN: usize = 1_024;
