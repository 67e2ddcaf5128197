use crate::model::{DAY_MS, Ms};

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const MAX_NOTE_LEN: usize = 4_096;
pub const MAX_STATES: usize = 200_000;
/// Longest single state.
pub const MAX_STATE_DURATION_MS: Ms = 366 * DAY_MS;
/// Longest distance between a rule's effective_from and effective_to.
pub const MAX_RULE_HORIZON_DAYS: i64 = 3 * 366;
pub const MAX_QUERY_WINDOW_MS: Ms = 2 * 366 * DAY_MS;
