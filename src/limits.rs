use crate::model::Ms;

/// Reject timestamps before the epoch or after year 2100.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Widest window a single reservation may span (10 years).
pub const MAX_WINDOW_MS: Ms = 10 * 366 * 86_400_000;

/// End time applied when the caller gives neither an end nor a finite
/// duration ("infinite" reservations run for a year, then re-arm or purge).
pub const DEFAULT_DURATION_MS: Ms = 365 * 86_400_000;

pub const MAX_NAME_LEN: usize = 64;
pub const MAX_ACL_ENTRIES: usize = 1024;

/// Reservation ids are recycled: the counter wraps back to 1 past this.
pub const MAX_RESV_ID: u32 = 9_999_999;

/// Forward day-shifts tested per side when expanding recurrence windows.
pub const RECURRENCE_LOOKAHEAD_DAYS: i32 = 7;

/// Bounded retry count for the "no reservation named" job test when
/// license contention pushes the start time forward.
pub const MAX_RESV_TEST_RETRIES: usize = 5;

/// Depth of the save-signal channel feeding the state writer task.
pub const SAVE_CHANNEL_DEPTH: usize = 64;
