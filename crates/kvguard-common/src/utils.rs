//! Utility functions for kvguard

use std::time::Duration;

/// Current Unix timestamp in milliseconds
pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Convert a duration to whole milliseconds, saturating at `u64::MAX`.
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
