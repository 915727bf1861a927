/*!
 * Utility functions for Device Orchestra.
 */
use std::time::Duration;

use chrono::Utc;

/// Seconds since the Unix epoch with millisecond resolution
pub fn unix_timestamp() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Convert a duration in seconds to a `Duration`
///
/// Returns `None` for negative, NaN, infinite or too large inputs.
pub fn secs_to_duration(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

/// Convert milliseconds to a duration
pub fn millis_to_duration(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
