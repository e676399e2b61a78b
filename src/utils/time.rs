//! Wall-clock helpers shared by the task model and the wire codec.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall time as milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Convert epoch milliseconds back into a `SystemTime`.
pub fn millis_to_system_time(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

/// Milliseconds since the Unix epoch for a `SystemTime`, saturating at zero
/// for pre-epoch values.
pub fn system_time_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
