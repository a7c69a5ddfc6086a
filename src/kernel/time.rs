//! Shared timestamp/id helpers for audit and capability envelopes.

use ulid::Ulid;

/// Returns unix-epoch seconds as an `f64` (sub-second precision).
pub fn now_secs() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
///
/// Used for human-facing exports; durable rows store `now_secs()`.
pub fn now_epoch_z() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{}Z", secs)
}

/// New ULID string, used for capability and approval ids.
pub fn new_ulid() -> String {
    Ulid::new().to_string()
}

/// Seconds elapsed since midnight UTC, for time-window constraints.
pub fn secs_of_day(now: f64) -> u32 {
    (now as u64 % 86_400) as u32
}
