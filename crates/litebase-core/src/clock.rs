//! Wall-clock helpers. Coordination timestamps are compared across nodes,
//! so they are taken from the system clock rather than `Instant`.

use std::time::{SystemTime, UNIX_EPOCH};

fn since_epoch() -> std::time::Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    since_epoch().as_secs()
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    since_epoch().as_millis() as u64
}

/// Current unix time in nanoseconds.
pub fn now_nanos() -> u64 {
    since_epoch().as_nanos() as u64
}
