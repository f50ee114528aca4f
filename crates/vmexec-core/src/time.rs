//! Timestamp formatting shared across audit logging and persisted records.

use chrono::{NaiveDateTime, Utc};

const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// The current UTC time, formatted `YYYY-MM-DDTHH:MM:SSZ`.
pub fn utc_now() -> String {
    Utc::now().format(FORMAT).to_string()
}

/// Seconds elapsed between `created_at` (as produced by [`utc_now`]) and
/// now. `None` if `created_at` doesn't parse — the caller's `describe`
/// simply omits uptime rather than failing.
pub fn seconds_since(created_at: &str) -> Option<u64> {
    let parsed = NaiveDateTime::parse_from_str(created_at, FORMAT).ok()?.and_utc();
    let elapsed = Utc::now().signed_duration_since(parsed);
    u64::try_from(elapsed.num_seconds()).ok()
}
