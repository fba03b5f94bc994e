use std::time::SystemTime;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

/// Hand-for-hand, clock and SSE events.
pub mod events;
/// Health check body.
pub mod health;
/// Status report body.
pub mod status;
/// Full and delta replication payloads.
pub mod sync;

/// Milliseconds since the Unix epoch, as stamped on outgoing payloads.
pub fn unix_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn format_system_time(time: SystemTime) -> String {
    OffsetDateTime::from(time)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "invalid-timestamp".into())
}
