use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session entry kept for every connected player, refreshed on heartbeat.
///
/// Timestamps are Unix milliseconds so the record can live in a store shared
/// by several processes. Freshness is judged by the store, not from these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Player owning the session.
    pub player_id: String,
    /// Table the player is currently seated at, if any.
    pub table_id: Option<String>,
    /// Tournament the player is registered in, if any.
    pub tournament_id: Option<String>,
    /// Server instance holding the player's connection.
    pub instance_id: String,
    /// When the session was first registered.
    pub connected_at: i64,
    /// Last heartbeat received for this session.
    pub last_activity: i64,
}

/// Opaque proof of lock ownership handed out by `acquire_lock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(Uuid);

impl LockToken {
    /// Allocate a fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Lock entry. Ownership is proven by `token`, never by `owner_instance`.
/// Expiry is tracked by the store from the TTL given at acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    /// Resource name the lock guards.
    pub key: String,
    /// Token of the current owner.
    pub token: LockToken,
    /// Instance that acquired the lock, kept for diagnostics only.
    pub owner_instance: String,
    /// Unix milliseconds at acquisition.
    pub acquired_at: i64,
}

/// Fixed-window counter state returned by the store after one hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitWindow {
    /// Rate-limited subject.
    pub key: String,
    /// Requests counted in the current window, including the current one.
    pub count: u32,
    /// Ceiling configured for the window.
    pub limit: u32,
    /// Time left until the window restarts.
    #[serde(with = "duration_millis")]
    pub reset_in: Duration,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request fits within the limit.
    pub allowed: bool,
    /// Requests still allowed in the current window.
    pub remaining: u32,
    /// Time left until the current window resets.
    #[serde(with = "duration_millis")]
    pub reset_in: Duration,
}

/// Message travelling over a pub/sub channel, stamped by the publishing instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Channel the envelope was published on.
    pub channel: String,
    /// Instance that published it.
    pub sender_instance: String,
    /// Unix timestamp in milliseconds at publish time.
    pub timestamp: i64,
    /// Message body.
    pub payload: serde_json::Value,
}

/// Counts of entries removed by a store purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeCounts {
    /// Expired locks dropped.
    pub locks: usize,
    /// Elapsed rate windows dropped.
    pub rate_windows: usize,
    /// Channels without subscribers dropped.
    pub channels: usize,
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
