/// In-process backend.
pub mod memory;

use std::time::Duration;

use futures::{future::BoxFuture, stream::BoxStream};

use crate::dao::{
    models::{Envelope, LockRecord, LockToken, PurgeCounts, RateLimitWindow, SessionRecord},
    storage::StoreResult,
};

pub use self::memory::MemoryStore;

/// Abstraction over the state shared between server instances: sessions, pub/sub
/// channels, TTL locks and rate-limit windows.
///
/// Every mutating operation must be atomic per key on the backend so that two
/// instances racing on the same lock or window observe a single winner. Callers
/// pass durations only; the backend owns the clock that expires entries.
pub trait CoordinationStore: Send + Sync {
    /// Upsert the session of `record.player_id`, keeping the `connected_at` of an
    /// existing entry and marking it active now. Returns the stored record.
    fn put_session(&self, record: SessionRecord) -> BoxFuture<'static, StoreResult<SessionRecord>>;
    /// Session of `player_id`, optionally only if it was active within the window.
    fn get_session(
        &self,
        player_id: String,
        active_within: Option<Duration>,
    ) -> BoxFuture<'static, StoreResult<Option<SessionRecord>>>;
    /// Drop the session of `player_id`, returning it if present.
    fn remove_session(
        &self,
        player_id: String,
    ) -> BoxFuture<'static, StoreResult<Option<SessionRecord>>>;
    /// All sessions, optionally only those active within the window.
    fn list_sessions(
        &self,
        active_within: Option<Duration>,
    ) -> BoxFuture<'static, StoreResult<Vec<SessionRecord>>>;
    /// Remove sessions idle for longer than `max_idle`.
    fn purge_idle_sessions(&self, max_idle: Duration) -> BoxFuture<'static, StoreResult<usize>>;

    /// Deliver an envelope to current subscribers, returning how many received it.
    fn publish(&self, envelope: Envelope) -> BoxFuture<'static, StoreResult<usize>>;
    /// Open a best-effort, at-most-once stream of envelopes published on `channel`.
    fn subscribe(&self, channel: String) -> StoreResult<BoxStream<'static, Envelope>>;

    /// Install `record` for `ttl` unless a live lock already holds its key.
    fn try_acquire_lock(
        &self,
        record: LockRecord,
        ttl: Duration,
    ) -> BoxFuture<'static, StoreResult<bool>>;
    /// Remove the lock on `key` only if `token` owns it.
    fn release_lock(&self, key: String, token: LockToken) -> BoxFuture<'static, StoreResult<bool>>;
    /// Reset the expiry of a live lock owned by `token` to `ttl` from now.
    fn extend_lock(
        &self,
        key: String,
        token: LockToken,
        ttl: Duration,
    ) -> BoxFuture<'static, StoreResult<bool>>;
    /// Remove the lock on `key` whoever holds it.
    fn force_release_lock(&self, key: String) -> BoxFuture<'static, StoreResult<bool>>;
    /// Live lock on `key`, if any.
    fn lock_holder(&self, key: String) -> BoxFuture<'static, StoreResult<Option<LockRecord>>>;

    /// Count one hit against the fixed window for `key`, restarting it when elapsed.
    fn hit_rate_window(
        &self,
        key: String,
        limit: u32,
        window: Duration,
    ) -> BoxFuture<'static, StoreResult<RateLimitWindow>>;

    /// Drop expired locks, elapsed rate windows and channels without subscribers.
    fn purge_expired(&self) -> BoxFuture<'static, StoreResult<PurgeCounts>>;
    /// Drop all state. Every later call fails with `StoreError::ShutDown`.
    fn close(&self) -> BoxFuture<'static, StoreResult<()>>;
    /// Cheap reachability check.
    fn health_check(&self) -> BoxFuture<'static, StoreResult<()>>;
}
