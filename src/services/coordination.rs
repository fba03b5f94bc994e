use std::{sync::Arc, time::Duration};

use futures::{StreamExt, stream::BoxStream};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::{
    config::CoordinationConfig,
    dao::{
        coordination_store::CoordinationStore,
        models::{
            Envelope, LockRecord, LockToken, PurgeCounts, RateLimitDecision, SessionRecord,
        },
        storage::StoreError,
    },
    dto::unix_millis,
};

const BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Errors surfaced by the coordination layer.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A published payload could not be encoded as JSON.
    #[error("failed to serialize payload for channel `{channel}`")]
    Serialize {
        /// Channel the payload was meant for.
        channel: String,
        /// Encoding failure.
        #[source]
        source: serde_json::Error,
    },
}

/// Result alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Entries removed by one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Idle sessions dropped.
    pub sessions: usize,
    /// Expired locks dropped.
    pub locks: usize,
    /// Elapsed rate windows dropped.
    pub rate_windows: usize,
    /// Channels without subscribers dropped.
    pub channels: usize,
}

impl SweepReport {
    fn new(sessions: usize, purged: PurgeCounts) -> Self {
        Self {
            sessions,
            locks: purged.locks,
            rate_windows: purged.rate_windows,
            channels: purged.channels,
        }
    }

    /// Total number of removed entries.
    pub fn total(&self) -> usize {
        self.sessions + self.locks + self.rate_windows + self.channels
    }
}

/// Live subscription to a pub/sub channel. Dropping it unsubscribes.
pub struct Subscription {
    channel: String,
    stream: BoxStream<'static, Envelope>,
}

impl Subscription {
    /// Channel this subscription listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next envelope; `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.stream.next().await
    }

    /// Stop receiving. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}
}

/// Cross-instance coordination: session registry, pub/sub, TTL locks and rate limits.
///
/// All state lives behind a [`CoordinationStore`], so swapping the in-memory
/// backend for a shared one does not change any call site.
pub struct Coordinator {
    store: Arc<dyn CoordinationStore>,
    instance_id: String,
    config: CoordinationConfig,
}

impl Coordinator {
    /// Build a coordinator for this instance on top of `store`.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        instance_id: impl Into<String>,
        config: CoordinationConfig,
    ) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
            config,
        }
    }

    /// Identifier of this server instance.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Register or refresh the session of `player_id`, owned by this instance.
    pub async fn heartbeat(
        &self,
        player_id: &str,
        table_id: Option<String>,
        tournament_id: Option<String>,
    ) -> CoordinationResult<SessionRecord> {
        let now = unix_millis();
        let record = SessionRecord {
            player_id: player_id.to_string(),
            table_id,
            tournament_id,
            instance_id: self.instance_id.clone(),
            connected_at: now,
            last_activity: now,
        };
        Ok(self.store.put_session(record).await?)
    }

    /// Stored session of `player_id`, online or not.
    pub async fn session(&self, player_id: &str) -> CoordinationResult<Option<SessionRecord>> {
        Ok(self.store.get_session(player_id.to_string(), None).await?)
    }

    /// A player is online iff their session was refreshed within the online window.
    pub async fn is_online(&self, player_id: &str) -> CoordinationResult<bool> {
        Ok(self
            .store
            .get_session(player_id.to_string(), Some(self.config.online_window()))
            .await?
            .is_some())
    }

    /// Instance currently holding the player's connection.
    pub async fn owning_instance(&self, player_id: &str) -> CoordinationResult<Option<String>> {
        Ok(self
            .session(player_id)
            .await?
            .map(|session| session.instance_id))
    }

    /// Forget the session of `player_id`. Returns whether one existed.
    pub async fn remove_session(&self, player_id: &str) -> CoordinationResult<bool> {
        Ok(self
            .store
            .remove_session(player_id.to_string())
            .await?
            .is_some())
    }

    /// Sessions whose player is seated at `table_id`.
    pub async fn sessions_for_table(&self, table_id: &str) -> CoordinationResult<Vec<SessionRecord>> {
        Ok(self
            .store
            .list_sessions(None)
            .await?
            .into_iter()
            .filter(|session| session.table_id.as_deref() == Some(table_id))
            .collect())
    }

    /// Number of sessions currently counted as online.
    pub async fn online_count(&self) -> CoordinationResult<usize> {
        Ok(self
            .store
            .list_sessions(Some(self.config.online_window()))
            .await?
            .len())
    }

    /// Publish `payload` on `channel`, returning how many subscribers received it.
    pub async fn publish(
        &self,
        channel: &str,
        payload: &impl Serialize,
    ) -> CoordinationResult<usize> {
        let payload =
            serde_json::to_value(payload).map_err(|source| CoordinationError::Serialize {
                channel: channel.to_string(),
                source,
            })?;
        let envelope = Envelope {
            channel: channel.to_string(),
            sender_instance: self.instance_id.clone(),
            timestamp: unix_millis(),
            payload,
        };
        Ok(self.store.publish(envelope).await?)
    }

    /// Start receiving envelopes published on `channel` from now on.
    pub fn subscribe(&self, channel: &str) -> CoordinationResult<Subscription> {
        let stream = self.store.subscribe(channel.to_string())?;
        Ok(Subscription {
            channel: channel.to_string(),
            stream,
        })
    }

    /// Try once to take `key` for `ttl`. Returns `None` on contention; never waits.
    pub async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
    ) -> CoordinationResult<Option<LockToken>> {
        let token = LockToken::generate();
        let record = LockRecord {
            key: key.to_string(),
            token,
            owner_instance: self.instance_id.clone(),
            acquired_at: unix_millis(),
        };

        if self.store.try_acquire_lock(record, ttl).await? {
            debug!(key, %token, "lock acquired");
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    /// Retry [`Coordinator::acquire_lock`] up to `attempts` times with jittered
    /// exponential backoff between tries.
    pub async fn acquire_lock_with_backoff(
        &self,
        key: &str,
        ttl: Duration,
        attempts: u32,
    ) -> CoordinationResult<Option<LockToken>> {
        let mut delay = BACKOFF_INITIAL;
        for attempt in 0..attempts.max(1) {
            if let Some(token) = self.acquire_lock(key, ttl).await? {
                return Ok(Some(token));
            }
            if attempt + 1 < attempts {
                let jitter = rand::rng().random_range(0..=delay.as_millis() as u64 / 2);
                sleep(delay + Duration::from_millis(jitter)).await;
                delay = (delay * 2).min(BACKOFF_MAX);
            }
        }
        Ok(None)
    }

    /// Release `key` if `token` still owns it.
    pub async fn release_lock(&self, key: &str, token: LockToken) -> CoordinationResult<bool> {
        Ok(self.store.release_lock(key.to_string(), token).await?)
    }

    /// Push the expiry of a live lock owned by `token` to `ttl` from now.
    pub async fn extend_lock(
        &self,
        key: &str,
        token: LockToken,
        ttl: Duration,
    ) -> CoordinationResult<bool> {
        Ok(self
            .store
            .extend_lock(key.to_string(), token, ttl)
            .await?)
    }

    /// Drop whatever lock holds `key`. Idempotent.
    pub async fn force_release(&self, key: &str) -> CoordinationResult<bool> {
        Ok(self.store.force_release_lock(key.to_string()).await?)
    }

    /// Live lock on `key`, if any.
    pub async fn lock_holder(&self, key: &str) -> CoordinationResult<Option<LockRecord>> {
        Ok(self.store.lock_holder(key.to_string()).await?)
    }

    /// Count one request from `key` against a fixed window of `limit` per `window`.
    pub async fn check_rate_limit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> CoordinationResult<RateLimitDecision> {
        let hit = self
            .store
            .hit_rate_window(key.to_string(), limit, window)
            .await?;

        Ok(RateLimitDecision {
            allowed: hit.count <= hit.limit,
            remaining: hit.limit.saturating_sub(hit.count),
            reset_in: hit.reset_in,
        })
    }

    /// Purge stale sessions, expired locks, elapsed windows and abandoned channels.
    pub async fn sweep(&self) -> CoordinationResult<SweepReport> {
        let sessions = self
            .store
            .purge_idle_sessions(self.config.stale_after())
            .await?;
        let purged = self.store.purge_expired().await?;
        let report = SweepReport::new(sessions, purged);
        if report.total() > 0 {
            debug!(?report, "coordination sweep removed entries");
        }
        Ok(report)
    }

    /// Whether the backing store answers.
    pub async fn health_check(&self) -> CoordinationResult<()> {
        Ok(self.store.health_check().await?)
    }

    /// Drop every session, lock, window and channel and close the store.
    pub async fn shutdown(&self) -> CoordinationResult<()> {
        self.store.close().await?;
        info!(instance = %self.instance_id, "coordination layer shut down");
        Ok(())
    }
}
