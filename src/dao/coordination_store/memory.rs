use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::{
    StreamExt,
    future::{self, BoxFuture},
    stream::BoxStream,
};
use tokio::{sync::broadcast, time::Instant};
use tokio_stream::wrappers::BroadcastStream;

use crate::dao::{
    coordination_store::CoordinationStore,
    models::{Envelope, LockRecord, LockToken, PurgeCounts, RateLimitWindow, SessionRecord},
    storage::{StoreError, StoreResult},
};

/// Default number of undelivered envelopes a channel buffers per subscriber.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Single-process coordination backend built on concurrent maps.
///
/// Suitable for one instance or for tests; a shared backend implementing
/// [`CoordinationStore`] replaces it for horizontal scale-out. Expiry is
/// measured on the tokio clock, so paused-time tests drive it directly.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    sessions: DashMap<String, StoredSession>,
    locks: DashMap<String, HeldLock>,
    rate_windows: DashMap<String, Window>,
    channels: DashMap<String, broadcast::Sender<Envelope>>,
    channel_capacity: usize,
    closed: AtomicBool,
}

struct StoredSession {
    record: SessionRecord,
    last_seen: Instant,
}

impl StoredSession {
    fn active_within(&self, window: Option<Duration>, now: Instant) -> bool {
        window.is_none_or(|window| now.saturating_duration_since(self.last_seen) <= window)
    }
}

struct HeldLock {
    record: LockRecord,
    expires_at: Instant,
}

impl HeldLock {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

struct Window {
    count: u32,
    reset_at: Instant,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl MemoryStore {
    /// Build an empty store whose pub/sub channels buffer `channel_capacity` envelopes.
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                sessions: DashMap::new(),
                locks: DashMap::new(),
                rate_windows: DashMap::new(),
                channels: DashMap::new(),
                channel_capacity: channel_capacity.max(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::ShutDown);
        }
        Ok(())
    }

    fn upsert_session(&self, mut record: SessionRecord) -> SessionRecord {
        let now = Instant::now();
        match self.inner.sessions.entry(record.player_id.clone()) {
            Entry::Occupied(mut stored) => {
                record.connected_at = stored.get().record.connected_at;
                stored.insert(StoredSession {
                    record: record.clone(),
                    last_seen: now,
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(StoredSession {
                    record: record.clone(),
                    last_seen: now,
                });
            }
        }
        record
    }

    fn acquire(&self, record: LockRecord, ttl: Duration) -> bool {
        let now = Instant::now();
        let lock = HeldLock {
            record,
            expires_at: now + ttl,
        };
        match self.inner.locks.entry(lock.record.key.clone()) {
            Entry::Occupied(mut held) => {
                if held.get().is_live(now) {
                    return false;
                }
                held.insert(lock);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(lock);
                true
            }
        }
    }

    fn extend(&self, key: &str, token: LockToken, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.inner.locks.get_mut(key) {
            Some(mut held) if held.record.token == token && held.is_live(now) => {
                held.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }

    fn hit(&self, key: String, limit: u32, window: Duration) -> RateLimitWindow {
        let now = Instant::now();
        let mut entry = self
            .inner
            .rate_windows
            .entry(key.clone())
            .or_insert_with(|| Window {
                count: 0,
                reset_at: now + window,
            });

        if now >= entry.reset_at {
            entry.count = 0;
            entry.reset_at = now + window;
        }
        entry.count = entry.count.saturating_add(1);
        RateLimitWindow {
            key,
            count: entry.count,
            limit,
            reset_in: entry.reset_at.saturating_duration_since(now),
        }
    }

    fn publish_now(&self, envelope: Envelope) -> usize {
        match self.inner.channels.get(&envelope.channel) {
            Some(sender) => sender.send(envelope).unwrap_or(0),
            None => 0,
        }
    }

    fn subscribe_now(&self, channel: String) -> BoxStream<'static, Envelope> {
        let receiver = self
            .inner
            .channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(self.inner.channel_capacity).0)
            .subscribe();

        // Lagged receivers silently skip what they missed: delivery is at-most-once.
        BroadcastStream::new(receiver)
            .filter_map(|item| future::ready(item.ok()))
            .boxed()
    }

    fn purge(&self) -> PurgeCounts {
        let now = Instant::now();
        let locks = retain_counting(&self.inner.locks, |held| held.is_live(now));
        let rate_windows = retain_counting(&self.inner.rate_windows, |window| {
            now < window.reset_at
        });
        let channels = retain_counting(&self.inner.channels, |sender| {
            sender.receiver_count() > 0
        });

        PurgeCounts {
            locks,
            rate_windows,
            channels,
        }
    }

    fn purge_sessions(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        retain_counting(&self.inner.sessions, |session| {
            session.active_within(Some(max_idle), now)
        })
    }

    fn close_now(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.sessions.clear();
        self.inner.locks.clear();
        self.inner.rate_windows.clear();
        self.inner.channels.clear();
    }
}

/// Retain entries matching `keep`, returning how many were removed.
fn retain_counting<V>(map: &DashMap<String, V>, keep: impl Fn(&V) -> bool) -> usize {
    let mut removed = 0;
    map.retain(|_, value| {
        let retained = keep(value);
        if !retained {
            removed += 1;
        }
        retained
    });
    removed
}

impl CoordinationStore for MemoryStore {
    fn put_session(&self, record: SessionRecord) -> BoxFuture<'static, StoreResult<SessionRecord>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_open()?;
            Ok(store.upsert_session(record))
        })
    }

    fn get_session(
        &self,
        player_id: String,
        active_within: Option<Duration>,
    ) -> BoxFuture<'static, StoreResult<Option<SessionRecord>>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_open()?;
            let now = Instant::now();
            Ok(store
                .inner
                .sessions
                .get(&player_id)
                .filter(|stored| stored.active_within(active_within, now))
                .map(|stored| stored.record.clone()))
        })
    }

    fn remove_session(
        &self,
        player_id: String,
    ) -> BoxFuture<'static, StoreResult<Option<SessionRecord>>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_open()?;
            Ok(store
                .inner
                .sessions
                .remove(&player_id)
                .map(|(_, stored)| stored.record))
        })
    }

    fn list_sessions(
        &self,
        active_within: Option<Duration>,
    ) -> BoxFuture<'static, StoreResult<Vec<SessionRecord>>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_open()?;
            let now = Instant::now();
            Ok(store
                .inner
                .sessions
                .iter()
                .filter(|entry| entry.active_within(active_within, now))
                .map(|entry| entry.record.clone())
                .collect())
        })
    }

    fn purge_idle_sessions(&self, max_idle: Duration) -> BoxFuture<'static, StoreResult<usize>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_open()?;
            Ok(store.purge_sessions(max_idle))
        })
    }

    fn publish(&self, envelope: Envelope) -> BoxFuture<'static, StoreResult<usize>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_open()?;
            Ok(store.publish_now(envelope))
        })
    }

    fn subscribe(&self, channel: String) -> StoreResult<BoxStream<'static, Envelope>> {
        self.ensure_open()?;
        Ok(self.subscribe_now(channel))
    }

    fn try_acquire_lock(
        &self,
        record: LockRecord,
        ttl: Duration,
    ) -> BoxFuture<'static, StoreResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_open()?;
            Ok(store.acquire(record, ttl))
        })
    }

    fn release_lock(&self, key: String, token: LockToken) -> BoxFuture<'static, StoreResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_open()?;
            Ok(store
                .inner
                .locks
                .remove_if(&key, |_, held| held.record.token == token)
                .is_some())
        })
    }

    fn extend_lock(
        &self,
        key: String,
        token: LockToken,
        ttl: Duration,
    ) -> BoxFuture<'static, StoreResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_open()?;
            Ok(store.extend(&key, token, ttl))
        })
    }

    fn force_release_lock(&self, key: String) -> BoxFuture<'static, StoreResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_open()?;
            Ok(store.inner.locks.remove(&key).is_some())
        })
    }

    fn lock_holder(&self, key: String) -> BoxFuture<'static, StoreResult<Option<LockRecord>>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_open()?;
            let now = Instant::now();
            Ok(store
                .inner
                .locks
                .get(&key)
                .filter(|held| held.is_live(now))
                .map(|held| held.record.clone()))
        })
    }

    fn hit_rate_window(
        &self,
        key: String,
        limit: u32,
        window: Duration,
    ) -> BoxFuture<'static, StoreResult<RateLimitWindow>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_open()?;
            Ok(store.hit(key, limit, window))
        })
    }

    fn purge_expired(&self) -> BoxFuture<'static, StoreResult<PurgeCounts>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_open()?;
            Ok(store.purge())
        })
    }

    fn close(&self) -> BoxFuture<'static, StoreResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store.close_now();
            Ok(())
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StoreResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_open() })
    }
}
