//! Adaptive load shedding: turns periodic resource samples into a load level and
//! gates non-essential features accordingly.

use std::{
    fs,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::{
    sync::watch,
    time::{Instant, sleep},
};
use tracing::{error, info, warn};

use crate::{
    config::LoadConfig,
    state::load::{FeatureFlags, LoadLevel, LoadMetrics, LogVerbosity},
};

/// Sleep used to probe scheduler lag; the overshoot is the lag.
const LAG_PROBE: Duration = Duration::from_millis(10);

/// Notification delivered to listeners when the level changes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadChange {
    /// Level before the change.
    pub previous: LoadLevel,
    /// Level after the change.
    pub current: LoadLevel,
    /// Factor that caused it.
    pub factor: f64,
    /// Features enabled at the new level.
    pub flags: FeatureFlags,
}

/// Handle returned by [`LoadShedder::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&LoadChange) + Send + Sync>;
type PressureHook = Arc<dyn Fn() + Send + Sync>;

/// Source of resource samples.
pub trait MetricsSource: Send + Sync {
    /// Take one sample of every gauge.
    fn sample(&self) -> BoxFuture<'static, LoadMetrics>;
}

/// Process-level metrics: gauges maintained by the host plus memory and lag
/// measured on demand.
#[derive(Clone, Default)]
pub struct RuntimeMetrics {
    inner: Arc<RuntimeGauges>,
}

#[derive(Default)]
struct RuntimeGauges {
    connections: AtomicU64,
    tables: AtomicU64,
}

impl RuntimeMetrics {
    /// Gauges starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the connection gauge.
    pub fn set_connections(&self, value: u64) {
        self.inner.connections.store(value, Ordering::Relaxed);
    }

    /// Overwrite the active-table gauge.
    pub fn set_tables(&self, value: u64) {
        self.inner.tables.store(value, Ordering::Relaxed);
    }

    /// Count one more open connection.
    pub fn connection_opened(&self) {
        self.inner.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one fewer open connection, never below zero.
    pub fn connection_closed(&self) {
        let _ = self
            .inner
            .connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

impl MetricsSource for RuntimeMetrics {
    fn sample(&self) -> BoxFuture<'static, LoadMetrics> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let started = Instant::now();
            sleep(LAG_PROBE).await;
            let lag = started.elapsed().saturating_sub(LAG_PROBE);

            LoadMetrics {
                connections: inner.connections.load(Ordering::Relaxed),
                tables: inner.tables.load(Ordering::Relaxed),
                memory_bytes: resident_memory_bytes().unwrap_or(0),
                lag_ms: lag.as_secs_f64() * 1_000.0,
            }
        })
    }
}

/// Resident set size from `/proc/self/statm`, assuming 4 KiB pages.
fn resident_memory_bytes() -> Option<u64> {
    let statm = fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

#[derive(Debug, Clone, Copy, Default)]
struct LastSample {
    factor: f64,
    metrics: LoadMetrics,
}

/// Computes the load level and exposes the feature gates.
pub struct LoadShedder {
    config: LoadConfig,
    level: watch::Sender<LoadLevel>,
    last: Mutex<LastSample>,
    listeners: DashMap<ListenerId, Listener>,
    next_listener: AtomicU64,
    pressure_hooks: Mutex<Vec<PressureHook>>,
    verbosity: LogVerbosity,
}

impl LoadShedder {
    /// Shedder starting at NORMAL.
    pub fn new(config: LoadConfig) -> Self {
        let (level, _rx) = watch::channel(LoadLevel::Normal);
        Self {
            config,
            level,
            last: Mutex::new(LastSample::default()),
            listeners: DashMap::new(),
            next_listener: AtomicU64::new(1),
            pressure_hooks: Mutex::new(Vec::new()),
            verbosity: LogVerbosity::default(),
        }
    }

    /// Switch flipped with `verbose_logging` on every level change.
    pub fn verbosity(&self) -> LogVerbosity {
        self.verbosity.clone()
    }

    /// Period of the background sampler.
    pub fn sample_interval(&self) -> Duration {
        self.config.sample_interval()
    }

    /// Pull one sample from `source` and apply it.
    pub async fn sample_from(&self, source: &dyn MetricsSource) -> Option<LoadChange> {
        let metrics = source.sample().await;
        self.ingest(metrics)
    }

    /// Score a metrics sample and update the level.
    pub fn ingest(&self, metrics: LoadMetrics) -> Option<LoadChange> {
        let factor = metrics.load_factor(&self.config.weights, &self.config.limits);
        self.record(factor, metrics)
    }

    /// Apply a precomputed load factor.
    pub fn ingest_factor(&self, factor: f64) -> Option<LoadChange> {
        let metrics = self.last_sample().metrics;
        self.record(factor.max(0.0), metrics)
    }

    fn record(&self, factor: f64, metrics: LoadMetrics) -> Option<LoadChange> {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = LastSample { factor, metrics };

        let next = LoadLevel::from_factor(factor, &self.config.thresholds);
        let mut previous = next;
        let changed = self.level.send_if_modified(|current| {
            previous = *current;
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if !changed {
            return None;
        }

        let change = LoadChange {
            previous,
            current: next,
            factor,
            flags: FeatureFlags::for_level(next),
        };
        self.verbosity.set(change.flags.verbose_logging);
        if next > previous {
            warn!(from = %previous, to = %next, factor, "load level raised");
        } else {
            info!(from = %previous, to = %next, factor, "load level lowered");
        }

        self.notify(&change);
        if next == LoadLevel::Critical {
            self.relieve_pressure();
        }
        Some(change)
    }

    fn notify(&self, change: &LoadChange) {
        let listeners: Vec<(ListenerId, Listener)> = self
            .listeners
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(change))).is_err() {
                error!(listener = id.0, "load level listener panicked");
            }
        }
    }

    fn relieve_pressure(&self) {
        let hooks = self
            .pressure_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for hook in hooks {
            if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                error!("pressure relief hook panicked");
            }
        }
    }

    /// Register a listener invoked synchronously on every level change.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&LoadChange) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.insert(id, Arc::new(listener));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Register work to run whenever the level reaches CRITICAL.
    pub fn on_pressure<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.pressure_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    /// Watch channel carrying the current level.
    pub fn level_watcher(&self) -> watch::Receiver<LoadLevel> {
        self.level.subscribe()
    }

    /// Current level.
    pub fn level(&self) -> LoadLevel {
        *self.level.borrow()
    }

    /// Features enabled at the current level.
    pub fn flags(&self) -> FeatureFlags {
        FeatureFlags::for_level(self.level())
    }

    /// Last computed load factor.
    pub fn factor(&self) -> f64 {
        self.last_sample().factor
    }

    /// Last sample ingested.
    pub fn metrics(&self) -> LoadMetrics {
        self.last_sample().metrics
    }

    fn last_sample(&self) -> LastSample {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Active gameplay is only turned away at CRITICAL.
    pub fn can_accept_connection(&self) -> bool {
        self.level() < LoadLevel::Critical
    }

    /// Whether new tables and tournaments are accepted.
    pub fn can_create_table(&self) -> bool {
        self.flags().new_tournaments
    }

    /// Whether new spectators are accepted.
    pub fn can_accept_spectator(&self) -> bool {
        self.flags().spectators
    }

    /// Whether chat is accepted.
    pub fn can_chat(&self) -> bool {
        self.flags().chat
    }

    /// Whether hand histories are recorded.
    pub fn hand_history_enabled(&self) -> bool {
        self.flags().hand_history
    }

    /// Whether per-event debug logging is on.
    pub fn verbose_logging(&self) -> bool {
        self.flags().verbose_logging
    }

    /// Drop listeners and hooks.
    pub fn shutdown(&self) {
        self.listeners.clear();
        self.pressure_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
