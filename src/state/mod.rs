/// Per-tournament barrier state.
pub mod hand_for_hand;
/// Load levels, feature flags and metrics.
pub mod load;
mod sse;
/// Table state reported by the rules engine.
pub mod table;

use std::{sync::Arc, time::SystemTime};

use tokio::{runtime::Handle, sync::watch};
use tracing::{info, warn};

use crate::{
    config::AppConfig,
    dao::coordination_store::{CoordinationStore, MemoryStore},
    services::{
        action_clock::ActionClock,
        coordination::Coordinator,
        hand_for_hand::HandForHandSync,
        load_shedding::{LoadShedder, RuntimeMetrics},
        state_sync::StateSynchronizer,
        worker_pool::{HandlerRegistry, WorkerPool},
    },
};

pub use self::sse::SseHub;

/// Handle cloned into every route and background task.
pub type SharedState = Arc<AppState>;

const SSE_CAPACITY: usize = 64;

/// Component instances built once at startup and shared by handle.
pub struct AppState {
    config: AppConfig,
    started_at: SystemTime,
    coordinator: Arc<Coordinator>,
    clock: ActionClock,
    hand_for_hand: Arc<HandForHandSync>,
    load: Arc<LoadShedder>,
    sync: Arc<StateSynchronizer>,
    workers: WorkerPool,
    metrics: RuntimeMetrics,
    sse: SseHub,
    shutdown: watch::Sender<bool>,
}

impl AppState {
    /// Wire every component on a single-process [`MemoryStore`].
    ///
    /// Must be called from within a Tokio runtime: the worker pool supervisor
    /// is spawned immediately.
    pub fn new(config: AppConfig, registry: HandlerRegistry) -> SharedState {
        let store = Arc::new(MemoryStore::new(config.coordination.channel_capacity));
        Self::with_store(config, store, registry)
    }

    /// Wire every component on top of `store`, the seam for a shared backend.
    pub fn with_store(
        config: AppConfig,
        store: Arc<dyn CoordinationStore>,
        registry: HandlerRegistry,
    ) -> SharedState {
        let load = Arc::new(LoadShedder::new(config.load.clone()));
        let verbosity = load.verbosity();

        let coordinator = Arc::new(Coordinator::new(
            store,
            config.instance_id.clone(),
            config.coordination.clone(),
        ));
        let clock = ActionClock::new(
            config.clock.clone(),
            Some(coordinator.clone()),
            verbosity.clone(),
        );
        let hand_for_hand = Arc::new(
            HandForHandSync::new(config.hand_for_hand.clone()).with_verbosity(verbosity.clone()),
        );
        clock.set_bubble_monitor(hand_for_hand.clone());
        let sync = Arc::new(StateSynchronizer::new(config.sync.clone()).with_verbosity(verbosity));
        let workers = WorkerPool::start(config.workers.clone(), registry);

        load.on_pressure({
            let workers = workers.clone();
            let coordinator = coordinator.clone();
            move || {
                workers.cull_idle();
                let Ok(runtime) = Handle::try_current() else {
                    return;
                };
                let coordinator = coordinator.clone();
                runtime.spawn(async move {
                    match coordinator.sweep().await {
                        Ok(report) => info!(purged = report.total(), "pressure relief sweep done"),
                        Err(err) => warn!(error = %err, "pressure relief sweep failed"),
                    }
                });
            }
        });

        let (shutdown, _rx) = watch::channel(false);
        Arc::new(Self {
            config,
            started_at: SystemTime::now(),
            coordinator,
            clock,
            hand_for_hand,
            load,
            sync,
            workers,
            metrics: RuntimeMetrics::new(),
            sse: SseHub::new(SSE_CAPACITY),
            shutdown,
        })
    }

    /// Validated startup configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Wall-clock start time.
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Cross-instance coordination.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Action clock.
    pub fn clock(&self) -> &ActionClock {
        &self.clock
    }

    /// Hand-for-hand barriers.
    pub fn hand_for_hand(&self) -> &Arc<HandForHandSync> {
        &self.hand_for_hand
    }

    /// Load shedder.
    pub fn load(&self) -> &Arc<LoadShedder> {
        &self.load
    }

    /// State delta synchronizer.
    pub fn sync(&self) -> &Arc<StateSynchronizer> {
        &self.sync
    }

    /// CPU worker pool.
    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// Gauges fed to the load shedder.
    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    /// Broadcast hub behind `/sse/events`.
    pub fn sse(&self) -> &SseHub {
        &self.sse
    }

    /// Subscribe to the shutdown flag observed by background loops.
    pub fn shutdown_watcher(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Whether [`Self::shutdown`] has started.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop background loops and clear every timer, lock and worker.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("shutting down components");

        self.clock.shutdown();
        self.hand_for_hand.shutdown();
        self.sync.shutdown();
        self.load.shutdown();
        self.workers.shutdown().await;
        if let Err(err) = self.coordinator.shutdown().await {
            warn!(error = %err, "failed to clear coordination store");
        }
    }
}
