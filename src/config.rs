//! Application-level configuration loading, including per-component tuning sections.

use std::{env, fs, io::ErrorKind, path::PathBuf, thread, time::Duration};

use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/cardroom.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "CARDROOM_CONFIG_PATH";
/// Environment variable that pins the instance identifier.
const INSTANCE_ID_ENV: &str = "INSTANCE_ID";
const DEFAULT_PORT: u16 = 8080;

/// Fatal configuration problems detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read config `{path}`")]
    Read {
        /// File that failed to load.
        path: PathBuf,
        /// I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid JSON for [`AppConfig`].
    #[error("failed to parse config `{path}`")]
    Parse {
        /// File that failed to parse.
        path: PathBuf,
        /// Decoding failure.
        #[source]
        source: serde_json::Error,
    },
    /// A value is out of its allowed range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// HTTP listen port.
    pub port: u16,
    /// Identifier stamped on sessions, locks and published messages.
    pub instance_id: String,
    /// Action clock timing.
    pub clock: ClockConfig,
    /// Hand-for-hand barrier polling.
    pub hand_for_hand: HandForHandConfig,
    /// Load shedding.
    pub load: LoadConfig,
    /// Sessions, pub/sub and sweeping.
    pub coordination: CoordinationConfig,
    /// Delta replication.
    pub sync: SyncConfig,
    /// CPU worker pool.
    pub workers: WorkerPoolConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            instance_id: Uuid::new_v4().simple().to_string(),
            clock: ClockConfig::default(),
            hand_for_hand: HandForHandConfig::default(),
            load: LoadConfig::default(),
            coordination: CoordinationConfig::default(),
            sync: SyncConfig::default(),
            workers: WorkerPoolConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load the configuration from disk, applying environment overrides.
    ///
    /// A missing file yields the built-in defaults; an unreadable, malformed or
    /// inconsistent file is fatal.
    pub fn load() -> Result<Self, ConfigError> {
        let path = resolve_config_path();
        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => {
                let config = serde_json::from_str::<AppConfig>(&contents).map_err(|source| {
                    ConfigError::Parse {
                        path: path.clone(),
                        source,
                    }
                })?;
                info!(path = %path.display(), "loaded configuration");
                config
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        if let Some(port) = env::var("PORT")
            .or_else(|_| env::var("SERVER_PORT"))
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
        {
            config.port = port;
        }
        if let Some(instance_id) = env::var(INSTANCE_ID_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
        {
            config.instance_id = instance_id;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the components cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::Invalid("instance_id must not be empty".into()));
        }
        self.clock.validate()?;
        self.hand_for_hand.validate()?;
        self.load.validate()?;
        self.coordination.validate()?;
        self.sync.validate()?;
        self.workers.validate()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// Action clock timing.
pub struct ClockConfig {
    /// Extra window after a nominal deadline before the timeout fires.
    pub grace_period_ms: u64,
    /// How long a disconnected player may come back and restore their seat.
    pub reconnect_timeout_secs: u64,
    /// Hard ceiling on a tournament bubble pause.
    pub bubble_pause_max_secs: u64,
    /// TTL of the lock taken before firing a timeout in multi-instance mode.
    pub timeout_lock_ttl_ms: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 500,
            reconnect_timeout_secs: 60,
            bubble_pause_max_secs: 30,
            timeout_lock_ttl_ms: 5_000,
        }
    }
}

impl ClockConfig {
    /// [`Self::grace_period_ms`] as a duration.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// [`Self::reconnect_timeout_secs`] as a duration.
    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_secs)
    }

    /// [`Self::bubble_pause_max_secs`] as a duration.
    pub fn bubble_pause_max(&self) -> Duration {
        Duration::from_secs(self.bubble_pause_max_secs)
    }

    /// [`Self::timeout_lock_ttl_ms`] as a duration.
    pub fn timeout_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.timeout_lock_ttl_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("clock.bubble_pause_max_secs", self.bubble_pause_max_secs)?;
        require_positive("clock.timeout_lock_ttl_ms", self.timeout_lock_ttl_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// Hand-for-hand barrier polling.
pub struct HandForHandConfig {
    /// Period of the readiness check for active tournaments.
    pub check_interval_ms: u64,
}

impl Default for HandForHandConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 500,
        }
    }
}

impl HandForHandConfig {
    /// [`Self::check_interval_ms`] as a duration.
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("hand_for_hand.check_interval_ms", self.check_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
/// Relative weight of each metric in the load factor.
pub struct LoadWeights {
    /// Weight of open connections.
    pub connections: f64,
    /// Weight of active tables.
    pub tables: f64,
    /// Weight of memory use.
    pub memory: f64,
    /// Weight of scheduler lag.
    pub lag: f64,
}

impl Default for LoadWeights {
    fn default() -> Self {
        Self {
            connections: 0.20,
            tables: 0.20,
            memory: 0.35,
            lag: 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
/// Load factor values at which each degraded level begins.
pub struct LoadThresholds {
    /// Start of [`crate::state::load::LoadLevel::Elevated`].
    pub elevated: f64,
    /// Start of [`crate::state::load::LoadLevel::High`].
    pub high: f64,
    /// Start of [`crate::state::load::LoadLevel::Critical`].
    pub critical: f64,
}

impl Default for LoadThresholds {
    fn default() -> Self {
        Self {
            elevated: 0.60,
            high: 0.80,
            critical: 0.95,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
/// Capacity each metric is normalised against.
pub struct LoadLimits {
    /// Connections at full capacity.
    pub max_connections: u64,
    /// Active tables at full capacity.
    pub max_tables: u64,
    /// Resident memory at full capacity.
    pub max_memory_bytes: u64,
    /// Scheduler lag treated as saturated.
    pub max_lag_ms: f64,
}

impl Default for LoadLimits {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_tables: 1_000,
            max_memory_bytes: 2 * 1024 * 1024 * 1024,
            max_lag_ms: 100.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// Load shedding sampling and scoring.
pub struct LoadConfig {
    /// Seconds between two metric samples.
    pub sample_interval_secs: u64,
    /// Per-metric weights.
    pub weights: LoadWeights,
    /// Level boundaries.
    pub thresholds: LoadThresholds,
    /// Capacity per metric.
    pub limits: LoadLimits,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 5,
            weights: LoadWeights::default(),
            thresholds: LoadThresholds::default(),
            limits: LoadLimits::default(),
        }
    }
}

impl LoadConfig {
    /// Sampling period, never shorter than one second.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs.max(1))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let w = self.weights;
        if [w.connections, w.tables, w.memory, w.lag]
            .iter()
            .any(|weight| *weight < 0.0)
        {
            return Err(ConfigError::Invalid("load weights must be >= 0".into()));
        }
        let total = w.connections + w.tables + w.memory + w.lag;
        if (total - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Invalid(format!(
                "load weights must sum to 1.0 (got {total})"
            )));
        }

        let t = self.thresholds;
        if !(0.0 < t.elevated && t.elevated < t.high && t.high < t.critical && t.critical <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "load thresholds must be strictly increasing within (0, 1] (got {}/{}/{})",
                t.elevated, t.high, t.critical
            )));
        }

        let l = self.limits;
        if l.max_connections == 0 || l.max_tables == 0 || l.max_memory_bytes == 0 {
            return Err(ConfigError::Invalid("load limits must be positive".into()));
        }
        if l.max_lag_ms <= 0.0 {
            return Err(ConfigError::Invalid("load.limits.max_lag_ms must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// Session registry, pub/sub and sweeping.
pub struct CoordinationConfig {
    /// A session counts as online if refreshed within this window.
    pub online_window_secs: u64,
    /// Sessions idle for longer than this are purged by the sweep.
    pub stale_after_secs: u64,
    /// Seconds between two sweeps of stale entries.
    pub sweep_interval_secs: u64,
    /// Envelopes buffered per subscriber before it starts lagging.
    pub channel_capacity: usize,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            online_window_secs: 60,
            stale_after_secs: 300,
            sweep_interval_secs: 60,
            channel_capacity: 256,
        }
    }
}

impl CoordinationConfig {
    /// [`Self::online_window_secs`] as a duration.
    pub fn online_window(&self) -> Duration {
        Duration::from_secs(self.online_window_secs)
    }

    /// [`Self::stale_after_secs`] as a duration.
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    /// [`Self::sweep_interval_secs`] as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("coordination.sweep_interval_secs", self.sweep_interval_secs)?;
        require_positive("coordination.channel_capacity", self.channel_capacity as u64)?;
        if self.stale_after_secs < self.online_window_secs {
            return Err(ConfigError::Invalid(
                "coordination.stale_after_secs must be >= online_window_secs".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// State delta replication.
pub struct SyncConfig {
    /// Force a full payload at least this often per table.
    pub full_resync_interval_secs: u64,
    /// Deltas larger than this fraction of the full payload are sent as full.
    pub max_delta_ratio: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            full_resync_interval_secs: 60,
            max_delta_ratio: 0.70,
        }
    }
}

impl SyncConfig {
    /// [`Self::full_resync_interval_secs`] as a duration.
    pub fn full_resync_interval(&self) -> Duration {
        Duration::from_secs(self.full_resync_interval_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("sync.full_resync_interval_secs", self.full_resync_interval_secs)?;
        if !(0.0 < self.max_delta_ratio && self.max_delta_ratio <= 1.0) {
            return Err(ConfigError::Invalid(
                "sync.max_delta_ratio must be within (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// CPU worker pool sizing and failure policy.
pub struct WorkerPoolConfig {
    /// Workers kept alive even when idle.
    pub min_workers: usize,
    /// Upper bound on workers serving tasks.
    pub max_workers: usize,
    /// Default deadline of a task, counted from submission.
    pub task_timeout_ms: u64,
    /// Workers whose error count exceeds this are retired.
    pub error_threshold: u32,
    /// Idle workers above the minimum are culled after this long.
    pub idle_timeout_secs: u64,
    /// Seconds between idle-culling passes.
    pub maintenance_interval_secs: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            min_workers: (cpus / 2).max(1),
            max_workers: cpus.max(1),
            task_timeout_ms: 5_000,
            error_threshold: 3,
            idle_timeout_secs: 60,
            maintenance_interval_secs: 10,
        }
    }
}

impl WorkerPoolConfig {
    /// [`Self::task_timeout_ms`] as a duration.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// [`Self::idle_timeout_secs`] as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// [`Self::maintenance_interval_secs`] as a duration.
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("workers.max_workers", self.max_workers as u64)?;
        require_positive("workers.task_timeout_ms", self.task_timeout_ms)?;
        require_positive(
            "workers.maintenance_interval_secs",
            self.maintenance_interval_secs,
        )?;
        if self.min_workers > self.max_workers {
            return Err(ConfigError::Invalid(format!(
                "workers.min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        Ok(())
    }
}

fn require_positive(name: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{name} must be positive")));
    }
    Ok(())
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
