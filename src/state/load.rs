use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use serde::Serialize;

use crate::config::{LoadLimits, LoadThresholds, LoadWeights};

/// Ordered pressure level derived from the load factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadLevel {
    /// Everything enabled.
    #[default]
    Normal,
    /// Verbose logging off.
    Elevated,
    /// Spectators, new tournaments and chat refused.
    High,
    /// Only core gameplay; pressure hooks run.
    Critical,
}

impl LoadLevel {
    /// Map a load factor onto a level using the configured thresholds.
    pub fn from_factor(factor: f64, thresholds: &LoadThresholds) -> Self {
        if factor >= thresholds.critical {
            Self::Critical
        } else if factor >= thresholds.high {
            Self::High
        } else if factor >= thresholds.elevated {
            Self::Elevated
        } else {
            Self::Normal
        }
    }

    /// Wire name of the level.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Elevated => "ELEVATED",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for LoadLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-essential features toggled by the load level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlags {
    /// New spectators may join.
    pub spectators: bool,
    /// New tables or tournaments may be created.
    pub new_tournaments: bool,
    /// Chat messages are accepted.
    pub chat: bool,
    /// Hand histories are recorded.
    pub hand_history: bool,
    /// Per-event debug logging is emitted.
    pub verbose_logging: bool,
}

impl FeatureFlags {
    /// Fixed feature table per level.
    pub const fn for_level(level: LoadLevel) -> Self {
        match level {
            LoadLevel::Normal => Self {
                spectators: true,
                new_tournaments: true,
                chat: true,
                hand_history: true,
                verbose_logging: true,
            },
            LoadLevel::Elevated => Self {
                spectators: true,
                new_tournaments: true,
                chat: true,
                hand_history: true,
                verbose_logging: false,
            },
            LoadLevel::High => Self {
                spectators: false,
                new_tournaments: false,
                chat: false,
                hand_history: true,
                verbose_logging: false,
            },
            LoadLevel::Critical => Self {
                spectators: false,
                new_tournaments: false,
                chat: false,
                hand_history: false,
                verbose_logging: false,
            },
        }
    }
}

/// One sample of the resource gauges feeding the load factor.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadMetrics {
    /// Open client connections.
    pub connections: u64,
    /// Active tables.
    pub tables: u64,
    /// Resident memory in bytes.
    pub memory_bytes: u64,
    /// Scheduler lag in milliseconds.
    pub lag_ms: f64,
}

impl LoadMetrics {
    /// Weighted, normalised pressure score. Only the lag ratio is capped at
    /// 1; the other gauges may push the factor above 1 when over their limits.
    pub fn load_factor(&self, weights: &LoadWeights, limits: &LoadLimits) -> f64 {
        let ratio = |value: f64, max: f64| value / max;

        weights.connections * ratio(self.connections as f64, limits.max_connections as f64)
            + weights.tables * ratio(self.tables as f64, limits.max_tables as f64)
            + weights.memory * ratio(self.memory_bytes as f64, limits.max_memory_bytes as f64)
            + weights.lag * ratio(self.lag_ms, limits.max_lag_ms).min(1.0)
    }
}

/// Shared switch for per-event debug logging, flipped on level changes.
#[derive(Debug, Clone)]
pub struct LogVerbosity(Arc<AtomicBool>);

impl LogVerbosity {
    /// Whether per-event debug logs should be emitted.
    pub fn enabled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Turn per-event debug logging on or off for every clone.
    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Relaxed);
    }
}

impl Default for LogVerbosity {
    fn default() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
}
