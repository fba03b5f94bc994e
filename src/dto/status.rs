use serde::Serialize;

use crate::state::load::{FeatureFlags, LoadLevel, LoadMetrics};

/// Response body of the `/status` route.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Instance that answered.
    pub instance_id: String,
    /// RFC 3339 start time.
    pub started_at: String,
    /// Load shedding state.
    pub load: LoadStatus,
    /// Worker pool counters.
    pub workers: PoolStats,
    /// Sessions refreshed within the online window.
    pub online_sessions: usize,
    /// Active hand-for-hand barriers.
    pub hand_for_hand: Vec<HandForHandStatus>,
}

/// Load shedding section of the status report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadStatus {
    /// Current level.
    pub level: LoadLevel,
    /// Last computed load factor.
    pub factor: f64,
    /// Features enabled at this level.
    pub flags: FeatureFlags,
    /// Sample the factor was computed from.
    pub metrics: LoadMetrics,
}

/// Worker pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Live worker threads.
    pub workers: usize,
    /// Workers running a task.
    pub busy: usize,
    /// Tasks waiting for a worker.
    pub queued: usize,
    /// Tasks that returned a value.
    pub completed: u64,
    /// Tasks whose handler returned an error or panicked.
    pub failed: u64,
    /// Tasks rejected at their deadline.
    pub timed_out: u64,
    /// Worker threads lost to a panic.
    pub crashed: u64,
    /// Mean wall time of completed tasks.
    pub avg_processing_ms: f64,
}

/// Snapshot of one tournament's hand-for-hand barrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandForHandStatus {
    /// Tournament in hand-for-hand play.
    pub tournament_id: String,
    /// Player count at which the bubble bursts.
    pub bubble_position: u32,
    /// Per-table state.
    pub tables: Vec<TableHandStatus>,
    /// Tables that finished the current hand.
    pub waiting: usize,
    /// Hands reported complete so far.
    pub completed_hands: u64,
    /// Synchronized rounds finished.
    pub rounds: u64,
}

/// One table inside a hand-for-hand barrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableHandStatus {
    /// Table identifier.
    pub table_id: String,
    /// Whether a hand is being played.
    pub hand_in_progress: bool,
    /// Number of the last hand reported.
    pub hand_number: Option<u64>,
    /// Tournament players remaining, as last reported.
    pub players_remaining: Option<u32>,
    /// Whether the table waits at the barrier.
    pub waiting: bool,
}
