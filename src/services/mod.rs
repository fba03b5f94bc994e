/// Per-player action deadlines, disconnects and bubble pauses.
pub mod action_clock;
/// Sessions, pub/sub, locks and rate limits across instances.
pub mod coordination;
/// Fan-out of component events to the SSE stream.
pub mod event_stream;
/// Tournament-wide hand-for-hand barrier.
pub mod hand_for_hand;
/// Health check service.
pub mod health_service;
/// Adaptive load shedding and feature gates.
pub mod load_shedding;
/// Versioned full/delta table state replication.
pub mod state_sync;
/// Background maintenance loops.
pub mod supervisor;
/// Auto-scaling pool of CPU workers.
pub mod worker_pool;
