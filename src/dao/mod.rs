/// Shared-store abstraction behind the coordination layer.
pub mod coordination_store;
/// Records held by coordination stores.
pub mod models;
/// Storage error types.
pub mod storage;
