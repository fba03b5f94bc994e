use std::error::Error;
use thiserror::Error;

/// Result alias for coordination store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error raised by coordination store backends regardless of the underlying technology.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or rejected the operation.
    #[error("coordination store unavailable: {message}")]
    Unavailable {
        /// What the store was doing when it failed.
        message: String,
        /// Backend failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// The store was closed during shutdown.
    #[error("coordination store is shut down")]
    ShutDown,
}
