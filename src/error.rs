use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;

use crate::{
    config::ConfigError,
    dao::storage::StoreError,
    services::{coordination::CoordinationError, state_sync::SyncError, worker_pool::WorkerError},
};

/// Errors that can occur in service layer operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Coordination store could not be reached.
    #[error("coordination store unavailable")]
    Unavailable(#[source] StoreError),
    /// Coordination payload could not be encoded.
    #[error("coordination failure: {0}")]
    Coordination(String),
    /// Worker pool rejected or lost a task.
    #[error(transparent)]
    Worker(#[from] WorkerError),
    /// Replication consumer is out of sequence and must resync.
    #[error(transparent)]
    Sync(#[from] SyncError),
    /// Startup configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Request refused because the instance is shedding load.
    #[error("shedding load: {0}")]
    Overloaded(String),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        ServiceError::Unavailable(err)
    }
}

impl From<CoordinationError> for ServiceError {
    fn from(err: CoordinationError) -> Self {
        match err {
            CoordinationError::Store(source) => ServiceError::Unavailable(source),
            other => ServiceError::Coordination(other.to_string()),
        }
    }
}

/// Application-level errors that are converted to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Conflict with current state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Service unavailable or degraded.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    /// Gateway-style timeout of a downstream task.
    #[error("timed out: {0}")]
    Timeout(String),
    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(source) => AppError::ServiceUnavailable(source.to_string()),
            ServiceError::Overloaded(message) => AppError::ServiceUnavailable(message),
            ServiceError::Worker(WorkerError::ShutDown) => {
                AppError::ServiceUnavailable("worker pool is shut down".into())
            }
            ServiceError::Worker(err @ WorkerError::Timeout { .. }) => {
                AppError::Timeout(err.to_string())
            }
            ServiceError::Worker(err) => AppError::Internal(err.to_string()),
            ServiceError::Sync(err) => AppError::Conflict(err.to_string()),
            ServiceError::Coordination(message) => AppError::Internal(message),
            ServiceError::Config(err) => AppError::Internal(err.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let payload = Json(ErrorBody {
            message: self.to_string(),
        });

        (status, payload).into_response()
    }
}
