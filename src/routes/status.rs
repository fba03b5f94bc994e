use axum::{Json, Router, extract::State, routing::get};

use crate::{
    dto::status::StatusResponse, error::AppError, services::health_service, state::SharedState,
};

/// Report load level, worker pool counters and active hand-for-hand barriers.
pub async fn status(State(state): State<SharedState>) -> Result<Json<StatusResponse>, AppError> {
    let report = health_service::status_report(&state).await?;
    Ok(Json(report))
}

/// Configure the status routes subtree.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/status", get(status))
}
