use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;
use tracing::warn;

use crate::{
    dto::{
        format_system_time,
        health::{HealthResponse, HealthStatus},
        status::{LoadStatus, StatusResponse},
    },
    error::ServiceError,
    services::worker_pool::PING_TASK,
    state::{SharedState, load::LoadLevel},
};

const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Report degraded when gameplay is being shed, the coordination store is
/// unreachable, or the worker pool cannot answer a ping.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    let level = state.load().level();
    let mut degraded = level == LoadLevel::Critical;

    if let Err(err) = state.coordinator().health_check().await {
        warn!(error = %err, "coordination store health check failed");
        degraded = true;
    }

    match timeout(
        PING_TIMEOUT,
        state
            .workers()
            .execute_with_timeout(PING_TASK, json!({}), PING_TIMEOUT),
    )
    .await
    {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            warn!(error = %err, "worker pool ping failed");
            degraded = true;
        }
        Err(_) => {
            warn!("worker pool ping timed out");
            degraded = true;
        }
    }

    let status = if degraded {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    };
    HealthResponse::new(status, state.coordinator().instance_id(), level)
}

/// Collect a point-in-time view of this instance for operators.
pub async fn status_report(state: &SharedState) -> Result<StatusResponse, ServiceError> {
    let load = state.load();
    let workers = state.workers().stats().await?;
    let online_sessions = state.coordinator().online_count().await?;

    Ok(StatusResponse {
        instance_id: state.coordinator().instance_id().to_string(),
        started_at: format_system_time(state.started_at()),
        load: LoadStatus {
            level: load.level(),
            factor: load.factor(),
            flags: load.flags(),
            metrics: load.metrics(),
        },
        workers,
        online_sessions,
        hand_for_hand: state.hand_for_hand().all_status(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AppConfig, services::worker_pool::HandlerRegistry, state::AppState};

    #[tokio::test]
    async fn healthy_until_critical_load() {
        let state = AppState::new(AppConfig::default(), HandlerRegistry::new().with_ping());
        assert_eq!(health_status(&state).await.status, HealthStatus::Ok);

        state.load().ingest_factor(0.99);
        let report = health_status(&state).await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.load_level, LoadLevel::Critical);
        state.shutdown().await;
    }

    #[tokio::test]
    async fn missing_ping_handler_degrades() {
        let state = AppState::new(AppConfig::default(), HandlerRegistry::new());
        assert_eq!(health_status(&state).await.status, HealthStatus::Degraded);
        state.shutdown().await;
    }

    #[tokio::test]
    async fn status_reports_components() {
        let state = AppState::new(AppConfig::default(), HandlerRegistry::new().with_ping());
        state
            .coordinator()
            .heartbeat("alice", Some("t1".into()), None)
            .await
            .unwrap();
        state.hand_for_hand().start_hand_for_hand("tour", 9, ["t1"]);

        let report = status_report(&state).await.unwrap();
        assert_eq!(report.online_sessions, 1);
        assert_eq!(report.load.level, LoadLevel::Normal);
        assert!(report.workers.workers >= state.config().workers.min_workers);
        assert_eq!(report.hand_for_hand.len(), 1);

        state.shutdown().await;
    }
}
