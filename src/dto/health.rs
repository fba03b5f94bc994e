use serde::Serialize;

use crate::state::load::LoadLevel;

/// Overall verdict of the health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Serving normally.
    Ok,
    /// Gameplay is being shed, or a dependency failed its probe.
    Degraded,
}

/// Body returned by the `/healthcheck` route.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Overall verdict.
    pub status: HealthStatus,
    /// Instance that answered.
    pub instance_id: String,
    /// Current load level.
    pub load_level: LoadLevel,
}

impl HealthResponse {
    /// Assemble a response.
    pub fn new(status: HealthStatus, instance_id: impl Into<String>, load_level: LoadLevel) -> Self {
        Self {
            status,
            instance_id: instance_id.into(),
            load_level,
        }
    }
}
