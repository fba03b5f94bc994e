use axum::Router;

use crate::state::SharedState;

/// `/healthcheck`.
pub mod health;
/// `/sse/events`.
pub mod sse;
/// `/status`.
pub mod status;

/// Compose all route trees and wire in shared state.
pub fn router(state: SharedState) -> Router<()> {
    health::router()
        .merge(status::router())
        .merge(sse::router())
        .with_state(state)
}
