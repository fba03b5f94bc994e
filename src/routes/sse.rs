use std::convert::Infallible;

use axum::{Router, extract::State, response::sse::Sse, routing::get};
use futures::Stream;
use tracing::info;

use crate::{
    error::{AppError, ServiceError},
    services::event_stream,
    state::SharedState,
};

/// Stream clock, hand-for-hand and load events to the tournament orchestrator.
pub async fn events(
    State(state): State<SharedState>,
) -> Result<Sse<impl Stream<Item = Result<axum::response::sse::Event, Infallible>>>, AppError> {
    if !state.load().can_accept_connection() {
        return Err(ServiceError::Overloaded("instance is shedding new connections".into()).into());
    }
    let receiver = state.sse().subscribe();
    info!("New event SSE connection");
    Ok(event_stream::to_sse_stream(state, receiver))
}

/// Configure the SSE endpoints.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/sse/events", get(events))
}
