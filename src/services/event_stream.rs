//! Fan-out of clock, hand-for-hand and load events to the orchestrator SSE stream.

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde::Serialize;
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        mpsc,
    },
    task::JoinHandle,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::{
    dto::events::{ClockEvent, HandForHandEvent, ServerEvent},
    services::load_shedding::LoadChange,
    state::{SharedState, SseHub},
};

const LOAD_EVENT: &str = "load_level_changed";

/// Start forwarding component events into the SSE hub. Returns the forwarder
/// tasks; they stop when the source channels close or shutdown is signalled.
pub fn install(state: &SharedState) -> Vec<JoinHandle<()>> {
    let hub = state.sse().clone();
    state.load().subscribe(move |change: &LoadChange| {
        publish(&hub, LOAD_EVENT, change);
    });

    let clock_events = state.clock().subscribe();
    let hfh_events = state.hand_for_hand().subscribe();
    vec![
        tokio::spawn(forward(state.clone(), clock_events, |event: &ClockEvent| event.name())),
        tokio::spawn(forward(state.clone(), hfh_events, |event: &HandForHandEvent| {
            event.name()
        })),
    ]
}

fn publish<T: Serialize>(hub: &SseHub, name: &str, payload: &T) {
    match ServerEvent::json(name.to_string(), payload) {
        Ok(event) => hub.broadcast(event),
        Err(err) => warn!(event = name, error = %err, "failed to serialise SSE event"),
    }
}

async fn forward<T, N>(state: SharedState, mut receiver: broadcast::Receiver<T>, name: N)
where
    T: Serialize + Clone + Send + 'static,
    N: Fn(&T) -> &'static str + Send + 'static,
{
    let mut shutdown = state.shutdown_watcher();
    loop {
        tokio::select! {
            received = receiver.recv() => match received {
                Ok(event) => publish(state.sse(), name(&event), &event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event forwarder lagged; events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Convert a broadcast receiver into an SSE response, forwarding events until
/// the client disconnects.
pub fn to_sse_stream(
    state: SharedState,
    mut receiver: broadcast::Receiver<ServerEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // small bounded channel between forwarder and response
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(8);

    tokio::spawn(async move {
        state.metrics().connection_opened();
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                recv_result = receiver.recv() => {
                    match recv_result {
                        Ok(payload) => {
                            let mut event = Event::default().data(payload.data);
                            if let Some(name) = payload.event {
                                event = event.event(name);
                            }

                            if tx.send(Ok(event)).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(_)) => {
                            // Skip lagged messages but keep the stream alive.
                            continue;
                        }
                    }
                }
            }
        }
        state.metrics().connection_closed();
        info!("event SSE stream disconnected");
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}
