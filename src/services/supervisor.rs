//! Background maintenance loops: load sampling, hand-for-hand readiness checks
//! and coordination sweeps. Each loop exits when the shared shutdown flag flips.

use std::{future::Future, time::Duration};

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

use crate::state::SharedState;

/// Spawn every background loop for `state`.
pub fn spawn_all(state: &SharedState) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(run_load_sampler(state.clone())),
        tokio::spawn(run_hand_for_hand_checks(state.clone())),
        tokio::spawn(run_coordination_sweeps(state.clone())),
    ]
}

/// Sample runtime metrics on the configured interval and feed the load shedder.
pub async fn run_load_sampler(state: SharedState) {
    let period = state.load().sample_interval();
    run_every(period, state.shutdown_watcher(), || {
        let state = state.clone();
        async move {
            state
                .metrics()
                .set_tables(state.sync().tracked_tables() as u64);
            if let Some(change) = state.load().sample_from(state.metrics()).await {
                debug!(level = %change.current, factor = change.factor, "load sample changed level");
            }
        }
    })
    .await;
    info!("load sampler stopped");
}

/// Periodic barrier release for hand-for-hand tournaments.
pub async fn run_hand_for_hand_checks(state: SharedState) {
    let period = state.hand_for_hand().check_interval();
    run_every(period, state.shutdown_watcher(), || {
        let state = state.clone();
        async move {
            let released = state.hand_for_hand().run_ready_checks();
            if released > 0 {
                debug!(released, "hand-for-hand barriers released by periodic check");
            }
        }
    })
    .await;
    info!("hand-for-hand checks stopped");
}

/// Purge stale sessions, expired locks and exhausted rate windows.
pub async fn run_coordination_sweeps(state: SharedState) {
    let period = state.config().coordination.sweep_interval();
    run_every(period, state.shutdown_watcher(), || {
        let state = state.clone();
        async move {
            match state.coordinator().sweep().await {
                Ok(report) if report.total() > 0 => {
                    info!(
                        sessions = report.sessions,
                        locks = report.locks,
                        rate_windows = report.rate_windows,
                        channels = report.channels,
                        "coordination sweep purged entries"
                    );
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "coordination sweep failed"),
            }
        }
    })
    .await;
    info!("coordination sweeps stopped");
}

/// Run `tick` every `period` until `shutdown` reports `true`. A tick that
/// panics is logged and the loop keeps going.
async fn run_every<F, Fut>(period: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = tokio::spawn(tick()).await
                    && err.is_panic()
                {
                    warn!("background tick panicked");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use tokio::time::sleep;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn loop_ticks_until_shutdown() {
        let (tx, rx) = watch::channel(false);
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = tokio::spawn(run_every(Duration::from_secs(1), rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        sleep(Duration::from_millis(3_500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_tick_does_not_stop_loop() {
        let (tx, rx) = watch::channel(false);
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = tokio::spawn(run_every(Duration::from_secs(1), rx, move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first tick fails");
                }
            }
        }));

        sleep(Duration::from_millis(2_500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
