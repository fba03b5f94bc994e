//! Per-player action deadlines with a fairness grace window, disconnect
//! bookkeeping and tournament bubble pauses.
//!
//! Every timer is a spawned task that owns nothing but a key and a token. The
//! registry entry is the source of truth: a timer only fires if it can still
//! remove the entry carrying its own token, so cancellation, re-registration
//! and extension never race with a stale timer.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::ClockConfig,
    dto::events::ClockEvent,
    services::coordination::Coordinator,
    state::load::LogVerbosity,
};

/// Pub/sub channel carrying connection changes between instances.
pub const CONNECTION_CHANNEL: &str = "player.connection";
const EVENT_CAPACITY: usize = 256;

/// Invoked once when a player's action times out; applies the automatic fold or check.
pub type TimeoutCallback = Box<dyn FnOnce() + Send + Sync + 'static>;
/// Invoked once when a bubble pause ends, whether cancelled or forced.
pub type ResumeCallback = Box<dyn FnOnce() + Send + Sync + 'static>;

/// Answers whether a tournament is currently playing the bubble.
pub trait BubbleMonitor: Send + Sync {
    /// Whether `tournament_id` is one elimination away from the money.
    fn at_bubble(&self, tournament_id: &str) -> bool;
}

/// Observable state of a pending action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockPhase {
    /// Primary deadline not reached yet.
    Armed,
    /// Deadline passed; the timeout fires when the grace window closes.
    Grace,
}

/// Last known seat state of a disconnected player, returned on reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    /// Seat index.
    pub seat: u8,
    /// Chips behind.
    pub stack: u64,
    /// Private cards dealt to the player.
    pub hole_cards: Vec<String>,
    /// Chips committed in the current round.
    pub current_bet: u64,
    /// All-in in the current hand.
    pub all_in: bool,
    /// Folded in the current hand.
    pub folded: bool,
    /// Unused time bank.
    pub time_bank_ms: u64,
}

type ActionKey = (String, String);

struct PendingAction {
    seat: u8,
    token: u64,
    phase: ClockPhase,
    action_deadline: Instant,
    on_timeout: TimeoutCallback,
    timer: JoinHandle<()>,
}

struct DisconnectRecord {
    table_id: String,
    tournament_id: Option<String>,
    snapshot: PlayerSnapshot,
    reconnect_deadline: Instant,
    token: u64,
    expiry: JoinHandle<()>,
}

struct BubblePause {
    token: u64,
    on_resume: Option<ResumeCallback>,
    timer: JoinHandle<()>,
}

struct ClockInner {
    config: ClockConfig,
    actions: DashMap<ActionKey, PendingAction>,
    disconnects: DashMap<String, DisconnectRecord>,
    pauses: DashMap<String, BubblePause>,
    next_token: AtomicU64,
    events: broadcast::Sender<ClockEvent>,
    coordinator: Option<Arc<Coordinator>>,
    bubble_monitor: OnceLock<Arc<dyn BubbleMonitor>>,
    verbosity: LogVerbosity,
}

/// Action clock handle; clones share the same timers.
#[derive(Clone)]
pub struct ActionClock {
    inner: Arc<ClockInner>,
}

impl ActionClock {
    /// Build a clock. With a coordinator, timeouts are fired under a
    /// cross-instance lock and connection changes are published.
    pub fn new(
        config: ClockConfig,
        coordinator: Option<Arc<Coordinator>>,
        verbosity: LogVerbosity,
    ) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ClockInner {
                config,
                actions: DashMap::new(),
                disconnects: DashMap::new(),
                pauses: DashMap::new(),
                next_token: AtomicU64::new(1),
                events,
                coordinator,
                bubble_monitor: OnceLock::new(),
                verbosity,
            }),
        }
    }

    /// Install the monitor consulted when a tournament player disconnects.
    /// Only the first monitor installed is kept.
    pub fn set_bubble_monitor(&self, monitor: Arc<dyn BubbleMonitor>) {
        if self.inner.bubble_monitor.set(monitor).is_err() {
            warn!("bubble monitor already installed; ignoring replacement");
        }
    }

    /// Receive every [`ClockEvent`] emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ClockEvent> {
        self.inner.events.subscribe()
    }

    /// Arm the clock for `player_id` at `table_id`. An action already pending
    /// for the same pair is replaced without firing.
    pub fn register_action<F>(
        &self,
        table_id: &str,
        player_id: &str,
        seat: u8,
        timeout: Duration,
        on_timeout: F,
    ) where
        F: FnOnce() + Send + Sync + 'static,
    {
        let key: ActionKey = (table_id.to_string(), player_id.to_string());
        let token = self.inner.next_token();
        let action_deadline = Instant::now() + timeout;

        let replaced = match self.inner.actions.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                let timer = self.inner.arm_action(key, token, action_deadline);
                Some(slot.insert(PendingAction {
                    seat,
                    token,
                    phase: ClockPhase::Armed,
                    action_deadline,
                    on_timeout: Box::new(on_timeout),
                    timer,
                }))
            }
            Entry::Vacant(slot) => {
                let timer = self.inner.arm_action(key, token, action_deadline);
                slot.insert(PendingAction {
                    seat,
                    token,
                    phase: ClockPhase::Armed,
                    action_deadline,
                    on_timeout: Box::new(on_timeout),
                    timer,
                });
                None
            }
        };
        if let Some(previous) = replaced {
            previous.timer.abort();
        }

        if self.inner.verbosity.enabled() {
            debug!(table = %table_id, player = %player_id, seat, timeout_ms = timeout.as_millis() as u64, "action clock armed");
        }
    }

    /// Clear the pending action, if any. Returns whether something was pending.
    pub fn cancel_action(&self, table_id: &str, player_id: &str) -> bool {
        let key: ActionKey = (table_id.to_string(), player_id.to_string());
        match self.inner.actions.remove(&key) {
            Some((_, action)) => {
                action.timer.abort();
                if self.inner.verbosity.enabled() {
                    debug!(table = %table_id, player = %player_id, "action clock cancelled");
                }
                true
            }
            None => false,
        }
    }

    /// Time left before the primary deadline; zero once in grace.
    pub fn get_remaining_time(&self, table_id: &str, player_id: &str) -> Option<Duration> {
        let key: ActionKey = (table_id.to_string(), player_id.to_string());
        self.inner
            .actions
            .get(&key)
            .map(|action| action.action_deadline.saturating_duration_since(Instant::now()))
    }

    /// Phase of the pending action, if one is registered.
    pub fn phase(&self, table_id: &str, player_id: &str) -> Option<ClockPhase> {
        let key: ActionKey = (table_id.to_string(), player_id.to_string());
        self.inner.actions.get(&key).map(|action| action.phase)
    }

    /// Push the deadline back by `extra` (time bank). Refused once the action
    /// has entered its grace window.
    pub fn extend_action(&self, table_id: &str, player_id: &str, extra: Duration) -> bool {
        let key: ActionKey = (table_id.to_string(), player_id.to_string());
        let Some(mut action) = self.inner.actions.get_mut(&key) else {
            return false;
        };
        if action.phase != ClockPhase::Armed {
            return false;
        }

        action.timer.abort();
        let token = self.inner.next_token();
        let action_deadline = action.action_deadline + extra;
        action.token = token;
        action.action_deadline = action_deadline;
        action.timer = self.inner.arm_action(key, token, action_deadline);

        if self.inner.verbosity.enabled() {
            debug!(table = %table_id, player = %player_id, seat = action.seat, extra_ms = extra.as_millis() as u64, "action clock extended");
        }
        true
    }

    /// Players with a pending action at `table_id`.
    pub fn pending_for_table(&self, table_id: &str) -> Vec<String> {
        self.inner
            .actions
            .iter()
            .filter(|entry| entry.key().0 == table_id)
            .map(|entry| entry.key().1.clone())
            .collect()
    }

    /// Pending actions across all tables.
    pub fn pending_count(&self) -> usize {
        self.inner.actions.len()
    }

    /// Keep `snapshot` for `player_id` until the reconnect window closes. A
    /// tournament player disconnecting on the bubble pauses the tournament.
    pub async fn register_disconnect(
        &self,
        player_id: &str,
        table_id: &str,
        tournament_id: Option<&str>,
        snapshot: PlayerSnapshot,
        reconnect_timeout: Option<Duration>,
    ) {
        let token = self.inner.next_token();
        let window = reconnect_timeout.unwrap_or_else(|| self.inner.config.reconnect_timeout());
        let reconnect_deadline = Instant::now() + window;

        let expiry = tokio::spawn(run_reconnect_expiry(
            self.inner.clone(),
            player_id.to_string(),
            token,
            reconnect_deadline,
        ));
        let record = DisconnectRecord {
            table_id: table_id.to_string(),
            tournament_id: tournament_id.map(str::to_string),
            snapshot,
            reconnect_deadline,
            token,
            expiry,
        };
        if let Some(previous) = self.inner.disconnects.insert(player_id.to_string(), record) {
            previous.expiry.abort();
        }

        info!(player = %player_id, table = %table_id, window_secs = window.as_secs(), "player disconnected");
        let event = ClockEvent::PlayerDisconnected {
            player_id: player_id.to_string(),
            table_id: table_id.to_string(),
            tournament_id: tournament_id.map(str::to_string),
        };
        self.inner.publish_connection(&event).await;
        self.inner.emit(event);

        if let Some(tournament_id) = tournament_id
            && self
                .inner
                .bubble_monitor
                .get()
                .is_some_and(|monitor| monitor.at_bubble(tournament_id))
            && !self.is_bubble_paused(tournament_id)
        {
            self.trigger_bubble_pause(tournament_id, None);
        }
    }

    /// Restore a disconnected player. Returns the stored snapshot only while the
    /// reconnect window is open; a stale record is purged either way.
    pub async fn try_reconnect(&self, player_id: &str) -> Option<PlayerSnapshot> {
        let (_, record) = self.inner.disconnects.remove(player_id)?;
        record.expiry.abort();

        if Instant::now() > record.reconnect_deadline {
            debug!(player = %player_id, "reconnect after window closed");
            return None;
        }

        if let Some(tournament_id) = &record.tournament_id {
            self.cancel_bubble_pause(tournament_id);
        }
        info!(player = %player_id, table = %record.table_id, "player reconnected");
        let event = ClockEvent::PlayerReconnected {
            player_id: player_id.to_string(),
            table_id: record.table_id,
        };
        self.inner.publish_connection(&event).await;
        self.inner.emit(event);
        Some(record.snapshot)
    }

    /// Whether `player_id` is inside a reconnect window.
    pub fn is_disconnected(&self, player_id: &str) -> bool {
        self.inner.disconnects.contains_key(player_id)
    }

    /// Players of `tournament_id` currently inside a reconnect window.
    pub fn disconnected_for_tournament(&self, tournament_id: &str) -> Vec<String> {
        self.inner
            .disconnects
            .iter()
            .filter(|entry| entry.tournament_id.as_deref() == Some(tournament_id))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Players inside a reconnect window.
    pub fn disconnected_count(&self) -> usize {
        self.inner.disconnects.len()
    }

    /// Pause `tournament_id` for at most the configured ceiling. Returns
    /// `false` if a pause is already running.
    pub fn trigger_bubble_pause(
        &self,
        tournament_id: &str,
        on_resume: Option<ResumeCallback>,
    ) -> bool {
        let max_pause = self.inner.config.bubble_pause_max();
        match self.inner.pauses.entry(tournament_id.to_string()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                let token = self.inner.next_token();
                let timer = tokio::spawn(run_pause_ceiling(
                    self.inner.clone(),
                    tournament_id.to_string(),
                    token,
                    Instant::now() + max_pause,
                ));
                slot.insert(BubblePause {
                    token,
                    on_resume,
                    timer,
                });
            }
        }

        info!(tournament = %tournament_id, max_secs = max_pause.as_secs(), "bubble pause started");
        self.inner.emit(ClockEvent::BubblePauseStarted {
            tournament_id: tournament_id.to_string(),
            max_pause_ms: max_pause.as_millis() as u64,
        });
        true
    }

    /// End a running pause early. No-op when nothing is paused.
    pub fn cancel_bubble_pause(&self, tournament_id: &str) -> bool {
        match self.inner.pauses.remove(tournament_id) {
            Some((_, pause)) => {
                pause.timer.abort();
                self.inner.end_pause(tournament_id, pause, false);
                true
            }
            None => false,
        }
    }

    /// Whether a bubble pause is running for `tournament_id`.
    pub fn is_bubble_paused(&self, tournament_id: &str) -> bool {
        self.inner.pauses.contains_key(tournament_id)
    }

    /// Abort every timer and forget all state. Pending callbacks are dropped
    /// without being invoked.
    pub fn shutdown(&self) {
        self.inner.actions.retain(|_, action| {
            action.timer.abort();
            false
        });
        self.inner.disconnects.retain(|_, record| {
            record.expiry.abort();
            false
        });
        self.inner.pauses.retain(|_, pause| {
            pause.timer.abort();
            false
        });
    }
}

impl ClockInner {
    fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    fn arm_action(self: &Arc<Self>, key: ActionKey, token: u64, action_deadline: Instant) -> JoinHandle<()> {
        let grace_deadline = action_deadline + self.config.grace_period();
        tokio::spawn(run_action_timer(
            self.clone(),
            key,
            token,
            action_deadline,
            grace_deadline,
        ))
    }

    fn emit(&self, event: ClockEvent) {
        let _ = self.events.send(event);
    }

    async fn publish_connection(&self, event: &ClockEvent) {
        let Some(coordinator) = &self.coordinator else {
            return;
        };
        if let Err(err) = coordinator.publish(CONNECTION_CHANNEL, event).await {
            warn!(event = event.name(), error = %err, "failed to publish connection change");
        }
    }

    async fn fire_timeout(&self, (table_id, player_id): ActionKey, action: PendingAction) {
        let mut held = None;
        if let Some(coordinator) = &self.coordinator {
            let lock_key = format!("clock:{table_id}:{player_id}");
            match coordinator
                .acquire_lock(&lock_key, self.config.timeout_lock_ttl())
                .await
            {
                Ok(Some(token)) => held = Some((coordinator, lock_key, token)),
                Ok(None) => {
                    debug!(table = %table_id, player = %player_id, "timeout claimed by another instance");
                    return;
                }
                Err(err) => {
                    warn!(table = %table_id, player = %player_id, error = %err, "timeout lock unavailable; firing locally");
                }
            }
        }

        info!(table = %table_id, player = %player_id, seat = action.seat, "action timed out");
        if catch_unwind(AssertUnwindSafe(action.on_timeout)).is_err() {
            error!(table = %table_id, player = %player_id, "timeout callback panicked");
        }
        self.emit(ClockEvent::ActionTimedOut {
            table_id: table_id.clone(),
            player_id: player_id.clone(),
        });

        // The next action for this seat must be able to claim its own timeout.
        if let Some((coordinator, lock_key, token)) = held
            && let Err(err) = coordinator.release_lock(&lock_key, token).await
        {
            warn!(table = %table_id, player = %player_id, error = %err, "failed to release timeout lock");
        }
    }

    fn end_pause(&self, tournament_id: &str, pause: BubblePause, forced: bool) {
        info!(tournament = %tournament_id, forced, "bubble pause ended");
        if let Some(on_resume) = pause.on_resume
            && catch_unwind(AssertUnwindSafe(on_resume)).is_err()
        {
            error!(tournament = %tournament_id, "bubble resume callback panicked");
        }
        self.emit(ClockEvent::BubblePauseEnded {
            tournament_id: tournament_id.to_string(),
            forced,
        });
    }
}

async fn run_action_timer(
    inner: Arc<ClockInner>,
    key: ActionKey,
    token: u64,
    action_deadline: Instant,
    grace_deadline: Instant,
) {
    sleep_until(action_deadline).await;
    match inner.actions.get_mut(&key) {
        Some(mut action) if action.token == token => action.phase = ClockPhase::Grace,
        _ => return,
    }

    sleep_until(grace_deadline).await;
    let Some((_, action)) = inner
        .actions
        .remove_if(&key, |_, action| action.token == token)
    else {
        return;
    };
    inner.fire_timeout(key, action).await;
}

async fn run_reconnect_expiry(
    inner: Arc<ClockInner>,
    player_id: String,
    token: u64,
    reconnect_deadline: Instant,
) {
    sleep_until(reconnect_deadline).await;
    let Some((_, record)) = inner
        .disconnects
        .remove_if(&player_id, |_, record| record.token == token)
    else {
        return;
    };

    info!(player = %player_id, table = %record.table_id, "reconnect window expired");
    let event = ClockEvent::ReconnectExpired {
        player_id,
        table_id: record.table_id,
        tournament_id: record.tournament_id,
    };
    inner.publish_connection(&event).await;
    inner.emit(event);
}

async fn run_pause_ceiling(
    inner: Arc<ClockInner>,
    tournament_id: String,
    token: u64,
    deadline: Instant,
) {
    sleep_until(deadline).await;
    if let Some((_, pause)) = inner
        .pauses
        .remove_if(&tournament_id, |_, pause| pause.token == token)
    {
        inner.end_pause(&tournament_id, pause, true);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::{sync::broadcast::error::TryRecvError, time::sleep};

    use super::*;
    use crate::{config::CoordinationConfig, dao::coordination_store::MemoryStore};

    fn clock() -> ActionClock {
        ActionClock::new(ClockConfig::default(), None, LogVerbosity::default())
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = count.clone();
        (count, move || {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn events(rx: &mut broadcast::Receiver<ClockEvent>) -> Vec<ClockEvent> {
        let mut seen = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => seen.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        seen
    }

    struct AlwaysBubble;

    impl BubbleMonitor for AlwaysBubble {
        fn at_bubble(&self, _tournament_id: &str) -> bool {
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_deadline_prevents_timeout() {
        let clock = clock();
        let (fired, on_timeout) = counter();
        clock.register_action("t1", "p1", 3, Duration::from_secs(5), on_timeout);

        sleep(Duration::from_secs(4)).await;
        assert!(clock.cancel_action("t1", "p1"));
        assert!(!clock.cancel_action("t1", "p1"));

        sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once_after_grace() {
        let clock = clock();
        let mut rx = clock.subscribe();
        let (fired, on_timeout) = counter();
        clock.register_action("t1", "p1", 3, Duration::from_secs(10), on_timeout);

        sleep(Duration::from_millis(9_900)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(clock.phase("t1", "p1"), Some(ClockPhase::Armed));
        let remaining = clock.get_remaining_time("t1", "p1").unwrap();
        assert!(remaining > Duration::ZERO && remaining <= Duration::from_millis(100));

        sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(clock.phase("t1", "p1"), Some(ClockPhase::Grace));
        assert_eq!(clock.get_remaining_time("t1", "p1"), Some(Duration::ZERO));

        sleep(Duration::from_millis(400)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(clock.phase("t1", "p1"), None);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(
            events(&mut rx),
            vec![ClockEvent::ActionTimedOut {
                table_id: "t1".into(),
                player_id: "p1".into(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn acting_during_grace_still_cancels() {
        let clock = clock();
        let (fired, on_timeout) = counter();
        clock.register_action("t1", "p1", 1, Duration::from_secs(2), on_timeout);

        sleep(Duration::from_millis(2_200)).await;
        assert_eq!(clock.phase("t1", "p1"), Some(ClockPhase::Grace));
        assert!(clock.cancel_action("t1", "p1"));

        sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reregistering_replaces_previous_timer() {
        let clock = clock();
        let (first, first_cb) = counter();
        let (second, second_cb) = counter();
        clock.register_action("t1", "p1", 1, Duration::from_secs(5), first_cb);
        clock.register_action("t1", "p1", 1, Duration::from_secs(20), second_cb);
        assert_eq!(clock.pending_count(), 1);

        sleep(Duration::from_secs(6)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        sleep(Duration::from_secs(15)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn time_bank_extends_deadline() {
        let clock = clock();
        let (fired, on_timeout) = counter();
        clock.register_action("t1", "p1", 1, Duration::from_secs(5), on_timeout);

        sleep(Duration::from_secs(4)).await;
        assert!(clock.extend_action("t1", "p1", Duration::from_secs(10)));
        let remaining = clock.get_remaining_time("t1", "p1").unwrap();
        assert!(remaining > Duration::from_secs(10) && remaining <= Duration::from_secs(11));

        sleep(Duration::from_millis(11_200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!clock.extend_action("t1", "p1", Duration::from_secs(10)));

        sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!clock.extend_action("t1", "p1", Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn extension_applies_with_verbose_logging_shed() {
        let verbosity = LogVerbosity::default();
        let clock = ActionClock::new(ClockConfig::default(), None, verbosity.clone());
        verbosity.set(false);
        let (fired, on_timeout) = counter();
        clock.register_action("t1", "p1", 1, Duration::from_secs(5), on_timeout);

        assert!(clock.extend_action("t1", "p1", Duration::from_secs(10)));
        assert!(!verbosity.enabled());
        let remaining = clock.get_remaining_time("t1", "p1").unwrap();
        assert!(remaining > Duration::from_secs(10));

        sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_callback_is_isolated() {
        let clock = clock();
        let (fired, on_timeout) = counter();
        clock.register_action("t1", "p1", 1, Duration::from_secs(1), || panic!("engine failure"));
        clock.register_action("t1", "p2", 2, Duration::from_secs(1), on_timeout);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(clock.pending_count(), 0);
        assert_eq!(clock.pending_for_table("t1"), Vec::<String>::new());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_window_returns_snapshot() {
        let clock = clock();
        let snapshot = PlayerSnapshot {
            seat: 4,
            stack: 12_500,
            hole_cards: vec!["Qs".into(), "Qh".into()],
            ..PlayerSnapshot::default()
        };
        clock
            .register_disconnect("p1", "t1", None, snapshot.clone(), None)
            .await;
        assert!(clock.is_disconnected("p1"));

        sleep(Duration::from_secs(59)).await;
        assert_eq!(clock.try_reconnect("p1").await, Some(snapshot));
        assert!(!clock.is_disconnected("p1"));
        assert_eq!(clock.try_reconnect("p1").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_window_is_refused() {
        let clock = clock();
        let mut rx = clock.subscribe();
        clock
            .register_disconnect(
                "p1",
                "t1",
                Some("tour"),
                PlayerSnapshot::default(),
                Some(Duration::from_secs(10)),
            )
            .await;

        sleep(Duration::from_secs(11)).await;
        assert!(!clock.is_disconnected("p1"));
        assert_eq!(clock.try_reconnect("p1").await, None);

        let seen = events(&mut rx);
        assert!(seen.contains(&ClockEvent::ReconnectExpired {
            player_id: "p1".into(),
            table_id: "t1".into(),
            tournament_id: Some("tour".into()),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_on_bubble_pauses_until_reconnect() {
        let clock = clock();
        clock.set_bubble_monitor(Arc::new(AlwaysBubble));
        let mut rx = clock.subscribe();

        clock
            .register_disconnect("p1", "t1", Some("tour"), PlayerSnapshot::default(), None)
            .await;
        assert!(clock.is_bubble_paused("tour"));
        assert_eq!(clock.disconnected_for_tournament("tour"), vec!["p1".to_string()]);

        sleep(Duration::from_secs(5)).await;
        assert!(clock.try_reconnect("p1").await.is_some());
        assert!(!clock.is_bubble_paused("tour"));
        assert!(events(&mut rx).contains(&ClockEvent::BubblePauseEnded {
            tournament_id: "tour".into(),
            forced: false,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn bubble_pause_is_capped() {
        let clock = clock();
        let mut rx = clock.subscribe();
        let (resumed, on_resume) = counter();

        assert!(clock.trigger_bubble_pause("tour", Some(Box::new(on_resume) as ResumeCallback)));
        assert!(!clock.trigger_bubble_pause("tour", None));

        sleep(Duration::from_secs(29)).await;
        assert!(clock.is_bubble_paused("tour"));
        assert_eq!(resumed.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(2)).await;
        assert!(!clock.is_bubble_paused("tour"));
        assert_eq!(resumed.load(Ordering::SeqCst), 1);
        assert!(!clock.cancel_bubble_pause("tour"));
        assert!(events(&mut rx).contains(&ClockEvent::BubblePauseEnded {
            tournament_id: "tour".into(),
            forced: true,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn contended_timeout_lock_skips_firing() {
        let store = Arc::new(MemoryStore::default());
        let ours = Arc::new(Coordinator::new(
            store.clone(),
            "instance-a",
            CoordinationConfig::default(),
        ));
        let theirs = Coordinator::new(store, "instance-b", CoordinationConfig::default());
        theirs
            .acquire_lock("clock:t1:p1", Duration::from_secs(60))
            .await
            .unwrap()
            .expect("lock free");

        let clock = ActionClock::new(ClockConfig::default(), Some(ours), LogVerbosity::default());
        let (fired, on_timeout) = counter();
        clock.register_action("t1", "p1", 1, Duration::from_secs(1), on_timeout);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(clock.phase("t1", "p1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn uncontended_timeout_takes_lock_and_publishes_connections() {
        let store = Arc::new(MemoryStore::default());
        let coordinator = Arc::new(Coordinator::new(
            store,
            "instance-a",
            CoordinationConfig::default(),
        ));
        let mut connections = coordinator.subscribe(CONNECTION_CHANNEL).unwrap();
        let clock = ActionClock::new(
            ClockConfig::default(),
            Some(coordinator.clone()),
            LogVerbosity::default(),
        );

        let (fired, on_timeout) = counter();
        clock.register_action("t1", "p1", 1, Duration::from_secs(1), on_timeout);
        sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(coordinator.lock_holder("clock:t1:p1").await.unwrap().is_none());

        clock
            .register_disconnect("p1", "t1", None, PlayerSnapshot::default(), None)
            .await;
        let envelope = connections.recv().await.unwrap();
        assert_eq!(envelope.sender_instance, "instance-a");
        assert_eq!(envelope.payload["type"], "player_disconnected");
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_timeouts_each_fire() {
        let store = Arc::new(MemoryStore::default());
        let coordinator = Arc::new(Coordinator::new(
            store,
            "instance-a",
            CoordinationConfig::default(),
        ));
        let config = ClockConfig {
            grace_period_ms: 20,
            ..ClockConfig::default()
        };
        let clock = ActionClock::new(config, Some(coordinator), LogVerbosity::default());
        let (fired, on_timeout) = counter();
        let (fired_again, on_second_timeout) = counter();

        clock.register_action("t1", "bob", 2, Duration::from_millis(100), on_timeout);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        clock.register_action("t1", "bob", 2, Duration::from_millis(100), on_second_timeout);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(fired_again.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_all_timers() {
        let clock = clock();
        let (fired, on_timeout) = counter();
        let (resumed, on_resume) = counter();
        clock.register_action("t1", "p1", 1, Duration::from_secs(1), on_timeout);
        clock.trigger_bubble_pause("tour", Some(Box::new(on_resume) as ResumeCallback));
        clock
            .register_disconnect("p2", "t1", None, PlayerSnapshot::default(), None)
            .await;

        clock.shutdown();
        sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(resumed.load(Ordering::SeqCst), 0);
        assert_eq!(clock.pending_count(), 0);
        assert_eq!(clock.disconnected_count(), 0);
        assert!(!clock.is_bubble_paused("tour"));
    }
}
