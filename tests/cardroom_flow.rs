use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use cardroom_core::{
    config::AppConfig,
    dto::sync::StatePayload,
    services::{
        action_clock::PlayerSnapshot,
        state_sync::TableReplica,
        worker_pool::{HandlerRegistry, PING_TASK},
    },
    state::{
        AppState, SharedState,
        load::LoadLevel,
        table::{HandPhase, PlayerState, TableState},
    },
};
use serde_json::json;

fn app() -> SharedState {
    let mut config = AppConfig::default();
    config.clock.grace_period_ms = 20;
    config.workers.min_workers = 1;
    config.workers.max_workers = 2;
    AppState::new(config, HandlerRegistry::new().with_ping())
}

#[tokio::test]
async fn disconnect_on_the_bubble_pauses_the_tournament() {
    let state = app();
    state
        .hand_for_hand()
        .start_hand_for_hand("tour", 9, ["t1", "t2"]);

    let snapshot = PlayerSnapshot {
        seat: 4,
        stack: 12_500,
        time_bank_ms: 30_000,
        ..PlayerSnapshot::default()
    };
    state
        .clock()
        .register_disconnect("alice", "t1", Some("tour"), snapshot.clone(), None)
        .await;
    assert!(state.clock().is_bubble_paused("tour"));
    assert_eq!(state.clock().disconnected_for_tournament("tour").len(), 1);

    assert!(state.hand_for_hand().hand_started("tour", "t1", 1));
    assert!(!state.hand_for_hand().hand_started("tour", "t2", 1));
    state.hand_for_hand().hand_completed("t1", 9);
    state.hand_for_hand().hand_started("tour", "t2", 1);
    state.hand_for_hand().hand_completed("t2", 9);
    assert_eq!(state.hand_for_hand().run_ready_checks(), 0);

    assert!(state.hand_for_hand().player_eliminated("tour", 8));
    assert!(!state.hand_for_hand().is_active("tour"));
    assert!(state.clock().is_bubble_paused("tour"));

    assert_eq!(state.clock().try_reconnect("alice").await, Some(snapshot));
    assert!(!state.clock().is_bubble_paused("tour"));
    state.shutdown().await;
}

#[tokio::test]
async fn unanswered_action_times_out_once() {
    let state = app();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    state
        .clock()
        .register_action("t1", "bob", 3, Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(state.clock().pending_count(), 0);
    state.shutdown().await;
}

#[tokio::test]
async fn remote_replica_follows_serialized_updates() {
    let state = app();
    let mut table = TableState::new("t1");
    table.hand_id = Some("h1".into());
    table.phase = HandPhase::Preflop;
    for seat in 1..=6u8 {
        table.players.insert(
            format!("p{seat}"),
            PlayerState {
                seat,
                stack: 5_000,
                ..PlayerState::default()
            },
        );
    }

    let mut replica = TableReplica::new("t1");
    let mut apply = |payload: StatePayload| {
        let wire = serde_json::to_string(&payload).unwrap();
        let decoded: StatePayload = serde_json::from_str(&wire).unwrap();
        replica.apply(&decoded).unwrap().clone()
    };

    let first = state.sync().generate_update("t1", &table, false);
    assert!(first.is_full());
    apply(first);

    table.pot = 150;
    table.current_player = Some("p3".into());
    if let Some(player) = table.players.get_mut("p2") {
        player.bet = 100;
        player.stack = 4_900;
    }
    let second = state.sync().generate_update("t1", &table, false);
    assert!(!second.is_full());
    assert_eq!(apply(second), table);

    state.shutdown().await;
}

#[tokio::test]
async fn critical_load_closes_the_gates() {
    let state = app();
    let reply = state.workers().execute(PING_TASK, json!({})).await.unwrap();
    assert_eq!(reply, json!({}));

    state.load().ingest_factor(0.97);
    assert_eq!(state.load().level(), LoadLevel::Critical);
    assert!(!state.load().can_accept_connection());
    assert!(!state.load().can_create_table());
    assert!(!state.load().verbose_logging());

    state.load().ingest_factor(0.1);
    assert!(state.load().can_accept_connection());
    state.shutdown().await;
}
