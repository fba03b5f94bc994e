use dashmap::{DashMap, mapref::entry::Entry};
use indexmap::IndexMap;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    config::SyncConfig,
    dto::{
        sync::{PlayerChange, PlayerDelta, StateChanges, StatePayload},
        unix_millis,
    },
    state::{load::LogVerbosity, table::TableState},
};

/// Consumer-side replication failures. None of them are fatal: the consumer
/// asks the producer for a full payload and continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// A delta skipped or repeated a version.
    #[error("version gap on table `{table_id}`: expected {expected}, received {received}")]
    SequenceGap {
        /// Table the delta was for.
        table_id: String,
        /// Version the replica needed next.
        expected: u64,
        /// Version the payload carried.
        received: u64,
    },
    /// A delta arrived before any full payload.
    #[error("delta received for table `{table_id}` before any full state")]
    MissingBaseline {
        /// Table the delta was for.
        table_id: String,
    },
    /// The payload belongs to another table.
    #[error("payload for table `{received}` applied to replica of `{expected}`")]
    TableMismatch {
        /// Table the replica mirrors.
        expected: String,
        /// Table the payload belongs to.
        received: String,
    },
}

/// Last state issued for a table. Never mutated once issued, only replaced.
#[derive(Debug, Clone)]
struct TableSnapshot {
    version: u64,
    state: TableState,
    last_full_at: Instant,
    force_full: bool,
}

/// Produces versioned full or delta payloads for every table it tracks.
pub struct StateSynchronizer {
    config: SyncConfig,
    snapshots: DashMap<String, TableSnapshot>,
    verbosity: LogVerbosity,
}

impl StateSynchronizer {
    /// Synchronizer tracking no table yet.
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            snapshots: DashMap::new(),
            verbosity: LogVerbosity::default(),
        }
    }

    /// Share the verbose-logging switch driven by the load shedder.
    pub fn with_verbosity(mut self, verbosity: LogVerbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Build the next payload for `table_id` from `current` and record it as the
    /// new snapshot.
    ///
    /// A full payload is produced for the first snapshot, when `force_full` is
    /// set or a resync was requested, when the resync interval elapsed, on a hand
    /// boundary, and whenever the delta would not be meaningfully smaller.
    pub fn generate_update(
        &self,
        table_id: &str,
        current: &TableState,
        force_full: bool,
    ) -> StatePayload {
        let now = Instant::now();
        let timestamp = unix_millis();

        match self.snapshots.entry(table_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(TableSnapshot {
                    version: 1,
                    state: current.clone(),
                    last_full_at: now,
                    force_full: false,
                });
                StatePayload::Full {
                    version: 1,
                    state: current.clone(),
                    timestamp,
                }
            }
            Entry::Occupied(mut held) => {
                let previous = held.get();
                let version = previous.version + 1;
                let full_required = force_full
                    || previous.force_full
                    || now.saturating_duration_since(previous.last_full_at)
                        >= self.config.full_resync_interval()
                    || previous.state.hand_id != current.hand_id;

                let payload = if full_required {
                    StatePayload::Full {
                        version,
                        state: current.clone(),
                        timestamp,
                    }
                } else {
                    self.delta_or_full(table_id, &previous.state, current, version, timestamp)
                };

                let last_full_at = if payload.is_full() {
                    now
                } else {
                    previous.last_full_at
                };
                held.insert(TableSnapshot {
                    version,
                    state: current.clone(),
                    last_full_at,
                    force_full: false,
                });
                payload
            }
        }
    }

    fn delta_or_full(
        &self,
        table_id: &str,
        previous: &TableState,
        current: &TableState,
        version: u64,
        timestamp: i64,
    ) -> StatePayload {
        let (changes, player_changes) = diff_states(previous, current);
        let delta = StatePayload::Delta {
            version,
            changes,
            player_changes,
            timestamp,
        };
        let full = StatePayload::Full {
            version,
            state: current.clone(),
            timestamp,
        };

        match (serde_json::to_vec(&delta), serde_json::to_vec(&full)) {
            (Ok(delta_bytes), Ok(full_bytes)) => {
                let ratio = delta_bytes.len() as f64 / full_bytes.len().max(1) as f64;
                if self.verbosity.enabled() {
                    debug!(
                        table = %table_id,
                        version,
                        delta_bytes = delta_bytes.len(),
                        full_bytes = full_bytes.len(),
                        "computed state delta"
                    );
                }
                if ratio > self.config.max_delta_ratio {
                    full
                } else {
                    delta
                }
            }
            (Err(err), _) | (_, Err(err)) => {
                warn!(table = %table_id, error = %err, "failed to size state payload; sending full");
                full
            }
        }
    }

    /// Make the next payload for `table_id` a full one, e.g. after a consumer
    /// reported a version gap.
    pub fn request_full(&self, table_id: &str) {
        if let Some(mut snapshot) = self.snapshots.get_mut(table_id) {
            snapshot.force_full = true;
        }
    }

    /// Version of the last payload issued for `table_id`.
    pub fn current_version(&self, table_id: &str) -> Option<u64> {
        self.snapshots.get(table_id).map(|snapshot| snapshot.version)
    }

    /// Drop the snapshot of `table_id`; its next update is full at version 1.
    pub fn forget_table(&self, table_id: &str) {
        self.snapshots.remove(table_id);
    }

    /// Tables with an issued snapshot.
    pub fn tracked_tables(&self) -> usize {
        self.snapshots.len()
    }

    /// Drop every snapshot.
    pub fn shutdown(&self) {
        self.snapshots.clear();
    }
}

/// Compute table-level and per-player changes turning `previous` into `current`.
pub fn diff_states(
    previous: &TableState,
    current: &TableState,
) -> (StateChanges, IndexMap<String, PlayerChange>) {
    fn changed<T: PartialEq + Clone>(before: &T, after: &T) -> Option<T> {
        (before != after).then(|| after.clone())
    }

    let changes = StateChanges {
        phase: changed(&previous.phase, &current.phase),
        pot: changed(&previous.pot, &current.pot),
        current_bet: changed(&previous.current_bet, &current.current_bet),
        current_player: changed(&previous.current_player, &current.current_player),
        min_raise: changed(&previous.min_raise, &current.min_raise),
        dealer_seat: changed(&previous.dealer_seat, &current.dealer_seat),
        hand_complete: changed(&previous.hand_complete, &current.hand_complete),
        community_cards: changed(&previous.community_cards, &current.community_cards),
        side_pots: changed(&previous.side_pots, &current.side_pots),
    };

    let mut player_changes = IndexMap::new();
    for (player_id, after) in &current.players {
        match previous.players.get(player_id) {
            None => {
                player_changes.insert(player_id.clone(), PlayerChange::Added(after.clone()));
            }
            Some(before) => {
                let delta = PlayerDelta {
                    seat: changed(&before.seat, &after.seat),
                    stack: changed(&before.stack, &after.stack),
                    bet: changed(&before.bet, &after.bet),
                    folded: changed(&before.folded, &after.folded),
                    all_in: changed(&before.all_in, &after.all_in),
                    status: changed(&before.status, &after.status),
                    hole_cards: changed(&before.hole_cards, &after.hole_cards),
                };
                if !delta.is_empty() {
                    player_changes.insert(player_id.clone(), PlayerChange::Updated(delta));
                }
            }
        }
    }
    for player_id in previous.players.keys() {
        if !current.players.contains_key(player_id) {
            player_changes.insert(player_id.clone(), PlayerChange::Removed);
        }
    }

    (changes, player_changes)
}

/// Merge a payload into `base`, producing the state the producer held at that version.
///
/// A full payload replaces `base` entirely.
pub fn apply_delta(base: &TableState, payload: &StatePayload) -> TableState {
    match payload {
        StatePayload::Full { state, .. } => state.clone(),
        StatePayload::Delta {
            changes,
            player_changes,
            ..
        } => {
            let mut next = base.clone();
            apply_changes(&mut next, changes, player_changes);
            next
        }
    }
}

fn apply_changes(
    state: &mut TableState,
    changes: &StateChanges,
    player_changes: &IndexMap<String, PlayerChange>,
) {
    fn set<T: Clone>(target: &mut T, value: &Option<T>) {
        if let Some(value) = value {
            *target = value.clone();
        }
    }

    set(&mut state.phase, &changes.phase);
    set(&mut state.pot, &changes.pot);
    set(&mut state.current_bet, &changes.current_bet);
    set(&mut state.current_player, &changes.current_player);
    set(&mut state.min_raise, &changes.min_raise);
    set(&mut state.dealer_seat, &changes.dealer_seat);
    set(&mut state.hand_complete, &changes.hand_complete);
    set(&mut state.community_cards, &changes.community_cards);
    set(&mut state.side_pots, &changes.side_pots);

    for (player_id, change) in player_changes {
        match change {
            PlayerChange::Added(player) => {
                state.players.insert(player_id.clone(), player.clone());
            }
            PlayerChange::Removed => {
                state.players.shift_remove(player_id);
            }
            PlayerChange::Updated(delta) => {
                let player = state.players.entry(player_id.clone()).or_default();
                set(&mut player.seat, &delta.seat);
                set(&mut player.stack, &delta.stack);
                set(&mut player.bet, &delta.bet);
                set(&mut player.folded, &delta.folded);
                set(&mut player.all_in, &delta.all_in);
                set(&mut player.status, &delta.status);
                set(&mut player.hole_cards, &delta.hole_cards);
            }
        }
    }
}

/// Consumer-side copy of one table, rebuilt from a full payload plus ordered deltas.
#[derive(Debug, Clone)]
pub struct TableReplica {
    table_id: String,
    version: Option<u64>,
    state: Option<TableState>,
}

impl TableReplica {
    /// Replica of `table_id` waiting for its first full payload.
    pub fn new(table_id: impl Into<String>) -> Self {
        Self {
            table_id: table_id.into(),
            version: None,
            state: None,
        }
    }

    /// Version of the last applied payload.
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    /// Reconstructed state, once a full payload was applied.
    pub fn state(&self) -> Option<&TableState> {
        self.state.as_ref()
    }

    /// Apply the next payload. Deltas must arrive strictly in version order; on
    /// error the replica keeps its last good state and the caller must resync.
    pub fn apply(&mut self, payload: &StatePayload) -> Result<&TableState, SyncError> {
        if let StatePayload::Full { state, .. } = payload
            && state.table_id != self.table_id
        {
            return Err(SyncError::TableMismatch {
                expected: self.table_id.clone(),
                received: state.table_id.clone(),
            });
        }

        let next = match (payload, self.state.as_ref(), self.version) {
            (StatePayload::Full { state, .. }, _, _) => state.clone(),
            (StatePayload::Delta { .. }, Some(base), Some(version)) => {
                if payload.version() != version + 1 {
                    return Err(SyncError::SequenceGap {
                        table_id: self.table_id.clone(),
                        expected: version + 1,
                        received: payload.version(),
                    });
                }
                apply_delta(base, payload)
            }
            (StatePayload::Delta { .. }, _, _) => {
                return Err(SyncError::MissingBaseline {
                    table_id: self.table_id.clone(),
                });
            }
        };

        self.version = Some(payload.version());
        Ok(self.state.insert(next))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::advance;

    use super::*;
    use crate::state::table::{HandPhase, PlayerState, PlayerStatus, SidePot};

    fn player(seat: u8, stack: u64) -> PlayerState {
        PlayerState {
            seat,
            stack,
            ..PlayerState::default()
        }
    }

    fn nine_handed(hand_id: &str) -> TableState {
        let mut state = TableState::new("t1");
        state.hand_id = Some(hand_id.into());
        state.phase = HandPhase::Preflop;
        state.dealer_seat = Some(1);
        for seat in 1..=9u8 {
            state
                .players
                .insert(format!("player-{seat}"), player(seat, 10_000));
        }
        state
    }

    fn synchronizer() -> StateSynchronizer {
        StateSynchronizer::new(SyncConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn first_update_is_full_at_version_one() {
        let sync = synchronizer();
        let payload = sync.generate_update("t1", &nine_handed("h1"), false);
        assert!(payload.is_full());
        assert_eq!(payload.version(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn small_change_produces_delta_with_only_changed_fields() {
        let sync = synchronizer();
        let mut state = nine_handed("h1");
        sync.generate_update("t1", &state, false);

        state.pot = 150;
        state.current_player = Some("player-3".into());
        state.players.get_mut("player-2").unwrap().bet = 100;
        state.players.get_mut("player-2").unwrap().stack = 9_900;

        let payload = sync.generate_update("t1", &state, false);
        let StatePayload::Delta {
            version,
            changes,
            player_changes,
            ..
        } = payload
        else {
            panic!("expected delta, got {payload:?}");
        };

        assert_eq!(version, 2);
        assert_eq!(changes.pot, Some(150));
        assert_eq!(changes.current_player, Some(Some("player-3".into())));
        assert_eq!(changes.phase, None);
        assert_eq!(player_changes.len(), 1);
        assert_eq!(
            player_changes["player-2"],
            PlayerChange::Updated(PlayerDelta {
                stack: Some(9_900),
                bet: Some(100),
                ..PlayerDelta::default()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hand_boundary_forces_full() {
        let sync = synchronizer();
        sync.generate_update("t1", &nine_handed("h1"), false);
        let payload = sync.generate_update("t1", &nine_handed("h2"), false);
        assert!(payload.is_full());
        assert_eq!(payload.version(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn resync_interval_forces_full() {
        let sync = synchronizer();
        let mut state = nine_handed("h1");
        sync.generate_update("t1", &state, false);

        state.pot = 10;
        assert!(!sync.generate_update("t1", &state, false).is_full());

        advance(Duration::from_secs(60)).await;
        state.pot = 20;
        assert!(sync.generate_update("t1", &state, false).is_full());

        state.pot = 30;
        assert!(!sync.generate_update("t1", &state, false).is_full());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_and_requested_full() {
        let sync = synchronizer();
        let state = nine_handed("h1");
        sync.generate_update("t1", &state, false);
        assert!(sync.generate_update("t1", &state, true).is_full());

        sync.request_full("t1");
        assert!(sync.generate_update("t1", &state, false).is_full());
        assert!(!sync.generate_update("t1", &state, false).is_full());
        assert_eq!(sync.current_version("t1"), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn forgotten_table_restarts_with_full_payload() {
        let sync = synchronizer();
        let state = nine_handed("h1");
        sync.generate_update("t1", &state, false);
        sync.generate_update("t2", &state, false);
        assert_eq!(sync.tracked_tables(), 2);

        sync.forget_table("t1");
        assert_eq!(sync.tracked_tables(), 1);
        assert_eq!(sync.current_version("t1"), None);
        let payload = sync.generate_update("t1", &state, false);
        assert!(payload.is_full());
        assert_eq!(payload.version(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_delta_falls_back_to_full() {
        let sync = synchronizer();
        let mut state = nine_handed("h1");
        sync.generate_update("t1", &state, false);

        for (index, player) in state.players.values_mut().enumerate() {
            player.stack = 1 + index as u64;
            player.bet = 7;
            player.folded = true;
            player.status = PlayerStatus::SittingOut;
        }
        state.community_cards = vec!["Ah".into(), "Kd".into(), "7c".into()];
        state.phase = HandPhase::Flop;

        assert!(sync.generate_update("t1", &state, false).is_full());
    }

    #[tokio::test(start_paused = true)]
    async fn replaying_full_then_deltas_reproduces_final_state() {
        let sync = synchronizer();
        let mut replica = TableReplica::new("t1");
        let mut state = nine_handed("h1");

        replica
            .apply(&sync.generate_update("t1", &state, false))
            .unwrap();

        state.pot = 300;
        state.current_bet = 200;
        state.min_raise = 200;
        state.players.get_mut("player-4").unwrap().bet = 200;
        state.players.get_mut("player-4").unwrap().stack = 9_800;
        replica
            .apply(&sync.generate_update("t1", &state, false))
            .unwrap();

        state.players.get_mut("player-5").unwrap().folded = true;
        state.players.shift_remove("player-9");
        state.players.insert(
            "late-joiner".into(),
            PlayerState {
                seat: 9,
                stack: 5_000,
                status: PlayerStatus::SittingOut,
                ..PlayerState::default()
            },
        );
        state.current_player = None;
        replica
            .apply(&sync.generate_update("t1", &state, false))
            .unwrap();

        state.phase = HandPhase::Flop;
        state.community_cards = vec!["2s".into(), "9h".into(), "Td".into()];
        state.side_pots = vec![SidePot {
            amount: 400,
            eligible_players: vec!["player-1".into(), "player-4".into()],
        }];
        state.players.get_mut("player-1").unwrap().all_in = true;
        state.players.get_mut("player-1").unwrap().hole_cards =
            Some(vec!["As".into(), "Ad".into()]);
        let last = sync.generate_update("t1", &state, false);
        assert_eq!(last.version(), 4);
        replica.apply(&last).unwrap();

        assert_eq!(replica.state(), Some(&state));
        assert_eq!(replica.version(), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn replica_rejects_version_gap() {
        let sync = synchronizer();
        let mut replica = TableReplica::new("t1");
        let mut state = nine_handed("h1");
        replica
            .apply(&sync.generate_update("t1", &state, false))
            .unwrap();

        state.pot = 1;
        let _lost = sync.generate_update("t1", &state, false);
        state.pot = 2;
        let third = sync.generate_update("t1", &state, false);

        let err = replica.apply(&third).unwrap_err();
        assert_eq!(
            err,
            SyncError::SequenceGap {
                table_id: "t1".into(),
                expected: 2,
                received: 3,
            }
        );
        assert_eq!(replica.version(), Some(1));

        sync.request_full("t1");
        let resync = sync.generate_update("t1", &state, false);
        replica.apply(&resync).unwrap();
        assert_eq!(replica.state(), Some(&state));
    }

    #[test]
    fn delta_without_baseline_is_rejected() {
        let mut replica = TableReplica::new("t1");
        let delta = StatePayload::Delta {
            version: 2,
            changes: StateChanges::default(),
            player_changes: IndexMap::new(),
            timestamp: 0,
        };
        assert!(matches!(
            replica.apply(&delta),
            Err(SyncError::MissingBaseline { .. })
        ));
    }

    #[test]
    fn cleared_fields_survive_json_round_trip() {
        let mut before = TableState::new("t1");
        before.current_player = Some("p1".into());
        before.dealer_seat = Some(3);
        let after = TableState::new("t1");

        let (changes, players) = diff_states(&before, &after);
        let payload = StatePayload::Delta {
            version: 2,
            changes,
            player_changes: players,
            timestamp: 0,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "delta");
        assert!(json["changes"]["currentPlayer"].is_null());
        assert!(json.get("playerChanges").is_none());

        let decoded: StatePayload = serde_json::from_value(json).unwrap();
        assert_eq!(apply_delta(&before, &decoded), after);
    }

    #[test]
    fn removed_players_are_marked() {
        let mut before = TableState::new("t1");
        before.players.insert("gone".into(), player(2, 100));
        let after = TableState::new("t1");

        let (_, players) = diff_states(&before, &after);
        assert_eq!(players["gone"], PlayerChange::Removed);
        let json = serde_json::to_value(&players).unwrap();
        assert_eq!(json["gone"]["change"], "removed");
    }
}
