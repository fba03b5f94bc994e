//! Hand-for-hand synchronization across the tables of one tournament.

use dashmap::DashMap;
use tokio::{sync::broadcast, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    config::HandForHandConfig,
    dto::{events::HandForHandEvent, status::HandForHandStatus},
    services::action_clock::BubbleMonitor,
    state::{
        hand_for_hand::{StartRefusal, TournamentHandForHand},
        load::LogVerbosity,
    },
};

const EVENT_CAPACITY: usize = 128;

/// Tournament-wide barrier engaged during bubble play.
pub struct HandForHandSync {
    config: HandForHandConfig,
    tournaments: DashMap<String, TournamentHandForHand>,
    /// table id -> tournament id
    table_index: DashMap<String, String>,
    events: broadcast::Sender<HandForHandEvent>,
    verbosity: LogVerbosity,
}

impl HandForHandSync {
    /// Empty registry with no tournament in hand-for-hand play.
    pub fn new(config: HandForHandConfig) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            tournaments: DashMap::new(),
            table_index: DashMap::new(),
            events,
            verbosity: LogVerbosity::default(),
        }
    }

    /// Share the load-driven debug switch.
    pub fn with_verbosity(mut self, verbosity: LogVerbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Receive every [`HandForHandEvent`] emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HandForHandEvent> {
        self.events.subscribe()
    }

    /// Period of the background readiness check.
    pub fn check_interval(&self) -> std::time::Duration {
        self.config.check_interval()
    }

    fn emit(&self, event: HandForHandEvent) {
        if self.verbosity.enabled() {
            debug!(event = event.name(), tournament = %event.tournament_id(), "hand-for-hand event");
        }
        let _ = self.events.send(event);
    }

    /// Engage the barrier for `tournament_id`. Restarting an active tournament
    /// resets its state.
    pub fn start_hand_for_hand<I, S>(&self, tournament_id: &str, bubble_position: u32, table_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let state = TournamentHandForHand::new(tournament_id, bubble_position, table_ids);
        let tables: Vec<String> = state.table_ids().map(str::to_string).collect();

        if let Some(previous) = self.tournaments.insert(tournament_id.to_string(), state) {
            for table_id in previous.table_ids() {
                self.table_index
                    .remove_if(table_id, |_, owner| owner == tournament_id);
            }
        }
        for table_id in &tables {
            self.table_index
                .insert(table_id.clone(), tournament_id.to_string());
        }

        info!(tournament = %tournament_id, bubble_position, tables = tables.len(), "hand-for-hand started");
        self.emit(HandForHandEvent::Started {
            tournament_id: tournament_id.to_string(),
            bubble_position,
            tables,
        });
    }

    /// Ask to deal `hand_number` at `table_id`. Returns `false` when the caller
    /// must wait and retry. Tournaments not in hand-for-hand are unrestricted.
    pub fn hand_started(&self, tournament_id: &str, table_id: &str, hand_number: u64) -> bool {
        let Some(mut state) = self.tournaments.get_mut(tournament_id) else {
            return true;
        };
        match state.start_hand(table_id, hand_number) {
            Ok(()) => true,
            Err(StartRefusal::UnknownTable) => {
                warn!(tournament = %tournament_id, table = %table_id, "hand start from table outside hand-for-hand");
                false
            }
            Err(refusal) => {
                if self.verbosity.enabled() {
                    debug!(tournament = %tournament_id, table = %table_id, ?refusal, "hand start deferred");
                }
                false
            }
        }
    }

    /// Record that `table_id` finished its hand. Returns `false` when the table
    /// is not part of any hand-for-hand tournament.
    pub fn hand_completed(&self, table_id: &str, players_remaining: u32) -> bool {
        let Some(tournament_id) = self.table_index.get(table_id).map(|owner| owner.clone()) else {
            return false;
        };

        let mut events = Vec::with_capacity(2);
        {
            let Some(mut state) = self.tournaments.get_mut(&tournament_id) else {
                return false;
            };
            if state.complete_hand(table_id, players_remaining, Instant::now()) {
                events.push(HandForHandEvent::TableWaiting {
                    tournament_id: tournament_id.clone(),
                    table_id: table_id.to_string(),
                    waiting: state.waiting_count(),
                    total: state.table_count(),
                });
            }
            if let Some(round) = state.release_if_ready() {
                events.push(HandForHandEvent::AllTablesReady {
                    tournament_id: tournament_id.clone(),
                    round,
                });
            }
        }

        for event in events {
            self.emit(event);
        }
        true
    }

    /// Report the tournament-wide player count after an elimination. Ends
    /// hand-for-hand and returns `true` once the bubble has burst.
    pub fn player_eliminated(&self, tournament_id: &str, total_remaining: u32) -> bool {
        let burst = self
            .tournaments
            .get(tournament_id)
            .is_some_and(|state| state.bubble_burst(total_remaining));
        if !burst {
            return false;
        }

        info!(tournament = %tournament_id, total_remaining, "bubble burst");
        self.emit(HandForHandEvent::BubbleBurst {
            tournament_id: tournament_id.to_string(),
            players_remaining: total_remaining,
        });
        self.end_hand_for_hand(tournament_id);
        true
    }

    /// Track a table created by a split or rebalance.
    pub fn add_table(&self, tournament_id: &str, table_id: &str) -> bool {
        let added = self
            .tournaments
            .get_mut(tournament_id)
            .is_some_and(|mut state| state.add_table(table_id));
        if added {
            self.table_index
                .insert(table_id.to_string(), tournament_id.to_string());
        }
        added
    }

    /// Stop tracking a table broken up by a merge. The barrier is re-evaluated
    /// immediately so the remaining tables are never left waiting on it.
    pub fn remove_table(&self, tournament_id: &str, table_id: &str) -> bool {
        let (removed, released) = match self.tournaments.get_mut(tournament_id) {
            Some(mut state) => {
                let removed = state.remove_table(table_id);
                (removed, state.release_if_ready())
            }
            None => return false,
        };
        if removed {
            self.table_index
                .remove_if(table_id, |_, owner| owner == tournament_id);
        }
        if let Some(round) = released {
            self.emit(HandForHandEvent::AllTablesReady {
                tournament_id: tournament_id.to_string(),
                round,
            });
        }
        removed
    }

    /// Tear down all state for `tournament_id`.
    pub fn end_hand_for_hand(&self, tournament_id: &str) -> bool {
        let Some((_, state)) = self.tournaments.remove(tournament_id) else {
            return false;
        };
        for table_id in state.table_ids() {
            self.table_index
                .remove_if(table_id, |_, owner| owner == tournament_id);
        }
        info!(tournament = %tournament_id, hands = state.completed_hands(), "hand-for-hand ended");
        self.emit(HandForHandEvent::Ended {
            tournament_id: tournament_id.to_string(),
            hands_played: state.completed_hands(),
        });
        true
    }

    /// Periodic readiness sweep. Returns how many barriers were released.
    pub fn run_ready_checks(&self) -> usize {
        let mut released = Vec::new();
        for mut entry in self.tournaments.iter_mut() {
            if let Some(round) = entry.release_if_ready() {
                released.push((entry.key().clone(), round));
            }
        }

        let count = released.len();
        for (tournament_id, round) in released {
            self.emit(HandForHandEvent::AllTablesReady {
                tournament_id,
                round,
            });
        }
        count
    }

    /// Whether `tournament_id` is in hand-for-hand play.
    pub fn is_active(&self, tournament_id: &str) -> bool {
        self.tournaments.contains_key(tournament_id)
    }

    /// Tournament whose barrier tracks `table_id`.
    pub fn tournament_for_table(&self, table_id: &str) -> Option<String> {
        self.table_index.get(table_id).map(|owner| owner.clone())
    }

    /// Barrier snapshot of one tournament.
    pub fn status(&self, tournament_id: &str) -> Option<HandForHandStatus> {
        self.tournaments.get(tournament_id).map(|state| state.status())
    }

    /// Barrier snapshots of every active tournament, sorted by id.
    pub fn all_status(&self) -> Vec<HandForHandStatus> {
        let mut all: Vec<_> = self
            .tournaments
            .iter()
            .map(|entry| entry.status())
            .collect();
        all.sort_by(|a, b| a.tournament_id.cmp(&b.tournament_id));
        all
    }

    /// Forget every tournament without emitting events.
    pub fn shutdown(&self) {
        self.tournaments.clear();
        self.table_index.clear();
    }
}

impl BubbleMonitor for HandForHandSync {
    fn at_bubble(&self, tournament_id: &str) -> bool {
        self.is_active(tournament_id)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;

    fn sync() -> HandForHandSync {
        HandForHandSync::new(HandForHandConfig::default())
    }

    fn drain(rx: &mut broadcast::Receiver<HandForHandEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => names.push(event.name()),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
        names
    }

    #[test]
    fn sibling_in_progress_blocks_every_other_table() {
        let hfh = sync();
        hfh.start_hand_for_hand("tour", 9, ["t1", "t2", "t3", "t4"]);

        assert!(hfh.hand_started("tour", "t2", 41));
        for table in ["t1", "t3", "t4"] {
            assert!(!hfh.hand_started("tour", table, 41));
        }
        assert!(hfh.hand_started("tour", "t2", 41));
    }

    #[test]
    fn inactive_tournament_is_unrestricted() {
        let hfh = sync();
        assert!(hfh.hand_started("other", "t1", 1));
        assert!(!hfh.hand_completed("t1", 5));
    }

    #[test]
    fn bubble_scenario_four_tables() {
        let hfh = sync();
        let mut rx = hfh.subscribe();
        hfh.start_hand_for_hand("tour", 9, ["t1", "t2", "t3", "t4"]);

        for table in ["t1", "t2", "t3", "t4"] {
            assert!(hfh.hand_completed(table, 3));
        }
        assert_eq!(
            drain(&mut rx),
            vec![
                "hfh_started",
                "hfh_table_waiting",
                "hfh_table_waiting",
                "hfh_table_waiting",
                "hfh_table_waiting",
                "hfh_all_tables_ready",
            ]
        );
        assert_eq!(hfh.status("tour").unwrap().waiting, 0);

        assert!(!hfh.player_eliminated("tour", 9));
        assert!(hfh.is_active("tour"));

        assert!(hfh.player_eliminated("tour", 8));
        assert!(!hfh.is_active("tour"));
        assert_eq!(drain(&mut rx), vec!["hfh_bubble_burst", "hfh_ended"]);
        assert!(hfh.hand_started("tour", "t1", 99));
    }

    #[test]
    fn all_tables_ready_fires_once_per_round() {
        let hfh = sync();
        let mut rx = hfh.subscribe();
        hfh.start_hand_for_hand("tour", 18, ["t1", "t2"]);

        hfh.hand_completed("t1", 9);
        hfh.hand_completed("t1", 9);
        hfh.hand_completed("t2", 9);
        assert_eq!(hfh.run_ready_checks(), 0);

        let ready = drain(&mut rx)
            .into_iter()
            .filter(|name| *name == "hfh_all_tables_ready")
            .count();
        assert_eq!(ready, 1);
    }

    #[test]
    fn removing_lagging_table_releases_barrier() {
        let hfh = sync();
        let mut rx = hfh.subscribe();
        hfh.start_hand_for_hand("tour", 9, ["t1", "t2", "t3"]);
        hfh.hand_completed("t1", 4);
        hfh.hand_completed("t2", 4);

        assert!(hfh.remove_table("tour", "t3"));
        assert!(drain(&mut rx).contains(&"hfh_all_tables_ready"));
        assert_eq!(hfh.tournament_for_table("t3"), None);
    }

    #[test]
    fn added_table_joins_barrier() {
        let hfh = sync();
        hfh.start_hand_for_hand("tour", 9, ["t1"]);
        assert!(hfh.add_table("tour", "t2"));
        assert!(!hfh.add_table("tour", "t2"));
        assert_eq!(hfh.tournament_for_table("t2").as_deref(), Some("tour"));

        hfh.hand_completed("t1", 4);
        let status = hfh.status("tour").unwrap();
        assert_eq!(status.rounds, 0);
        hfh.hand_completed("t2", 4);
        assert_eq!(hfh.status("tour").unwrap().rounds, 1);
    }

    #[test]
    fn end_clears_table_index() {
        let hfh = sync();
        hfh.start_hand_for_hand("tour", 9, ["t1", "t2"]);
        assert!(hfh.at_bubble("tour"));
        assert!(hfh.end_hand_for_hand("tour"));
        assert!(!hfh.end_hand_for_hand("tour"));
        assert!(!hfh.at_bubble("tour"));
        assert!(!hfh.hand_completed("t1", 3));
    }
}
