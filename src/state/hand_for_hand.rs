use indexmap::{IndexMap, IndexSet};
use tokio::time::Instant;

use crate::dto::status::{HandForHandStatus, TableHandStatus};

/// Why a table may not deal its next hand yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartRefusal {
    /// Another table is still playing its hand.
    HandInProgress {
        /// Table still playing.
        table_id: String,
    },
    /// This table already finished its hand for the current round.
    AwaitingBarrier,
    /// The table is not part of the barrier.
    UnknownTable,
}

/// Per-table progress while hand-for-hand is engaged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableHandState {
    /// Whether a hand is being played.
    pub hand_in_progress: bool,
    /// Number of the last hand started.
    pub hand_number: Option<u64>,
    /// When the last hand finished.
    pub last_completed_at: Option<Instant>,
    /// Tournament players remaining, as last reported.
    pub players_remaining: Option<u32>,
}

/// Barrier state for one tournament.
///
/// Readiness compares identities, not counts: the barrier opens once every
/// tracked table is in the waiting set.
#[derive(Debug, Clone)]
pub struct TournamentHandForHand {
    /// Tournament in hand-for-hand play.
    pub tournament_id: String,
    /// Player count at which the bubble bursts.
    pub bubble_position: u32,
    tables: IndexMap<String, TableHandState>,
    waiting: IndexSet<String>,
    completed_hands: u64,
    rounds: u64,
}

impl TournamentHandForHand {
    /// Barrier over `table_ids`, with no table waiting yet.
    pub fn new<I, S>(tournament_id: impl Into<String>, bubble_position: u32, table_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tournament_id: tournament_id.into(),
            bubble_position,
            tables: table_ids
                .into_iter()
                .map(|id| (id.into(), TableHandState::default()))
                .collect(),
            waiting: IndexSet::new(),
            completed_hands: 0,
            rounds: 0,
        }
    }

    /// Tables in the barrier, in insertion order.
    pub fn table_ids(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Tables that finished the current round.
    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    /// Tables in the barrier.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Hands reported complete so far.
    pub fn completed_hands(&self) -> u64 {
        self.completed_hands
    }

    /// Mark `table_id` as dealing `hand_number` if the barrier allows it.
    pub fn start_hand(&mut self, table_id: &str, hand_number: u64) -> Result<(), StartRefusal> {
        if !self.tables.contains_key(table_id) {
            return Err(StartRefusal::UnknownTable);
        }
        if let Some((busy, _)) = self
            .tables
            .iter()
            .find(|(id, table)| id.as_str() != table_id && table.hand_in_progress)
        {
            return Err(StartRefusal::HandInProgress {
                table_id: busy.clone(),
            });
        }
        if self.waiting.contains(table_id) {
            return Err(StartRefusal::AwaitingBarrier);
        }

        if let Some(table) = self.tables.get_mut(table_id) {
            table.hand_in_progress = true;
            table.hand_number = Some(hand_number);
        }
        Ok(())
    }

    /// Record a finished hand. Returns `false` if the table is unknown or was
    /// already waiting.
    pub fn complete_hand(&mut self, table_id: &str, players_remaining: u32, now: Instant) -> bool {
        let Some(table) = self.tables.get_mut(table_id) else {
            return false;
        };
        table.hand_in_progress = false;
        table.last_completed_at = Some(now);
        table.players_remaining = Some(players_remaining);

        let newly_waiting = self.waiting.insert(table_id.to_string());
        if newly_waiting {
            self.completed_hands += 1;
        }
        newly_waiting
    }

    /// Track a new table. Returns `false` if it was already tracked.
    pub fn add_table(&mut self, table_id: &str) -> bool {
        if self.tables.contains_key(table_id) {
            return false;
        }
        self.tables
            .insert(table_id.to_string(), TableHandState::default());
        true
    }

    /// Drop a table from both the table set and the waiting set.
    pub fn remove_table(&mut self, table_id: &str) -> bool {
        self.waiting.shift_remove(table_id);
        self.tables.shift_remove(table_id).is_some()
    }

    /// Whether every tracked table is waiting.
    pub fn is_ready(&self) -> bool {
        !self.tables.is_empty() && self.tables.keys().all(|id| self.waiting.contains(id))
    }

    /// Open the barrier if every table is waiting. Returns the round number
    /// just completed.
    pub fn release_if_ready(&mut self) -> Option<u64> {
        if !self.is_ready() {
            return None;
        }
        self.waiting.clear();
        self.rounds += 1;
        Some(self.rounds)
    }

    /// The bubble bursts once fewer players remain than the paid position.
    pub fn bubble_burst(&self, total_remaining: u32) -> bool {
        total_remaining < self.bubble_position
    }

    /// Snapshot for the status report.
    pub fn status(&self) -> HandForHandStatus {
        HandForHandStatus {
            tournament_id: self.tournament_id.clone(),
            bubble_position: self.bubble_position,
            tables: self
                .tables
                .iter()
                .map(|(id, table)| TableHandStatus {
                    table_id: id.clone(),
                    hand_in_progress: table.hand_in_progress,
                    hand_number: table.hand_number,
                    players_remaining: table.players_remaining,
                    waiting: self.waiting.contains(id),
                })
                .collect(),
            waiting: self.waiting.len(),
            completed_hands: self.completed_hands,
            rounds: self.rounds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tournament() -> TournamentHandForHand {
        TournamentHandForHand::new("tour", 9, ["t1", "t2", "t3"])
    }

    #[test]
    fn second_table_refused_while_first_plays() {
        let mut state = tournament();
        state.start_hand("t1", 1).unwrap();
        assert_eq!(
            state.start_hand("t2", 1),
            Err(StartRefusal::HandInProgress {
                table_id: "t1".into()
            })
        );
        assert_eq!(state.start_hand("nope", 1), Err(StartRefusal::UnknownTable));
    }

    #[test]
    fn waiting_table_cannot_deal_again_before_release() {
        let mut state = tournament();
        state.start_hand("t1", 1).unwrap();
        assert!(state.complete_hand("t1", 6, Instant::now()));
        assert_eq!(state.start_hand("t1", 2), Err(StartRefusal::AwaitingBarrier));
        state.start_hand("t2", 1).unwrap();
    }

    #[test]
    fn double_report_does_not_count_twice() {
        let mut state = tournament();
        let now = Instant::now();
        assert!(state.complete_hand("t1", 6, now));
        assert!(!state.complete_hand("t1", 6, now));
        assert!(state.complete_hand("t2", 5, now));
        assert!(!state.is_ready());
        assert_eq!(state.release_if_ready(), None);
        assert_eq!(state.completed_hands(), 2);
    }

    #[test]
    fn release_clears_waiting_once() {
        let mut state = tournament();
        let now = Instant::now();
        for table in ["t1", "t2", "t3"] {
            state.complete_hand(table, 4, now);
        }
        assert_eq!(state.release_if_ready(), Some(1));
        assert_eq!(state.waiting_count(), 0);
        assert_eq!(state.release_if_ready(), None);
    }

    #[test]
    fn removing_unfinished_table_unblocks_barrier() {
        let mut state = tournament();
        let now = Instant::now();
        state.complete_hand("t1", 4, now);
        state.complete_hand("t2", 4, now);
        assert!(!state.is_ready());

        assert!(state.remove_table("t3"));
        assert!(state.is_ready());
    }

    #[test]
    fn removing_waiting_table_shrinks_both_sets() {
        let mut state = tournament();
        let now = Instant::now();
        state.complete_hand("t1", 4, now);
        state.remove_table("t1");
        assert_eq!(state.waiting_count(), 0);
        assert_eq!(state.table_count(), 2);

        state.complete_hand("t2", 4, now);
        state.complete_hand("t3", 4, now);
        assert!(state.is_ready());
    }

    #[test]
    fn bubble_bursts_strictly_below_position() {
        let state = tournament();
        assert!(!state.bubble_burst(10));
        assert!(!state.bubble_burst(9));
        assert!(state.bubble_burst(8));
        assert!(state.bubble_burst(0));
    }
}
