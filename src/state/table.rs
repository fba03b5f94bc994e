use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Betting phase of the hand currently dealt at a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandPhase {
    /// Between hands.
    #[default]
    Waiting,
    /// Hole cards dealt, no board yet.
    Preflop,
    /// Three board cards.
    Flop,
    /// Fourth board card.
    Turn,
    /// Fifth board card.
    River,
    /// Hands revealed.
    Showdown,
}

/// Seat-level status shown to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    /// Playing.
    #[default]
    Active,
    /// Seated but skipped when dealing.
    SittingOut,
    /// Disconnected but still inside the reconnect window.
    Reconnecting,
}

/// Pot formed when one or more players are all-in for less than the full bet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidePot {
    /// Chips in the pot.
    pub amount: u64,
    /// Players who can win it.
    pub eligible_players: Vec<String>,
}

/// Per-player view of a table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    /// Seat index.
    pub seat: u8,
    /// Chips behind.
    pub stack: u64,
    /// Chips committed in the current betting round.
    pub bet: u64,
    /// Folded in the current hand.
    pub folded: bool,
    /// All-in in the current hand.
    pub all_in: bool,
    /// Seat status.
    pub status: PlayerStatus,
    /// Hole cards, when visible to the receiving audience.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hole_cards: Option<Vec<String>>,
}

/// Authoritative table state as reported by the rules engine.
///
/// The synchronizer treats this as an opaque value: every field is either
/// diffed or forces a full resync when it changes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableState {
    /// Table identifier.
    pub table_id: String,
    /// Identifier of the hand in play; a change marks a hand boundary.
    pub hand_id: Option<String>,
    /// Current betting round.
    pub phase: HandPhase,
    /// Main pot.
    pub pot: u64,
    /// Bet to call.
    pub current_bet: u64,
    /// Player to act, if any.
    pub current_player: Option<String>,
    /// Minimum raise increment.
    pub min_raise: u64,
    /// Button position.
    pub dealer_seat: Option<u8>,
    /// Whether the hand is over.
    pub hand_complete: bool,
    /// Board cards.
    pub community_cards: Vec<String>,
    /// Side pots in creation order.
    pub side_pots: Vec<SidePot>,
    /// Seated players keyed by player id.
    pub players: IndexMap<String, PlayerState>,
}

impl TableState {
    /// Empty table waiting for its first hand.
    pub fn new(table_id: impl Into<String>) -> Self {
        Self {
            table_id: table_id.into(),
            ..Self::default()
        }
    }
}
