use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::state::table::{HandPhase, PlayerState, PlayerStatus, SidePot, TableState};

/// Replication payload handed to the broadcast layer for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StatePayload {
    /// Complete state; resets any consumer-side baseline.
    Full {
        /// Version this payload brings the consumer to.
        version: u64,
        /// Whole table state.
        state: TableState,
        /// Unix milliseconds at generation.
        timestamp: i64,
    },
    /// Field-level changes relative to the previous version.
    Delta {
        /// Version this payload brings the consumer to; the previous must be one less.
        version: u64,
        /// Table-level fields that changed.
        changes: StateChanges,
        /// Per-player changes keyed by player id.
        #[serde(
            rename = "playerChanges",
            default,
            skip_serializing_if = "IndexMap::is_empty"
        )]
        player_changes: IndexMap<String, PlayerChange>,
        /// Unix milliseconds at generation.
        timestamp: i64,
    },
}

impl StatePayload {
    /// Version carried by either variant.
    pub fn version(&self) -> u64 {
        match self {
            Self::Full { version, .. } | Self::Delta { version, .. } => *version,
        }
    }

    /// Whether this is a complete snapshot.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full { .. })
    }
}

/// Changed table-level fields. `None` means unchanged.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChanges {
    /// New betting round.
    #[serde(default)]
    pub phase: Option<HandPhase>,
    /// New pot total.
    #[serde(default)]
    pub pot: Option<u64>,
    /// New bet to call.
    #[serde(default)]
    pub current_bet: Option<u64>,
    /// `Some(None)` clears the acting player.
    #[serde(default, with = "::serde_with::rust::double_option")]
    pub current_player: Option<Option<String>>,
    /// New minimum raise.
    #[serde(default)]
    pub min_raise: Option<u64>,
    /// `Some(None)` clears the button.
    #[serde(default, with = "::serde_with::rust::double_option")]
    pub dealer_seat: Option<Option<u8>>,
    /// Whether the hand is over.
    #[serde(default)]
    pub hand_complete: Option<bool>,
    /// Board, replaced as a whole.
    #[serde(default)]
    pub community_cards: Option<Vec<String>>,
    /// Side pots, replaced as a whole.
    #[serde(default)]
    pub side_pots: Option<Vec<SidePot>>,
}

/// How a single player's entry changed between two versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum PlayerChange {
    /// Player joined the table.
    Added(PlayerState),
    /// Player fields changed.
    Updated(PlayerDelta),
    /// Player left the table.
    Removed,
}

/// Changed per-player fields. `None` means unchanged.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerDelta {
    /// New seat.
    #[serde(default)]
    pub seat: Option<u8>,
    /// New stack.
    #[serde(default)]
    pub stack: Option<u64>,
    /// New bet in the current round.
    #[serde(default)]
    pub bet: Option<u64>,
    /// Fold flag.
    #[serde(default)]
    pub folded: Option<bool>,
    /// All-in flag.
    #[serde(default)]
    pub all_in: Option<bool>,
    /// Seat status.
    #[serde(default)]
    pub status: Option<PlayerStatus>,
    /// `Some(None)` hides the cards again.
    #[serde(default, with = "::serde_with::rust::double_option")]
    pub hole_cards: Option<Option<Vec<String>>>,
}

impl PlayerDelta {
    /// Whether no field changed.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}
