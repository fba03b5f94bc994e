use serde::Serialize;

/// Dispatched payload carried across the SSE channel.
#[derive(Clone, Debug)]
pub struct ServerEvent {
    /// SSE `event:` name; `None` sends an unnamed message.
    pub event: Option<String>,
    /// Serialized JSON body.
    pub data: String,
}

impl ServerEvent {
    /// Convenience wrapper that serialises `payload` into the SSE data field.
    pub fn json<E, T>(event: E, payload: &T) -> serde_json::Result<Self>
    where
        E: Into<Option<String>>,
        T: Serialize,
    {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_string(payload)?,
        })
    }
}

/// Hand-for-hand lifecycle notifications for the tournament orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum HandForHandEvent {
    /// Barrier armed for the listed tables.
    #[serde(rename = "hfh_started")]
    Started {
        /// Tournament in hand-for-hand play.
        tournament_id: String,
        /// Player count at which the bubble bursts.
        bubble_position: u32,
        /// Tables taking part.
        tables: Vec<String>,
    },
    /// A table finished its hand and waits for the others.
    #[serde(rename = "hfh_table_waiting")]
    TableWaiting {
        /// Tournament the table belongs to.
        tournament_id: String,
        /// Table that finished.
        table_id: String,
        /// Tables now waiting, this one included.
        waiting: usize,
        /// Tables in the barrier.
        total: usize,
    },
    /// Every table finished; the next synchronized hand may start.
    #[serde(rename = "hfh_all_tables_ready")]
    AllTablesReady {
        /// Tournament whose tables are all ready.
        tournament_id: String,
        /// Synchronized round just completed.
        round: u64,
    },
    /// Players remaining fell below the bubble.
    #[serde(rename = "hfh_bubble_burst")]
    BubbleBurst {
        /// Tournament whose bubble burst.
        tournament_id: String,
        /// Smallest count reported by the round.
        players_remaining: u32,
    },
    /// Hand-for-hand play was stopped.
    #[serde(rename = "hfh_ended")]
    Ended {
        /// Tournament that left hand-for-hand play.
        tournament_id: String,
        /// Hands completed while it was active.
        hands_played: u64,
    },
}

impl HandForHandEvent {
    /// Wire name, also used as the SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "hfh_started",
            Self::TableWaiting { .. } => "hfh_table_waiting",
            Self::AllTablesReady { .. } => "hfh_all_tables_ready",
            Self::BubbleBurst { .. } => "hfh_bubble_burst",
            Self::Ended { .. } => "hfh_ended",
        }
    }

    /// Tournament the event concerns.
    pub fn tournament_id(&self) -> &str {
        match self {
            Self::Started { tournament_id, .. }
            | Self::TableWaiting { tournament_id, .. }
            | Self::AllTablesReady { tournament_id, .. }
            | Self::BubbleBurst { tournament_id, .. }
            | Self::Ended { tournament_id, .. } => tournament_id,
        }
    }
}

/// Action clock notifications beyond the per-action timeout callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClockEvent {
    /// A player let their action clock run out.
    ActionTimedOut {
        /// Table where the action was pending.
        table_id: String,
        /// Player who timed out.
        player_id: String,
    },
    /// A player dropped and their seat snapshot was kept.
    PlayerDisconnected {
        /// Player who dropped.
        player_id: String,
        /// Table they were seated at.
        table_id: String,
        /// Tournament, when the table is part of one.
        tournament_id: Option<String>,
    },
    /// A player came back within the reconnect window.
    PlayerReconnected {
        /// Returning player.
        player_id: String,
        /// Table the snapshot belongs to.
        table_id: String,
    },
    /// The reconnect window lapsed; the rules engine should sit the player out.
    ReconnectExpired {
        /// Player who did not come back.
        player_id: String,
        /// Table they were seated at.
        table_id: String,
        /// Tournament, when the table is part of one.
        tournament_id: Option<String>,
    },
    /// A tournament was paused on the bubble.
    BubblePauseStarted {
        /// Paused tournament.
        tournament_id: String,
        /// Ceiling after which play resumes regardless.
        max_pause_ms: u64,
    },
    /// A bubble pause ended.
    BubblePauseEnded {
        /// Resumed tournament.
        tournament_id: String,
        /// `true` when the ceiling elapsed rather than the pause being cancelled.
        forced: bool,
    },
}

impl ClockEvent {
    /// Wire name, also used as the SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ActionTimedOut { .. } => "action_timed_out",
            Self::PlayerDisconnected { .. } => "player_disconnected",
            Self::PlayerReconnected { .. } => "player_reconnected",
            Self::ReconnectExpired { .. } => "reconnect_expired",
            Self::BubblePauseStarted { .. } => "bubble_pause_started",
            Self::BubblePauseEnded { .. } => "bubble_pause_ended",
        }
    }
}
