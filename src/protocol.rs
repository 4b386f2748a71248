//! Wire protocol between clients and the session registry.
//!
//! Commands arrive as JSON objects tagged by `"type"`; events leave as JSON
//! objects tagged by `"event"`. Both sides use snake_case names.
//!
//! ```json
//! { "type": "move", "session_id": "abc", "from": "e2", "to": "e4" }
//! { "event": "possible_moves", "square": "g1", "moves": [{ "to": "f3", "is_capture": false }] }
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chat::ChatMessage;
use crate::game::{PossibleMove, SessionSnapshot};
use crate::types::{Color, EndReason, Square, Winner};

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// A command sent by a connection, always addressed to one session.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Take a seat, creating the session on first use.
    Join {
        session_id: String,
        player_name: String,
        /// Preset such as `"3+2"`; only consulted when the session is created.
        #[serde(default)]
        time_control: Option<String>,
        /// Token from an earlier `seated` event, to take a dropped seat back.
        #[serde(default)]
        reconnect_token: Option<Uuid>,
    },
    JoinAsSpectator {
        session_id: String,
        name: String,
    },
    Move {
        session_id: String,
        from: Square,
        to: Square,
        /// `"q"`, `"r"`, `"b"`, `"n"` or the full piece name.
        #[serde(default)]
        promotion: Option<String>,
    },
    GetPossibleMoves {
        session_id: String,
        square: Square,
    },
    Resign {
        session_id: String,
    },
    OfferDraw {
        session_id: String,
    },
    RespondDraw {
        session_id: String,
        accept: bool,
    },
    /// A client-side clock reached zero for `color`.
    TimeUp {
        session_id: String,
        color: Color,
    },
    OfferReplay {
        session_id: String,
    },
    RespondReplay {
        session_id: String,
        accept: bool,
    },
    SendMessage {
        session_id: String,
        message: String,
    },
    MarkMessagesRead {
        session_id: String,
        message_ids: Vec<Uuid>,
    },
}

impl ClientCommand {
    pub fn session_id(&self) -> &str {
        match self {
            ClientCommand::Join { session_id, .. }
            | ClientCommand::JoinAsSpectator { session_id, .. }
            | ClientCommand::Move { session_id, .. }
            | ClientCommand::GetPossibleMoves { session_id, .. }
            | ClientCommand::Resign { session_id }
            | ClientCommand::OfferDraw { session_id }
            | ClientCommand::RespondDraw { session_id, .. }
            | ClientCommand::TimeUp { session_id, .. }
            | ClientCommand::OfferReplay { session_id }
            | ClientCommand::RespondReplay { session_id, .. }
            | ClientCommand::SendMessage { session_id, .. }
            | ClientCommand::MarkMessagesRead { session_id, .. } => session_id,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientCommand::Join { .. } => "join",
            ClientCommand::JoinAsSpectator { .. } => "join_as_spectator",
            ClientCommand::Move { .. } => "move",
            ClientCommand::GetPossibleMoves { .. } => "get_possible_moves",
            ClientCommand::Resign { .. } => "resign",
            ClientCommand::OfferDraw { .. } => "offer_draw",
            ClientCommand::RespondDraw { .. } => "respond_draw",
            ClientCommand::TimeUp { .. } => "time_up",
            ClientCommand::OfferReplay { .. } => "offer_replay",
            ClientCommand::RespondReplay { .. } => "respond_replay",
            ClientCommand::SendMessage { .. } => "send_message",
            ClientCommand::MarkMessagesRead { .. } => "mark_messages_read",
        }
    }
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// Everything the server pushes to connections.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Full authoritative state, sent after every accepted transition.
    GameUpdate(Box<SessionSnapshot>),
    PossibleMoves {
        square: Square,
        moves: Vec<PossibleMove>,
    },
    /// Private to the seated connection. The token is needed to reclaim the
    /// seat after a drop.
    Seated {
        color: Color,
        reconnect_token: Uuid,
    },
    /// Sent to the first player seated in a session.
    InviteGenerated {
        url: String,
    },
    GameEnded {
        reason: EndReason,
        winner: Option<Winner>,
    },
    ReplayOffered {
        from_player: String,
    },
    ReplayDeclined {
        from_player: String,
    },
    SpectatorJoined {
        name: String,
    },
    SpectatorLeft {
        name: String,
    },
    MoveRejected {
        reason: String,
    },
    CommandError {
        reason: String,
    },
    NewMessage(ChatMessage),
    /// Read receipt, sent to everyone but the reader.
    MessagesRead {
        read_by: String,
        message_ids: Vec<Uuid>,
    },
    /// Sent to the author of a chat message that was not posted.
    MessageError {
        reason: String,
    },
}

/// Outbound delivery seam between the registry and a transport.
///
/// Delivery is best-effort: recipients that are gone are skipped.
pub trait Notifier: Send + Sync {
    fn notify(&self, recipients: &[Uuid], event: &ServerEvent);
}
