//! Error types for the chess-duel session server.
//!
//! Every rejection a command can meet is a [`GameError`]. The transport
//! layer never inspects variants directly; it asks for the
//! [`Disposition`] and reacts accordingly.

use crate::types::{Color, Square};

/// How the command boundary reacts to a failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Drop without telling anyone.
    Silent,
    /// Tell the sender their move was refused.
    MoveRejected,
    /// Tell the sender why the command failed.
    CommandError,
    /// Tell the sender their chat message was not posted.
    MessageError,
}

/// Errors that can occur while processing an inbound command.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GameError {
    /// Bad payload shape or out-of-range value.
    #[error("malformed command: {0}")]
    MalformedCommand(String),

    /// The move failed generation or the legality filter.
    #[error("illegal move: {from} -> {to}")]
    IllegalMove { from: Square, to: Square },

    /// The connection is moving faster than the throttle allows.
    #[error("move rate limit exceeded")]
    RateLimited,

    /// Unknown session key.
    #[error("session {0} not found")]
    SessionNotFound(String),

    /// The connection is not seated (or not seated in this session).
    #[error("connection is not a participant of this session")]
    NotParticipant,

    /// The connection already holds a seat or spectator slot somewhere.
    #[error("already joined session {0}")]
    AlreadyJoined(String),

    /// Both seats are taken by connected players.
    #[error("session is full")]
    SessionFull,

    /// The command needs a different lifecycle state.
    #[error("not allowed while the game is {0}")]
    WrongState(crate::types::GameState),

    /// Moving out of turn.
    #[error("it is {0}'s turn")]
    NotYourTurn(Color),

    /// Draw offered again too soon.
    #[error("must wait {remaining} more moves before offering a draw")]
    DrawOfferCooldown { remaining: u32 },

    /// The same side already has an offer on the table.
    #[error("you already have a pending draw offer")]
    DrawOfferPending,

    /// Responding to an offer that does not exist or that the sender made.
    #[error("there is no pending {0} offer to respond to")]
    NoPendingOffer(&'static str),

    /// A replay needs both players connected.
    #[error("opponent is not connected")]
    OpponentAway,

    /// A time-up claim for a clock that is not exhausted.
    #[error("{color} still has {remaining:.1}s on the clock")]
    ClockNotExpired { color: Color, remaining: f64 },

    /// A time-up claim for the side whose clock is stopped.
    #[error("{0}'s clock is not running")]
    ClockNotRunning(Color),

    /// A chat message failed sanitizing or the content filter.
    #[error("{0}")]
    MessageRejected(String),

    /// Something went wrong that the sender could not have caused.
    #[error("internal failure: {0}")]
    Internal(String),
}

impl GameError {
    /// Maps the error onto the reaction at the command boundary.
    pub fn disposition(&self) -> Disposition {
        match self {
            GameError::RateLimited | GameError::SessionNotFound(_) | GameError::NotParticipant => {
                Disposition::Silent
            }
            GameError::IllegalMove { .. } | GameError::NotYourTurn(_) => Disposition::MoveRejected,
            GameError::MessageRejected(_) => Disposition::MessageError,
            _ => Disposition::CommandError,
        }
    }
}

/// Result type alias for command processing.
pub type GameResult<T> = Result<T, GameError>;
