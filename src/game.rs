//! Game session state machine.
//!
//! A [`GameSession`] owns one match: seats, spectators, the position,
//! clocks, history and the draw/replay negotiations. It is a plain
//! synchronous value; the registry wraps it in a mutex and turns its
//! results into broadcasts.
//!
//! Every operation takes the current time in Unix milliseconds so the
//! clock arithmetic stays deterministic under test.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::chat::{self, ChatLog, ChatMessage};
use crate::clock::{Clocks, TimeControl};
use crate::config::SessionConfig;
use crate::error::{GameError, GameResult};
use crate::movegen;
use crate::types::*;

/// Longest accepted player or spectator name.
const MAX_NAME_LEN: usize = 32;

/// Returns the current Unix time in milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Trims a display name and checks it is usable.
pub fn validate_name(name: &str) -> GameResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(GameError::MalformedCommand("name must not be empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(GameError::MalformedCommand(format!(
            "name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

// ---------------------------------------------------------------------------
// Participants and records
// ---------------------------------------------------------------------------

/// A seated player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Player {
    /// Connection currently bound to this seat.
    pub id: Uuid,
    pub name: String,
    pub color: Color,
    pub connected: bool,
    /// Bumped every time the seat is (re)bound, so a stale grace timer
    /// can tell it lost the race.
    #[serde(skip)]
    pub generation: u64,
    /// Secret handed only to the seated connection; presenting it is the
    /// only way to take the seat back after a drop.
    #[serde(skip)]
    pub reconnect_token: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Spectator {
    pub id: Uuid,
    pub name: String,
}

/// One committed ply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MoveRecord {
    /// Full-move number, starting at 1.
    pub number: u32,
    pub color: Color,
    #[serde(flatten)]
    pub descriptor: MoveDescriptor,
    /// Unix milliseconds.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ReplayOffer {
    pub from: Color,
    pub from_player: String,
    pub timestamp: u64,
}

/// A destination reported to a player hovering over one of their pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PossibleMove {
    #[schema(value_type = String)]
    pub to: Square,
    pub is_capture: bool,
}

// ---------------------------------------------------------------------------
// Operation outcomes
// ---------------------------------------------------------------------------

/// How a join was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// A free seat was taken. `first` is set for the opening seat.
    Seated {
        color: Color,
        first: bool,
        reconnect_token: Uuid,
    },
    /// A disconnected seat was rebound to its token holder.
    Reconnected {
        color: Color,
        previous: Uuid,
        reconnect_token: Uuid,
    },
}

/// What leaving meant for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Departure {
    Spectator { name: String },
    /// A player left before the game started; the seat is free again.
    LeftWaiting { name: String },
    /// A player dropped. `grace` is set when a reconnection window applies.
    Player {
        color: Color,
        generation: u64,
        grace: bool,
    },
    Unknown,
}

/// Result of answering a replay offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayAnswer {
    pub accepted: bool,
    /// Connection of the player who made the offer, if still connected.
    pub offerer: Option<Uuid>,
    pub responder_name: String,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Full authoritative state pushed to every participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SessionSnapshot {
    pub id: String,
    pub players: Vec<Player>,
    pub spectators: Vec<Spectator>,
    /// Occupied squares only, keyed by algebraic name.
    pub board: BTreeMap<String, Piece>,
    pub current_player: Color,
    pub state: GameState,
    pub time_control: String,
    pub white_time: f64,
    pub black_time: f64,
    pub move_history: Vec<MoveRecord>,
    pub last_move: Option<MoveDescriptor>,
    pub draw_offer: Option<Color>,
    pub draw_offer_cooldown: u32,
    pub replay_offer: Option<ReplayOffer>,
    pub winner: Option<Winner>,
    pub end_reason: Option<EndReason>,
    pub in_check: bool,
    pub invite_url: String,
    pub castling: CastlingRights,
    #[schema(value_type = Option<String>)]
    pub en_passant: Option<Square>,
    pub messages: Vec<ChatMessage>,
}

/// Compact listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SessionSummary {
    pub id: String,
    pub state: GameState,
    pub players: Vec<String>,
    pub spectators: usize,
    pub moves: usize,
    pub time_control: String,
}

// ---------------------------------------------------------------------------
// GameSession
// ---------------------------------------------------------------------------

/// One match between two seated players.
#[derive(Debug, Clone)]
pub struct GameSession {
    pub id: String,
    /// Distinguishes this session from a later one reusing the same key.
    pub instance: Uuid,
    pub players: Vec<Player>,
    pub spectators: Vec<Spectator>,
    pub position: Position,
    pub current_player: Color,
    pub state: GameState,
    pub time_control: TimeControl,
    pub clocks: Clocks,
    /// Unix milliseconds of the last commit (or game start).
    pub last_move_time: u64,
    pub move_history: Vec<MoveRecord>,
    pub last_move: Option<MoveDescriptor>,
    pub draw_offer: Option<Color>,
    /// When the pending draw offer was made; clocks are paused from here.
    pub draw_offer_at: Option<u64>,
    /// Plies since the last draw offer.
    pub draw_offer_cooldown: u32,
    pub replay_offer: Option<ReplayOffer>,
    pub winner: Option<Winner>,
    pub end_reason: Option<EndReason>,
    pub in_check: bool,
    pub invite_url: String,
    /// Color handed to the first player seated.
    pub first_color: Color,
    pub last_activity: u64,
    pub messages: ChatLog,
    next_generation: u64,
    draw_offer_min_plies: u32,
    time_up_tolerance_ms: u64,
}

impl GameSession {
    /// Creates an empty session waiting for its first player.
    pub fn new(
        id: &str,
        time_control: TimeControl,
        first_color: Color,
        config: &SessionConfig,
        now: u64,
    ) -> Self {
        Self {
            id: id.to_string(),
            instance: Uuid::new_v4(),
            players: Vec::with_capacity(2),
            spectators: Vec::new(),
            position: Position::starting(),
            current_player: Color::White,
            state: GameState::Waiting,
            time_control,
            clocks: Clocks::new(time_control),
            last_move_time: now,
            move_history: Vec::new(),
            last_move: None,
            draw_offer: None,
            draw_offer_at: None,
            draw_offer_cooldown: 0,
            replay_offer: None,
            winner: None,
            end_reason: None,
            in_check: false,
            invite_url: config.invite_url(id),
            first_color,
            last_activity: now,
            messages: ChatLog::default(),
            next_generation: 0,
            draw_offer_min_plies: config.draw_offer_min_plies,
            time_up_tolerance_ms: config.time_up_tolerance.as_millis() as u64,
        }
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// The connected seat bound to `conn`.
    pub fn player(&self, conn: Uuid) -> Option<&Player> {
        self.players.iter().find(|p| p.id == conn && p.connected)
    }

    fn seated_color(&self, conn: Uuid) -> GameResult<Color> {
        self.player(conn)
            .map(|p| p.color)
            .ok_or(GameError::NotParticipant)
    }

    fn player_by_color(&self, color: Color) -> Option<&Player> {
        self.players.iter().find(|p| p.color == color)
    }

    /// Returns `true` if the connection holds a seat or a spectator slot.
    pub fn has_member(&self, conn: Uuid) -> bool {
        self.player(conn).is_some() || self.spectators.iter().any(|s| s.id == conn)
    }

    /// Connected players and spectators.
    pub fn participants(&self) -> Vec<Uuid> {
        self.players
            .iter()
            .filter(|p| p.connected)
            .map(|p| p.id)
            .chain(self.spectators.iter().map(|s| s.id))
            .collect()
    }

    /// Every connection id ever bound here and still recorded.
    pub fn member_ids(&self) -> Vec<Uuid> {
        self.players
            .iter()
            .map(|p| p.id)
            .chain(self.spectators.iter().map(|s| s.id))
            .collect()
    }

    fn require_active(&self) -> GameResult<()> {
        if self.state == GameState::Active {
            Ok(())
        } else {
            Err(GameError::WrongState(self.state))
        }
    }

    fn finish(&mut self, state: GameState, winner: Option<Winner>, reason: EndReason) {
        self.state = state;
        self.winner = winner;
        self.end_reason = Some(reason);
        self.draw_offer = None;
        self.draw_offer_at = None;
        log::info!(
            "Session {} ended: {} ({})",
            self.id,
            reason,
            winner.map(|w| w.to_string()).unwrap_or_else(|| "no winner".into())
        );
    }

    /// Milliseconds the side to move has been thinking, excluding a pending
    /// draw-offer pause.
    fn elapsed_on_clock(&self, now: u64) -> u64 {
        let until = self.draw_offer_at.unwrap_or(now).min(now);
        until.saturating_sub(self.last_move_time)
    }

    // -----------------------------------------------------------------------
    // Seating
    // -----------------------------------------------------------------------

    /// Seats a player, or rebinds a disconnected seat whose reconnect token
    /// matches. A display name alone never reclaims a seat.
    pub fn join(
        &mut self,
        conn: Uuid,
        name: &str,
        reconnect_token: Option<Uuid>,
        now: u64,
    ) -> GameResult<JoinOutcome> {
        if self.has_member(conn) {
            return Err(GameError::AlreadyJoined(self.id.clone()));
        }
        let name = validate_name(name)?;

        if let Some(token) = reconnect_token
            && let Some(seat) = self
                .players
                .iter_mut()
                .find(|p| !p.connected && p.reconnect_token == token)
        {
            let previous = seat.id;
            self.next_generation += 1;
            seat.id = conn;
            seat.connected = true;
            seat.generation = self.next_generation;
            let color = seat.color;
            self.last_activity = now;
            log::info!("{} reconnected to session {} as {color}", seat.name, self.id);
            return Ok(JoinOutcome::Reconnected {
                color,
                previous,
                reconnect_token: token,
            });
        }

        if self.players.len() >= 2 {
            return Err(GameError::SessionFull);
        }

        let color = match self.players.first() {
            Some(existing) => existing.color.opponent(),
            None => self.first_color,
        };
        self.next_generation += 1;
        let reconnect_token = Uuid::new_v4();
        self.players.push(Player {
            id: conn,
            name: name.clone(),
            color,
            connected: true,
            generation: self.next_generation,
            reconnect_token,
        });
        self.last_activity = now;

        if self.players.len() == 2 {
            self.state = GameState::Active;
            self.last_move_time = now;
            log::info!("Session {} is active ({})", self.id, self.time_control);
        }

        log::info!("{name} joined session {} as {color}", self.id);
        Ok(JoinOutcome::Seated {
            color,
            first: self.players.len() == 1,
            reconnect_token,
        })
    }

    pub fn join_spectator(&mut self, conn: Uuid, name: &str, now: u64) -> GameResult<String> {
        if self.has_member(conn) {
            return Err(GameError::AlreadyJoined(self.id.clone()));
        }
        let name = validate_name(name)?;
        self.spectators.push(Spectator {
            id: conn,
            name: name.clone(),
        });
        self.last_activity = now;
        Ok(name)
    }

    /// Unbinds a connection from the session.
    pub fn disconnect(&mut self, conn: Uuid, now: u64) -> Departure {
        if let Some(idx) = self.spectators.iter().position(|s| s.id == conn) {
            let spectator = self.spectators.remove(idx);
            return Departure::Spectator {
                name: spectator.name,
            };
        }

        let Some(idx) = self.players.iter().position(|p| p.id == conn) else {
            return Departure::Unknown;
        };
        self.last_activity = now;

        if self.state == GameState::Waiting {
            let player = self.players.remove(idx);
            return Departure::LeftWaiting { name: player.name };
        }

        let player = &mut self.players[idx];
        player.connected = false;
        let (color, generation) = (player.color, player.generation);

        if self
            .replay_offer
            .as_ref()
            .is_some_and(|offer| offer.from == color)
        {
            self.replay_offer = None;
        }

        Departure::Player {
            color,
            generation,
            grace: self.state == GameState::Active,
        }
    }

    /// Abandons the game if the seat is still the one that dropped.
    /// Returns `false` when the timer lost a race with a reconnect or the
    /// game already ended.
    pub fn expire_grace(&mut self, color: Color, generation: u64, now: u64) -> bool {
        if self.state != GameState::Active {
            return false;
        }
        let still_gone = self
            .player_by_color(color)
            .is_some_and(|p| !p.connected && p.generation == generation);
        if !still_gone {
            return false;
        }
        self.last_activity = now;
        self.finish(
            GameState::Abandoned,
            Some(Winner::from(color.opponent())),
            EndReason::Disconnection,
        );
        true
    }

    // -----------------------------------------------------------------------
    // Moves
    // -----------------------------------------------------------------------

    /// Validates and commits a move from `conn`.
    pub fn make_move(
        &mut self,
        conn: Uuid,
        from: Square,
        to: Square,
        promotion: Option<PieceKind>,
        now: u64,
    ) -> GameResult<MoveDescriptor> {
        self.require_active()?;
        let color = self.seated_color(conn)?;
        if color != self.current_player {
            return Err(GameError::NotYourTurn(self.current_player));
        }
        if !movegen::is_legal_move(&mut self.position, color, from, to) {
            log::warn!("Illegal move {from}{to} by {color} in session {}", self.id);
            return Err(GameError::IllegalMove { from, to });
        }

        let descriptor = movegen::execute_move(&mut self.position, from, to, promotion)?;

        self.move_history.push(MoveRecord {
            number: (self.move_history.len() / 2 + 1) as u32,
            color,
            descriptor,
            timestamp: now,
        });

        // An outstanding draw offer is implicitly declined; the pause still
        // counts as stopped time.
        if let Some(offered_at) = self.draw_offer_at.take() {
            self.last_move_time += now.saturating_sub(offered_at);
        }
        let elapsed = now.saturating_sub(self.last_move_time) as f64 / 1000.0;
        let on_time = self.clocks.debit(color, elapsed);
        if on_time {
            self.clocks.credit(color, self.time_control.increment_secs);
        }

        let next = color.opponent();
        self.current_player = next;
        self.last_move_time = now;
        self.last_activity = now;
        self.draw_offer_cooldown += 1;
        self.draw_offer = None;
        self.last_move = Some(descriptor);
        self.in_check = movegen::is_king_in_check(&self.position.board, next);

        if !on_time {
            self.finish(GameState::Finished, Some(Winner::from(next)), EndReason::Timeout);
        } else if movegen::is_checkmate(&mut self.position, next) {
            self.finish(GameState::Finished, Some(Winner::from(color)), EndReason::Checkmate);
        } else if movegen::is_stalemate(&mut self.position, next) {
            self.finish(GameState::Finished, Some(Winner::Draw), EndReason::Stalemate);
        }

        Ok(descriptor)
    }

    /// Legal destinations for one of the requester's pieces. Empty unless the
    /// game is active and it is the requester's turn.
    pub fn possible_moves(&mut self, conn: Uuid, square: Square) -> Vec<PossibleMove> {
        let Some(color) = self.player(conn).map(|p| p.color) else {
            return Vec::new();
        };
        if self.state != GameState::Active || color != self.current_player {
            return Vec::new();
        }

        let position = &mut self.position;
        let moving = position.board.get(square);
        movegen::legal_destinations(position, color, square)
            .into_iter()
            .map(|to| {
                let en_passant = moving.is_some_and(|p| p.kind == PieceKind::Pawn)
                    && to.file != square.file
                    && position.en_passant == Some(to);
                PossibleMove {
                    to,
                    is_capture: position.board.get(to).is_some() || en_passant,
                }
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Ending the game
    // -----------------------------------------------------------------------

    pub fn resign(&mut self, conn: Uuid, now: u64) -> GameResult<()> {
        self.require_active()?;
        let color = self.seated_color(conn)?;
        self.last_activity = now;
        self.finish(
            GameState::Finished,
            Some(Winner::from(color.opponent())),
            EndReason::Resignation,
        );
        Ok(())
    }

    /// Handles a client report that `color`'s clock reached zero.
    ///
    /// Only the running clock can run out, and only if the server agrees
    /// it is exhausted within the configured tolerance.
    pub fn time_up(&mut self, conn: Uuid, color: Color, now: u64) -> GameResult<()> {
        self.require_active()?;
        self.seated_color(conn)?;
        if color != self.current_player || self.draw_offer_at.is_some() {
            return Err(GameError::ClockNotRunning(color));
        }

        let elapsed_ms = self.elapsed_on_clock(now);
        let remaining_ms = self.clocks.remaining(color) * 1000.0 - elapsed_ms as f64;
        if remaining_ms > self.time_up_tolerance_ms as f64 {
            return Err(GameError::ClockNotExpired {
                color,
                remaining: remaining_ms / 1000.0,
            });
        }

        self.clocks.exhaust(color);
        self.last_activity = now;
        self.finish(
            GameState::Finished,
            Some(Winner::from(color.opponent())),
            EndReason::Timeout,
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Draw negotiation
    // -----------------------------------------------------------------------

    pub fn offer_draw(&mut self, conn: Uuid, now: u64) -> GameResult<()> {
        self.require_active()?;
        let color = self.seated_color(conn)?;

        if self.draw_offer_cooldown < self.draw_offer_min_plies {
            return Err(GameError::DrawOfferCooldown {
                remaining: self.draw_offer_min_plies - self.draw_offer_cooldown,
            });
        }
        if self.draw_offer == Some(color) {
            return Err(GameError::DrawOfferPending);
        }

        self.draw_offer = Some(color);
        self.draw_offer_cooldown = 0;
        if self.draw_offer_at.is_none() {
            self.draw_offer_at = Some(now);
        }
        self.last_activity = now;
        log::info!("{color} offered a draw in session {}", self.id);
        Ok(())
    }

    /// Accepts or declines the opponent's pending offer. Returns `true` if
    /// the game ended.
    pub fn respond_draw(&mut self, conn: Uuid, accept: bool, now: u64) -> GameResult<bool> {
        self.require_active()?;
        let color = self.seated_color(conn)?;
        match self.draw_offer {
            Some(offerer) if offerer != color => {}
            _ => return Err(GameError::NoPendingOffer("draw")),
        }
        self.last_activity = now;

        if accept {
            self.finish(GameState::Finished, Some(Winner::Draw), EndReason::Agreement);
            return Ok(true);
        }

        if let Some(offered_at) = self.draw_offer_at.take() {
            self.last_move_time += now.saturating_sub(offered_at);
        }
        self.draw_offer = None;
        Ok(false)
    }

    // -----------------------------------------------------------------------
    // Replay negotiation
    // -----------------------------------------------------------------------

    /// Records a rematch offer. Returns the name of the offering player and
    /// the opponent's connection.
    pub fn offer_replay(&mut self, conn: Uuid, now: u64) -> GameResult<(String, Uuid)> {
        if !self.state.is_over() {
            return Err(GameError::WrongState(self.state));
        }
        let offerer = self.player(conn).cloned().ok_or(GameError::NotParticipant)?;
        let opponent = self
            .player_by_color(offerer.color.opponent())
            .filter(|p| p.connected)
            .map(|p| p.id)
            .ok_or(GameError::OpponentAway)?;

        self.replay_offer = Some(ReplayOffer {
            from: offerer.color,
            from_player: offerer.name.clone(),
            timestamp: now,
        });
        self.last_activity = now;
        Ok((offerer.name, opponent))
    }

    pub fn respond_replay(&mut self, conn: Uuid, accept: bool, now: u64) -> GameResult<ReplayAnswer> {
        if !self.state.is_over() {
            return Err(GameError::WrongState(self.state));
        }
        let responder = self.player(conn).cloned().ok_or(GameError::NotParticipant)?;
        let offer = match &self.replay_offer {
            Some(offer) if offer.from != responder.color => offer.clone(),
            _ => return Err(GameError::NoPendingOffer("replay")),
        };
        let offerer = self
            .player_by_color(offer.from)
            .filter(|p| p.connected)
            .map(|p| p.id);

        self.replay_offer = None;
        self.last_activity = now;

        if accept {
            if offerer.is_none() {
                return Err(GameError::OpponentAway);
            }
            self.restart(now);
        }

        Ok(ReplayAnswer {
            accepted: accept,
            offerer,
            responder_name: responder.name,
        })
    }

    /// Fresh board and clocks, colors swapped.
    fn restart(&mut self, now: u64) {
        self.position = Position::starting();
        self.current_player = Color::White;
        self.state = GameState::Active;
        self.clocks = Clocks::new(self.time_control);
        self.last_move_time = now;
        self.move_history.clear();
        self.last_move = None;
        self.in_check = false;
        self.winner = None;
        self.end_reason = None;
        self.draw_offer = None;
        self.draw_offer_at = None;
        self.draw_offer_cooldown = 0;
        self.replay_offer = None;
        for player in &mut self.players {
            player.color = player.color.opponent();
        }
        log::info!("Session {} restarted with colors swapped", self.id);
    }

    // -----------------------------------------------------------------------
    // Chat
    // -----------------------------------------------------------------------

    /// Display name and color of a player or spectator.
    fn member(&self, conn: Uuid) -> Option<(String, Option<Color>)> {
        if let Some(player) = self.player(conn) {
            return Some((player.name.clone(), Some(player.color)));
        }
        self.spectators
            .iter()
            .find(|s| s.id == conn)
            .map(|s| (s.name.clone(), None))
    }

    /// Posts a chat line from any member, in any state.
    pub fn send_message(&mut self, conn: Uuid, raw: &str, now: u64) -> GameResult<ChatMessage> {
        let (sender, sender_color) = self.member(conn).ok_or(GameError::NotParticipant)?;
        let text = chat::sanitize_message(raw)?;
        let message = ChatMessage {
            id: Uuid::new_v4(),
            sender: sender.clone(),
            sender_color,
            text,
            timestamp: now,
            read_by: vec![sender],
        };
        self.messages.push(message.clone());
        self.last_activity = now;
        Ok(message)
    }

    /// Marks messages as seen by `conn`. Returns the reader's name and the
    /// ids that were found.
    pub fn mark_messages_read(&mut self, conn: Uuid, ids: &[Uuid]) -> GameResult<(String, Vec<Uuid>)> {
        let (reader, _) = self.member(conn).ok_or(GameError::NotParticipant)?;
        let found = self.messages.mark_read(&reader, ids);
        Ok((reader, found))
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            players: self.players.clone(),
            spectators: self.spectators.clone(),
            board: self.position.board.to_map(),
            current_player: self.current_player,
            state: self.state,
            time_control: self.time_control.to_string(),
            white_time: self.clocks.white,
            black_time: self.clocks.black,
            move_history: self.move_history.clone(),
            last_move: self.last_move,
            draw_offer: self.draw_offer,
            draw_offer_cooldown: self.draw_offer_cooldown,
            replay_offer: self.replay_offer.clone(),
            winner: self.winner,
            end_reason: self.end_reason,
            in_check: self.in_check,
            invite_url: self.invite_url.clone(),
            castling: self.position.castling,
            en_passant: self.position.en_passant,
            messages: self.messages.to_vec(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            state: self.state,
            players: self.players.iter().map(|p| p.name.clone()).collect(),
            spectators: self.spectators.len(),
            moves: self.move_history.len(),
            time_control: self.time_control.to_string(),
        }
    }

    /// Whether the background sweep may drop this session.
    pub fn is_reclaimable(&self, now: u64, config: &SessionConfig) -> bool {
        let idle = now.saturating_sub(self.last_activity);
        let retention = match self.state {
            GameState::Finished => config.finished_retention,
            GameState::Abandoned => config.abandoned_retention,
            GameState::Waiting if !self.players.iter().any(|p| p.connected) => {
                config.waiting_retention
            }
            _ => return false,
        };
        idle > retention.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const T0: u64 = 1_700_000_000_000;

    fn sq(name: &str) -> Square {
        Square::from_algebraic(name).unwrap()
    }

    fn session(tc: TimeControl) -> GameSession {
        GameSession::new("room", tc, Color::White, &SessionConfig::default(), T0)
    }

    /// Two seated players; returns (session, white conn, black conn).
    fn active_session(tc: TimeControl) -> (GameSession, Uuid, Uuid) {
        let mut s = session(tc);
        let white = Uuid::new_v4();
        let black = Uuid::new_v4();
        s.join(white, "alice", None, T0).unwrap();
        s.join(black, "bob", None, T0).unwrap();
        (s, white, black)
    }

    /// Plays knight shuffles so plies accumulate without anything happening.
    fn shuffle(s: &mut GameSession, white: Uuid, black: Uuid, plies: usize, mut now: u64) -> u64 {
        for _ in 0..plies {
            now += 1_000;
            let (conn, home, out) = match s.current_player {
                Color::White => (white, "g1", "f3"),
                Color::Black => (black, "g8", "f6"),
            };
            let (from, to) = if s.position.board.get(sq(home)).is_some() {
                (home, out)
            } else {
                (out, home)
            };
            s.make_move(conn, sq(from), sq(to), None, now).unwrap();
        }
        now
    }

    #[test]
    fn test_join_join_e2e4() {
        let (mut s, white, black) = active_session(TimeControl::new(300, 0));
        assert_eq!(s.state, GameState::Active);
        assert_eq!(s.player(white).unwrap().color, Color::White);
        assert_eq!(s.player(black).unwrap().color, Color::Black);

        let desc = s.make_move(white, sq("e2"), sq("e4"), None, T0 + 2_000).unwrap();
        assert_eq!(desc.piece, Piece::new(PieceKind::Pawn, Color::White));
        assert_eq!(s.current_player, Color::Black);
        assert_eq!(s.move_history.len(), 1);
        assert_eq!(s.move_history[0].number, 1);
        assert_eq!(s.clocks.white, 298.0);
        assert_eq!(s.clocks.black, 300.0);
        assert_eq!(s.draw_offer_cooldown, 1);
        assert_eq!(s.position.en_passant, Some(sq("e3")));

        let snap = s.snapshot();
        assert_eq!(snap.board.get("e4"), Some(&Piece::new(PieceKind::Pawn, Color::White)));
        assert!(!snap.board.contains_key("e2"));
    }

    #[test]
    fn test_first_player_gets_coin_flip_color() {
        let mut s = GameSession::new("room", TimeControl::default(), Color::Black, &SessionConfig::default(), T0);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(matches!(
            s.join(a, "alice", None, T0),
            Ok(JoinOutcome::Seated { color: Color::Black, first: true, .. })
        ));
        assert!(matches!(
            s.join(b, "bob", None, T0),
            Ok(JoinOutcome::Seated { color: Color::White, first: false, .. })
        ));
        assert_ne!(s.players[0].reconnect_token, s.players[1].reconnect_token);
    }

    #[test]
    fn test_third_player_is_turned_away() {
        let (mut s, _, _) = active_session(TimeControl::default());
        assert_eq!(s.join(Uuid::new_v4(), "carol", None, T0), Err(GameError::SessionFull));
        assert_eq!(s.players.len(), 2);
    }

    #[test]
    fn test_bad_names_are_malformed() {
        let mut s = session(TimeControl::default());
        assert!(matches!(
            s.join(Uuid::new_v4(), "   ", None, T0),
            Err(GameError::MalformedCommand(_))
        ));
        assert!(matches!(
            s.join(Uuid::new_v4(), &"x".repeat(40), None, T0),
            Err(GameError::MalformedCommand(_))
        ));
    }

    #[test]
    fn test_out_of_turn_and_illegal_moves_do_not_mutate() {
        let (mut s, white, black) = active_session(TimeControl::default());
        let before = s.snapshot();

        assert_eq!(
            s.make_move(black, sq("e7"), sq("e5"), None, T0 + 1_000),
            Err(GameError::NotYourTurn(Color::White))
        );
        assert_eq!(
            s.make_move(white, sq("e2"), sq("e5"), None, T0 + 1_000),
            Err(GameError::IllegalMove { from: sq("e2"), to: sq("e5") })
        );
        assert_eq!(
            s.make_move(Uuid::new_v4(), sq("e2"), sq("e4"), None, T0 + 1_000),
            Err(GameError::NotParticipant)
        );
        assert_eq!(s.snapshot(), before);
    }

    #[test]
    fn test_moves_rejected_while_waiting() {
        let mut s = session(TimeControl::default());
        let a = Uuid::new_v4();
        s.join(a, "alice", None, T0).unwrap();
        assert_eq!(
            s.make_move(a, sq("e2"), sq("e4"), None, T0),
            Err(GameError::WrongState(GameState::Waiting))
        );
    }

    #[test]
    fn test_increment_is_credited() {
        let (mut s, white, _) = active_session(TimeControl::new(180, 2));
        s.make_move(white, sq("d2"), sq("d4"), None, T0 + 5_000).unwrap();
        assert_eq!(s.clocks.white, 177.0);
    }

    #[test]
    fn test_flag_fall_on_move_is_timeout() {
        let (mut s, white, _) = active_session(TimeControl::new(60, 5));
        s.make_move(white, sq("e2"), sq("e4"), None, T0 + 61_000).unwrap();

        assert_eq!(s.state, GameState::Finished);
        assert_eq!(s.end_reason, Some(EndReason::Timeout));
        assert_eq!(s.winner, Some(Winner::Black));
        assert_eq!(s.clocks.white, 0.0, "no increment after the flag falls");
    }

    #[test]
    fn test_fools_mate_finishes_game() {
        let (mut s, white, black) = active_session(TimeControl::default());
        s.make_move(white, sq("f2"), sq("f3"), None, T0 + 1_000).unwrap();
        s.make_move(black, sq("e7"), sq("e5"), None, T0 + 2_000).unwrap();
        s.make_move(white, sq("g2"), sq("g4"), None, T0 + 3_000).unwrap();
        s.make_move(black, sq("d8"), sq("h4"), None, T0 + 4_000).unwrap();

        assert_eq!(s.state, GameState::Finished);
        assert_eq!(s.end_reason, Some(EndReason::Checkmate));
        assert_eq!(s.winner, Some(Winner::Black));
        assert!(s.in_check);
        assert_eq!(s.move_history[3].number, 2);
    }

    #[test]
    fn test_stalemate_ends_in_draw() {
        let (mut s, white, black) = active_session(TimeControl::default());
        // Shortest known stalemate from the opening position.
        let line = [
            ("e2", "e3"), ("a7", "a5"),
            ("d1", "h5"), ("a8", "a6"),
            ("h5", "a5"), ("h7", "h5"),
            ("h2", "h4"), ("a6", "h6"),
            ("a5", "c7"), ("f7", "f6"),
            ("c7", "d7"), ("e8", "f7"),
            ("d7", "b7"), ("d8", "d3"),
            ("b7", "b8"), ("d3", "h7"),
            ("b8", "c8"), ("f7", "g6"),
            ("c8", "e6"),
        ];
        let mut now = T0;
        for (ply, (from, to)) in line.iter().enumerate() {
            now += 1_000;
            let conn = if ply % 2 == 0 { white } else { black };
            s.make_move(conn, sq(from), sq(to), None, now).unwrap();
        }

        assert_eq!(s.state, GameState::Finished);
        assert_eq!(s.end_reason, Some(EndReason::Stalemate));
        assert_eq!(s.winner, Some(Winner::Draw));
        assert!(!s.in_check);
        assert_eq!(s.move_history.len(), 19);
    }

    #[test]
    fn test_resign() {
        let (mut s, white, _) = active_session(TimeControl::default());
        s.resign(white, T0 + 100).unwrap();
        assert_eq!(s.winner, Some(Winner::Black));
        assert_eq!(s.end_reason, Some(EndReason::Resignation));
        assert_eq!(s.resign(white, T0 + 200), Err(GameError::WrongState(GameState::Finished)));
    }

    #[test]
    fn test_draw_offer_cooldown() {
        let (mut s, white, black) = active_session(TimeControl::default());
        let now = shuffle(&mut s, white, black, 2, T0);

        let err = s.offer_draw(white, now).unwrap_err();
        assert_eq!(err, GameError::DrawOfferCooldown { remaining: 3 });
        assert_eq!(err.to_string(), "must wait 3 more moves before offering a draw");

        let now = shuffle(&mut s, white, black, 4, now);
        s.offer_draw(white, now).unwrap();
        assert_eq!(s.draw_offer, Some(Color::White));
        assert_eq!(s.draw_offer_cooldown, 0);

        // Declining and offering again immediately trips the cooldown.
        s.respond_draw(black, false, now + 500).unwrap();
        assert_eq!(
            s.offer_draw(black, now + 600),
            Err(GameError::DrawOfferCooldown { remaining: 5 })
        );
    }

    #[test]
    fn test_duplicate_draw_offer_is_refused() {
        let (mut s, white, black) = active_session(TimeControl::default());
        let now = shuffle(&mut s, white, black, 6, T0);
        s.offer_draw(white, now).unwrap();
        s.draw_offer_cooldown = 10;
        assert_eq!(s.offer_draw(white, now + 1), Err(GameError::DrawOfferPending));
    }

    #[test]
    fn test_accepting_draw_ends_game() {
        let (mut s, white, black) = active_session(TimeControl::default());
        let now = shuffle(&mut s, white, black, 6, T0);
        s.offer_draw(black, now).unwrap();

        assert_eq!(s.respond_draw(black, true, now), Err(GameError::NoPendingOffer("draw")));
        assert_eq!(s.respond_draw(white, true, now + 10), Ok(true));
        assert_eq!(s.winner, Some(Winner::Draw));
        assert_eq!(s.end_reason, Some(EndReason::Agreement));
    }

    #[test]
    fn test_declined_draw_does_not_charge_paused_time() {
        let (mut s, white, black) = active_session(TimeControl::default());
        let now = shuffle(&mut s, white, black, 6, T0);
        let white_before = s.clocks.white;

        // White is on move: 1s thinking, 20s paused offer, 1s thinking.
        s.offer_draw(black, now + 1_000).unwrap();
        s.respond_draw(white, false, now + 21_000).unwrap();
        s.make_move(white, sq("e2"), sq("e4"), None, now + 22_000).unwrap();

        assert_eq!(s.clocks.white, white_before - 2.0);
    }

    #[test]
    fn test_move_during_pending_offer_skips_paused_time() {
        let (mut s, white, black) = active_session(TimeControl::default());
        let now = shuffle(&mut s, white, black, 6, T0);
        let white_before = s.clocks.white;

        s.offer_draw(white, now + 1_000).unwrap();
        s.make_move(white, sq("e2"), sq("e4"), None, now + 11_000).unwrap();

        assert_eq!(s.draw_offer, None);
        assert_eq!(s.clocks.white, white_before - 1.0);
    }

    #[test]
    fn test_time_up_for_exhausted_clock() {
        let (mut s, white, black) = active_session(TimeControl::new(60, 0));

        assert!(matches!(
            s.time_up(black, Color::White, T0 + 30_000),
            Err(GameError::ClockNotExpired { color: Color::White, .. })
        ));
        assert_eq!(
            s.time_up(black, Color::Black, T0 + 70_000),
            Err(GameError::ClockNotRunning(Color::Black))
        );

        s.time_up(black, Color::White, T0 + 59_500).unwrap();
        assert_eq!(s.state, GameState::Finished);
        assert_eq!(s.end_reason, Some(EndReason::Timeout));
        assert_eq!(s.winner, Some(Winner::Black));
        assert_eq!(s.clocks.white, 0.0);
    }

    #[test]
    fn test_late_time_up_after_validated_move_is_ignored() {
        let (mut s, white, black) = active_session(TimeControl::new(60, 0));
        s.make_move(white, sq("e2"), sq("e4"), None, T0 + 59_000).unwrap();

        // White's flag signal raced the move and lost.
        assert_eq!(
            s.time_up(black, Color::White, T0 + 60_500),
            Err(GameError::ClockNotRunning(Color::White))
        );
        assert_eq!(s.state, GameState::Active);
    }

    #[test]
    fn test_possible_moves() {
        let (mut s, white, black) = active_session(TimeControl::default());

        let mut moves = s.possible_moves(white, sq("g1"));
        moves.sort_by_key(|m| m.to);
        assert_eq!(
            moves,
            vec![
                PossibleMove { to: sq("f3"), is_capture: false },
                PossibleMove { to: sq("h3"), is_capture: false },
            ]
        );

        assert!(s.possible_moves(black, sq("g8")).is_empty(), "not black's turn");
        assert!(s.possible_moves(white, sq("g8")).is_empty(), "not white's piece");
        assert!(s.possible_moves(Uuid::new_v4(), sq("g1")).is_empty());
    }

    #[test]
    fn test_possible_moves_flags_en_passant_as_capture() {
        let (mut s, white, black) = active_session(TimeControl::default());
        s.make_move(white, sq("e2"), sq("e4"), None, T0 + 1_000).unwrap();
        s.make_move(black, sq("a7"), sq("a6"), None, T0 + 2_000).unwrap();
        s.make_move(white, sq("e4"), sq("e5"), None, T0 + 3_000).unwrap();
        s.make_move(black, sq("d7"), sq("d5"), None, T0 + 4_000).unwrap();

        let moves = s.possible_moves(white, sq("e5"));
        assert!(moves.contains(&PossibleMove { to: sq("d6"), is_capture: true }));
        assert!(moves.contains(&PossibleMove { to: sq("e6"), is_capture: false }));
    }

    #[test]
    fn test_disconnect_then_grace_expiry_abandons() {
        let (mut s, white, _) = active_session(TimeControl::default());
        let departure = s.disconnect(white, T0 + 1_000);
        let Departure::Player { color, generation, grace } = departure.clone() else {
            panic!("expected a player departure, got {departure:?}");
        };
        assert_eq!(color, Color::White);
        assert!(grace);

        assert!(s.expire_grace(color, generation, T0 + 31_000));
        assert_eq!(s.state, GameState::Abandoned);
        assert_eq!(s.end_reason, Some(EndReason::Disconnection));
        assert_eq!(s.winner, Some(Winner::Black));
    }

    #[test]
    fn test_reconnect_beats_grace_timer() {
        let (mut s, white, _) = active_session(TimeControl::default());
        let Departure::Player { color, generation, .. } = s.disconnect(white, T0 + 1_000) else {
            panic!("expected a player departure");
        };

        let token = s.players.iter().find(|p| p.id == white).unwrap().reconnect_token;
        let again = Uuid::new_v4();
        assert_eq!(
            s.join(again, "alice", Some(token), T0 + 5_000),
            Ok(JoinOutcome::Reconnected {
                color: Color::White,
                previous: white,
                reconnect_token: token,
            })
        );
        assert!(!s.expire_grace(color, generation, T0 + 31_000));
        assert_eq!(s.state, GameState::Active);
        assert_eq!(s.player(again).map(|p| p.connected), Some(true));
    }

    #[test]
    fn test_name_alone_does_not_reclaim_seat() {
        let (mut s, white, _) = active_session(TimeControl::default());
        s.disconnect(white, T0 + 1_000);

        let stranger = Uuid::new_v4();
        assert_eq!(s.join(stranger, "alice", None, T0 + 2_000), Err(GameError::SessionFull));
        assert_eq!(
            s.join(stranger, "alice", Some(Uuid::new_v4()), T0 + 2_000),
            Err(GameError::SessionFull)
        );
        assert!(s.player(stranger).is_none());
        assert!(s.players.iter().all(|p| p.id != stranger));
    }

    #[test]
    fn test_token_of_connected_seat_is_not_reusable() {
        let (mut s, white, _) = active_session(TimeControl::default());
        let token = s.players.iter().find(|p| p.id == white).unwrap().reconnect_token;
        assert_eq!(
            s.join(Uuid::new_v4(), "mallory", Some(token), T0 + 1_000),
            Err(GameError::SessionFull)
        );
        assert_eq!(s.player(white).map(|p| p.color), Some(Color::White));
    }

    #[test]
    fn test_leaving_waiting_session_frees_seat() {
        let mut s = session(TimeControl::default());
        let a = Uuid::new_v4();
        s.join(a, "alice", None, T0).unwrap();
        assert_eq!(s.disconnect(a, T0 + 10), Departure::LeftWaiting { name: "alice".into() });
        assert!(s.players.is_empty());

        let b = Uuid::new_v4();
        assert!(matches!(
            s.join(b, "bob", None, T0 + 20),
            Ok(JoinOutcome::Seated { color: Color::White, first: true, .. })
        ));
    }

    #[test]
    fn test_spectators() {
        let (mut s, _, _) = active_session(TimeControl::default());
        let watcher = Uuid::new_v4();
        assert_eq!(s.join_spectator(watcher, " carol ", T0), Ok("carol".to_string()));
        assert_eq!(s.join_spectator(watcher, "carol", T0), Err(GameError::AlreadyJoined("room".into())));
        assert!(s.participants().contains(&watcher));
        assert_eq!(s.disconnect(watcher, T0), Departure::Spectator { name: "carol".into() });
        assert!(s.spectators.is_empty());
    }

    #[test]
    fn test_replay_swaps_colors_and_resets() {
        let (mut s, white, black) = active_session(TimeControl::new(180, 2));
        s.make_move(white, sq("e2"), sq("e4"), None, T0 + 4_000).unwrap();
        s.resign(black, T0 + 5_000).unwrap();

        assert_eq!(s.respond_replay(black, true, T0 + 5_500), Err(GameError::NoPendingOffer("replay")));
        let (name, opponent) = s.offer_replay(white, T0 + 6_000).unwrap();
        assert_eq!(name, "alice");
        assert_eq!(opponent, black);
        assert_eq!(s.respond_replay(white, true, T0 + 6_500), Err(GameError::NoPendingOffer("replay")));

        let answer = s.respond_replay(black, true, T0 + 7_000).unwrap();
        assert!(answer.accepted);
        assert_eq!(answer.offerer, Some(white));

        assert_eq!(s.state, GameState::Active);
        assert_eq!(s.player(white).unwrap().color, Color::Black);
        assert_eq!(s.player(black).unwrap().color, Color::White);
        assert_eq!(s.current_player, Color::White);
        assert!(s.move_history.is_empty());
        assert_eq!(s.clocks, Clocks::new(TimeControl::new(180, 2)));
        assert_eq!(s.winner, None);
        assert_eq!(s.position, Position::starting());
    }

    #[test]
    fn test_replay_after_abandonment() {
        let (mut s, white, black) = active_session(TimeControl::default());
        let token = s.players.iter().find(|p| p.id == white).unwrap().reconnect_token;
        let Departure::Player { color, generation, .. } = s.disconnect(white, T0 + 1_000) else {
            panic!("expected a player departure");
        };
        assert!(s.expire_grace(color, generation, T0 + 31_000));
        assert_eq!(s.state, GameState::Abandoned);

        let back = Uuid::new_v4();
        assert!(matches!(
            s.join(back, "alice", Some(token), T0 + 40_000),
            Ok(JoinOutcome::Reconnected { color: Color::White, .. })
        ));
        assert_eq!(s.state, GameState::Abandoned, "rejoining does not revive the game");

        let (name, opponent) = s.offer_replay(black, T0 + 41_000).unwrap();
        assert_eq!(name, "bob");
        assert_eq!(opponent, back);

        let answer = s.respond_replay(back, true, T0 + 42_000).unwrap();
        assert!(answer.accepted);
        assert_eq!(s.state, GameState::Active);
        assert_eq!(s.end_reason, None);
        assert_eq!(s.winner, None);
        assert_eq!(s.player(back).unwrap().color, Color::Black);
        assert_eq!(s.player(black).unwrap().color, Color::White);
        assert_eq!(s.last_move_time, T0 + 42_000);
    }

    #[test]
    fn test_declined_replay_keeps_result() {
        let (mut s, white, black) = active_session(TimeControl::default());
        s.resign(white, T0 + 1_000).unwrap();
        s.offer_replay(black, T0 + 2_000).unwrap();

        let answer = s.respond_replay(white, false, T0 + 3_000).unwrap();
        assert!(!answer.accepted);
        assert_eq!(answer.offerer, Some(black));
        assert_eq!(answer.responder_name, "alice");
        assert_eq!(s.state, GameState::Finished);
        assert_eq!(s.replay_offer, None);
    }

    #[test]
    fn test_replay_needs_connected_opponent() {
        let (mut s, white, black) = active_session(TimeControl::default());
        s.resign(white, T0 + 1_000).unwrap();
        s.disconnect(black, T0 + 2_000);
        assert_eq!(s.offer_replay(white, T0 + 3_000), Err(GameError::OpponentAway));
        assert_eq!(s.offer_replay(black, T0 + 3_000), Err(GameError::NotParticipant));
    }

    #[test]
    fn test_chat_between_players_and_spectators() {
        let (mut s, white, black) = active_session(TimeControl::default());
        let watcher = Uuid::new_v4();
        s.join_spectator(watcher, "carol", T0).unwrap();

        let hello = s.send_message(white, " <i>good luck</i> ", T0 + 100).unwrap();
        assert_eq!(hello.text, "good luck");
        assert_eq!(hello.sender, "alice");
        assert_eq!(hello.sender_color, Some(Color::White));
        assert_eq!(hello.read_by, vec!["alice".to_string()]);

        let aside = s.send_message(watcher, "enjoying this", T0 + 200).unwrap();
        assert_eq!(aside.sender_color, None);

        assert_eq!(
            s.send_message(black, "you cheat", T0 + 300),
            Err(GameError::MessageRejected("message contains inappropriate content".into()))
        );
        assert_eq!(s.send_message(Uuid::new_v4(), "hi", T0), Err(GameError::NotParticipant));
        assert_eq!(s.messages.len(), 2);

        let (reader, found) = s.mark_messages_read(black, &[hello.id]).unwrap();
        assert_eq!(reader, "bob");
        assert_eq!(found, vec![hello.id]);
        assert_eq!(
            s.snapshot().messages[0].read_by,
            vec!["alice".to_string(), "bob".to_string()]
        );
    }

    #[test]
    fn test_reclaim_windows() {
        let config = SessionConfig::default();
        let (mut s, white, _) = active_session(TimeControl::default());
        assert!(!s.is_reclaimable(T0 + 10 * 3_600_000, &config), "active sessions stay");

        s.resign(white, T0).unwrap();
        assert!(!s.is_reclaimable(T0 + 59 * 60_000, &config));
        assert!(s.is_reclaimable(T0 + 61 * 60_000, &config));

        let mut waiting = session(TimeControl::default());
        let a = Uuid::new_v4();
        waiting.join(a, "alice", None, T0).unwrap();
        assert!(!waiting.is_reclaimable(T0 + 31 * 60_000, &config), "someone is seated");
        waiting.disconnect(a, T0);
        assert!(waiting.is_reclaimable(T0 + 31 * 60_000, &config));
    }

    #[test]
    fn test_snapshot_serializes_snake_case() {
        let (s, _, _) = active_session(TimeControl::new(180, 2));
        let json = serde_json::to_value(s.snapshot()).unwrap();
        assert_eq!(json["state"], "active");
        assert_eq!(json["current_player"], "white");
        assert_eq!(json["time_control"], "3+2");
        assert_eq!(json["invite_url"], "http://localhost:8080/?gameId=room");
        assert_eq!(json["board"]["e1"]["type"], "king");
        assert!(json["players"][0].get("generation").is_none());
        assert!(json["players"][0].get("reconnect_token").is_none());
    }
}
