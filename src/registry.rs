//! Session registry and command dispatch.
//!
//! The registry is the single entry point for inbound commands. It owns the
//! keyed store of sessions (each behind its own mutex), the connection →
//! session membership table, the move rate limiter and the disconnect
//! grace timers.
//!
//! Every command runs inside a panic boundary. Events produced while a
//! session is locked are collected in an [`Outbox`] and only handed to the
//! [`Notifier`] once all locks are released.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use crate::clock::TimeControl;
use crate::config::{RateLimitConfig, SessionConfig};
use crate::error::{Disposition, GameError, GameResult};
use crate::game::{
    unix_millis, validate_name, Departure, GameSession, JoinOutcome, SessionSnapshot, SessionSummary,
};
use crate::protocol::{ClientCommand, Notifier, ServerEvent};
use crate::rate_limit::MoveRateLimiter;
use crate::types::{Color, GameState, PieceKind};

/// Longest accepted session key.
const MAX_SESSION_ID_LEN: usize = 64;

type SharedSession = Arc<Mutex<GameSession>>;

/// Events waiting to be delivered once locks are released.
#[derive(Default)]
struct Outbox {
    queue: Vec<(Vec<Uuid>, ServerEvent)>,
}

impl Outbox {
    fn to(&mut self, recipients: Vec<Uuid>, event: ServerEvent) {
        if !recipients.is_empty() {
            self.queue.push((recipients, event));
        }
    }

    fn to_one(&mut self, conn: Uuid, event: ServerEvent) {
        self.queue.push((vec![conn], event));
    }

    /// Snapshot for everyone in the session, plus the end notice if the
    /// game just ended.
    fn broadcast_state(&mut self, session: &GameSession, ended: bool) {
        let participants = session.participants();
        if ended && let Some(reason) = session.end_reason {
            self.to(
                participants.clone(),
                ServerEvent::GameEnded {
                    reason,
                    winner: session.winner,
                },
            );
        }
        self.to(participants, ServerEvent::GameUpdate(Box::new(session.snapshot())));
    }

    fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Acquires a mutex, turning poison into an internal failure.
fn lock<T>(mutex: &Mutex<T>) -> GameResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| GameError::Internal("lock poisoned".to_string()))
}

/// Rejects session keys that could not have come from an invite link.
fn validate_session_id(id: &str) -> GameResult<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(GameError::MalformedCommand(format!("invalid session id '{id}'")))
    }
}

// ---------------------------------------------------------------------------
// SessionRegistry
// ---------------------------------------------------------------------------

/// Process-wide session service. Construct one, share it behind an `Arc`,
/// and call [`SessionRegistry::shutdown`] when done.
pub struct SessionRegistry {
    config: SessionConfig,
    sessions: RwLock<HashMap<String, SharedSession>>,
    /// Connection → key of the session it joined.
    memberships: Mutex<HashMap<Uuid, String>>,
    limiter: Mutex<MoveRateLimiter>,
    grace_timers: Mutex<HashMap<(String, Uuid), AbortHandle>>,
    reclaimer: Mutex<Option<JoinHandle<()>>>,
    notifier: Arc<dyn Notifier>,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig, rate_limit: RateLimitConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            memberships: Mutex::new(HashMap::new()),
            limiter: Mutex::new(MoveRateLimiter::new(rate_limit)),
            grace_timers: Mutex::new(HashMap::new()),
            reclaimer: Mutex::new(None),
            notifier,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Store access
    // -----------------------------------------------------------------------

    fn find(&self, id: &str) -> GameResult<SharedSession> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| GameError::Internal("session table poisoned".to_string()))?;
        sessions
            .get(id)
            .cloned()
            .ok_or_else(|| GameError::SessionNotFound(id.to_string()))
    }

    fn find_or_create(&self, id: &str, time_control: Option<&str>, now: u64) -> GameResult<SharedSession> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| GameError::Internal("session table poisoned".to_string()))?;
        let session = sessions.entry(id.to_string()).or_insert_with(|| {
            let tc = time_control
                .and_then(|label| label.parse::<TimeControl>().ok())
                .unwrap_or(self.config.default_time_control);
            let first_color = if rand::random::<bool>() {
                Color::White
            } else {
                Color::Black
            };
            log::info!("Created session {id} ({tc})");
            Arc::new(Mutex::new(GameSession::new(id, tc, first_color, &self.config, now)))
        });
        Ok(Arc::clone(session))
    }

    /// The session `conn` joined, provided it is the one the command names.
    fn membership(&self, conn: Uuid, session_id: &str) -> GameResult<SharedSession> {
        let joined = lock(&self.memberships)?.get(&conn).cloned();
        match joined {
            Some(id) if id == session_id => self.find(&id),
            _ => Err(GameError::NotParticipant),
        }
    }

    /// Mints a fresh session key ahead of the first join.
    pub fn create_session(&self, time_control: Option<&str>) -> GameResult<(String, String)> {
        let id = Uuid::new_v4().simple().to_string();
        self.find_or_create(&id, time_control, unix_millis())?;
        let invite_url = self.config.invite_url(&id);
        Ok((id, invite_url))
    }

    pub fn snapshot(&self, id: &str) -> GameResult<SessionSnapshot> {
        let session = self.find(id)?;
        let guard = lock(&session)?;
        Ok(guard.snapshot())
    }

    /// Plain-text diagram of the session's board.
    pub fn board_ascii(&self, id: &str) -> GameResult<String> {
        let session = self.find(id)?;
        let guard = lock(&session)?;
        Ok(guard.position.board.to_string())
    }

    pub fn list(&self) -> GameResult<Vec<SessionSummary>> {
        let sessions: Vec<SharedSession> = self
            .sessions
            .read()
            .map_err(|_| GameError::Internal("session table poisoned".to_string()))?
            .values()
            .cloned()
            .collect();

        let mut summaries = sessions
            .iter()
            .map(|session| lock(session).map(|guard| guard.summary()))
            .collect::<GameResult<Vec<_>>>()?;
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Command boundary
    // -----------------------------------------------------------------------

    /// Processes one inbound command from `conn`.
    pub fn handle_command(self: &Arc<Self>, conn: Uuid, command: ClientCommand) {
        self.handle_command_at(conn, command, unix_millis());
    }

    /// Same as [`handle_command`](Self::handle_command) with an explicit clock.
    pub fn handle_command_at(self: &Arc<Self>, conn: Uuid, command: ClientCommand, now: u64) {
        let kind = command.kind();
        let session_id = command.session_id().to_string();
        let mut outbox = Outbox::default();

        let result = match panic::catch_unwind(AssertUnwindSafe(|| {
            self.dispatch(conn, command, now, &mut outbox)
        })) {
            Ok(result) => result,
            Err(_) => {
                self.evict_poisoned(&session_id);
                Err(GameError::Internal(format!("{kind} handler panicked")))
            }
        };

        if let Err(err) = result {
            outbox.clear();
            self.report(conn, kind, err, &mut outbox);
        }
        self.flush(outbox);
    }

    fn report(&self, conn: Uuid, kind: &str, err: GameError, outbox: &mut Outbox) {
        match err.disposition() {
            Disposition::Silent => {
                log::debug!("Dropped {kind} from {conn}: {err}");
            }
            Disposition::MoveRejected => {
                outbox.to_one(conn, ServerEvent::MoveRejected { reason: err.to_string() });
            }
            Disposition::MessageError => {
                log::debug!("Refused chat message from {conn}: {err}");
                outbox.to_one(conn, ServerEvent::MessageError { reason: err.to_string() });
            }
            Disposition::CommandError => {
                if matches!(err, GameError::Internal(_)) {
                    log::error!("Failed to process {kind} from {conn}: {err}");
                } else {
                    log::warn!("Rejected {kind} from {conn}: {err}");
                }
                outbox.to_one(conn, ServerEvent::CommandError { reason: err.to_string() });
            }
        }
    }

    /// Reports a frame that could not be parsed into a command.
    pub fn reject_malformed(&self, conn: Uuid, detail: &str) {
        let err = GameError::MalformedCommand(detail.to_string());
        let mut outbox = Outbox::default();
        self.report(conn, "frame", err, &mut outbox);
        self.flush(outbox);
    }

    fn flush(&self, outbox: Outbox) {
        for (recipients, event) in outbox.queue {
            self.notifier.notify(&recipients, &event);
        }
    }

    fn dispatch(self: &Arc<Self>, conn: Uuid, command: ClientCommand, now: u64, out: &mut Outbox) -> GameResult<()> {
        validate_session_id(command.session_id())?;

        match command {
            ClientCommand::Join {
                session_id,
                player_name,
                time_control,
                reconnect_token,
            } => self.join(
                conn,
                &session_id,
                &player_name,
                time_control.as_deref(),
                reconnect_token,
                now,
                out,
            ),

            ClientCommand::JoinAsSpectator { session_id, name } => {
                self.join_spectator(conn, &session_id, &name, now, out)
            }

            ClientCommand::Move {
                session_id,
                from,
                to,
                promotion,
            } => {
                let promotion = match promotion.as_deref() {
                    None | Some("") => None,
                    Some(choice) => Some(PieceKind::from_promotion_str(choice).ok_or_else(|| {
                        GameError::MalformedCommand(format!("invalid promotion piece '{choice}'"))
                    })?),
                };
                lock(&self.limiter)?.check(conn, now)?;

                let session = self.membership(conn, &session_id)?;
                let mut game = lock(&session)?;
                let descriptor = game.make_move(conn, from, to, promotion, now)?;
                log::debug!("Session {session_id}: {descriptor}");
                out.broadcast_state(&game, game.state.is_over());
                Ok(())
            }

            ClientCommand::GetPossibleMoves { session_id, square } => {
                let session = self.membership(conn, &session_id)?;
                let moves = lock(&session)?.possible_moves(conn, square);
                out.to_one(conn, ServerEvent::PossibleMoves { square, moves });
                Ok(())
            }

            ClientCommand::Resign { session_id } => {
                let session = self.membership(conn, &session_id)?;
                let mut game = lock(&session)?;
                game.resign(conn, now)?;
                out.broadcast_state(&game, true);
                Ok(())
            }

            ClientCommand::OfferDraw { session_id } => {
                let session = self.membership(conn, &session_id)?;
                let mut game = lock(&session)?;
                game.offer_draw(conn, now)?;
                out.broadcast_state(&game, false);
                Ok(())
            }

            ClientCommand::RespondDraw { session_id, accept } => {
                let session = self.membership(conn, &session_id)?;
                let mut game = lock(&session)?;
                let ended = game.respond_draw(conn, accept, now)?;
                out.broadcast_state(&game, ended);
                Ok(())
            }

            ClientCommand::TimeUp { session_id, color } => {
                let session = self.membership(conn, &session_id)?;
                let mut game = lock(&session)?;
                game.time_up(conn, color, now)?;
                out.broadcast_state(&game, true);
                Ok(())
            }

            ClientCommand::OfferReplay { session_id } => {
                let session = self.membership(conn, &session_id)?;
                let mut game = lock(&session)?;
                let (from_player, opponent) = game.offer_replay(conn, now)?;
                out.broadcast_state(&game, false);
                out.to_one(opponent, ServerEvent::ReplayOffered { from_player });
                Ok(())
            }

            ClientCommand::RespondReplay { session_id, accept } => {
                let session = self.membership(conn, &session_id)?;
                let mut game = lock(&session)?;
                let answer = game.respond_replay(conn, accept, now)?;
                if !answer.accepted
                    && let Some(offerer) = answer.offerer
                {
                    out.to_one(
                        offerer,
                        ServerEvent::ReplayDeclined {
                            from_player: answer.responder_name.clone(),
                        },
                    );
                }
                out.broadcast_state(&game, false);
                Ok(())
            }

            ClientCommand::SendMessage { session_id, message } => {
                let session = self.membership(conn, &session_id)?;
                let mut game = lock(&session)?;
                let message = game.send_message(conn, &message, now)?;
                out.to(game.participants(), ServerEvent::NewMessage(message));
                Ok(())
            }

            ClientCommand::MarkMessagesRead {
                session_id,
                message_ids,
            } => {
                let session = self.membership(conn, &session_id)?;
                let mut game = lock(&session)?;
                let (reader, found) = game.mark_messages_read(conn, &message_ids)?;
                if !found.is_empty() {
                    let others = game.participants().into_iter().filter(|id| *id != conn).collect();
                    out.to(
                        others,
                        ServerEvent::MessagesRead {
                            read_by: reader,
                            message_ids: found,
                        },
                    );
                }
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Joining
    // -----------------------------------------------------------------------

    fn ensure_unattached(&self, conn: Uuid) -> GameResult<()> {
        match lock(&self.memberships)?.get(&conn) {
            Some(existing) => Err(GameError::AlreadyJoined(existing.clone())),
            None => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn join(
        &self,
        conn: Uuid,
        session_id: &str,
        player_name: &str,
        time_control: Option<&str>,
        reconnect_token: Option<Uuid>,
        now: u64,
        out: &mut Outbox,
    ) -> GameResult<()> {
        self.ensure_unattached(conn)?;
        // A rejected join must not leave a session behind.
        validate_name(player_name)?;
        let session = self.find_or_create(session_id, time_control, now)?;

        let outcome = {
            let mut game = lock(&session)?;
            let outcome = game.join(conn, player_name, reconnect_token, now)?;
            let (color, token) = match outcome {
                JoinOutcome::Seated {
                    color,
                    reconnect_token,
                    ..
                }
                | JoinOutcome::Reconnected {
                    color,
                    reconnect_token,
                    ..
                } => (color, reconnect_token),
            };
            out.to_one(
                conn,
                ServerEvent::Seated {
                    color,
                    reconnect_token: token,
                },
            );
            if let JoinOutcome::Seated { first: true, .. } = outcome {
                out.to_one(
                    conn,
                    ServerEvent::InviteGenerated {
                        url: game.invite_url.clone(),
                    },
                );
            }
            out.broadcast_state(&game, false);
            outcome
        };

        lock(&self.memberships)?.insert(conn, session_id.to_string());

        if let JoinOutcome::Reconnected { previous, .. } = outcome {
            self.cancel_grace_timer(session_id, previous);
        }
        Ok(())
    }

    fn join_spectator(&self, conn: Uuid, session_id: &str, name: &str, now: u64, out: &mut Outbox) -> GameResult<()> {
        self.ensure_unattached(conn)?;
        let session = self.find(session_id)?;
        {
            let mut game = lock(&session)?;
            let name = game.join_spectator(conn, name, now)?;
            out.broadcast_state(&game, false);
            out.to(game.participants(), ServerEvent::SpectatorJoined { name });
        }
        lock(&self.memberships)?.insert(conn, session_id.to_string());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Disconnects and grace timers
    // -----------------------------------------------------------------------

    /// Unbinds a closed connection from whatever it joined.
    pub fn disconnect(self: &Arc<Self>, conn: Uuid) {
        let now = unix_millis();
        let mut outbox = Outbox::default();
        if let Err(err) = self.detach(conn, now, &mut outbox) {
            log::error!("Failed to detach connection {conn}: {err}");
        }
        self.flush(outbox);
    }

    fn detach(self: &Arc<Self>, conn: Uuid, now: u64, out: &mut Outbox) -> GameResult<()> {
        lock(&self.limiter)?.purge(&conn);

        let Some(session_id) = lock(&self.memberships)?.remove(&conn) else {
            return Ok(());
        };
        let session = match self.find(&session_id) {
            Ok(session) => session,
            Err(GameError::SessionNotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };

        let (departure, instance) = {
            let mut game = lock(&session)?;
            let departure = game.disconnect(conn, now);
            match &departure {
                Departure::Spectator { name } => {
                    out.broadcast_state(&game, false);
                    out.to(game.participants(), ServerEvent::SpectatorLeft { name: name.clone() });
                }
                Departure::LeftWaiting { name } => {
                    log::info!("{name} left waiting session {session_id}");
                    out.broadcast_state(&game, false);
                }
                Departure::Player { color, .. } => {
                    log::info!("{color} disconnected from session {session_id}");
                    out.broadcast_state(&game, false);
                }
                Departure::Unknown => {}
            }
            (departure, game.instance)
        };

        if let Departure::Player {
            color,
            generation,
            grace: true,
        } = departure
        {
            self.arm_grace_timer(&session_id, conn, instance, color, generation);
        }
        Ok(())
    }

    fn arm_grace_timer(self: &Arc<Self>, session_id: &str, conn: Uuid, instance: Uuid, color: Color, generation: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("No runtime available; session {session_id} will not time out {color}");
            return;
        };

        let registry: Weak<Self> = Arc::downgrade(self);
        let grace = self.config.disconnect_grace;
        let id = session_id.to_string();
        let task = runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(registry) = registry.upgrade() {
                registry.expire_grace(&id, conn, instance, color, generation, unix_millis());
            }
        });

        if let Ok(mut timers) = lock(&self.grace_timers)
            && let Some(stale) = timers.insert((session_id.to_string(), conn), task.abort_handle())
        {
            stale.abort();
        }
    }

    fn cancel_grace_timer(&self, session_id: &str, conn: Uuid) {
        if let Ok(mut timers) = lock(&self.grace_timers)
            && let Some(handle) = timers.remove(&(session_id.to_string(), conn))
        {
            handle.abort();
            log::debug!("Cancelled grace timer for {conn} in session {session_id}");
        }
    }

    /// Fired by a grace timer. A no-op if the session was replaced, ended,
    /// or the seat was taken back in the meantime.
    pub fn expire_grace(&self, session_id: &str, conn: Uuid, instance: Uuid, color: Color, generation: u64, now: u64) {
        if let Ok(mut timers) = lock(&self.grace_timers) {
            timers.remove(&(session_id.to_string(), conn));
        }

        let mut outbox = Outbox::default();
        let result = self.find(session_id).and_then(|session| {
            let mut game = lock(&session)?;
            if game.instance == instance && game.expire_grace(color, generation, now) {
                log::info!("Session {session_id} abandoned: {color} did not return");
                outbox.broadcast_state(&game, true);
            }
            Ok(())
        });
        match result {
            Ok(()) | Err(GameError::SessionNotFound(_)) => {}
            Err(err) => log::error!("Grace expiry for session {session_id} failed: {err}"),
        }
        self.flush(outbox);
    }

    // -----------------------------------------------------------------------
    // Reclamation
    // -----------------------------------------------------------------------

    /// Drops sessions past their retention window and stale throttle entries.
    /// Returns the number of sessions removed.
    pub fn reclaim(&self, now: u64) -> usize {
        let removed: Vec<(String, Vec<Uuid>)> = {
            let Ok(mut sessions) = self.sessions.write() else {
                log::error!("Session table poisoned; skipping reclamation");
                return 0;
            };
            let expired: Vec<(String, Vec<Uuid>)> = sessions
                .iter()
                .filter_map(|(id, session)| match session.lock() {
                    Ok(game) => game
                        .is_reclaimable(now, &self.config)
                        .then(|| (id.clone(), game.member_ids())),
                    Err(poisoned) => {
                        log::error!("Dropping session {id}: a command panicked while holding it");
                        Some((id.clone(), poisoned.into_inner().member_ids()))
                    }
                })
                .collect();
            for (id, _) in &expired {
                sessions.remove(id);
            }
            expired
        };

        self.release(&removed);
        if let Ok(mut limiter) = lock(&self.limiter) {
            let stale = limiter.purge_stale(now);
            if stale > 0 {
                log::debug!("Purged {stale} idle rate-limit entries");
            }
        }

        if !removed.is_empty() {
            log::info!("Reclaimed {} idle session(s)", removed.len());
        }
        removed.len()
    }

    /// Drops a session whose mutex was poisoned by a panicking command.
    fn evict_poisoned(&self, session_id: &str) {
        let removed = {
            let Ok(mut sessions) = self.sessions.write() else {
                return;
            };
            let members = match sessions.get(session_id) {
                Some(session) if session.is_poisoned() => match session.lock() {
                    Ok(game) => game.member_ids(),
                    Err(poisoned) => poisoned.into_inner().member_ids(),
                },
                _ => return,
            };
            sessions.remove(session_id);
            vec![(session_id.to_string(), members)]
        };
        log::error!("Dropped session {session_id} after a command panicked");
        self.release(&removed);
    }

    /// Forgets memberships, throttle entries and timers of removed sessions.
    fn release(&self, removed: &[(String, Vec<Uuid>)]) {
        if let Ok(mut memberships) = lock(&self.memberships) {
            for (id, members) in removed {
                for conn in members {
                    if memberships.get(conn) == Some(id) {
                        memberships.remove(conn);
                    }
                }
            }
        }

        if let Ok(mut limiter) = lock(&self.limiter) {
            for conn in removed.iter().flat_map(|(_, members)| members) {
                limiter.purge(conn);
            }
        }

        if let Ok(mut timers) = lock(&self.grace_timers) {
            timers.retain(|(id, _), handle| {
                let gone = removed.iter().any(|(removed_id, _)| removed_id == id);
                if gone {
                    handle.abort();
                }
                !gone
            });
        }
    }

    /// Starts the periodic reclamation sweep on the current runtime.
    pub fn spawn_reclaimer(self: &Arc<Self>) {
        let registry = Arc::downgrade(self);
        let period = self.config.reclaim_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.reclaim(unix_millis());
            }
        });

        if let Ok(mut slot) = lock(&self.reclaimer)
            && let Some(previous) = slot.replace(task)
        {
            previous.abort();
        }
    }

    /// Stops background work and drops every session.
    pub fn shutdown(&self) {
        if let Ok(mut slot) = lock(&self.reclaimer)
            && let Some(task) = slot.take()
        {
            task.abort();
        }
        if let Ok(mut timers) = lock(&self.grace_timers) {
            for (_, handle) in timers.drain() {
                handle.abort();
            }
        }
        if let Ok(mut sessions) = self.sessions.write() {
            log::info!("Shutting down with {} session(s)", sessions.len());
            sessions.clear();
        }
        if let Ok(mut memberships) = lock(&self.memberships) {
            memberships.clear();
        }
    }

    /// Whether any grace timer is pending for the session.
    #[cfg(test)]
    pub fn has_pending_grace(&self, session_id: &str) -> bool {
        lock(&self.grace_timers)
            .map(|timers| timers.keys().any(|(id, _)| id == session_id))
            .unwrap_or(false)
    }

    /// State of a session, for quick checks.
    #[cfg(test)]
    pub fn state_of(&self, session_id: &str) -> Option<GameState> {
        let session = self.find(session_id).ok()?;
        let game = session.lock().ok()?;
        Some(game.state)
    }
}
