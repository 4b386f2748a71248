//! WebSocket transport for chess-duel.
//!
//! ## Architecture
//!
//! - **`ConnectionHub`**: a singleton actor holding the address of every
//!   live WebSocket connection. The registry reaches clients through it by
//!   way of the [`Notifier`] implementation on `Addr<ConnectionHub>`.
//!
//! - **`WsSession`**: an actor representing a single WebSocket connection.
//!   Parses JSON commands, hands them to the [`SessionRegistry`], and
//!   forwards events pushed by the hub.
//!
//! ## Client → Server Protocol
//!
//! Clients send JSON text frames tagged with a `"type"` field:
//!
//! | Type                 | Extra Fields                                    |
//! |----------------------|-------------------------------------------------|
//! | `join`               | `session_id`, `player_name`, `time_control?`,   |
//! |                      | `reconnect_token?`                              |
//! | `join_as_spectator`  | `session_id`, `name`                            |
//! | `move`               | `session_id`, `from`, `to`, `promotion?`        |
//! | `get_possible_moves` | `session_id`, `square`                          |
//! | `resign`             | `session_id`                                    |
//! | `offer_draw`         | `session_id`                                    |
//! | `respond_draw`       | `session_id`, `accept`                          |
//! | `time_up`            | `session_id`, `color`                           |
//! | `offer_replay`       | `session_id`                                    |
//! | `respond_replay`     | `session_id`, `accept`                          |
//! | `send_message`       | `session_id`, `message`                         |
//! | `mark_messages_read` | `session_id`, `message_ids`                     |
//!
//! ## Server → Client Protocol
//!
//! Every frame the server sends carries an `"event"` field:
//! `game_update`, `possible_moves`, `seated`, `invite_generated`,
//! `game_ended`, `replay_offered`, `replay_declined`, `spectator_joined`,
//! `spectator_left`, `move_rejected`, `command_error`, `new_message`,
//! `messages_read` or `message_error`.
//!
//! `seated` is only ever sent to the connection that took the seat. Its
//! `reconnect_token` must accompany a later `join` to take the seat back.

use actix::prelude::*;
use actix_web::{HttpRequest, HttpResponse, web};
use actix_web_actors::ws;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::api::AppState;
use crate::protocol::{ClientCommand, Notifier, ServerEvent};
use crate::registry::SessionRegistry;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// How often the server sends a WebSocket ping frame to keep the
/// connection alive and detect stale clients.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Maximum time the server waits for a pong response before
/// considering the connection dead.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Hub messages (actor mailbox protocol)
// ---------------------------------------------------------------------------

/// Message sent by a `WsSession` to register itself with the hub.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Connect {
    pub addr: Recipient<WsText>,
    pub conn_id: Uuid,
}

/// Message sent by a `WsSession` to unregister from the hub.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub conn_id: Uuid,
}

/// A serialized event for a set of connections.
#[derive(Message, Clone)]
#[rtype(result = "()")]
pub struct Deliver {
    pub recipients: Vec<Uuid>,
    pub payload: String,
}

/// Internal message: deliver a text frame to a single `WsSession`.
#[derive(Message)]
#[rtype(result = "()")]
pub struct WsText(pub String);

// ---------------------------------------------------------------------------
// ConnectionHub: central delivery point (actor)
// ---------------------------------------------------------------------------

/// Singleton actor mapping connection ids to their session actors.
#[derive(Default)]
pub struct ConnectionHub {
    connections: HashMap<Uuid, Recipient<WsText>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Actor for ConnectionHub {
    type Context = Context<Self>;
}

impl Handler<Connect> for ConnectionHub {
    type Result = ();

    fn handle(&mut self, msg: Connect, _ctx: &mut Context<Self>) {
        log::debug!("WS connection {} registered with hub", msg.conn_id);
        self.connections.insert(msg.conn_id, msg.addr);
    }
}

impl Handler<Disconnect> for ConnectionHub {
    type Result = ();

    fn handle(&mut self, msg: Disconnect, _ctx: &mut Context<Self>) {
        log::debug!("WS connection {} removed from hub", msg.conn_id);
        self.connections.remove(&msg.conn_id);
    }
}

/// Forwards a payload to every recipient still connected.
impl Handler<Deliver> for ConnectionHub {
    type Result = ();

    fn handle(&mut self, msg: Deliver, _ctx: &mut Context<Self>) {
        for conn_id in &msg.recipients {
            if let Some(addr) = self.connections.get(conn_id) {
                addr.do_send(WsText(msg.payload.clone()));
            }
        }
    }
}

impl Notifier for Addr<ConnectionHub> {
    fn notify(&self, recipients: &[Uuid], event: &ServerEvent) {
        match serde_json::to_string(event) {
            Ok(payload) => self.do_send(Deliver {
                recipients: recipients.to_vec(),
                payload,
            }),
            Err(e) => log::error!("Failed to serialize event: {}", e),
        }
    }
}

// ---------------------------------------------------------------------------
// WsSession: per-connection actor
// ---------------------------------------------------------------------------

/// Actor representing a single WebSocket client connection.
///
/// Responsibilities:
/// - Parse incoming JSON commands and hand them to the registry
/// - Maintain a heartbeat (ping/pong) to detect stale connections
/// - Register with the `ConnectionHub` so events can reach the client
/// - Tell the registry when the connection goes away
pub struct WsSession {
    /// Connection id, used as the player/spectator identity.
    id: Uuid,
    /// Timestamp of the last received pong (or initial connect time).
    last_heartbeat: Instant,
    registry: Arc<SessionRegistry>,
    hub: Addr<ConnectionHub>,
}

impl WsSession {
    pub fn new(registry: Arc<SessionRegistry>, hub: Addr<ConnectionHub>) -> Self {
        Self {
            id: Uuid::new_v4(),
            last_heartbeat: Instant::now(),
            registry,
            hub,
        }
    }

    /// Starts a periodic heartbeat check. If the client has not responded
    /// to a ping within `CLIENT_TIMEOUT`, the connection is closed.
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                log::warn!("WS connection {} heartbeat timeout, disconnecting", act.id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn handle_message(&self, text: &str) {
        match serde_json::from_str::<ClientCommand>(text) {
            Ok(command) => {
                log::debug!(
                    "WS connection {}: {} for session {}",
                    self.id,
                    command.kind(),
                    command.session_id()
                );
                self.registry.handle_command(self.id, command);
            }
            Err(e) => {
                log::warn!("WS connection {} sent an unreadable frame: {}", self.id, e);
                self.registry
                    .reject_malformed(self.id, &format!("invalid JSON: {e}"));
            }
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        log::info!("WS connection {} started", self.id);
        self.start_heartbeat(ctx);
        self.hub.do_send(Connect {
            addr: ctx.address().recipient(),
            conn_id: self.id,
        });
    }

    /// Releases the seat or spectator slot and unregisters from the hub.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        log::info!("WS connection {} stopped", self.id);
        self.registry.disconnect(self.id);
        self.hub.do_send(Disconnect { conn_id: self.id });
    }
}

/// Handler for incoming WebSocket frames (text, binary, ping, pong, close).
impl actix::StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.handle_message(&text);
            }
            Ok(ws::Message::Binary(_)) => {
                log::warn!("WS connection {}: binary messages not supported", self.id);
                self.registry
                    .reject_malformed(self.id, "binary frames are not supported, send JSON text");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                log::info!("WS connection {} closed: {:?}", self.id, reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                // Continuation frames are handled internally by actix
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                log::error!("WS connection {} protocol error: {}", self.id, e);
                ctx.stop();
            }
        }
    }
}

/// Handler for hub-pushed text messages.
impl Handler<WsText> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: WsText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

// ---------------------------------------------------------------------------
// HTTP → WebSocket upgrade handler
// ---------------------------------------------------------------------------

/// Upgrades an HTTP request to a WebSocket connection.
pub async fn ws_connect(
    req: HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
    hub: web::Data<Addr<ConnectionHub>>,
) -> Result<HttpResponse, actix_web::Error> {
    let session = WsSession::new(Arc::clone(&data.registry), hub.get_ref().clone());
    log::info!("New WebSocket connection request from {:?}", req.peer_addr());
    ws::start(session, &req, stream)
}
