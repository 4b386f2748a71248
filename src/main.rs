//! # chess-duel: two-player chess sessions
//!
//! A server-authoritative chess server for two remote players. The server
//! owns the board, the clocks and every rule; clients only send intents
//! and render the state pushed back to them.
//!
//! ## Features
//!
//! - **Session Registry**: sessions are created on first join, keyed by a
//!   shareable id, and reclaimed once finished, abandoned or left empty.
//!
//! - **Rules Engine**: full legal move generation including castling, en
//!   passant and promotion, with check, checkmate and stalemate detection.
//!
//! - **Clocks**: base time plus Fischer increment, debited from wall time
//!   on every committed move. Flag falls are detected on the move itself
//!   or confirmed from a client's time-up claim.
//!
//! - **Negotiation**: draw offers with a cooldown, resignation, and replay
//!   offers that restart a finished game with colors swapped.
//!
//! - **Disconnect Grace**: a player who drops out of an active game keeps
//!   their seat for a grace period before the game is abandoned. Only the
//!   holder of the seat's private reconnect token can take it back.
//!
//! - **Chat**: sanitized, length-limited messages with read receipts.
//!
//! - **WebSocket Play** at `/ws`, plus a small REST surface documented
//!   with Swagger UI at `/swagger-ui/`.
//!
//! ## Usage
//!
//! ```bash
//! # Start the server (default: http://0.0.0.0:8080)
//! chess-duel serve
//!
//! # Custom port and the URL invite links should point at
//! chess-duel serve --port 3000 --public-url https://chess.example.org
//! ```
//!
//! ## API Endpoints
//!
//! | Method | Path                          | Description                    |
//! |--------|-------------------------------|--------------------------------|
//! | POST   | `/api/sessions`               | Create a session               |
//! | GET    | `/api/sessions`               | List sessions                  |
//! | GET    | `/api/sessions/{id}`          | Get session snapshot           |
//! | GET    | `/api/sessions/{id}/board`    | Get ASCII board                |
//! | GET    | `/ws`                         | WebSocket endpoint             |
//! | GET    | `/swagger-ui/`                | Swagger UI documentation       |

pub mod api;
pub mod chat;
pub mod clock;
pub mod config;
pub mod error;
pub mod game;
pub mod movegen;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod types;
pub mod ws;

use actix::Actor;
use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::{ApiDoc, AppState};
use crate::clock::TimeControl;
use crate::config::{RateLimitConfig, SessionConfig};
use crate::registry::SessionRegistry;
use crate::ws::ConnectionHub;

/// chess-duel: server-authoritative chess between two remote players.
#[derive(Parser, Debug)]
#[command(name = "chess-duel")]
#[command(about = "Two-player chess sessions over WebSocket")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the WebSocket and REST server with Swagger UI.
    Serve {
        /// Port to listen on.
        #[arg(short, long, default_value_t = 8080)]
        port: u16,

        /// Host address to bind to.
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Base URL invite links point at.
        #[arg(long, default_value = "http://localhost:8080")]
        public_url: String,

        /// Seconds a disconnected player keeps their seat.
        #[arg(long, default_value_t = 30)]
        grace_secs: u64,

        /// Time control for sessions that do not name one, as minutes+increment.
        #[arg(long, default_value = "5+0")]
        time_control: TimeControl,
    },
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            host,
            public_url,
            grace_secs,
            time_control,
        } => {
            let config = SessionConfig {
                disconnect_grace: Duration::from_secs(grace_secs),
                public_url,
                default_time_control: time_control,
                ..SessionConfig::default()
            };
            run_server(&host, port, config).await
        }
    }
}

/// Starts the HTTP + WebSocket server with all API routes and Swagger UI.
async fn run_server(host: &str, port: u16, config: SessionConfig) -> std::io::Result<()> {
    let openapi = ApiDoc::openapi();

    // The hub is both the socket directory and the registry's outbound channel.
    let hub = ConnectionHub::new().start();
    let registry = Arc::new(SessionRegistry::new(
        config,
        RateLimitConfig::default(),
        Arc::new(hub.clone()),
    ));
    registry.spawn_reclaimer();

    let state = web::Data::new(AppState {
        registry: Arc::clone(&registry),
    });
    let hub_data = web::Data::new(hub);

    log::info!("Starting chess-duel server on {}:{}", host, port);
    log::info!("Invite links point at {}", registry.config().public_url);
    log::info!("Swagger UI available at http://{}:{}/swagger-ui/", host, port);
    log::info!("WebSocket endpoint: ws://{}:{}/ws", host, port);

    let result = HttpServer::new(move || {
        // Configure CORS to allow all origins
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .app_data(hub_data.clone())
            .configure(api::configure_routes)
            .route("/ws", web::get().to(ws::ws_connect))
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone()),
            )
    })
    .bind((host, port))?
    .run()
    .await;

    registry.shutdown();
    result
}
