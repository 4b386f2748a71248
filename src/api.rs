//! REST API for the chess-duel server.
//!
//! Play happens over the WebSocket at `/ws`; the REST surface exists for
//! lobby pages and for clients recovering state after a reload:
//! - Mint a session key and invite link ahead of the first join
//! - List live sessions
//! - Fetch the full authoritative snapshot of one session
//! - Render a session's board as plain text
//!
//! The API is documented with OpenAPI/Swagger via `utoipa`.
//! Swagger UI is available at `/swagger-ui/`.

use actix_web::{HttpResponse, Responder, web};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{OpenApi, ToSchema};

use crate::chat::ChatMessage;
use crate::clock::TimeControl;
use crate::error::GameError;
use crate::game::*;
use crate::registry::SessionRegistry;
use crate::types::*;

/// Shared application state.
///
/// Wrapped in `web::Data` and handed to every HTTP and WebSocket handler.
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct CreateSessionRequest {
    /// Preset such as `"3+2"`. Defaults to the server's configured control.
    #[serde(default)]
    pub time_control: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub invite_url: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(err: GameError) -> HttpResponse {
    let body = ErrorResponse {
        error: err.to_string(),
    };
    match err {
        GameError::SessionNotFound(_) => HttpResponse::NotFound().json(body),
        GameError::MalformedCommand(_) => HttpResponse::BadRequest().json(body),
        _ => HttpResponse::InternalServerError().json(body),
    }
}

// ---------------------------------------------------------------------------
// OpenAPI definition
// ---------------------------------------------------------------------------

/// OpenAPI documentation for the chess-duel API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "chess-duel: two-player chess sessions",
        version = "0.1.0",
        description = "Server-authoritative chess between two remote players. \
            Sessions are played over the WebSocket at /ws; these endpoints \
            create sessions and expose their state.",
        license(name = "MIT")
    ),
    paths(create_session, list_sessions, get_session, get_board_ascii),
    components(schemas(
        CreateSessionRequest,
        CreateSessionResponse,
        SessionListResponse,
        SessionSummary,
        SessionSnapshot,
        ErrorResponse,
        Player,
        Spectator,
        MoveRecord,
        ReplayOffer,
        PossibleMove,
        ChatMessage,
        Piece,
        PieceKind,
        Color,
        CastlingRights,
        SideCastlingRights,
        CastlingSide,
        SpecialMove,
        MoveDescriptor,
        GameState,
        Winner,
        EndReason,
    )),
    tags(
        (name = "sessions", description = "Session creation and state"),
        (name = "display", description = "Board display"),
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// API Handlers
// ---------------------------------------------------------------------------

/// Create a new session.
///
/// Reserves a session key so the creator can share the invite link before
/// anyone connects. The first `join` over the WebSocket takes a seat.
#[utoipa::path(
    post,
    path = "/api/sessions",
    tag = "sessions",
    request_body(content = CreateSessionRequest, description = "Optional time control"),
    responses(
        (status = 201, description = "Session created", body = CreateSessionResponse),
        (status = 400, description = "Invalid time control", body = ErrorResponse),
    )
)]
pub async fn create_session(
    body: Option<web::Json<CreateSessionRequest>>,
    data: web::Data<AppState>,
) -> impl Responder {
    let request = body.map(web::Json::into_inner).unwrap_or_default();

    if let Some(label) = request.time_control.as_deref()
        && let Err(reason) = label.parse::<TimeControl>()
    {
        return error_response(GameError::MalformedCommand(reason));
    }

    match data.registry.create_session(request.time_control.as_deref()) {
        Ok((session_id, invite_url)) => {
            log::info!("Minted session {session_id} via REST");
            HttpResponse::Created().json(CreateSessionResponse {
                session_id,
                invite_url,
            })
        }
        Err(err) => error_response(err),
    }
}

/// List all live sessions.
#[utoipa::path(
    get,
    path = "/api/sessions",
    tag = "sessions",
    responses(
        (status = 200, description = "List of sessions", body = SessionListResponse),
    )
)]
pub async fn list_sessions(data: web::Data<AppState>) -> impl Responder {
    match data.registry.list() {
        Ok(sessions) => {
            let total = sessions.len();
            HttpResponse::Ok().json(SessionListResponse { sessions, total })
        }
        Err(err) => error_response(err),
    }
}

/// Get the full state of a session.
///
/// Returns the same snapshot participants receive in `game_update` events,
/// so a reloaded client can redraw before rejoining.
#[utoipa::path(
    get,
    path = "/api/sessions/{session_id}",
    tag = "sessions",
    params(
        ("session_id" = String, Path, description = "Session key")
    ),
    responses(
        (status = 200, description = "Session snapshot", body = SessionSnapshot),
        (status = 404, description = "Session not found", body = ErrorResponse),
    )
)]
pub async fn get_session(path: web::Path<String>, data: web::Data<AppState>) -> impl Responder {
    match data.registry.snapshot(&path.into_inner()) {
        Ok(snapshot) => HttpResponse::Ok().json(snapshot),
        Err(err) => error_response(err),
    }
}

/// Get the board as ASCII art.
#[utoipa::path(
    get,
    path = "/api/sessions/{session_id}/board",
    tag = "display",
    params(
        ("session_id" = String, Path, description = "Session key")
    ),
    responses(
        (status = 200, description = "Board ASCII art", content_type = "text/plain"),
        (status = 404, description = "Session not found", body = ErrorResponse),
    )
)]
pub async fn get_board_ascii(path: web::Path<String>, data: web::Data<AppState>) -> impl Responder {
    match data.registry.board_ascii(&path.into_inner()) {
        Ok(ascii) => HttpResponse::Ok().content_type("text/plain").body(ascii),
        Err(err) => error_response(err),
    }
}

/// Configures all API routes.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/sessions", web::post().to(create_session))
            .route("/sessions", web::get().to(list_sessions))
            .route("/sessions/{session_id}", web::get().to(get_session))
            .route("/sessions/{session_id}/board", web::get().to(get_board_ascii)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RateLimitConfig, SessionConfig};
    use crate::protocol::{Notifier, ServerEvent};
    use actix_web::{App, http::StatusCode, test};
    use uuid::Uuid;

    struct Discard;

    impl Notifier for Discard {
        fn notify(&self, _recipients: &[Uuid], _event: &ServerEvent) {}
    }

    fn state() -> web::Data<AppState> {
        let registry = SessionRegistry::new(
            SessionConfig::default(),
            RateLimitConfig::default(),
            Arc::new(Discard),
        );
        web::Data::new(AppState {
            registry: Arc::new(registry),
        })
    }

    #[actix_web::test]
    async fn test_create_then_fetch_session() {
        let data = state();
        let app =
            test::init_service(App::new().app_data(data.clone()).configure(configure_routes)).await;

        let req = test::TestRequest::post()
            .uri("/api/sessions")
            .set_json(CreateSessionRequest {
                time_control: Some("3+2".to_string()),
            })
            .to_request();
        let created: CreateSessionResponse = test::call_and_read_body_json(&app, req).await;
        assert!(created.invite_url.ends_with(&format!("?gameId={}", created.session_id)));

        let req = test::TestRequest::get()
            .uri(&format!("/api/sessions/{}", created.session_id))
            .to_request();
        let snapshot: SessionSnapshot = test::call_and_read_body_json(&app, req).await;
        assert_eq!(snapshot.state, GameState::Waiting);
        assert_eq!(snapshot.time_control, "3+2");
        assert_eq!(snapshot.white_time, 180.0);
        assert_eq!(snapshot.board.len(), 32);
    }

    #[actix_web::test]
    async fn test_create_without_body_uses_default() {
        let data = state();
        let app =
            test::init_service(App::new().app_data(data.clone()).configure(configure_routes)).await;

        let req = test::TestRequest::post().uri("/api/sessions").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(data.registry.session_count(), 1);
    }

    #[actix_web::test]
    async fn test_bad_time_control_is_rejected() {
        let data = state();
        let app =
            test::init_service(App::new().app_data(data.clone()).configure(configure_routes)).await;

        let req = test::TestRequest::post()
            .uri("/api/sessions")
            .set_json(CreateSessionRequest {
                time_control: Some("0+5".to_string()),
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(data.registry.session_count(), 0);
    }

    #[actix_web::test]
    async fn test_unknown_session_is_404() {
        let app = test::init_service(App::new().app_data(state()).configure(configure_routes)).await;

        let req = test::TestRequest::get().uri("/api/sessions/nope").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get().uri("/api/sessions/nope/board").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_list_and_board() {
        let data = state();
        let (id, _) = data.registry.create_session(None).unwrap();
        let app =
            test::init_service(App::new().app_data(data.clone()).configure(configure_routes)).await;

        let req = test::TestRequest::get().uri("/api/sessions").to_request();
        let list: SessionListResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(list.total, 1);
        assert_eq!(list.sessions[0].id, id);
        assert_eq!(list.sessions[0].time_control, "5+0");

        let req = test::TestRequest::get()
            .uri(&format!("/api/sessions/{id}/board"))
            .to_request();
        let body = test::call_and_read_body(&app, req).await;
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("8 | r n b q k b n r |"));
    }
}
