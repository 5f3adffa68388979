//! Local HTTP API for the character-sheet frontend.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/players` | Player note basenames |
//! | `GET`  | `/api/player/{name}` | Player frontmatter as JSON |
//! | `POST` | `/api/player/{name}` | Create a player note (409 if it exists) |
//! | `PUT`  | `/api/player/{name}` | Shallow-merge into the frontmatter |
//! | `GET`  | `/api/player/{name}/skills` | Computed skill modifiers |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! Anything else falls through to the static frontend bundle when
//! `[server].frontend_dir` is set.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "player not found: Aria" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the frontend can be
//! served from a dev server.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::players::{valid_name, Players, SkillScore};

#[derive(Clone)]
struct AppState {
    players: Arc<Players>,
    /// Held across read-modify-write of a player note.
    write_lock: Arc<Mutex<()>>,
}

/// Build the router for a config. Used by [`run_server`] and tests.
pub fn build_router(config: &Config) -> anyhow::Result<Router> {
    let state = AppState {
        players: Arc::new(Players::from_config(config)?),
        write_lock: Arc::new(Mutex::new(())),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .route("/api/players", get(handle_list_players))
        .route(
            "/api/player/{name}",
            get(handle_get_player)
                .post(handle_create_player)
                .put(handle_update_player),
        )
        .route("/api/player/{name}/skills", get(handle_player_skills))
        .route("/health", get(handle_health))
        .with_state(state);

    match &config.server.frontend_dir {
        Some(dir) if dir.is_dir() => {
            app = app.fallback_service(ServeDir::new(dir));
        }
        Some(dir) => warn!("Frontend bundle not found: {}", dir.display()),
        None => {}
    }

    Ok(app.layer(cors))
}

/// Serve the API on `[server].bind` until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let app = build_router(config)?;
    let bind_addr = config.server.bind.clone();

    println!("Player server listening on http://{}", bind_addr);
    info!("Players folder: {}", config.server.players_path);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        error!("Request failed: {:#}", err);
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal".to_string(),
            message: format!("{:#}", err),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "conflict".to_string(),
        message: message.into(),
    }
}

fn checked_name(name: &str) -> Result<&str, AppError> {
    if valid_name(name) {
        Ok(name)
    } else {
        Err(bad_request(format!("invalid player name: {}", name)))
    }
}

/// A JSON object body, or 400.
fn object_body(body: Result<Json<Value>, JsonRejection>) -> Result<Map<String, Value>, AppError> {
    match body {
        Ok(Json(Value::Object(map))) => Ok(map),
        Ok(Json(_)) => Err(bad_request("body must be a JSON object")),
        Err(rejection) => Err(bad_request(rejection.body_text())),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Players ============

async fn handle_list_players(State(state): State<AppState>) -> Result<Json<Vec<String>>, AppError> {
    Ok(Json(state.players.list()?))
}

async fn handle_get_player(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Map<String, Value>>, AppError> {
    let name = checked_name(&name)?;
    state
        .players
        .get(name)?
        .map(Json)
        .ok_or_else(|| not_found(format!("player not found: {}", name)))
}

async fn handle_create_player(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Map<String, Value>>), AppError> {
    let name = checked_name(&name)?;
    let data = object_body(body)?;

    let _guard = state.write_lock.lock().await;
    if !state.players.create(name, &data)? {
        return Err(conflict(format!("player already exists: {}", name)));
    }
    info!("Created player {}", name);
    Ok((StatusCode::CREATED, Json(data)))
}

async fn handle_update_player(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Map<String, Value>>, AppError> {
    let name = checked_name(&name)?;
    let patch = object_body(body)?;

    let _guard = state.write_lock.lock().await;
    state
        .players
        .update(name, &patch)?
        .map(Json)
        .ok_or_else(|| not_found(format!("player not found: {}", name)))
}

async fn handle_player_skills(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<SkillScore>>, AppError> {
    let name = checked_name(&name)?;
    state
        .players
        .skills(name)?
        .map(Json)
        .ok_or_else(|| not_found(format!("player not found: {}", name)))
}
