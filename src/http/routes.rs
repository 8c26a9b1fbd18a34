//! HTTP route definitions

use axum::{
    extract::{Extension, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use uuid::Uuid;

use crate::app::AppState;
use crate::config::Config;
use crate::game::session::SessionSummary;
use crate::game::RegistryError;
use crate::http::middleware::{require_auth, AuthenticatedUser};
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/maps", get(maps_handler))
        .route("/sessions", get(list_sessions_handler))
        .route("/ws", get(ws_handler));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/sessions", post(create_session_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(cors_layer(&state.config)),
        )
        .with_state(state)
}

/// CORS from CLIENT_ORIGIN; `*` allows any origin without credentials
fn cors_layer(config: &Config) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    if config.allows_any_origin() {
        return cors.allow_origin(AllowOrigin::any());
    }

    let allowed_origins: Vec<HeaderValue> = config
        .client_origins
        .iter()
        .filter_map(|s| s.parse::<HeaderValue>().ok())
        .collect();
    cors.allow_origin(allowed_origins).allow_credentials(true)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_sessions: usize,
    active_competitors: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_sessions: state.registry.active_sessions(),
        active_competitors: state.registry.total_competitors(),
    })
}

// ============================================================================
// Catalog and lobby endpoints
// ============================================================================

#[derive(Serialize)]
struct MapsResponse {
    maps: Vec<String>,
}

async fn maps_handler(State(state): State<AppState>) -> Json<MapsResponse> {
    Json(MapsResponse {
        maps: state.registry.maps().names(),
    })
}

#[derive(Serialize)]
struct SessionsResponse {
    sessions: Vec<SessionSummary>,
}

async fn list_sessions_handler(State(state): State<AppState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.registry.list_waiting(),
    })
}

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: Uuid,
    /// Websocket path to connect to; the token is appended by the client
    ws_path: String,
}

async fn create_session_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), AppError> {
    let session_id = state
        .registry
        .create_session(auth.user_id, &auth.claims.display_name())?;
    info!(user_id = %auth.user_id, session_id = %session_id, "Session created over HTTP");

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id,
            ws_path: format!("/ws?session={session_id}"),
        }),
    ))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl From<RegistryError> for AppError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::AlreadyInSession(_) => AppError::Conflict(e.to_string()),
            RegistryError::SessionNotFound(_) | RegistryError::NoSession => {
                AppError::NotFound(e.to_string())
            }
            RegistryError::Session(_) => AppError::BadRequest(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
