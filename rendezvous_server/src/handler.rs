//! HTTP handlers for the signaling server
//!
//! Registration is a plain JSON request. Connecting upgrades to a websocket
//! that is then owned by a [`relay`](crate::relay) worker. Every response
//! allows any origin, and `OPTIONS` preflights are answered directly.

use crate::error::ClientRequestError;
use crate::identity::Identity;
use crate::protocol::{RegisterRequest, RegisterResponse};
use crate::relay;
use crate::state::ServerState;
use axum::body::{Body, Bytes};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

/// Query of `GET /connect`
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub uuid: Option<String>,
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub registered: usize,
    pub connected: usize,
    pub waiting: usize,
}

/// Build the HTTP router with all endpoints
pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(info_page))
        .route("/health", get(health))
        .route("/register", post(register))
        .route("/connect", get(connect))
        .fallback(not_found)
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// Answer preflights and let every other response be read cross-origin
async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return cors_preflight();
    }

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

fn cors_preflight() -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "content-type"),
            (header::ACCESS_CONTROL_MAX_AGE, "86400"),
        ],
        Body::empty(),
    )
        .into_response()
}

/// `POST /register` with `{"userId": ...}`
///
/// The body is decoded regardless of its content type so that simple
/// cross-origin requests work without a preflight.
async fn register(
    State(state): State<ServerState>,
    body: Bytes,
) -> Result<Json<RegisterResponse>, ClientRequestError> {
    let request: RegisterRequest = serde_json::from_slice(&body).map_err(|e| {
        tracing::debug!(error = %e, "invalid registration body");
        ClientRequestError::InvalidBody
    })?;

    let uuid = state.registry().register(request.user_id.clone());
    tracing::info!(identity = %uuid, user_id = %request.user_id, "registered client");
    Ok(Json(RegisterResponse { uuid }))
}

/// `GET /connect?uuid=<identity>`
///
/// The identity is checked before upgrading; unknown identities never get
/// a websocket.
async fn connect(
    State(state): State<ServerState>,
    Query(query): Query<ConnectQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, ClientRequestError> {
    let raw = query
        .uuid
        .filter(|uuid| !uuid.is_empty())
        .ok_or(ClientRequestError::MissingUuid)?;
    let identity: Identity = raw.parse().map_err(|_| ClientRequestError::InvalidUuid)?;

    if !state.registry().contains(identity) {
        tracing::warn!(identity = %identity, "connect for unknown identity");
        return Err(ClientRequestError::UnknownIdentity);
    }
    let ws = ws.ok_or(ClientRequestError::NotWebSocket)?;
    let max_frame_bytes = state.settings().max_frame_bytes;

    Ok(ws
        .max_message_size(max_frame_bytes)
        .max_frame_size(max_frame_bytes)
        .on_upgrade(move |socket| relay::run_connection(socket, state, identity)))
}

async fn health(State(state): State<ServerState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        registered: state.registry().len(),
        connected: state.registry().connected_count(),
        waiting: state.matcher().waiting(),
    })
}

async fn info_page() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain")],
        "Rendezvous Signaling Server\n\
         \n\
         Endpoints:\n\
         - POST /register {\"userId\": \"...\"} -> {\"uuid\": \"...\"}\n\
         - GET /connect?uuid={uuid} - WebSocket for signaling frames\n\
         - GET /health - Health check\n\
         \n\
         Frames (JSON text):\n\
         - {\"type\": \"offer\", \"sdp\": \"...\", \"to\": \"<uuid>\", \"from\": \"<uuid>\"}\n\
         - {\"type\": \"answer\", \"answer\": \"...\", \"to\": \"<uuid>\", \"from\": \"<uuid>\"}\n\
         - {\"type\": \"ice\", \"candidate\": \"...\", \"to\": \"<uuid>\", \"from\": \"<uuid>\"}\n\
         - {\"type\": \"send_offer\"} (server -> client, pairing mode)\n",
    )
        .into_response()
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}
