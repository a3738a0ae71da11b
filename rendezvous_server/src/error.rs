//! Error types for the signaling server

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors that can occur while routing signaling traffic
#[derive(Error, Debug)]
pub enum SignalingError {
    /// The destination identity was never registered (or was evicted)
    #[error("Unknown identity")]
    UnknownIdentity,

    /// The destination is registered but has no live connection
    #[error("Identity is not connected")]
    NotConnected,

    /// The channel's writer is gone
    #[error("Failed to send message: {0}")]
    SendError(String),
}

/// Errors from client requests and client frames
#[derive(Error, Debug)]
pub enum ClientRequestError {
    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unsupported message type
    #[error("Unsupported message type")]
    UnsupportedType,

    /// Registration body could not be decoded
    #[error("Invalid request body")]
    InvalidBody,

    /// `/connect` without a `uuid` query parameter
    #[error("UUID is required")]
    MissingUuid,

    /// `uuid` query parameter is not a UUID
    #[error("Invalid UUID")]
    InvalidUuid,

    /// `/connect` for an identity that is not registered
    #[error("Unknown UUID")]
    UnknownIdentity,

    /// `/connect` without a websocket upgrade
    #[error("Expected a WebSocket upgrade request")]
    NotWebSocket,
}

impl ClientRequestError {
    /// HTTP status reported for this error
    pub fn status(&self) -> StatusCode {
        match self {
            ClientRequestError::UnknownIdentity => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ClientRequestError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
