//! Signaling message shapes
//!
//! The server reads only the envelope of a signaling frame (`type`, `to`,
//! `from`). Payload fields such as `sdp`, `answer` or `candidate` are never
//! parsed; the frame is relayed as the exact text that was received.

use crate::error::ClientRequestError;
use crate::identity::Identity;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Body of `POST /register`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegisterRequest {
    /// Caller-supplied label, informational only
    #[serde(rename = "userId")]
    pub user_id: String,
}

/// Response of `POST /register`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegisterResponse {
    pub uuid: Identity,
}

/// Kind of a client-to-client signaling frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Offer,
    Answer,
    Ice,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameKind::Offer => "offer",
            FrameKind::Answer => "answer",
            FrameKind::Ice => "ice",
            FrameKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Routing envelope of a signaling frame
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FrameHeader {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    /// Destination identity (addressed routing)
    #[serde(default)]
    pub to: Option<Identity>,
    /// Claimed source identity
    #[serde(default)]
    pub from: Option<Identity>,
}

impl FrameHeader {
    /// Classify an inbound text frame.
    ///
    /// Only offers, answers and ICE candidates are routable; anything else,
    /// including frames that are not JSON objects, is rejected.
    pub fn classify(text: &str) -> Result<Self, ClientRequestError> {
        let header: FrameHeader = serde_json::from_str(text)?;
        match header.kind {
            FrameKind::Unknown => Err(ClientRequestError::UnsupportedType),
            _ => Ok(header),
        }
    }
}

/// Server-to-client control frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Tells the first member of a fresh pair to produce the offer
    SendOffer,
    /// The identity waited in the pairing pool for too long and was removed
    PairingTimeout,
}

impl fmt::Display for ControlFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}
