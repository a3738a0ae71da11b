//! Rendezvous and relay server for WebRTC signaling
//!
//! Clients register to obtain an opaque identity, connect a websocket with
//! that identity, and exchange offers, answers and ICE candidates through
//! the server until their own peer connection is up. Payloads are relayed
//! verbatim and never interpreted.
//!
//! # Protocol
//!
//! - **POST /register** `{"userId": "alice"}` → `{"uuid": "<uuid>"}`
//! - **GET /connect?uuid={uuid}** - upgrade to the signaling websocket
//! - **GET /health** - health check
//!
//! ## Frames (client → server → client)
//!
//! JSON text frames tagged by `type`:
//! - `{"type": "offer", "sdp": "...", "to": "<uuid>", "from": "<uuid>"}`
//! - `{"type": "answer", "answer": "...", "to": "<uuid>", "from": "<uuid>"}`
//! - `{"type": "ice", "candidate": "...", "to": "<uuid>", "from": "<uuid>"}`
//!
//! With addressed routing (the default) each frame goes to its `to`. With
//! pairing, the server pairs connected clients in arrival order, sends
//! `{"type": "send_offer"}` to the first of each pair, and routes every frame
//! to the sender's peer. Frames of any other type, and frames whose
//! destination is not connected, are dropped silently.
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! rendezvous-signaling --port 8080
//!
//! # Register
//! curl -X POST -d '{"userId":"alice"}' http://127.0.0.1:8080/register
//!
//! # Connect with any websocket client
//! websocat "ws://127.0.0.1:8080/connect?uuid=<uuid>"
//! ```

#![forbid(unsafe_code)]

pub mod channel;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod handler;
pub mod identity;
pub mod matcher;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod state;

pub use config::{Config, RelaySettings};
pub use error::{ClientRequestError, SignalingError};
pub use handler::build_router;
pub use identity::Identity;
pub use matcher::MatchingPolicy;
pub use registry::ClientRegistry;
pub use state::ServerState;
