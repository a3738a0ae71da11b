//! Relay loop
//!
//! One worker per live connection. The worker reads frames in order,
//! classifies each just far enough to find its destination, and queues the
//! untouched text on the destination's channel. Undeliverable frames are
//! dropped without telling the sender.

use crate::channel::{CLOSE_TIMEOUT, CLOSE_UNKNOWN, Channel, run_writer};
use crate::error::{ClientRequestError, SignalingError};
use crate::identity::Identity;
use crate::matcher::Unroutable;
use crate::protocol::FrameHeader;
use crate::state::ServerState;
use axum::extract::ws::{Message, WebSocket};
use futures_util::StreamExt;
use std::time::Instant;
use thiserror::Error;

/// Why an inbound frame was not forwarded
#[derive(Error, Debug)]
pub enum Dropped {
    #[error("frame of {0} bytes is over the size limit")]
    TooLarge(usize),

    #[error("unclassified frame: {0}")]
    Unclassified(#[source] ClientRequestError),

    #[error("frame claims to come from {0}")]
    Spoofed(Identity),

    #[error("no destination ({0:?})")]
    Unroutable(Unroutable),

    #[error("destination {to} unreachable: {source}")]
    Undeliverable { to: Identity, source: SignalingError },
}

/// Route one text frame sent by `sender`.
///
/// Returns the identity the frame was queued for.
pub fn route_frame(state: &ServerState, sender: Identity, text: &str) -> Result<Identity, Dropped> {
    if text.len() > state.settings().max_frame_bytes {
        return Err(Dropped::TooLarge(text.len()));
    }

    let header = FrameHeader::classify(text).map_err(Dropped::Unclassified)?;
    if let Some(from) = header.from {
        if from != sender {
            return Err(Dropped::Spoofed(from));
        }
    }

    let to = state
        .matcher()
        .destination(state.registry(), sender, &header)
        .map_err(Dropped::Unroutable)?;
    state
        .registry()
        .deliver(to, text)
        .map_err(|source| Dropped::Undeliverable { to, source })?;

    tracing::trace!(from = %sender, to = %to, kind = %header.kind, "relayed frame");
    Ok(to)
}

/// Detaches the connection and closes it when the worker ends, however it
/// ends (including the task being aborted).
struct ConnectionGuard {
    state: ServerState,
    identity: Identity,
    channel: Channel,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.state.registry().detach_connection(self.identity, self.channel.id()) {
            self.state
                .matcher()
                .on_disconnected(self.state.registry(), self.identity);
        }
        self.channel.close(1000, "closed");
        tracing::info!(identity = %self.identity, "connection closed");
    }
}

/// Run the worker for an upgraded connection until it closes
pub async fn run_connection(socket: WebSocket, state: ServerState, identity: Identity) {
    let (sink, mut stream) = socket.split();
    let (channel, rx) = Channel::new();
    let writer = tokio::spawn(run_writer(sink, rx));

    if state.registry().attach_connection(identity, channel.clone()).is_err() {
        // evicted between the connect check and the upgrade
        tracing::warn!(identity = %identity, "rejecting connection for unknown identity");
        channel.close(CLOSE_UNKNOWN, "unknown identity");
        drop(channel);
        let _ = writer.await;
        return;
    }

    let guard = ConnectionGuard {
        state: state.clone(),
        identity,
        channel: channel.clone(),
    };
    tracing::info!(identity = %identity, "connection attached");
    state.matcher().on_connected(state.registry(), identity);

    let keepalive = state.settings().keepalive;
    let mut ticker = tokio::time::interval(keepalive);
    ticker.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(message)) => {
                    last_seen = Instant::now();
                    match message {
                        Message::Text(text) => {
                            if let Err(reason) = route_frame(&state, identity, &text) {
                                tracing::debug!(identity = %identity, %reason, "dropped frame");
                            }
                        }
                        Message::Binary(_) => {
                            tracing::debug!(identity = %identity, "dropped binary frame");
                        }
                        Message::Ping(_) | Message::Pong(_) => {}
                        Message::Close(frame) => {
                            tracing::debug!(identity = %identity, reason = ?frame, "client closed");
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(identity = %identity, error = %e, "websocket read failed");
                    break;
                }
                None => break,
            },
            _ = channel.closed() => {
                tracing::debug!(identity = %identity, "connection closed by server");
                break;
            }
            _ = ticker.tick() => {
                if last_seen.elapsed() >= keepalive * 2 {
                    tracing::warn!(identity = %identity, "keepalive timeout");
                    channel.close(CLOSE_TIMEOUT, "keepalive timeout");
                    break;
                }
                if channel.send(Message::Ping(Vec::new())).is_err() {
                    break;
                }
            }
        }
    }

    drop(guard);
    drop(channel);
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelaySettings;
    use crate::matcher::MatchingPolicy;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connect(state: &ServerState, label: &str) -> (Identity, Channel, UnboundedReceiver<Message>) {
        let id = state.registry().register(label);
        let (channel, rx) = Channel::new();
        state.registry().attach_connection(id, channel.clone()).unwrap();
        (id, channel, rx)
    }

    fn text(rx: &mut UnboundedReceiver<Message>) -> Option<String> {
        match rx.try_recv() {
            Ok(Message::Text(text)) => Some(text),
            _ => None,
        }
    }

    #[test]
    fn offer_and_answer_are_relayed_verbatim() {
        let state = ServerState::default();
        let (alice, _, mut alice_rx) = connect(&state, "alice");
        let (bob, _, mut bob_rx) = connect(&state, "bob");

        let offer = format!(r#"{{"type":"offer","sdp":"x","to":"{bob}","from":"{alice}"}}"#);
        assert_eq!(route_frame(&state, alice, &offer).unwrap(), bob);
        assert_eq!(text(&mut bob_rx), Some(offer));
        assert_eq!(text(&mut alice_rx), None);

        // odd spacing survives because nothing is re-encoded
        let answer = format!(r#"{{ "type": "answer", "answer": "y", "to": "{alice}" }}"#);
        assert_eq!(route_frame(&state, bob, &answer).unwrap(), alice);
        assert_eq!(text(&mut alice_rx), Some(answer));
    }

    #[test]
    fn frames_keep_sender_order() {
        let state = ServerState::default();
        let (alice, _, _alice_rx) = connect(&state, "alice");
        let (bob, _, mut bob_rx) = connect(&state, "bob");

        let frames: Vec<String> = (0..20)
            .map(|i| format!(r#"{{"type":"ice","candidate":"c{i}","to":"{bob}"}}"#))
            .collect();
        for frame in &frames {
            route_frame(&state, alice, frame).unwrap();
        }
        let received: Vec<String> = std::iter::from_fn(|| text(&mut bob_rx)).collect();
        assert_eq!(received, frames);
    }

    #[test]
    fn unknown_or_disconnected_destinations_are_dropped() {
        let state = ServerState::default();
        let (alice, _, mut alice_rx) = connect(&state, "alice");
        let offline = state.registry().register("offline");

        let to_unknown = format!(r#"{{"type":"offer","sdp":"x","to":"{}"}}"#, Identity::issue());
        assert!(matches!(
            route_frame(&state, alice, &to_unknown),
            Err(Dropped::Undeliverable { source: SignalingError::UnknownIdentity, .. })
        ));

        let to_offline = format!(r#"{{"type":"offer","sdp":"x","to":"{offline}"}}"#);
        assert!(matches!(
            route_frame(&state, alice, &to_offline),
            Err(Dropped::Undeliverable { source: SignalingError::NotConnected, .. })
        ));
        assert_eq!(text(&mut alice_rx), None);
    }

    #[test]
    fn detached_destination_stops_receiving() {
        let state = ServerState::default();
        let (alice, alice_channel, mut alice_rx) = connect(&state, "alice");
        let (bob, _, _bob_rx) = connect(&state, "bob");
        state.registry().detach_connection(alice, alice_channel.id());

        let frame = format!(r#"{{"type":"answer","answer":"y","to":"{alice}","from":"{bob}"}}"#);
        assert!(route_frame(&state, bob, &frame).is_err());
        assert_eq!(text(&mut alice_rx), None);
    }

    #[test]
    fn unclassified_and_spoofed_frames_are_dropped() {
        let state = ServerState::default();
        let (alice, _, _alice_rx) = connect(&state, "alice");
        let (bob, _, mut bob_rx) = connect(&state, "bob");
        let mallory = Identity::issue();

        for frame in [
            "garbage".to_string(),
            format!(r#"{{"type":"chat","to":"{bob}"}}"#),
            format!(r#"{{"type":"offer","sdp":"x"}}"#),
        ] {
            assert!(route_frame(&state, alice, &frame).is_err(), "{frame}");
        }

        let spoofed = format!(r#"{{"type":"offer","sdp":"x","to":"{bob}","from":"{mallory}"}}"#);
        assert!(matches!(route_frame(&state, alice, &spoofed), Err(Dropped::Spoofed(id)) if id == mallory));
        assert_eq!(text(&mut bob_rx), None);
    }

    #[test]
    fn oversized_frames_are_dropped() {
        let state = ServerState::new(RelaySettings {
            max_frame_bytes: 64,
            ..RelaySettings::default()
        });
        let (alice, _, _alice_rx) = connect(&state, "alice");
        let (bob, _, mut bob_rx) = connect(&state, "bob");

        let frame = format!(r#"{{"type":"offer","sdp":"{}","to":"{bob}"}}"#, "x".repeat(64));
        assert!(matches!(route_frame(&state, alice, &frame), Err(Dropped::TooLarge(_))));
        assert_eq!(text(&mut bob_rx), None);
    }

    #[test]
    fn paired_frames_go_to_the_peer() {
        let state = ServerState::new(RelaySettings {
            policy: MatchingPolicy::Pairing,
            ..RelaySettings::default()
        });
        let (r1, _, mut rx1) = connect(&state, "r1");
        let (r2, _, mut rx2) = connect(&state, "r2");
        state.matcher().on_connected(state.registry(), r1);
        state.matcher().on_connected(state.registry(), r2);
        assert_eq!(text(&mut rx1).as_deref(), Some(r#"{"type":"send_offer"}"#));

        let offer = r#"{"type":"offer","sdp":"x"}"#;
        assert_eq!(route_frame(&state, r1, offer).unwrap(), r2);
        assert_eq!(text(&mut rx2).as_deref(), Some(offer));

        let answer = r#"{"type":"answer","answer":"y"}"#;
        assert_eq!(route_frame(&state, r2, answer).unwrap(), r1);
        assert_eq!(text(&mut rx1).as_deref(), Some(answer));
    }
}
