//! Live connection handles
//!
//! A [`Channel`] is the registry's view of one upgraded websocket. Writes go
//! through an unbounded queue drained by a single writer task, so the socket
//! never sees two concurrent writers no matter how many connections relay
//! into it.

use crate::error::SignalingError;
use axum::extract::ws::{CloseFrame, Message};
use futures_util::{Sink, SinkExt};
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Notify, mpsc};

/// Close code sent to a connection that was replaced by a newer one
pub const CLOSE_REPLACED: u16 = 4000;

/// Close code sent when the server drops a silent connection
pub const CLOSE_TIMEOUT: u16 = 4001;

/// Close code sent when the identity no longer exists
pub const CLOSE_UNKNOWN: u16 = 4004;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of one physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

/// Cloneable handle on one live connection
#[derive(Debug, Clone)]
pub struct Channel {
    id: ChannelId,
    tx: mpsc::UnboundedSender<Message>,
    closed: Arc<Notify>,
}

impl Channel {
    /// Create a channel and the queue its writer task drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            id: ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)),
            tx,
            closed: Arc::new(Notify::new()),
        };
        (channel, rx)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Queue a message for the writer task
    pub fn send(&self, message: Message) -> Result<(), SignalingError> {
        self.tx
            .send(message)
            .map_err(|e| SignalingError::SendError(e.to_string()))
    }

    /// Queue a text frame, verbatim
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), SignalingError> {
        self.send(Message::Text(text.into()))
    }

    /// Close the connection.
    ///
    /// Queues a close frame (the writer stops after sending it) and wakes the
    /// reader that owns this connection so it exits and detaches.
    pub fn close(&self, code: u16, reason: &'static str) {
        let _ = self.tx.send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })));
        self.closed.notify_one();
    }

    /// Resolves once [`Channel::close`] has been called on any clone
    pub async fn closed(&self) {
        self.closed.notified().await;
    }

    /// Whether the writer task is still draining this channel
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Drain a channel's queue into the socket sink.
///
/// This is the only code that writes to the sink. It stops after a close
/// frame, on the first write error, or once every [`Channel`] clone is gone.
pub async fn run_writer<S>(mut sink: S, mut rx: mpsc::UnboundedReceiver<Message>)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            tracing::debug!(error = %e, "websocket write failed");
            return;
        }
        if closing {
            return;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::Mutex;

    /// Sink that records every message it is given
    fn recording_sink() -> (
        impl Sink<Message, Error = Infallible> + Unpin,
        Arc<Mutex<Vec<Message>>>,
    ) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = futures_util::sink::unfold(Arc::clone(&sent), |sent, message: Message| async move {
            sent.lock().unwrap().push(message);
            Ok::<_, Infallible>(sent)
        });
        (Box::pin(sink), sent)
    }

    #[test]
    fn channel_ids_are_unique() {
        let (a, _rx_a) = Channel::new();
        let (b, _rx_b) = Channel::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[tokio::test]
    async fn writer_forwards_in_order_and_stops_at_close() {
        let (channel, rx) = Channel::new();
        channel.send_text("one").unwrap();
        channel.send_text("two").unwrap();
        channel.close(CLOSE_REPLACED, "replaced");
        channel.send_text("after close").unwrap();

        let (sink, sent) = recording_sink();
        run_writer(sink, rx).await;

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], Message::Text("one".into()));
        assert_eq!(sent[1], Message::Text("two".into()));
        assert!(matches!(&sent[2], Message::Close(Some(frame)) if frame.code == CLOSE_REPLACED));
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn writer_ends_when_all_handles_drop() {
        let (channel, rx) = Channel::new();
        channel.send_text("last").unwrap();
        drop(channel);

        let (sink, sent) = recording_sink();
        run_writer(sink, rx).await;
        assert_eq!(*sent.lock().unwrap(), vec![Message::Text("last".into())]);
    }

    #[tokio::test]
    async fn close_wakes_a_later_waiter() {
        let (channel, _rx) = Channel::new();
        channel.clone().close(CLOSE_TIMEOUT, "timeout");
        tokio::time::timeout(std::time::Duration::from_secs(1), channel.closed())
            .await
            .expect("close signal should be stored until observed");
    }
}
