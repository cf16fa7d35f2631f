//! Connection handles
//!
//! Every duplex connection is owned by one writer task. Everything else holds
//! a cloneable [`ConnectionHandle`] that queues frames for that writer, so
//! frames on one connection are written in the order they were queued.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use futures::{Sink, SinkExt};
use neuron_core::{generate_message, Head, Message, NeuronError, Obfuscator, Result};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

/// Command for a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Obfuscated frame bytes
    Frame(Vec<u8>),
    /// Close the connection
    Close,
}

/// Cloneable sending side of one duplex connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    peer: String,
    sender: mpsc::UnboundedSender<Outbound>,
    obfuscator: Arc<Obfuscator>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end its writer task drains
    pub fn channel(
        peer: impl Into<String>,
        obfuscator: Arc<Obfuscator>,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                peer: peer.into(),
                sender,
                obfuscator,
            },
            receiver,
        )
    }

    /// Remote address or URL of the connection
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// True once the writer task has gone away
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Resolve once the writer task has gone away
    pub async fn closed(&self) {
        self.sender.closed().await
    }

    /// Obfuscate and queue a text frame
    pub fn send_frame(&self, frame: &str) -> Result<()> {
        let bytes = self.obfuscator.encode_str(frame)?;
        self.send_raw(bytes)
    }

    /// Queue already obfuscated bytes
    pub fn send_raw(&self, bytes: Vec<u8>) -> Result<()> {
        self.sender
            .send(Outbound::Frame(bytes))
            .map_err(|_| NeuronError::send_failed(&self.peer, "connection writer closed"))
    }

    /// Answer an envelope with `<id>#!REPLY#base64(json)**`
    pub fn reply(&self, id: &str, message: &Message) -> Result<()> {
        let payload = STANDARD.encode(message.to_json()?);
        self.send_frame(&generate_message(Head::Notification, "REPLY", [payload], Some(id)))
    }

    /// Ask the peer to run `service.operation` with a base64 encoded payload
    pub fn eval(&self, id: &str, service: &str, operation: &str, payload: &str) -> Result<()> {
        self.send_frame(&eval_frame(id, service, operation, payload))
    }

    /// Ask the writer task to close the connection
    pub fn close(&self) {
        if self.sender.send(Outbound::Close).is_err() {
            debug!("Connection {} already closed", self.peer);
        }
    }
}

/// Build `[<id>#]?EVAL#<service>#<operation>#base64(payload)**`
pub fn eval_frame(id: &str, service: &str, operation: &str, payload: &str) -> String {
    let encoded = STANDARD.encode(payload);
    generate_message(
        Head::Request,
        "EVAL",
        [service, operation, encoded.as_str()],
        Some(id),
    )
}

/// Drain a handle's queue into a websocket sink until closed
///
/// A failed write ends the loop with an error; dropping the queue then wakes
/// every [`ConnectionHandle::closed`] waiter so the reader side can tear the
/// connection down.
pub async fn write_loop<S>(
    mut sink: S,
    mut receiver: mpsc::UnboundedReceiver<Outbound>,
    peer: String,
) -> Result<()>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut outcome = Ok(());
    while let Some(outbound) = receiver.recv().await {
        match outbound {
            Outbound::Frame(bytes) => {
                if let Err(e) = sink.send(WsMessage::Binary(bytes)).await {
                    warn!("Write to {} failed: {}", peer, e);
                    outcome = Err(NeuronError::send_failed(&peer, e.to_string()));
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }
    receiver.close();
    drop(receiver);
    let _ = sink.close().await;
    debug!("Writer for {} stopped", peer);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as futures_mpsc;
    use futures::StreamExt;
    use neuron_core::analyze_message;

    fn obfuscator() -> Arc<Obfuscator> {
        Arc::new(Obfuscator::new("1.4.7"))
    }

    #[test]
    fn test_eval_frame_layout() {
        let frame = eval_frame("job-1", "Subscriber", "BehaviorTreePush", "{}");
        assert_eq!(frame, "job-1#?EVAL#Subscriber#BehaviorTreePush#e30=**");
    }

    #[tokio::test]
    async fn test_reply_is_obfuscated_reply_frame() {
        let (handle, mut receiver) = ConnectionHandle::channel("peer", obfuscator());
        handle.reply("req-9", &Message::success("Pong")).unwrap();

        let Some(Outbound::Frame(bytes)) = receiver.recv().await else {
            panic!("expected a frame");
        };
        let plain = obfuscator().decode_str(&bytes).unwrap().unwrap();
        let envelope = analyze_message(&plain)[0].clone().unwrap();
        assert_eq!(envelope.id(), Some("req-9"));
        assert!(envelope.is(Head::Notification, "REPLY"));
        let json = String::from_utf8(STANDARD.decode(envelope.cmd(0).unwrap()).unwrap()).unwrap();
        assert_eq!(Message::from_json(&json).unwrap(), Message::success("Pong"));
    }

    #[tokio::test]
    async fn test_send_after_writer_gone_fails() {
        let (handle, receiver) = ConnectionHandle::channel("peer", obfuscator());
        drop(receiver);
        assert!(handle.is_closed());
        let err = handle.send_frame("!HEART**").unwrap_err();
        assert_eq!(err.status(), neuron_core::StatusCode::WEBSOCKET_ERROR);
    }

    #[tokio::test]
    async fn test_write_loop_forwards_until_close() {
        let (handle, receiver) = ConnectionHandle::channel("peer", obfuscator());
        let (sink, mut written) = futures_mpsc::unbounded::<WsMessage>();

        handle.send_raw(vec![1, 2, 3]).unwrap();
        handle.close();
        write_loop(sink, receiver, "peer".to_string()).await.unwrap();

        assert_eq!(written.next().await, Some(WsMessage::Binary(vec![1, 2, 3])));
        assert_eq!(written.next().await, Some(WsMessage::Close(None)));
        assert_eq!(written.next().await, None);
        assert!(handle.send_raw(vec![4]).is_err());
    }

    #[tokio::test]
    async fn test_failed_write_ends_connection() {
        let (handle, receiver) = ConnectionHandle::channel("peer", obfuscator());
        let (sink, written) = futures_mpsc::unbounded::<WsMessage>();
        drop(written);

        handle.send_raw(vec![1]).unwrap();
        let writer = tokio::spawn(write_loop(sink, receiver, "peer".to_string()));

        tokio::time::timeout(std::time::Duration::from_secs(1), handle.closed())
            .await
            .unwrap();
        let err = writer.await.unwrap().unwrap_err();
        assert_eq!(err.status(), neuron_core::StatusCode::WEBSOCKET_ERROR);
        assert!(handle.send_raw(vec![2]).is_err());
    }
}
