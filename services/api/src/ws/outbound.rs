//! The single writer that owns the client half of the socket.
//!
//! Pumps and the tool worker never touch the socket directly: they send
//! [`ServerMessage`]s through a [`ClientChannel`], and `forward_to_client`
//! writes them out in the order they were queued.

use super::protocol::ServerMessage;
use crate::error::{ErrorClass, QUOTA_EXCEEDED_TEXT, RelayError};
use anyhow::Result;
use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Bound on messages queued for the client writer.
pub const OUTBOUND_CAPACITY: usize = 64;

/// A cloneable handle for sending messages to the connected client.
#[derive(Clone, Debug)]
pub struct ClientChannel {
    tx: mpsc::Sender<ServerMessage>,
}

impl ClientChannel {
    pub fn new(tx: mpsc::Sender<ServerMessage>) -> Self {
        Self { tx }
    }

    /// Queues a message. Fails with `ConnectionClosed` once the writer is gone.
    pub async fn send(&self, msg: ServerMessage) -> Result<(), RelayError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| RelayError::ConnectionClosed("client connection closed".to_string()))
    }

    /// Tells the client about a failure of the given class, if it has a notice.
    pub async fn send_error(&self, class: ErrorClass) -> Result<(), RelayError> {
        let Some(notice) = class.client_notice() else {
            return Ok(());
        };
        self.send(ServerMessage::Error(notice)).await?;
        if class == ErrorClass::QuotaExceeded {
            self.send(ServerMessage::Text(QUOTA_EXCEEDED_TEXT.to_string()))
                .await?;
        }
        Ok(())
    }
}

/// Drains queued messages into the socket until every [`ClientChannel`] is
/// dropped or the socket stops accepting writes.
pub async fn forward_to_client<W>(mut rx: mpsc::Receiver<ServerMessage>, mut sink: W)
where
    W: Sink<Message> + Unpin,
    W::Error: std::error::Error + Send + Sync + 'static,
{
    while let Some(msg) = rx.recv().await {
        if let Err(e) = send_msg(&mut sink, &msg).await {
            warn!(error = %e, "Failed to write to client socket. Stopping writer.");
            return;
        }
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "Client socket was already closed.");
    }
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg<W>(sink: &mut W, msg: &ServerMessage) -> Result<()>
where
    W: Sink<Message> + Unpin,
    W::Error: std::error::Error + Send + Sync + 'static,
{
    let serialized = serde_json::to_string(msg)?;
    sink.send(Message::Text(serialized.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorPayload;
    use futures::{StreamExt, channel::mpsc as fmpsc};
    use serde_json::{Value, json};

    fn decode(msg: Message) -> Value {
        match msg {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn writes_messages_in_queue_order() {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (sink, mut frames) = fmpsc::unbounded::<Message>();
        let writer = tokio::spawn(forward_to_client(rx, sink));

        let client = ClientChannel::new(tx);
        client.send(ServerMessage::Ready).await.unwrap();
        client.send(ServerMessage::Text("one".into())).await.unwrap();
        client.send(ServerMessage::TurnComplete).await.unwrap();
        drop(client);
        writer.await.unwrap();

        let mut seen = Vec::new();
        while let Some(frame) = frames.next().await {
            seen.push(decode(frame));
        }
        assert_eq!(
            seen,
            vec![
                json!({"type": "ready"}),
                json!({"type": "text", "data": "one"}),
                json!({"type": "turn_complete"}),
            ]
        );
    }

    #[tokio::test]
    async fn send_fails_once_writer_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let client = ClientChannel::new(tx);

        let err = client.send(ServerMessage::Ready).await.unwrap_err();
        assert_eq!(err.classify(), ErrorClass::ConnectionClosed);
    }

    #[tokio::test]
    async fn quota_error_is_followed_by_a_chat_notice() {
        let (tx, mut rx) = mpsc::channel(4);
        let client = ClientChannel::new(tx);

        client.send_error(ErrorClass::QuotaExceeded).await.unwrap();
        client.send_error(ErrorClass::ConnectionClosed).await.unwrap();
        drop(client);

        assert_eq!(
            rx.recv().await,
            Some(ServerMessage::Error(ErrorPayload::quota_exceeded()))
        );
        assert_eq!(
            rx.recv().await,
            Some(ServerMessage::Text(QUOTA_EXCEEDED_TEXT.to_string()))
        );
        assert_eq!(rx.recv().await, None);
    }
}
