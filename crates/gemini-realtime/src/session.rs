//! A live session over the Gemini `BidiGenerateContent` WebSocket.

use crate::types::{ClientMessage, ServerMessage, Setup};
use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use relay_core::{UpstreamError, UpstreamInput, UpstreamResponse, UpstreamSession};
use std::collections::VecDeque;
use tokio::{net::TcpStream, sync::Mutex};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::protocol::{CloseFrame, Message as WsMessage, frame::coding::CloseCode},
};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An open Gemini Live session.
///
/// The sink and the stream are locked independently so one task can block on
/// `receive` while others send.
pub struct GeminiLiveSession {
    sender: Mutex<SplitSink<WsStream, WsMessage>>,
    receiver: Mutex<SplitStream<WsStream>>,
    pending: Mutex<VecDeque<UpstreamResponse>>,
}

impl GeminiLiveSession {
    /// Connects, sends the setup message and waits for `setupComplete`.
    ///
    /// `url` may embed credentials and is never logged.
    pub async fn connect(url: &str, setup: Setup) -> Result<Self, UpstreamError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;
        let (mut sender, mut receiver) = ws_stream.split();
        info!(model = %setup.model, "Connected to Gemini Live WebSocket. Sending setup.");

        let setup_msg = serde_json::to_string(&ClientMessage::Setup(setup))?;
        sender
            .send(WsMessage::Text(setup_msg.into()))
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        loop {
            let frame = receiver.next().await;
            let payload = match frame {
                Some(Ok(WsMessage::Text(text))) => text.as_bytes().to_vec(),
                Some(Ok(WsMessage::Binary(data))) => data.to_vec(),
                Some(Ok(WsMessage::Close(frame))) => return Err(closed_error(frame)),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(UpstreamError::Transport(e.to_string())),
                None => {
                    return Err(UpstreamError::Closed {
                        code: u16::from(CloseCode::Abnormal),
                        reason: "stream ended before setup completed".to_string(),
                    });
                }
            };
            match serde_json::from_slice::<ServerMessage>(&payload) {
                Ok(msg) if msg.setup_complete.is_some() => break,
                Ok(msg) => warn!(?msg, "Received unexpected message during Gemini setup."),
                Err(e) => warn!(error = %e, "Failed to parse Gemini message during setup."),
            }
        }
        info!("Gemini session setup is complete. Ready for bidirectional streaming.");

        Ok(Self {
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    async fn send_message(&self, message: &ClientMessage) -> Result<(), UpstreamError> {
        let payload = serde_json::to_string(message)?;
        self.sender
            .lock()
            .await
            .send(WsMessage::Text(payload.into()))
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))
    }
}

/// Maps a close frame onto an error, keeping the server's reason text.
fn closed_error(frame: Option<CloseFrame>) -> UpstreamError {
    match frame {
        Some(frame) => UpstreamError::Closed {
            code: u16::from(frame.code),
            reason: frame.reason.to_string(),
        },
        None => UpstreamError::Closed {
            code: u16::from(CloseCode::Status),
            reason: "no close frame".to_string(),
        },
    }
}

#[async_trait]
impl UpstreamSession for GeminiLiveSession {
    async fn send(&self, input: UpstreamInput, end_of_turn: bool) -> Result<(), UpstreamError> {
        self.send_message(&ClientMessage::from_input(input, end_of_turn))
            .await
    }

    async fn receive(&self) -> Option<Result<UpstreamResponse, UpstreamError>> {
        loop {
            if let Some(response) = self.pending.lock().await.pop_front() {
                return Some(Ok(response));
            }

            let frame = self.receiver.lock().await.next().await;
            let payload = match frame {
                Some(Ok(WsMessage::Text(text))) => text.as_bytes().to_vec(),
                Some(Ok(WsMessage::Binary(data))) => data.to_vec(),
                Some(Ok(WsMessage::Close(frame))) => {
                    return match frame {
                        Some(frame) if frame.code == CloseCode::Normal => {
                            info!("Gemini closed the session normally.");
                            None
                        }
                        other => Some(Err(closed_error(other))),
                    };
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(UpstreamError::Transport(e.to_string()))),
                None => return None,
            };

            let message = match serde_json::from_slice::<ServerMessage>(&payload) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Skipping unparseable Gemini message.");
                    continue;
                }
            };
            match message.into_responses() {
                Ok(responses) => self.pending.lock().await.extend(responses),
                Err(e) => return Some(Err(e)),
            }
        }
    }

    async fn close(&self) -> Result<(), UpstreamError> {
        debug!("Closing Gemini Live WebSocket.");
        self.sender
            .lock()
            .await
            .close()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))
    }
}
