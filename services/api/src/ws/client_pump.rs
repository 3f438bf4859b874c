//! Forwards client messages to the upstream session.

use super::{protocol::ClientMessage, supervisor::Pump};
use crate::error::{ErrorClass, RelayError};
use async_trait::async_trait;
use axum::extract::ws::Message;
use futures_util::{Stream, StreamExt};
use relay_core::{UpstreamInput, UpstreamSession};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const AUDIO_MIME_TYPE: &str = "audio/pcm";
const IMAGE_MIME_TYPE: &str = "image/jpeg";

pub struct ClientPump<S> {
    stream: S,
    upstream: Arc<dyn UpstreamSession>,
    idle_timeout: Duration,
}

impl<S> ClientPump<S>
where
    S: Stream<Item = Result<Message, axum::Error>> + Send + Unpin + 'static,
{
    pub fn new(stream: S, upstream: Arc<dyn UpstreamSession>, idle_timeout: Duration) -> Self {
        Self {
            stream,
            upstream,
            idle_timeout,
        }
    }
}

/// Forwards one text frame. Messages that cannot be parsed are skipped.
async fn forward(upstream: &Arc<dyn UpstreamSession>, text: &str) -> Result<(), RelayError> {
    let message = match ClientMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Ignoring malformed client message.");
            return Ok(());
        }
    };

    match message {
        ClientMessage::Audio(data) => {
            debug!(bytes = data.len(), "Forwarding client audio.");
            upstream
                .send(
                    UpstreamInput::Media {
                        mime_type: AUDIO_MIME_TYPE.to_string(),
                        data,
                    },
                    true,
                )
                .await?;
        }
        ClientMessage::Image(data) => {
            debug!(bytes = data.len(), "Forwarding client image.");
            upstream
                .send(
                    UpstreamInput::Media {
                        mime_type: IMAGE_MIME_TYPE.to_string(),
                        data,
                    },
                    false,
                )
                .await?;
        }
        ClientMessage::Text(text) => {
            info!(chars = text.chars().count(), "Forwarding client text.");
            upstream.send(UpstreamInput::Text(text), true).await?;
        }
        ClientMessage::End => info!("Client finished its input."),
        ClientMessage::Setup(_) => info!("Ignoring setup message received mid-session."),
        ClientMessage::Unknown(kind) => warn!(%kind, "Ignoring unknown client message type."),
    }
    Ok(())
}

#[async_trait]
impl<S> Pump for ClientPump<S>
where
    S: Stream<Item = Result<Message, axum::Error>> + Send + Unpin + 'static,
{
    const NAME: &'static str = "client_pump";

    async fn run(&mut self, token: &CancellationToken) -> Result<(), RelayError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                next = tokio::time::timeout(self.idle_timeout, self.stream.next()) => next,
            };
            let frame = match next {
                Err(_) => {
                    return Err(RelayError::Timeout(format!(
                        "no client message for {}s",
                        self.idle_timeout.as_secs()
                    )));
                }
                Ok(None) => {
                    info!("Client stream ended.");
                    return Ok(());
                }
                Ok(Some(Err(e))) => {
                    return Err(RelayError::ConnectionClosed(format!(
                        "client connection closed: {e}"
                    )));
                }
                Ok(Some(Ok(frame))) => frame,
            };

            let text = match frame {
                Message::Text(text) => text,
                Message::Close(_) => {
                    info!("Client sent close frame.");
                    return Ok(());
                }
                Message::Binary(_) => {
                    warn!("Ignoring binary frame from client.");
                    continue;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };

            if let Err(e) = forward(&self.upstream, text.as_str()).await {
                match e.classify() {
                    ErrorClass::ConnectionClosed | ErrorClass::QuotaExceeded => return Err(e),
                    _ => error!(error = ?e, "Failed to forward client message."),
                }
            }
        }
    }
}
