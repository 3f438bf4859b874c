//! Turn-level handling of model content.

use super::{outbound::ClientChannel, protocol::ServerMessage};
use crate::{error::RelayError, registry::SessionState};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use relay_core::{AudioSink, AudioTurnBuffer, Part, ServerContent};
use std::sync::Arc;
use tracing::{debug, info, warn};

const INTERRUPTED_MESSAGE: &str = "Response interrupted by user input";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Receiving,
}

/// Consumes `serverContent` for one session: forwards it to the client and
/// accumulates the turn's audio until the turn completes or is interrupted.
pub struct ServerContentProcessor {
    session: Arc<SessionState>,
    client: ClientChannel,
    audio_sink: Arc<dyn AudioSink>,
    audio_buffer: AudioTurnBuffer,
    phase: TurnPhase,
}

impl ServerContentProcessor {
    pub fn new(
        session: Arc<SessionState>,
        client: ClientChannel,
        audio_sink: Arc<dyn AudioSink>,
    ) -> Self {
        Self {
            session,
            client,
            audio_sink,
            audio_buffer: AudioTurnBuffer::new(),
            phase: TurnPhase::Idle,
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn buffered_chunks(&self) -> usize {
        self.audio_buffer.len()
    }

    pub async fn process(&mut self, content: ServerContent) -> Result<(), RelayError> {
        if content.interrupted {
            return self.interrupt().await;
        }

        if let Some(parts) = content.model_turn {
            self.session.mark_model_response();
            self.phase = TurnPhase::Receiving;
            for part in parts {
                match part {
                    Part::InlineData { mime_type, data } => {
                        debug!(%mime_type, bytes = data.len(), "Forwarding model audio.");
                        let encoded = BASE64.encode(&data);
                        self.audio_buffer.push(data);
                        self.client.send(ServerMessage::Audio(encoded)).await?;
                    }
                    Part::Text(text) => {
                        self.client.send(ServerMessage::Text(text)).await?;
                    }
                }
            }
        }

        if let Some(text) = content.input_transcription.filter(|t| !t.trim().is_empty()) {
            self.client
                .send(ServerMessage::InputTranscription(text))
                .await?;
        }
        if let Some(text) = content
            .output_transcription
            .filter(|t| !t.trim().is_empty())
        {
            self.client
                .send(ServerMessage::OutputTranscription(text))
                .await?;
        }

        if content.turn_complete {
            self.complete_turn().await?;
        }
        Ok(())
    }

    async fn interrupt(&mut self) -> Result<(), RelayError> {
        info!(
            discarded_chunks = self.audio_buffer.len(),
            "Model response interrupted."
        );
        self.audio_buffer.clear();
        self.session.set_receiving_response(false);
        self.phase = TurnPhase::Idle;
        self.client
            .send(ServerMessage::Interrupted {
                message: INTERRUPTED_MESSAGE.to_string(),
            })
            .await
    }

    async fn complete_turn(&mut self) -> Result<(), RelayError> {
        let session_id = self.session.session_id.to_string();
        if let Err(e) = self
            .audio_sink
            .flush(&session_id, self.audio_buffer.chunks())
            .await
        {
            warn!(error = %e, "Failed to persist turn audio.");
        }
        self.audio_buffer.clear();
        self.session.reset_turn_flags();
        self.phase = TurnPhase::Idle;
        debug!("Turn complete.");
        self.client.send(ServerMessage::TurnComplete).await
    }

    /// Drops any partial turn, e.g. before the upstream pump restarts.
    pub fn reset_turn(&mut self) {
        self.audio_buffer.clear();
        self.session.reset_turn_flags();
        self.phase = TurnPhase::Idle;
    }
}
