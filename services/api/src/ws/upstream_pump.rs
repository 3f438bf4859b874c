//! Routes upstream responses to the tool queue or the content processor.

use super::{
    content::ServerContentProcessor, outbound::ClientChannel, protocol::ServerMessage,
    supervisor::Pump, tool_queue::ToolCallQueue,
};
use crate::{
    error::{ErrorClass, RelayError},
    registry::SessionState,
};
use async_trait::async_trait;
use relay_core::{AudioSink, UpstreamResponse, UpstreamSession};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct UpstreamPump {
    session: Arc<SessionState>,
    upstream: Arc<dyn UpstreamSession>,
    tool_queue: ToolCallQueue,
    client: ClientChannel,
    processor: ServerContentProcessor,
}

impl UpstreamPump {
    pub fn new(
        session: Arc<SessionState>,
        upstream: Arc<dyn UpstreamSession>,
        tool_queue: ToolCallQueue,
        client: ClientChannel,
        audio_sink: Arc<dyn AudioSink>,
    ) -> Self {
        let processor = ServerContentProcessor::new(session.clone(), client.clone(), audio_sink);
        Self {
            session,
            upstream,
            tool_queue,
            client,
            processor,
        }
    }

    async fn handle(&mut self, response: UpstreamResponse) -> Result<(), RelayError> {
        match response {
            UpstreamResponse::ToolCall(batch) => {
                debug!(calls = batch.function_calls.len(), "Queueing tool call batch.");
                self.tool_queue.enqueue(batch)?;
            }
            UpstreamResponse::ToolCallCancellation { ids } => {
                let cancelled = self.session.cancel_tool_calls(&ids);
                info!(?ids, cancelled, "Upstream cancelled tool calls.");
            }
            UpstreamResponse::ServerContent(content) => self.processor.process(content).await?,
            UpstreamResponse::SessionResumptionUpdate {
                new_handle,
                resumable,
            } => match new_handle {
                Some(handle) if resumable => {
                    debug!("Received a new session resumption handle.");
                    self.session.set_resumption_handle(handle.clone());
                    self.client.send(ServerMessage::SessionHandle(handle)).await?;
                }
                _ => debug!(resumable, "Session is not resumable at this point."),
            },
            UpstreamResponse::GoAway { time_left } => {
                warn!(?time_left, "Upstream will close the session soon.");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Pump for UpstreamPump {
    const NAME: &'static str = "upstream_pump";

    async fn run(&mut self, token: &CancellationToken) -> Result<(), RelayError> {
        loop {
            let response = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                response = self.upstream.receive() => response,
            };
            let response = match response {
                None => {
                    info!("Upstream response stream ended.");
                    return Ok(());
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(response)) => response,
            };

            if let Err(e) = self.handle(response).await {
                match e.classify() {
                    ErrorClass::ConnectionClosed | ErrorClass::QuotaExceeded => return Err(e),
                    _ => error!(error = ?e, "Failed to handle upstream response."),
                }
            }
        }
    }

    fn reset(&mut self) {
        self.processor.reset_turn();
    }
}
