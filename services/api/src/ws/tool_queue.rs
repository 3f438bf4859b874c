//! Serialized execution of model tool calls.
//!
//! The upstream pump only enqueues batches; one worker per session runs them so
//! that a slow tool never stalls the response stream.

use super::{outbound::ClientChannel, protocol::ServerMessage};
use crate::{error::RelayError, registry::SessionState};
use relay_core::{
    FunctionCall, FunctionResponse, ToolCallBatch, ToolError, ToolExecutor, UpstreamInput,
    UpstreamSession,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The producer side of a session's tool-call queue.
#[derive(Clone, Debug)]
pub struct ToolCallQueue {
    tx: mpsc::UnboundedSender<ToolCallBatch>,
}

impl ToolCallQueue {
    /// Queues a batch without waiting for any tool to run.
    pub fn enqueue(&self, batch: ToolCallBatch) -> Result<(), RelayError> {
        self.tx
            .send(batch)
            .map_err(|_| RelayError::Unexpected(anyhow::anyhow!("tool worker has stopped")))
    }
}

/// Runs queued batches one at a time, each call in the order received.
pub struct ToolWorker {
    session: Arc<SessionState>,
    client: ClientChannel,
    upstream: Arc<dyn UpstreamSession>,
    executor: Arc<dyn ToolExecutor>,
    rx: mpsc::UnboundedReceiver<ToolCallBatch>,
}

/// Creates a session's queue together with the worker that drains it.
pub fn tool_call_queue(
    session: Arc<SessionState>,
    client: ClientChannel,
    upstream: Arc<dyn UpstreamSession>,
    executor: Arc<dyn ToolExecutor>,
) -> (ToolCallQueue, ToolWorker) {
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = ToolWorker {
        session,
        client,
        upstream,
        executor,
        rx,
    };
    (ToolCallQueue { tx }, worker)
}

impl ToolWorker {
    pub async fn run(mut self, token: CancellationToken) {
        loop {
            let batch = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                batch = self.rx.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };
            if let Err(e) = self.process_batch(batch, &token).await {
                error!(error = ?e, "Tool batch failed.");
            }
        }

        self.rx.close();
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "Discarded queued tool batches on shutdown.");
        }
    }

    async fn process_batch(
        &self,
        batch: ToolCallBatch,
        token: &CancellationToken,
    ) -> Result<(), RelayError> {
        info!(calls = batch.function_calls.len(), "Executing tool call batch.");
        let mut responses = Vec::with_capacity(batch.function_calls.len());
        for call in batch.function_calls {
            if token.is_cancelled() {
                return Ok(());
            }
            responses.push(self.execute_call(call, token).await?);
        }
        if token.is_cancelled() {
            debug!("Tool worker cancelled; not sending the batch response.");
            return Ok(());
        }
        self.upstream
            .send(UpstreamInput::ToolResponse(responses), false)
            .await?;
        Ok(())
    }

    async fn execute_call(
        &self,
        call: FunctionCall,
        worker_token: &CancellationToken,
    ) -> Result<FunctionResponse, RelayError> {
        let FunctionCall { id, name, args } = call;
        let token = worker_token.child_token();
        let _execution = self
            .session
            .begin_tool_execution(&id, &name, token.clone());

        self.client
            .send(ServerMessage::FunctionCall {
                name: name.clone(),
                args: args.clone(),
            })
            .await?;

        let result = tokio::select! {
            _ = token.cancelled() => Err(ToolError::Cancelled),
            result = self.executor.execute(&name, &args) => result,
        };
        let response = result.unwrap_or_else(|e| {
            warn!(tool = %name, call_id = %id, error = %e, "Tool call failed.");
            e.to_result()
        });

        self.client
            .send(ServerMessage::FunctionResponse(response.clone()))
            .await?;
        Ok(FunctionResponse { id, name, response })
    }
}
