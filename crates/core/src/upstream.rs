//! The upstream collaborator: an opaque, bidirectional streaming session with a
//! real-time multimodal model.
//!
//! The relay only depends on the contract in this module. Provider crates
//! implement [`UpstreamSession`] and [`UpstreamFactory`].

use crate::generic_types::SessionOptions;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tracing::{debug, warn};

/// Failures raised by an upstream session or while opening one.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Failed to connect to upstream: {0}")]
    Connect(String),
    #[error("Upstream connection closed (code {code}): {reason}")]
    Closed { code: u16, reason: String },
    #[error("Upstream transport error: {0}")]
    Transport(String),
    #[error("Upstream protocol error: {0}")]
    Protocol(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Upstream session already closed")]
    AlreadyClosed,
}

/// A single function call requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// An ordered batch of function calls delivered in one upstream message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolCallBatch {
    pub function_calls: Vec<FunctionCall>,
}

/// The result of one function call, keyed by the originating call id.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

/// Input forwarded to the upstream session.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamInput {
    /// Base64-encoded media exactly as received from the client.
    Media { mime_type: String, data: String },
    Text(String),
    /// One aggregated response for a whole tool-call batch.
    ToolResponse(Vec<FunctionResponse>),
}

/// One part of a model turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    InlineData { mime_type: String, data: Bytes },
}

/// Turn-level content produced by the model.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerContent {
    pub model_turn: Option<Vec<Part>>,
    pub interrupted: bool,
    pub turn_complete: bool,
    pub input_transcription: Option<String>,
    pub output_transcription: Option<String>,
}

/// One element of the upstream response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamResponse {
    ToolCall(ToolCallBatch),
    ToolCallCancellation { ids: Vec<String> },
    ServerContent(ServerContent),
    SessionResumptionUpdate {
        new_handle: Option<String>,
        resumable: bool,
    },
    GoAway { time_left: Option<String> },
}

/// An open streaming session with the upstream model.
///
/// All methods take `&self` so that the client pump, the upstream pump and the
/// tool worker can share one session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamSession: Send + Sync {
    /// Sends input to the model. `end_of_turn` marks the input as completing
    /// the user's turn.
    async fn send(&self, input: UpstreamInput, end_of_turn: bool) -> Result<(), UpstreamError>;

    /// Reads the next response. Returns `None` once the stream has ended.
    async fn receive(&self) -> Option<Result<UpstreamResponse, UpstreamError>>;

    /// Closes the underlying transport.
    async fn close(&self) -> Result<(), UpstreamError>;
}

/// Opens upstream sessions for negotiated client options.
#[async_trait]
pub trait UpstreamFactory: Send + Sync {
    async fn open(&self, options: &SessionOptions) -> Result<UpstreamHandle, UpstreamError>;
}

/// Scoped ownership of an upstream session.
///
/// The transport is closed exactly once: either by an explicit [`close`](Self::close)
/// or, failing that, when the handle is dropped inside a Tokio runtime.
pub struct UpstreamHandle {
    session: Arc<dyn UpstreamSession>,
    closed: AtomicBool,
}

impl UpstreamHandle {
    pub fn new(session: Arc<dyn UpstreamSession>) -> Self {
        Self {
            session,
            closed: AtomicBool::new(false),
        }
    }

    /// A shared reference to the session for tasks that send or receive.
    pub fn session(&self) -> Arc<dyn UpstreamSession> {
        self.session.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the session. Returns `Ok(false)` if it had already been closed.
    ///
    /// The handle counts as closed even when the transport reports an error.
    pub async fn close(&self) -> Result<bool, UpstreamError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.session.close().await?;
        Ok(true)
    }
}

impl Drop for UpstreamHandle {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Upstream handle dropped while open; closing in background.");
                let session = self.session.clone();
                runtime.spawn(async move {
                    if let Err(e) = session.close().await {
                        warn!(error = %e, "Failed to close dropped upstream session");
                    }
                });
            }
            Err(_) => warn!("Upstream handle dropped outside a runtime; transport not closed."),
        }
    }
}

impl std::fmt::Debug for UpstreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}
