//! Failure taxonomy for relay sessions and how each class is surfaced.

use relay_core::{ToolError, UpstreamError};
use serde::Serialize;

/// Everything that can end or interrupt a relay session.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid setup message: {0}")]
    Setup(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error(transparent)]
    ToolExecution(#[from] ToolError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

/// The handling class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Setup,
    Configuration,
    QuotaExceeded,
    ConnectionClosed,
    Timeout,
    ToolExecution,
    Unexpected,
}

impl RelayError {
    /// Classifies the failure by its variant, falling back to its text for
    /// failures reported by collaborators.
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Setup(_) => ErrorClass::Setup,
            Self::Configuration(_) => ErrorClass::Configuration,
            Self::QuotaExceeded(_) => ErrorClass::QuotaExceeded,
            Self::ConnectionClosed(_) => ErrorClass::ConnectionClosed,
            Self::Timeout(_) => ErrorClass::Timeout,
            Self::ToolExecution(_) => ErrorClass::ToolExecution,
            Self::Upstream(UpstreamError::Configuration(_)) => ErrorClass::Configuration,
            Self::Upstream(UpstreamError::AlreadyClosed) => ErrorClass::ConnectionClosed,
            Self::Upstream(UpstreamError::Closed { code, reason }) => classify_close(*code, reason),
            Self::Upstream(_) | Self::Unexpected(_) => classify_text(&format!("{self:#}")),
        }
    }
}

/// Close codes that end a session without anything left to report.
const QUIET_CLOSE_CODES: [u16; 4] = [1000, 1001, 1005, 1006];

/// Any close code outside [`QUIET_CLOSE_CODES`] is a server-side failure the
/// client must hear about.
fn classify_close(code: u16, reason: &str) -> ErrorClass {
    if reason.to_lowercase().contains("quota exceeded") {
        ErrorClass::QuotaExceeded
    } else if QUIET_CLOSE_CODES.contains(&code) {
        ErrorClass::ConnectionClosed
    } else {
        ErrorClass::Unexpected
    }
}

/// Quota errors are checked first: the upstream reports them by closing the
/// connection with the quota message as the reason.
fn classify_text(text: &str) -> ErrorClass {
    let lower = text.to_lowercase();
    if lower.contains("quota exceeded") {
        ErrorClass::QuotaExceeded
    } else if lower.contains("connection closed")
        || lower.contains("code = 1006")
        || lower.contains("closed abnormally")
    {
        ErrorClass::ConnectionClosed
    } else {
        ErrorClass::Unexpected
    }
}

/// The `data` of an outbound `error` message.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub message: String,
    pub action: String,
    pub error_type: String,
}

impl ErrorPayload {
    fn new(message: &str, action: &str, error_type: &str) -> Self {
        Self {
            message: message.to_string(),
            action: action.to_string(),
            error_type: error_type.to_string(),
        }
    }

    pub fn setup() -> Self {
        Self::new(
            "Invalid setup message.",
            "Please ensure the client sends a valid setup message first.",
            "setup_error",
        )
    }

    pub fn configuration() -> Self {
        Self::new(
            "Failed to start the live session.",
            "Please try again later.",
            "configuration_error",
        )
    }

    pub fn quota_exceeded() -> Self {
        Self::new(
            "Quota exceeded.",
            "Please wait a moment and try again in a few minutes.",
            "quota_exceeded",
        )
    }

    pub fn timeout() -> Self {
        Self::new(
            "Session timed out due to inactivity.",
            "You can start a new conversation.",
            "timeout",
        )
    }

    pub fn general() -> Self {
        Self::new(
            "An unexpected error occurred.",
            "Please try again.",
            "general",
        )
    }
}

/// Chat-visible companion of the quota error.
pub const QUOTA_EXCEEDED_TEXT: &str =
    "⚠️ Quota exceeded. Please wait a moment and try again in a few minutes.";

impl ErrorClass {
    /// The error shown to the client, if any. A closed connection has nobody
    /// left to tell.
    pub fn client_notice(&self) -> Option<ErrorPayload> {
        match self {
            Self::ConnectionClosed => None,
            Self::Setup => Some(ErrorPayload::setup()),
            Self::Configuration => Some(ErrorPayload::configuration()),
            Self::QuotaExceeded => Some(ErrorPayload::quota_exceeded()),
            Self::Timeout => Some(ErrorPayload::timeout()),
            Self::ToolExecution | Self::Unexpected => Some(ErrorPayload::general()),
        }
    }
}
