//! The tool-executor collaborator.

use async_trait::async_trait;
use serde_json::{Value, json};

/// A failure inside a single tool call.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error("Tool request failed: {0}")]
    Http(String),
    #[error("Tool execution failed: {0}")]
    Failed(String),
    #[error("Tool execution cancelled")]
    Cancelled,
}

impl ToolError {
    /// The result reported in place of a value when the call failed.
    pub fn to_result(&self) -> Value {
        json!({ "error": self.to_string() })
    }
}

/// Executes named side-effecting operations requested by the model.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, args: &Value) -> Result<Value, ToolError>;
}
