//! Provider-neutral building blocks for the live session relay.
//!
//! This crate defines the contracts the relay service is written against: the
//! upstream streaming session, the tool executor and the persisted-audio sink,
//! together with the structured configuration used to open a live session.

pub mod audio;
pub mod generic_types;
pub mod tool;
pub mod upstream;

pub use audio::{AudioSink, AudioSinkError, AudioTurnBuffer};
pub use generic_types::{FunctionDeclaration, LiveSessionConfig, ResponseModality, SessionOptions};
pub use tool::{ToolError, ToolExecutor};
pub use upstream::{
    FunctionCall, FunctionResponse, Part, ServerContent, ToolCallBatch, UpstreamError,
    UpstreamFactory, UpstreamHandle, UpstreamInput, UpstreamResponse, UpstreamSession,
};
