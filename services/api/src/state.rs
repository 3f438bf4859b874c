//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the configuration,
//! the session registry and the collaborators every connection is built from.

use crate::{config::Config, registry::SessionRegistry};
use relay_core::{AudioSink, ToolExecutor, UpstreamFactory};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub upstream_factory: Arc<dyn UpstreamFactory>,
    pub tool_executor: Arc<dyn ToolExecutor>,
    pub audio_sink: Arc<dyn AudioSink>,
}
