//! Opens Gemini Live sessions for negotiated client options.

use crate::{session::GeminiLiveSession, types::Setup};
use async_trait::async_trait;
use relay_core::{LiveSessionConfig, SessionOptions, UpstreamError, UpstreamFactory, UpstreamHandle};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::{info, instrument};

/// The public developer endpoint for the Live API.
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

/// Builds Gemini session configuration and opens sessions.
///
/// Credentials are injected at construction; a factory without an API key
/// fails every `open` with a configuration error.
pub struct GeminiSessionFactory {
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    base_config: LiveSessionConfig,
}

impl GeminiSessionFactory {
    /// Creates a factory.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - The `BidiGenerateContent` WebSocket URL.
    /// * `api_key` - The API key appended to the endpoint, if one is available.
    /// * `model` - The model name, e.g. `models/gemini-2.0-flash-exp`.
    /// * `base_config` - Voice, tools and system instruction shared by all sessions.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<SecretString>,
        model: impl Into<String>,
        base_config: LiveSessionConfig,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
            base_config,
        }
    }

    /// The configuration a session opened with `options` would use.
    pub fn session_config(&self, options: &SessionOptions) -> LiveSessionConfig {
        self.base_config.clone().with_options(options)
    }

    fn authenticated_url(&self) -> Result<String, UpstreamError> {
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            UpstreamError::Configuration(
                "No API key available for the live session".to_string(),
            )
        })?;
        if self.model.trim().is_empty() {
            return Err(UpstreamError::Configuration(
                "No model configured for the live session".to_string(),
            ));
        }
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        Ok(format!(
            "{}{}key={}",
            self.endpoint,
            separator,
            api_key.expose_secret()
        ))
    }
}

#[async_trait]
impl UpstreamFactory for GeminiSessionFactory {
    #[instrument(name = "gemini_open", skip_all, fields(model = %self.model))]
    async fn open(&self, options: &SessionOptions) -> Result<UpstreamHandle, UpstreamError> {
        let url = self.authenticated_url()?;
        let config = self.session_config(options);
        info!(
            modality = %config.modality,
            voice = %config.voice,
            input_transcription = config.input_transcription,
            output_transcription = config.output_transcription,
            tools = config.tools.len(),
            resuming = config.resumption_handle.is_some(),
            "Creating Gemini live session."
        );

        let session = GeminiLiveSession::connect(&url, Setup::from_config(&self.model, &config)).await?;
        Ok(UpstreamHandle::new(Arc::new(session)))
    }
}
