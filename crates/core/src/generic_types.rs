//! Structured configuration for opening a live session with any provider.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The voice used when none is configured.
pub const DEFAULT_VOICE: &str = "Puck";

/// The response medium negotiated with the client at setup.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    #[default]
    Audio,
    Text,
}

impl ResponseModality {
    /// Parses the modality requested by a client. Anything other than `AUDIO`
    /// or `TEXT` yields `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "AUDIO" => Some(Self::Audio),
            "TEXT" => Some(Self::Text),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "AUDIO",
            Self::Text => "TEXT",
        }
    }
}

impl fmt::Display for ResponseModality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-connection options negotiated from the client's setup message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub modality: ResponseModality,
    pub input_transcription: bool,
    pub output_transcription: bool,
    /// Handle returned by a previous upstream session, used to resume its context.
    pub resumption_handle: Option<String>,
}

/// A function the upstream model may call.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Every recognized field of a live session, with explicit defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSessionConfig {
    pub modality: ResponseModality,
    pub voice: String,
    pub input_transcription: bool,
    pub output_transcription: bool,
    pub tools: Vec<FunctionDeclaration>,
    pub system_instruction: Option<String>,
    pub resumption_handle: Option<String>,
}

impl Default for LiveSessionConfig {
    fn default() -> Self {
        Self {
            modality: ResponseModality::Audio,
            voice: DEFAULT_VOICE.to_string(),
            input_transcription: false,
            output_transcription: false,
            tools: Vec::new(),
            system_instruction: None,
            resumption_handle: None,
        }
    }
}

impl LiveSessionConfig {
    /// Applies the options a client negotiated on top of this base configuration.
    pub fn with_options(mut self, options: &SessionOptions) -> Self {
        self.modality = options.modality;
        self.input_transcription = options.input_transcription;
        self.output_transcription = options.output_transcription;
        self.resumption_handle = options.resumption_handle.clone();
        self
    }
}
