//! Defines the WebSocket message protocol between the browser client and the relay.

use crate::error::{ErrorPayload, RelayError};
use relay_core::{ResponseModality, SessionOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// The raw `{type, data}` envelope every client message arrives in.
#[derive(Deserialize, Debug)]
struct ClientEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
}

/// A client message that could not be interpreted.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed client message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Invalid `{kind}` message: {reason}")]
    InvalidData { kind: String, reason: String },
}

/// Messages sent from the client (browser) to the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Negotiates the session. Only honored as the first message.
    Setup(SessionOptions),
    /// Base64 PCM audio; completes the user's turn.
    Audio(String),
    /// Base64 JPEG frame; does not complete a turn on its own.
    Image(String),
    Text(String),
    /// The client finished speaking. Informational only.
    End,
    Unknown(String),
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: ClientEnvelope = serde_json::from_str(text)?;
        let kind = envelope.kind;
        let message = match kind.as_str() {
            "setup" => Self::Setup(setup_options(envelope.data)?),
            "audio" => Self::Audio(string_data(&kind, envelope.data)?),
            "image" => Self::Image(string_data(&kind, envelope.data)?),
            "text" => Self::Text(string_data(&kind, envelope.data)?),
            "end" => Self::End,
            _ => Self::Unknown(kind),
        };
        Ok(message)
    }

    /// The envelope type, for logging.
    pub fn kind(&self) -> &str {
        match self {
            Self::Setup(_) => "setup",
            Self::Audio(_) => "audio",
            Self::Image(_) => "image",
            Self::Text(_) => "text",
            Self::End => "end",
            Self::Unknown(kind) => kind,
        }
    }
}

fn string_data(kind: &str, data: Option<Value>) -> Result<String, ProtocolError> {
    match data {
        Some(Value::String(data)) => Ok(data),
        _ => Err(ProtocolError::InvalidData {
            kind: kind.to_string(),
            reason: "`data` must be a string".to_string(),
        }),
    }
}

/// Reads the negotiated options out of a setup payload, which must be an
/// object. An absent or unrecognized modality falls back to AUDIO.
/// Transcription is only enabled by a literal `true`.
fn setup_options(data: Option<Value>) -> Result<SessionOptions, ProtocolError> {
    let data = match data {
        Some(Value::Object(data)) => data,
        _ => {
            return Err(ProtocolError::InvalidData {
                kind: "setup".to_string(),
                reason: "`data` must be an object".to_string(),
            });
        }
    };

    let modality = match data.get("modality") {
        None => ResponseModality::default(),
        Some(value) => value
            .as_str()
            .and_then(ResponseModality::parse)
            .unwrap_or_else(|| {
                warn!(modality = %value, "Invalid modality requested. Defaulting to AUDIO.");
                ResponseModality::Audio
            }),
    };
    let flag = |key: &str| matches!(data.get(key), Some(Value::Bool(true)));

    Ok(SessionOptions {
        modality,
        input_transcription: flag("input_audio_transcription"),
        output_transcription: flag("output_audio_transcription"),
        resumption_handle: data
            .get("session_handle")
            .and_then(Value::as_str)
            .filter(|handle| !handle.is_empty())
            .map(str::to_string),
    })
}

/// Parses the first client message, which must be a valid `setup`.
pub fn parse_setup(text: &str) -> Result<SessionOptions, RelayError> {
    match ClientMessage::parse(text) {
        Ok(ClientMessage::Setup(options)) => Ok(options),
        Ok(other) => Err(RelayError::Setup(format!(
            "expected a `setup` message, got `{}`",
            other.kind()
        ))),
        Err(e) => Err(RelayError::Setup(e.to_string())),
    }
}

/// Messages sent from the relay to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The relay is ready for the setup message.
    Ready,
    Error(ErrorPayload),
    /// The model requested a tool; sent before it runs.
    FunctionCall { name: String, args: Value },
    /// The result of the preceding `function_call`.
    FunctionResponse(Value),
    /// Base64 PCM16 model audio.
    Audio(String),
    Text(String),
    InputTranscription(String),
    OutputTranscription(String),
    Interrupted { message: String },
    TurnComplete,
    /// A handle the client may send back in a later setup to resume.
    SessionHandle(String),
}
