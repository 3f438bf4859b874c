//! Wire types for the Gemini Live `BidiGenerateContent` protocol.

use base64::Engine;
use bytes::Bytes;
use relay_core::{
    FunctionCall, FunctionDeclaration, FunctionResponse, LiveSessionConfig, Part,
    ResponseModality, ServerContent, ToolCallBatch, UpstreamError, UpstreamInput,
    UpstreamResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

// --- Client -> server ---

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
    ToolResponse(ToolResponse),
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_resumption: Option<SessionResumptionConfig>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<ResponseModality>,
    pub speech_config: SpeechConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

/// Enables a transcription stream. Serialized as an empty object.
#[derive(Serialize, Debug, Default)]
pub struct AudioTranscriptionConfig {}

#[derive(Serialize, Debug, Default)]
pub struct SessionResumptionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<TextPart>,
}

#[derive(Serialize, Debug)]
pub struct TextPart {
    pub text: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

impl Setup {
    /// Builds the setup message for a model from a structured session config.
    pub fn from_config(model: &str, config: &LiveSessionConfig) -> Self {
        let system_instruction = config
            .system_instruction
            .as_ref()
            .filter(|text| !text.trim().is_empty())
            .map(|text| Content {
                role: None,
                parts: vec![TextPart { text: text.clone() }],
            });
        let tools = (!config.tools.is_empty()).then(|| {
            vec![Tool {
                function_declarations: config.tools.clone(),
            }]
        });

        Self {
            model: model.to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec![config.modality],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                },
            },
            system_instruction,
            tools,
            input_audio_transcription: config
                .input_transcription
                .then(AudioTranscriptionConfig::default),
            output_audio_transcription: config
                .output_transcription
                .then(AudioTranscriptionConfig::default),
            // Always enabled so the server hands out a handle for later resumption.
            session_resumption: Some(SessionResumptionConfig {
                handle: config.resumption_handle.clone(),
            }),
        }
    }
}

impl ClientMessage {
    /// Maps relay input onto the wire message that carries it.
    ///
    /// Realtime media is segmented into turns by server-side activity
    /// detection, so `end_of_turn` only affects text turns.
    pub fn from_input(input: UpstreamInput, end_of_turn: bool) -> Self {
        match input {
            UpstreamInput::Media { mime_type, data } => Self::RealtimeInput(RealtimeInput {
                media_chunks: vec![Blob { mime_type, data }],
            }),
            UpstreamInput::Text(text) => Self::ClientContent(ClientContent {
                turns: vec![Content {
                    role: Some("user".to_string()),
                    parts: vec![TextPart { text }],
                }],
                turn_complete: end_of_turn,
            }),
            UpstreamInput::ToolResponse(function_responses) => {
                Self::ToolResponse(ToolResponse { function_responses })
            }
        }
    }
}

// --- Server -> client ---

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<Value>,
    pub server_content: Option<LiveServerContent>,
    pub tool_call: Option<LiveToolCall>,
    pub tool_call_cancellation: Option<LiveToolCallCancellation>,
    pub session_resumption_update: Option<LiveSessionResumptionUpdate>,
    pub go_away: Option<LiveGoAway>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LiveServerContent {
    pub model_turn: Option<ServerContentTurn>,
    pub turn_complete: Option<bool>,
    pub interrupted: Option<bool>,
    pub input_transcription: Option<ServerTranscription>,
    pub output_transcription: Option<ServerTranscription>,
}

#[derive(Deserialize, Debug)]
pub struct ServerContentTurn {
    #[serde(default)]
    pub parts: Vec<ServerPart>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ServerPart {
    pub text: Option<String>,
    pub inline_data: Option<ServerBlob>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ServerBlob {
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Deserialize, Debug)]
pub struct ServerTranscription {
    pub text: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LiveToolCall {
    #[serde(default)]
    pub function_calls: Vec<LiveFunctionCall>,
}

#[derive(Deserialize, Debug)]
pub struct LiveFunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub args: Option<Value>,
}

#[derive(Deserialize, Debug)]
pub struct LiveToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LiveSessionResumptionUpdate {
    pub new_handle: Option<String>,
    pub resumable: Option<bool>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LiveGoAway {
    pub time_left: Option<String>,
}

impl ServerMessage {
    /// Converts one server frame into relay responses, in the order the
    /// protocol defines them.
    pub fn into_responses(self) -> Result<Vec<UpstreamResponse>, UpstreamError> {
        let mut responses = Vec::new();

        if let Some(tool_call) = self.tool_call {
            let function_calls = tool_call
                .function_calls
                .into_iter()
                .map(|call| FunctionCall {
                    id: call.id,
                    name: call.name,
                    args: call.args.unwrap_or_else(|| Value::Object(Default::default())),
                })
                .collect();
            responses.push(UpstreamResponse::ToolCall(ToolCallBatch { function_calls }));
        }
        if let Some(cancellation) = self.tool_call_cancellation {
            responses.push(UpstreamResponse::ToolCallCancellation {
                ids: cancellation.ids,
            });
        }
        if let Some(content) = self.server_content {
            responses.push(UpstreamResponse::ServerContent(content.into_content()?));
        }
        if let Some(update) = self.session_resumption_update {
            responses.push(UpstreamResponse::SessionResumptionUpdate {
                new_handle: update.new_handle,
                resumable: update.resumable.unwrap_or(false),
            });
        }
        if let Some(go_away) = self.go_away {
            responses.push(UpstreamResponse::GoAway {
                time_left: go_away.time_left,
            });
        }
        Ok(responses)
    }
}

impl LiveServerContent {
    fn into_content(self) -> Result<ServerContent, UpstreamError> {
        let model_turn = match self.model_turn {
            Some(turn) => {
                let mut parts = Vec::with_capacity(turn.parts.len());
                for part in turn.parts {
                    if let Some(blob) = part.inline_data {
                        let data = base64::engine::general_purpose::STANDARD
                            .decode(blob.data.as_bytes())
                            .map_err(|e| {
                                UpstreamError::Protocol(format!("invalid inline data: {e}"))
                            })?;
                        parts.push(Part::InlineData {
                            mime_type: blob.mime_type.unwrap_or_default(),
                            data: Bytes::from(data),
                        });
                    } else if let Some(text) = part.text {
                        parts.push(Part::Text(text));
                    } else {
                        warn!("Skipping model turn part with no text or inline data.");
                    }
                }
                Some(parts)
            }
            None => None,
        };

        Ok(ServerContent {
            model_turn,
            interrupted: self.interrupted.unwrap_or(false),
            turn_complete: self.turn_complete.unwrap_or(false),
            input_transcription: self.input_transcription.and_then(|t| t.text),
            output_transcription: self.output_transcription.and_then(|t| t.text),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn setup_carries_voice_tools_and_transcription() {
        let config = LiveSessionConfig {
            modality: ResponseModality::Text,
            voice: "Aoede".to_string(),
            input_transcription: true,
            output_transcription: false,
            tools: vec![FunctionDeclaration {
                name: "print_blackboard".to_string(),
                description: "Shows notes".to_string(),
                parameters: json!({"type": "object"}),
            }],
            system_instruction: Some("You are a tutor.".to_string()),
            resumption_handle: None,
        };

        let value = serde_json::to_value(ClientMessage::Setup(Setup::from_config(
            "models/gemini-2.0-flash-exp",
            &config,
        )))
        .unwrap();

        let setup = &value["setup"];
        assert_eq!(setup["model"], "models/gemini-2.0-flash-exp");
        assert_eq!(setup["generationConfig"]["responseModalities"], json!(["TEXT"]));
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Aoede"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "You are a tutor.");
        assert_eq!(
            setup["tools"][0]["functionDeclarations"][0]["name"],
            "print_blackboard"
        );
        assert_eq!(setup["inputAudioTranscription"], json!({}));
        assert!(setup.get("outputAudioTranscription").is_none());
        assert_eq!(setup["sessionResumption"], json!({}));
    }

    #[test]
    fn setup_passes_resumption_handle_and_skips_blank_instruction() {
        let config = LiveSessionConfig {
            system_instruction: Some("   ".to_string()),
            resumption_handle: Some("resume-me".to_string()),
            ..Default::default()
        };

        let value = serde_json::to_value(Setup::from_config("m", &config)).unwrap();

        assert!(value.get("systemInstruction").is_none());
        assert!(value.get("tools").is_none());
        assert_eq!(value["sessionResumption"]["handle"], "resume-me");
    }

    #[test]
    fn text_input_becomes_a_user_turn() {
        let value = serde_json::to_value(ClientMessage::from_input(
            UpstreamInput::Text("Hi".to_string()),
            true,
        ))
        .unwrap();

        assert_eq!(
            value,
            json!({"clientContent": {
                "turns": [{"role": "user", "parts": [{"text": "Hi"}]}],
                "turnComplete": true
            }})
        );
    }

    #[test]
    fn media_input_becomes_realtime_input() {
        let value = serde_json::to_value(ClientMessage::from_input(
            UpstreamInput::Media {
                mime_type: "image/jpeg".to_string(),
                data: "AAEC".to_string(),
            },
            false,
        ))
        .unwrap();

        assert_eq!(
            value,
            json!({"realtimeInput": {"mediaChunks": [{"mimeType": "image/jpeg", "data": "AAEC"}]}})
        );
    }

    #[test]
    fn tool_response_keeps_call_order() {
        let value = serde_json::to_value(ClientMessage::from_input(
            UpstreamInput::ToolResponse(vec![
                FunctionResponse {
                    id: "1".to_string(),
                    name: "a".to_string(),
                    response: json!({"ok": true}),
                },
                FunctionResponse {
                    id: "2".to_string(),
                    name: "b".to_string(),
                    response: json!({"error": "boom"}),
                },
            ]),
            false,
        ))
        .unwrap();

        let responses = &value["toolResponse"]["functionResponses"];
        assert_eq!(responses[0]["id"], "1");
        assert_eq!(responses[1]["id"], "2");
        assert_eq!(responses[1]["response"]["error"], "boom");
    }

    #[test]
    fn server_content_decodes_audio_and_text() {
        let message: ServerMessage = serde_json::from_value(json!({
            "serverContent": {
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AQID"}},
                    {"text": "Hello"}
                ]},
                "turnComplete": true,
                "outputTranscription": {"text": "Hello"}
            }
        }))
        .unwrap();

        let responses = message.into_responses().unwrap();

        assert_eq!(
            responses,
            vec![UpstreamResponse::ServerContent(ServerContent {
                model_turn: Some(vec![
                    Part::InlineData {
                        mime_type: "audio/pcm;rate=24000".to_string(),
                        data: Bytes::from_static(&[1, 2, 3]),
                    },
                    Part::Text("Hello".to_string()),
                ]),
                interrupted: false,
                turn_complete: true,
                input_transcription: None,
                output_transcription: Some("Hello".to_string()),
            })]
        );
    }

    #[test]
    fn tool_call_defaults_missing_args_to_empty_object() {
        let message: ServerMessage = serde_json::from_value(json!({
            "toolCall": {"functionCalls": [
                {"id": "1", "name": "lookup"},
                {"id": "2", "name": "print_blackboard", "args": {"content": "x"}}
            ]}
        }))
        .unwrap();

        let responses = message.into_responses().unwrap();

        let UpstreamResponse::ToolCall(batch) = &responses[0] else {
            panic!("expected a tool call, got {responses:?}");
        };
        assert_eq!(batch.function_calls.len(), 2);
        assert_eq!(batch.function_calls[0].args, json!({}));
        assert_eq!(batch.function_calls[1].id, "2");
        assert_eq!(batch.function_calls[1].args["content"], "x");
    }

    #[test]
    fn invalid_inline_data_is_a_protocol_error() {
        let message: ServerMessage = serde_json::from_value(json!({
            "serverContent": {"modelTurn": {"parts": [{"inlineData": {"data": "%%%"}}]}}
        }))
        .unwrap();

        assert!(matches!(
            message.into_responses(),
            Err(UpstreamError::Protocol(_))
        ));
    }

    #[test]
    fn resumption_update_and_go_away_are_surfaced() {
        let message: ServerMessage = serde_json::from_value(json!({
            "sessionResumptionUpdate": {"newHandle": "h-2", "resumable": true},
            "goAway": {"timeLeft": "10s"}
        }))
        .unwrap();

        let responses = message.into_responses().unwrap();

        assert_eq!(
            responses,
            vec![
                UpstreamResponse::SessionResumptionUpdate {
                    new_handle: Some("h-2".to_string()),
                    resumable: true,
                },
                UpstreamResponse::GoAway {
                    time_left: Some("10s".to_string()),
                },
            ]
        );
    }

    #[test]
    fn setup_complete_produces_no_responses() {
        let message: ServerMessage =
            serde_json::from_value(json!({"setupComplete": {}})).unwrap();
        assert!(message.setup_complete.is_some());
        assert!(message.into_responses().unwrap().is_empty());
    }
}
