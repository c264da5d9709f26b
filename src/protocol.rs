//! JSON envelope spoken with the remote live agent.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::audio::codec::{EncodedFrame, decode_base64};
use crate::config::Config;

/// Rate of inbound agent audio when the mime type does not state one.
pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Logical inbound events, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    AudioChunk {
        data: Bytes,
        sample_rate: u32,
        channels: u16,
    },
    InputTranscriptDelta(String),
    OutputTranscriptDelta(String),
    TurnComplete,
    Interrupted,
    Closed,
    Errored(String),
}

// ======================== Outbound ========================

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    // 空对象即开启转写
    pub input_audio_transcription: Empty,
    pub output_audio_transcription: Empty,
}

#[derive(Serialize, Debug, Default)]
pub struct Empty {}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
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
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Serialize, Debug)]
pub struct TextPart {
    pub text: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage<'a> {
    realtime_input: RealtimeInput<'a>,
}

#[derive(Serialize, Debug)]
struct RealtimeInput<'a> {
    audio: Blob<'a>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Blob<'a> {
    mime_type: &'a str,
    data: &'a str,
}

/// Parameters of the session announced in the setup message.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
}

impl From<&Config> for SessionSetup {
    fn from(config: &Config) -> Self {
        Self {
            model: config.model.to_string(),
            voice: config.voice.to_string(),
            system_instruction: config.system_instruction(),
        }
    }
}

impl SessionSetup {
    pub fn to_message(&self) -> SetupMessage {
        let model = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };
        SetupMessage {
            setup: Setup {
                model,
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO".to_string()],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: self.voice.clone(),
                            },
                        },
                    },
                },
                system_instruction: if self.system_instruction.is_empty() {
                    None
                } else {
                    Some(Content {
                        parts: vec![TextPart {
                            text: self.system_instruction.clone(),
                        }],
                    })
                },
                input_audio_transcription: Empty {},
                output_audio_transcription: Empty {},
            },
        }
    }
}

pub fn realtime_input_json(frame: &EncodedFrame) -> serde_json::Result<String> {
    serde_json::to_string(&RealtimeInputMessage {
        realtime_input: RealtimeInput {
            audio: Blob {
                mime_type: &frame.mime_type,
                data: &frame.data,
            },
        },
    })
}

// ======================== Inbound ========================

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
}

#[derive(Deserialize, Debug, Default)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    data: String,
}

#[derive(Deserialize, Debug)]
struct Transcription {
    text: Option<String>,
}

/// What one server frame means to the transport.
#[derive(Debug, PartialEq)]
pub enum ServerFrame {
    /// Handshake finished; the channel is open.
    SetupComplete,
    /// Zero or more events for the session.
    Events(Vec<WireMessage>),
}

/// Parse one server JSON frame into logical events.
pub fn parse_server_frame(text: &str) -> serde_json::Result<ServerFrame> {
    let msg: ServerMessage = serde_json::from_str(text)?;

    if msg.setup_complete.is_some() {
        return Ok(ServerFrame::SetupComplete);
    }
    if let Some(go_away) = &msg.go_away {
        log::warn!("Server announced disconnect: {}", go_away);
    }

    let Some(content) = msg.server_content else {
        return Ok(ServerFrame::Events(Vec::new()));
    };

    // 打断时忽略同一帧内的其余内容
    if content.interrupted {
        return Ok(ServerFrame::Events(vec![WireMessage::Interrupted]));
    }

    let mut events = Vec::new();
    if let Some(text) = content.input_transcription.and_then(|t| t.text) {
        if !text.is_empty() {
            events.push(WireMessage::InputTranscriptDelta(text));
        }
    }
    if let Some(text) = content.output_transcription.and_then(|t| t.text) {
        if !text.is_empty() {
            events.push(WireMessage::OutputTranscriptDelta(text));
        }
    }
    if content.turn_complete {
        events.push(WireMessage::TurnComplete);
    }
    for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
        let Some(inline) = part.inline_data else {
            continue;
        };
        if !inline.mime_type.is_empty() && !inline.mime_type.starts_with("audio/") {
            log::debug!("Ignoring non-audio inline data: {}", inline.mime_type);
            continue;
        }
        match decode_base64(&inline.data) {
            Ok(bytes) => events.push(WireMessage::AudioChunk {
                data: Bytes::from(bytes),
                sample_rate: mime_sample_rate(&inline.mime_type)
                    .unwrap_or(DEFAULT_OUTPUT_SAMPLE_RATE),
                channels: 1,
            }),
            Err(e) => log::warn!("Dropping inbound audio chunk: {}", e),
        }
    }
    Ok(ServerFrame::Events(events))
}

/// `audio/pcm;rate=24000` → `Some(24000)`.
fn mime_sample_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
}
