//! Live API protocol types
//!
//! JSON messages exchanged over the bidirectional Live session.
//!
//! # Protocol Overview
//!
//! 1. Connect to the `BidiGenerateContent` WebSocket endpoint
//! 2. Send `setup` (model, audio modality, voice, system instruction,
//!    transcription on both directions)
//! 3. Receive `setupComplete`
//! 4. Stream microphone audio via `realtimeInput`
//! 5. Receive `serverContent`: inline audio, transcription fragments,
//!    `turnComplete` and `interrupted` signals

use serde::{Deserialize, Serialize};

use crate::audio::EncodedFrame;

/// Default Live API WebSocket endpoint
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default native-audio model
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";

/// Default prebuilt voice
pub const DEFAULT_VOICE: &str = "Zephyr";

/// Inline payload (audio bytes as base64 plus MIME type)
pub type Blob = EncodedFrame;

/// A piece of turn content
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

/// One conversational turn (or a system instruction)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    /// Content made of a single text part
    pub fn text(role: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![Part {
                text: Some(text.into()),
                inline_data: None,
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    /// Response modalities - always `["AUDIO"]` for a phone call
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

/// Enables transcription in one direction; carries no options
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AudioTranscriptionConfig {}

/// Session setup, the first message sent on a new connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupConfig {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    pub input_audio_transcription: AudioTranscriptionConfig,
    pub output_audio_transcription: AudioTranscriptionConfig,
}

impl SetupConfig {
    /// Audio-out session with transcription on both directions
    pub fn audio_session(model: &str, voice_name: &str, system_instruction: String) -> Self {
        Self {
            model: model.to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice_name.to_string(),
                        },
                    },
                },
            },
            system_instruction: Content::text(None, system_instruction),
            input_audio_transcription: AudioTranscriptionConfig::default(),
            output_audio_transcription: AudioTranscriptionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub audio: Blob,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

// ============================================================================
// Client Messages (sent TO the Live API)
// ============================================================================

/// Messages sent from client to the Live API
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupConfig),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
}

impl ClientMessage {
    /// One captured microphone frame
    pub fn realtime_audio(frame: EncodedFrame) -> Self {
        Self::RealtimeInput(RealtimeInput { audio: frame })
    }

    /// A complete user text turn
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::ClientContent(ClientContent {
            turns: vec![Content::text(Some("user"), text)],
            turn_complete: true,
        })
    }
}

// ============================================================================
// Server Messages (received FROM the Live API)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SetupComplete {}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,

    #[serde(default)]
    pub input_transcription: Option<Transcription>,

    #[serde(default)]
    pub output_transcription: Option<Transcription>,

    #[serde(default)]
    pub turn_complete: bool,

    #[serde(default)]
    pub interrupted: bool,

    #[serde(default)]
    pub generation_complete: bool,
}

impl ServerContent {
    /// Fragment of the user's transcribed speech, if any
    pub fn input_text(&self) -> Option<&str> {
        self.input_transcription.as_ref()?.text.as_deref()
    }

    /// Fragment of the agent's transcribed speech, if any
    pub fn output_text(&self) -> Option<&str> {
        self.output_transcription.as_ref()?.text.as_deref()
    }

    /// Inline audio payloads in part order
    pub fn inline_audio(&self) -> impl Iterator<Item = &Blob> {
        self.model_turn
            .iter()
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| part.inline_data.as_ref())
            .filter(|blob| blob.mime_type.starts_with("audio/"))
    }
}

/// Messages received from the Live API. Every field is optional and fields
/// this client does not handle (tool calls, usage metadata) are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<SetupComplete>,

    #[serde(default)]
    pub server_content: Option<ServerContent>,

    #[serde(default)]
    pub go_away: Option<GoAway>,
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }
}

/// Sample rate from a `audio/pcm;rate=NNNN` MIME type
pub fn pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("rate="))
        .and_then(|rate| rate.parse().ok())
}
