//! OpenAI Realtime API WebSocket message types.
//!
//! The relay forwards envelopes without decoding them; these types are used
//! where a component has to act on an event (session control, cancellation,
//! playback, transcript assembly).
//!
//! # Protocol Overview
//!
//! Client events (sent to server):
//! - session.update - Update session configuration
//! - input_audio_buffer.append - Append audio to buffer
//! - input_audio_buffer.commit - Commit audio buffer
//! - conversation.item.create - Add item to conversation
//! - conversation.item.truncate - Truncate played assistant audio
//! - response.create - Generate a response
//! - response.cancel - Cancel current response
//!
//! Server events (received from server):
//! - session.created / session.updated
//! - input_audio_buffer.speech_started / speech_stopped / committed
//! - conversation.item.created / truncated
//! - conversation.item.input_audio_transcription.completed
//! - response.created / response.done
//! - response.output_item.added / response.output_item.done
//! - response.audio.delta / response.audio.done
//! - response.audio_transcript.delta / response.text.delta
//! - error

use base64::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::realtime::base::{SessionControl, TurnDetectionConfig};

// =============================================================================
// Session Configuration
// =============================================================================

/// Session configuration for OpenAI Realtime API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Response modalities (text, audio)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    /// System instructions for the assistant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Voice for audio output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Input audio format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,

    /// Output audio format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,

    /// Input audio transcription configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputAudioTranscription>,

    /// Turn detection; `Some(None)` is sent as `null` and disables it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<Option<TurnDetection>>,
}

impl From<&SessionControl> for SessionConfig {
    fn from(control: &SessionControl) -> Self {
        let turn_detection = match &control.turn_detection {
            TurnDetectionConfig::ServerVad {
                threshold,
                prefix_padding_ms,
                silence_duration_ms,
            } => Some(TurnDetection::ServerVad {
                threshold: *threshold,
                prefix_padding_ms: *prefix_padding_ms,
                silence_duration_ms: *silence_duration_ms,
            }),
            TurnDetectionConfig::Disabled => None,
        };

        SessionConfig {
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            instructions: control.instructions.clone(),
            voice: control.voice.clone(),
            input_audio_format: Some("pcm16".to_string()),
            output_audio_format: Some("pcm16".to_string()),
            input_audio_transcription: control.input_audio_transcription.as_ref().map(|t| {
                InputAudioTranscription {
                    model: t.model.clone(),
                }
            }),
            turn_detection: Some(turn_detection),
        }
    }
}

/// Input audio transcription configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputAudioTranscription {
    /// Transcription model (e.g., "whisper-1")
    pub model: String,
}

/// Turn detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TurnDetection {
    /// Server-side VAD
    #[serde(rename = "server_vad")]
    ServerVad {
        /// Activation threshold
        #[serde(skip_serializing_if = "Option::is_none")]
        threshold: Option<f32>,
        /// Audio prefix padding in ms
        #[serde(skip_serializing_if = "Option::is_none")]
        prefix_padding_ms: Option<u32>,
        /// Silence duration in ms
        #[serde(skip_serializing_if = "Option::is_none")]
        silence_duration_ms: Option<u32>,
    },
}

// =============================================================================
// Conversation Items
// =============================================================================

/// Conversation item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationItem {
    /// Item ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Item type
    #[serde(rename = "type")]
    pub item_type: String,
    /// Item status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Item role (user, assistant, system)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Content parts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentPart>>,
}

impl ConversationItem {
    /// A user message carrying a single text part.
    pub fn user_text(text: &str) -> Self {
        Self {
            item_type: "message".to_string(),
            role: Some("user".to_string()),
            content: Some(vec![ContentPart {
                content_type: "input_text".to_string(),
                text: Some(text.to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }
}

/// Content part within a conversation item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentPart {
    /// Content type (input_text, input_audio, text, audio)
    #[serde(rename = "type")]
    pub content_type: String,
    /// Text content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Audio content (base64 encoded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    /// Transcript of audio content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

// =============================================================================
// Client Events (sent to server)
// =============================================================================

/// Client events sent to the OpenAI Realtime API.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Update session configuration
    #[serde(rename = "session.update")]
    SessionUpdate {
        /// Session configuration
        session: SessionConfig,
    },

    /// Append audio to input buffer
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// Base64-encoded audio data
        audio: String,
    },

    /// Commit the input audio buffer
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    /// Create a conversation item
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate {
        /// Item to create
        item: ConversationItem,
    },

    /// Truncate a conversation item
    #[serde(rename = "conversation.item.truncate")]
    ConversationItemTruncate {
        /// Item ID
        item_id: String,
        /// Content index
        content_index: u32,
        /// Audio end in ms
        audio_end_ms: u64,
    },

    /// Create a response
    #[serde(rename = "response.create")]
    ResponseCreate,

    /// Cancel the current response
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    /// Create an audio append event from raw bytes.
    pub fn audio_append(data: &[u8]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: BASE64_STANDARD.encode(data),
        }
    }
}

// =============================================================================
// Server Events (received from server)
// =============================================================================

/// Server events received from the OpenAI Realtime API.
///
/// Event types the caller endpoint does not act on decode as `Other`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Error occurred
    #[serde(rename = "error")]
    Error {
        error: ApiError,
    },

    /// Session created
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: Session,
    },

    /// Session updated
    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: Session,
    },

    /// Speech started (VAD detected speech)
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        /// Audio start timestamp in ms
        #[serde(default)]
        audio_start_ms: u64,
        #[serde(default)]
        item_id: Option<String>,
    },

    /// Speech stopped (VAD detected silence)
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        /// Audio end timestamp in ms
        #[serde(default)]
        audio_end_ms: u64,
        #[serde(default)]
        item_id: Option<String>,
    },

    /// Conversation item created
    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated {
        #[serde(default)]
        previous_item_id: Option<String>,
        item: ConversationItem,
    },

    /// Input audio transcription completed
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        item_id: String,
        #[serde(default)]
        content_index: u32,
        transcript: String,
    },

    /// Conversation item truncated
    #[serde(rename = "conversation.item.truncated")]
    ConversationItemTruncated {
        item_id: String,
        #[serde(default)]
        content_index: u32,
        #[serde(default)]
        audio_end_ms: u64,
    },

    /// Response done
    #[serde(rename = "response.done")]
    ResponseDone {
        response: Response,
    },

    /// Output item added to response
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        item: ConversationItem,
    },

    /// Output item done
    #[serde(rename = "response.output_item.done")]
    OutputItemDone {
        item: ConversationItem,
    },

    /// Text delta
    #[serde(rename = "response.text.delta")]
    TextDelta {
        item_id: String,
        #[serde(default)]
        content_index: u32,
        delta: String,
    },

    /// Audio transcript delta
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        item_id: String,
        #[serde(default)]
        content_index: u32,
        delta: String,
    },

    /// Audio delta (audio data chunk)
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: Option<String>,
        item_id: String,
        #[serde(default)]
        content_index: u32,
        /// Base64-encoded audio delta
        delta: String,
    },

    /// Audio done
    #[serde(rename = "response.audio.done")]
    AudioDone {
        item_id: String,
    },

    /// Any event type not listed above
    #[serde(other)]
    Other,
}

// =============================================================================
// Supporting Types
// =============================================================================

/// API error information.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiError {
    /// Error type
    #[serde(rename = "type", default)]
    pub error_type: String,
    /// Error code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Error message
    #[serde(default)]
    pub message: String,
    /// Event ID that caused the error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// Session information.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Session {
    /// Session ID
    #[serde(default)]
    pub id: String,
    /// Model used
    #[serde(default)]
    pub model: Option<String>,
    /// Voice
    #[serde(default)]
    pub voice: Option<String>,
}

/// Response information.
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    /// Response ID
    #[serde(default)]
    pub id: String,
    /// Response status (completed, cancelled, failed, incomplete)
    #[serde(default)]
    pub status: String,
    /// Status details
    #[serde(default)]
    pub status_details: Option<serde_json::Value>,
}

// =============================================================================
// Tests
// =============================================================================
