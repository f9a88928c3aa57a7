//! Base traits and types for the upstream conversational session.
//!
//! The upstream is an externally hosted service that accepts caller audio and
//! text and produces synthesized speech plus transcripts. This module defines
//! the adapter contract both the relay and the caller endpoint program against.
//!
//! # Audio Format
//!
//! Input and output audio is PCM 16-bit signed little-endian at 24kHz.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::audio::AudioFrame;
use crate::core::envelope::Envelope;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while talking to the upstream session.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Connection to the upstream failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,
}

/// Result type for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

// =============================================================================
// Configuration Types
// =============================================================================

/// Connection parameters for an upstream session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// WebSocket endpoint of the upstream (or of a relay in front of it)
    pub url: String,

    /// Bearer token; omitted when talking to a relay
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model appended as `?model=` when the URL carries no query
    #[serde(default)]
    pub model: Option<String>,
}

/// Configuration for input audio transcription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputTranscriptionConfig {
    /// Model to use for transcription (e.g., "whisper-1")
    pub model: String,
}

/// Configuration for turn detection (VAD).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TurnDetectionConfig {
    /// Upstream voice-activity detection decides when the caller's turn ends
    #[serde(rename = "server_vad")]
    ServerVad {
        /// Activation threshold (0.0 to 1.0)
        #[serde(default)]
        threshold: Option<f32>,
        /// Amount of audio to include before voice detection (ms)
        #[serde(default)]
        prefix_padding_ms: Option<u32>,
        /// Silence duration before end of turn (ms)
        #[serde(default)]
        silence_duration_ms: Option<u32>,
    },
    /// No automatic turn detection; turns are ended explicitly
    #[serde(rename = "disabled")]
    Disabled,
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        TurnDetectionConfig::ServerVad {
            threshold: Some(0.5),
            prefix_padding_ms: Some(300),
            silence_duration_ms: Some(500),
        }
    }
}

impl TurnDetectionConfig {
    pub fn is_server_vad(&self) -> bool {
        matches!(self, TurnDetectionConfig::ServerVad { .. })
    }

    /// Parse the short form used by the CLI and environment ("server_vad" | "disabled").
    pub fn from_mode(mode: &str) -> Option<Self> {
        match mode.trim().to_lowercase().as_str() {
            "server_vad" | "vad" => Some(Self::default()),
            "disabled" | "none" | "manual" => Some(Self::Disabled),
            _ => None,
        }
    }
}

/// Session-wide parameters applied once at or near session start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionControl {
    /// Voice identity for synthesized speech
    #[serde(default)]
    pub voice: Option<String>,

    /// System instructions for the assistant
    #[serde(default)]
    pub instructions: Option<String>,

    /// Transcription of caller audio
    #[serde(default)]
    pub input_audio_transcription: Option<InputTranscriptionConfig>,

    /// Turn detection mode
    #[serde(default)]
    pub turn_detection: TurnDetectionConfig,
}

impl SessionControl {
    /// The parameters persona calls run with.
    pub fn persona_defaults() -> Self {
        Self {
            voice: Some("coral".to_string()),
            instructions: None,
            input_audio_transcription: Some(InputTranscriptionConfig {
                model: "whisper-1".to_string(),
            }),
            turn_detection: TurnDetectionConfig::ServerVad {
                threshold: Some(0.65),
                prefix_padding_ms: Some(350),
                silence_duration_ms: None,
            },
        }
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Connection state of an upstream adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected to the upstream
    #[default]
    Disconnected,
    /// Currently connecting
    Connecting,
    /// Connected and ready
    Connected,
    /// Connection failed
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// Event Stream
// =============================================================================

/// One item of the upstream's inbound event sequence.
///
/// `Closed` and `Failed` are terminal: nothing follows them.
#[derive(Debug)]
pub enum UpstreamEvent {
    /// A server event, exactly as the upstream sent it
    Message(Envelope),
    /// The upstream closed the session
    Closed { reason: String },
    /// The transport failed
    Failed(RealtimeError),
}

impl UpstreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UpstreamEvent::Message(_))
    }
}

/// Receiver half of the upstream event sequence.
pub type UpstreamEvents = mpsc::Receiver<UpstreamEvent>;

// =============================================================================
// Adapter Trait
// =============================================================================

/// One logical connection to the upstream conversational-audio service.
///
/// Sends never wait on a network round trip: they enqueue onto the adapter's
/// transport and return.
#[async_trait]
pub trait UpstreamSession: Send {
    /// Establish the session; resolves once the upstream reports readiness.
    async fn connect(&mut self) -> RealtimeResult<()>;

    /// Apply session-wide parameters. Before `connect` the control is held and
    /// sent as soon as the session is ready.
    async fn send_control(&mut self, control: &SessionControl) -> RealtimeResult<()>;

    /// Forward one caller audio frame.
    async fn append_input_audio(&mut self, frame: &AudioFrame) -> RealtimeResult<()>;

    /// Forward an arbitrary envelope unchanged.
    async fn send_event(&mut self, envelope: Envelope) -> RealtimeResult<()>;

    /// Ask the upstream to stop the response and truncate `track_id` at
    /// `offset` samples. Best effort: the upstream may already have produced
    /// more audio than `offset`.
    async fn cancel_response(&mut self, track_id: &str, offset: u64) -> RealtimeResult<()>;

    /// Take the inbound event sequence. Returns `None` after the first call.
    fn events(&mut self) -> Option<UpstreamEvents>;

    /// Tear down the session. Safe to call repeatedly and from any state.
    async fn disconnect(&mut self) -> RealtimeResult<()>;

    /// Check if the session is connected and ready.
    fn is_ready(&self) -> bool;

    /// Get the current connection state.
    fn connection_state(&self) -> ConnectionState;
}

/// Boxed trait object for upstream sessions.
pub type BoxedUpstream = Box<dyn UpstreamSession>;
