//! OpenAI Realtime API module.
//!
//! Provides the WebSocket adapter for OpenAI's Realtime API, plus the typed
//! client and server events that the turn-taking and conversation components
//! decode from envelopes.
//!
//! # Supported Voices
//!
//! alloy, ash, ballad, coral, echo, sage, shimmer, verse
//!
//! # Audio Format
//!
//! Input and output audio is PCM 16-bit signed little-endian at 24kHz.
//!
//! # Example
//!
//! ```rust,ignore
//! use persona_relay::core::realtime::{OpenAIRealtime, RealtimeConfig, UpstreamSession};
//!
//! let mut upstream = OpenAIRealtime::new(RealtimeConfig {
//!     url: "ws://localhost:8081/".to_string(),
//!     ..Default::default()
//! })?;
//! let mut events = upstream.events().unwrap();
//! upstream.connect().await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

mod client;
mod config;
mod messages;

pub use client::OpenAIRealtime;
pub use config::{
    DEFAULT_REALTIME_MODEL, OPENAI_REALTIME_SAMPLE_RATE, OPENAI_REALTIME_URL,
    OpenAIRealtimeVoice, build_ws_url,
};
pub use messages::{
    ApiError, ClientEvent, ContentPart, ConversationItem, Response, ServerEvent, Session,
    SessionConfig, TurnDetection,
};
