//! Upstream conversational session.
//!
//! This module defines the adapter contract for the externally hosted
//! realtime service and its OpenAI Realtime implementation.
//!
//! # Architecture
//!
//! - `UpstreamSession` trait for the adapter abstraction
//! - `create_upstream_session` factory used by the relay and the call client
//! - Inbound server events delivered on an mpsc channel taken via `events()`
//!
//! # Audio Format
//!
//! PCM 16-bit signed little-endian at 24kHz, base64 encoded on the wire.

mod base;
pub mod openai;

pub use base::{
    BoxedUpstream, ConnectionState, InputTranscriptionConfig, RealtimeConfig, RealtimeError,
    RealtimeResult, SessionControl, TurnDetectionConfig, UpstreamEvent, UpstreamEvents,
    UpstreamSession,
};
pub use openai::{
    ClientEvent, OPENAI_REALTIME_SAMPLE_RATE, OPENAI_REALTIME_URL, OpenAIRealtime,
    OpenAIRealtimeVoice, ServerEvent,
};

/// Factory function to create an upstream session for `config`.
///
/// Every upstream the relay and the call client talk to speaks the OpenAI
/// Realtime protocol, so this always builds an `OpenAIRealtime`.
pub fn create_upstream_session(config: RealtimeConfig) -> RealtimeResult<BoxedUpstream> {
    Ok(Box::new(OpenAIRealtime::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_upstream_session() {
        let config = RealtimeConfig {
            url: "ws://127.0.0.1:8081/".to_string(),
            ..Default::default()
        };
        let session = create_upstream_session(config).unwrap();
        assert!(!session.is_ready());
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_create_upstream_session_invalid_url() {
        let config = RealtimeConfig {
            url: "ftp://example.com".to_string(),
            ..Default::default()
        };
        match create_upstream_session(config) {
            Err(RealtimeError::InvalidConfiguration(msg)) => assert!(msg.contains("ftp")),
            _ => panic!("Expected InvalidConfiguration error"),
        }
    }
}
