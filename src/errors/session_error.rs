//! Session-level error taxonomy.
//!
//! Adapter, envelope and device errors are mapped into `SessionError` at the
//! session boundary. Fatal errors end the session and are reported to the
//! caller once, as a `relay_error` envelope.

use thiserror::Error;

use crate::core::audio::AudioDeviceError;
use crate::core::envelope::{Envelope, EnvelopeError};
use crate::core::realtime::RealtimeError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// A caller or upstream message was not a valid envelope. Recovered locally.
    #[error("malformed envelope: {0}")]
    ProtocolParse(String),

    /// The upstream was unreachable, rejected the session or did not become
    /// ready in time.
    #[error("upstream connection failed: {0}")]
    UpstreamConnect(String),

    /// The upstream reported an error or the transport failed mid-session.
    #[error("upstream error: {0}")]
    UpstreamRuntime(String),

    /// The upstream closed the session.
    #[error("upstream closed the session: {0}")]
    UpstreamClosed(String),

    #[error(transparent)]
    AudioDevice(#[from] AudioDeviceError),
}

pub type SessionResult<T> = Result<T, SessionError>;

impl SessionError {
    /// Code carried in the terminal `relay_error` envelope.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::ProtocolParse(_) => "protocol_parse_error",
            SessionError::UpstreamConnect(_) => "upstream_connect_failed",
            SessionError::UpstreamRuntime(_) => "upstream_error",
            SessionError::UpstreamClosed(_) => "upstream_closed",
            SessionError::AudioDevice(_) => "audio_device_error",
        }
    }

    /// Whether the error ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SessionError::ProtocolParse(_) | SessionError::UpstreamRuntime(_)
        )
    }

    /// Map an adapter error raised while establishing the session.
    pub fn connect(err: RealtimeError) -> Self {
        SessionError::UpstreamConnect(err.to_string())
    }

    /// The terminal error envelope sent to the caller before close.
    pub fn to_envelope(&self) -> Envelope {
        Envelope::relay_error(self.code(), &self.to_string())
    }
}

impl From<EnvelopeError> for SessionError {
    fn from(err: EnvelopeError) -> Self {
        SessionError::ProtocolParse(err.to_string())
    }
}

impl From<RealtimeError> for SessionError {
    fn from(err: RealtimeError) -> Self {
        SessionError::UpstreamRuntime(err.to_string())
    }
}
