//! Wire envelopes.
//!
//! Every message exchanged with the caller or the upstream service is a JSON
//! object with a string `type` discriminator. The relay never rewrites an
//! envelope: the original text is kept and forwarded as received.

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;

/// Errors produced when a message cannot be treated as an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("envelope has no string `type` field")]
    MissingType,
}

/// A typed protocol message carried verbatim between the two legs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    kind: String,
    raw: String,
}

impl Envelope {
    /// Validate `text` as an envelope without altering it.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        let object = value.as_object().ok_or(EnvelopeError::NotAnObject)?;
        let kind = object
            .get("type")
            .and_then(Value::as_str)
            .filter(|kind| !kind.is_empty())
            .ok_or(EnvelopeError::MissingType)?;
        Ok(Self {
            kind: kind.to_string(),
            raw: text.to_string(),
        })
    }

    /// Serialize a typed event into an envelope.
    pub fn from_event<T: Serialize>(event: &T) -> Result<Self, EnvelopeError> {
        let text = serde_json::to_string(event)?;
        Self::parse(&text)
    }

    /// The terminal error envelope the relay sends before closing a caller.
    pub fn relay_error(code: &str, message: &str) -> Self {
        let raw = json!({
            "type": "error",
            "error": {
                "type": "relay_error",
                "code": code,
                "message": message,
            }
        })
        .to_string();
        Self {
            kind: "error".to_string(),
            raw,
        }
    }

    /// The `type` discriminator.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn into_string(self) -> String {
        self.raw
    }

    /// Decode the envelope into a typed event.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        Ok(serde_json::from_str(&self.raw)?)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
