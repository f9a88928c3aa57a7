//! OpenAI Realtime API endpoint and voice settings.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::realtime::base::{RealtimeError, RealtimeResult};

/// OpenAI Realtime API WebSocket endpoint.
pub const OPENAI_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Model requested when none is configured.
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview-2024-10-01";

/// Audio sample rate of the Realtime API's pcm16 format.
pub const OPENAI_REALTIME_SAMPLE_RATE: u32 = 24000;

// =============================================================================
// Voices
// =============================================================================

/// Available voices for OpenAI Realtime API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenAIRealtimeVoice {
    /// Alloy voice (default)
    #[default]
    Alloy,
    Ash,
    Ballad,
    Coral,
    Echo,
    Sage,
    Shimmer,
    Verse,
}

impl OpenAIRealtimeVoice {
    /// Convert to the API parameter value.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alloy => "alloy",
            Self::Ash => "ash",
            Self::Ballad => "ballad",
            Self::Coral => "coral",
            Self::Echo => "echo",
            Self::Sage => "sage",
            Self::Shimmer => "shimmer",
            Self::Verse => "verse",
        }
    }

    /// Parse a voice name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|voice| voice.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Get all available voices.
    pub fn all() -> &'static [OpenAIRealtimeVoice] {
        &[
            Self::Alloy,
            Self::Ash,
            Self::Ballad,
            Self::Coral,
            Self::Echo,
            Self::Sage,
            Self::Shimmer,
            Self::Verse,
        ]
    }
}

impl std::fmt::Display for OpenAIRealtimeVoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Endpoint
// =============================================================================

/// Build the WebSocket URL for a session.
///
/// `model` is appended as a query parameter unless the URL already carries a
/// query, which is how relay URLs and pre-built endpoints are passed through.
pub fn build_ws_url(base: &str, model: Option<&str>) -> RealtimeResult<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| RealtimeError::InvalidConfiguration(format!("invalid URL '{base}': {e}")))?;

    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(RealtimeError::InvalidConfiguration(format!(
                "unsupported URL scheme '{other}', expected ws or wss"
            )));
        }
    }

    if let Some(model) = model
        && url.query().is_none()
    {
        url.query_pairs_mut().append_pair("model", model);
    }

    Ok(url)
}
