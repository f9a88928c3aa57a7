//! Environment variable loading.
//!
//! Every setting is optional here; defaults are applied during merging so a
//! YAML value can still take precedence over a default.

use std::env;
use std::str::FromStr;

/// Raw settings read from the process environment.
#[derive(Debug, Default)]
pub(super) struct EnvConfig {
    pub host: Option<String>,
    pub port: Option<u16>,

    pub tls_enabled: Option<bool>,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,

    pub relay_path: Option<String>,
    pub connect_timeout_ms: Option<u64>,

    pub upstream_url: Option<String>,
    pub realtime_model: Option<String>,
    pub openai_api_key: Option<String>,

    pub session_voice: Option<String>,
    pub session_instructions: Option<String>,
    pub session_transcription_model: Option<String>,
    pub session_turn_detection: Option<String>,

    pub max_websocket_connections: Option<usize>,
    pub max_connections_per_ip: Option<u32>,
}

impl EnvConfig {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            host: var("HOST"),
            port: parse_var("PORT")?,
            tls_enabled: parse_bool("TLS_ENABLED")?,
            tls_cert_path: var("TLS_CERT_PATH"),
            tls_key_path: var("TLS_KEY_PATH"),
            relay_path: var("RELAY_PATH"),
            connect_timeout_ms: parse_var("UPSTREAM_CONNECT_TIMEOUT_MS")?,
            upstream_url: var("UPSTREAM_URL"),
            realtime_model: var("REALTIME_MODEL"),
            openai_api_key: var("OPENAI_API_KEY"),
            session_voice: var("SESSION_VOICE"),
            session_instructions: var("SESSION_INSTRUCTIONS"),
            session_transcription_model: var("SESSION_TRANSCRIPTION_MODEL"),
            session_turn_detection: var("SESSION_TURN_DETECTION"),
            max_websocket_connections: parse_var("MAX_WEBSOCKET_CONNECTIONS")?,
            max_connections_per_ip: parse_var("MAX_CONNECTIONS_PER_IP")?,
        })
    }
}

/// Read a variable, treating an empty value as unset.
fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>, String>
where
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| format!("Invalid {name} value '{value}': {e}"))
        })
        .transpose()
}

fn parse_bool(name: &str) -> Result<Option<bool>, String> {
    var(name)
        .map(|value| match value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(format!("Invalid {name} value '{value}': expected true or false")),
        })
        .transpose()
}
