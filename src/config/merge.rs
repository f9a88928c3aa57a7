use std::path::PathBuf;

use super::env::EnvConfig;
use super::yaml::{SessionYaml, YamlConfig};
use super::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_MAX_CONNECTIONS_PER_IP, DEFAULT_PORT, DEFAULT_RELAY_PATH,
    ServerConfig, TlsConfig,
};
use crate::core::realtime::openai::{DEFAULT_REALTIME_MODEL, OPENAI_REALTIME_URL};
use crate::core::realtime::{InputTranscriptionConfig, SessionControl, TurnDetectionConfig};

/// Merge YAML configuration over environment variables
///
/// Environment variables form the base, YAML values win wherever they are
/// present, and defaults fill whatever neither source sets.
pub fn merge_config(yaml: Option<YamlConfig>) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let env = EnvConfig::load()?;
    let yaml = yaml.unwrap_or_default();

    let server = yaml.server.unwrap_or_default();
    let relay = yaml.relay.unwrap_or_default();
    let upstream = yaml.upstream.unwrap_or_default();
    let security = yaml.security.unwrap_or_default();
    let tls_yaml = server.tls.unwrap_or_default();

    // Session defaults borrow `env`; resolve them before its fields move out
    let session_defaults = match yaml.session.filter(|session| !session.is_empty()) {
        Some(session) => Some(session_from_yaml(session, &env)?),
        None => session_from_env(&env)?,
    };

    let tls = resolve_tls(
        tls_yaml.enabled.or(env.tls_enabled).unwrap_or(false),
        tls_yaml.cert_path.or(env.tls_cert_path),
        tls_yaml.key_path.or(env.tls_key_path),
    )?;

    Ok(ServerConfig {
        host: server
            .host
            .or(env.host)
            .unwrap_or_else(|| "0.0.0.0".to_string()),
        port: server.port.or(env.port).unwrap_or(DEFAULT_PORT),
        tls,
        relay_path: relay
            .path
            .or(env.relay_path)
            .unwrap_or_else(|| DEFAULT_RELAY_PATH.to_string()),
        connect_timeout_ms: relay
            .connect_timeout_ms
            .or(env.connect_timeout_ms)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
        upstream_url: upstream
            .url
            .or(env.upstream_url)
            .unwrap_or_else(|| OPENAI_REALTIME_URL.to_string()),
        realtime_model: Some(
            upstream
                .model
                .or(env.realtime_model)
                .unwrap_or_else(|| DEFAULT_REALTIME_MODEL.to_string()),
        ),
        openai_api_key: upstream.api_key.or(env.openai_api_key),
        session_defaults,
        max_websocket_connections: security
            .max_websocket_connections
            .or(env.max_websocket_connections),
        max_connections_per_ip: security
            .max_connections_per_ip
            .or(env.max_connections_per_ip)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS_PER_IP),
    })
}

fn resolve_tls(
    enabled: bool,
    cert_path: Option<String>,
    key_path: Option<String>,
) -> Result<Option<TlsConfig>, String> {
    if !enabled {
        return Ok(None);
    }
    match (cert_path, key_path) {
        (Some(cert), Some(key)) => Ok(Some(TlsConfig {
            cert_path: PathBuf::from(cert),
            key_path: PathBuf::from(key),
        })),
        _ => Err("TLS is enabled but cert_path and key_path are not both set".to_string()),
    }
}

/// YAML session section; unset fields fall back to the environment.
fn session_from_yaml(session: SessionYaml, env: &EnvConfig) -> Result<SessionControl, String> {
    let mode = session
        .turn_detection
        .or_else(|| env.session_turn_detection.clone());
    let mut turn_detection = parse_turn_detection(mode.as_deref())?;

    let tuned = session.threshold.is_some()
        || session.prefix_padding_ms.is_some()
        || session.silence_duration_ms.is_some();
    if tuned && turn_detection.is_server_vad() {
        turn_detection = TurnDetectionConfig::ServerVad {
            threshold: session.threshold,
            prefix_padding_ms: session.prefix_padding_ms,
            silence_duration_ms: session.silence_duration_ms,
        };
    }

    Ok(SessionControl {
        voice: session.voice.or_else(|| env.session_voice.clone()),
        instructions: session
            .instructions
            .or_else(|| env.session_instructions.clone()),
        input_audio_transcription: session
            .transcription_model
            .or_else(|| env.session_transcription_model.clone())
            .map(|model| InputTranscriptionConfig { model }),
        turn_detection,
    })
}

/// Session defaults from SESSION_* variables, if any is set.
fn session_from_env(env: &EnvConfig) -> Result<Option<SessionControl>, String> {
    if env.session_voice.is_none()
        && env.session_instructions.is_none()
        && env.session_transcription_model.is_none()
        && env.session_turn_detection.is_none()
    {
        return Ok(None);
    }

    Ok(Some(SessionControl {
        voice: env.session_voice.clone(),
        instructions: env.session_instructions.clone(),
        input_audio_transcription: env
            .session_transcription_model
            .clone()
            .map(|model| InputTranscriptionConfig { model }),
        turn_detection: parse_turn_detection(env.session_turn_detection.as_deref())?,
    }))
}

fn parse_turn_detection(mode: Option<&str>) -> Result<TurnDetectionConfig, String> {
    match mode {
        None => Ok(TurnDetectionConfig::default()),
        Some(mode) => TurnDetectionConfig::from_mode(mode).ok_or_else(|| {
            format!("Invalid turn detection mode '{mode}': expected server_vad or disabled")
        }),
    }
}
