use serde::Deserialize;
use std::path::PathBuf;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present here
/// override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 8081
///   tls:
///     enabled: false
///
/// relay:
///   path: "/"
///   connect_timeout_ms: 10000
///
/// upstream:
///   url: "wss://api.openai.com/v1/realtime"
///   model: "gpt-4o-realtime-preview-2024-10-01"
///   api_key: "sk-..."
///
/// session:
///   voice: "coral"
///   instructions: "You are a hotel front desk clerk."
///   transcription_model: "whisper-1"
///   turn_detection: "server_vad"
///   threshold: 0.65
///   prefix_padding_ms: 350
///
/// security:
///   max_websocket_connections: 1000
///   max_connections_per_ip: 100
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub relay: Option<RelayYaml>,
    pub upstream: Option<UpstreamYaml>,
    pub session: Option<SessionYaml>,
    pub security: Option<SecurityYaml>,
}

/// Server configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<TlsYaml>,
}

/// TLS configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsYaml {
    pub enabled: Option<bool>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

/// Relay behaviour from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RelayYaml {
    pub path: Option<String>,
    pub connect_timeout_ms: Option<u64>,
}

/// Upstream endpoint from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct UpstreamYaml {
    pub url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
}

/// Session defaults from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub transcription_model: Option<String>,
    /// "server_vad" or "disabled"
    pub turn_detection: Option<String>,
    pub threshold: Option<f32>,
    pub prefix_padding_ms: Option<u32>,
    pub silence_duration_ms: Option<u32>,
}

impl SessionYaml {
    pub fn is_empty(&self) -> bool {
        self.voice.is_none()
            && self.instructions.is_none()
            && self.transcription_model.is_none()
            && self.turn_detection.is_none()
            && self.threshold.is_none()
            && self.prefix_padding_ms.is_none()
            && self.silence_duration_ms.is_none()
    }
}

/// Security settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SecurityYaml {
    pub max_websocket_connections: Option<usize>,
    pub max_connections_per_ip: Option<u32>,
}

impl YamlConfig {
    /// Load YAML configuration from a file
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_yaml_config_full() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 8080
  tls:
    enabled: true
    cert_path: "/tmp/cert.pem"
    key_path: "/tmp/key.pem"

relay:
  path: "/relay"
  connect_timeout_ms: 3000

upstream:
  url: "wss://example.com/v1/realtime"
  model: "gpt-4o-realtime-preview"
  api_key: "sk-yaml"

session:
  voice: "coral"
  turn_detection: "disabled"

security:
  max_websocket_connections: 10
  max_connections_per_ip: 2
"#;

        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();

        let server = config.server.unwrap();
        assert_eq!(server.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(server.tls.unwrap().enabled, Some(true));

        let relay = config.relay.unwrap();
        assert_eq!(relay.path.as_deref(), Some("/relay"));
        assert_eq!(relay.connect_timeout_ms, Some(3000));

        assert_eq!(config.upstream.unwrap().api_key.as_deref(), Some("sk-yaml"));

        let session = config.session.unwrap();
        assert_eq!(session.turn_detection.as_deref(), Some("disabled"));
        assert!(!session.is_empty());

        let security = config.security.unwrap();
        assert_eq!(security.max_websocket_connections, Some(10));
        assert_eq!(security.max_connections_per_ip, Some(2));
    }

    #[test]
    fn test_yaml_config_empty() {
        let config: YamlConfig = serde_yaml::from_str("{}").unwrap();
        assert!(config.server.is_none());
        assert!(config.session.is_none());
    }

    #[test]
    fn test_yaml_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        fs::write(&path, "relay:\n  connect_timeout_ms: 1234\n").unwrap();

        let config = YamlConfig::from_file(&path).unwrap();
        assert_eq!(config.relay.unwrap().connect_timeout_ms, Some(1234));
    }
}
