//! Configuration module for the relay server
//!
//! This module handles server configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Merging YAML and environment configurations
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use persona_relay::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from a YAML file, falling back to environment variables
//! let config_path = PathBuf::from("config.yaml");
//! let config = ServerConfig::from_file(&config_path)?;
//!
//! println!("Relay listening on {}{}", config.address(), config.relay_path);
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::core::realtime::{RealtimeConfig, SessionControl};

mod env;
mod merge;
mod validation;
mod yaml;

/// Default listen port for the relay.
pub const DEFAULT_PORT: u16 = 8081;

/// Default path callers connect to.
pub const DEFAULT_RELAY_PATH: &str = "/";

/// Default bound on upstream readiness.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default per-IP WebSocket limit.
pub const DEFAULT_MAX_CONNECTIONS_PER_IP: u32 = 100;

/// TLS configuration for HTTPS and WSS
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM format)
    pub cert_path: PathBuf,
    /// Path to the TLS private key file (PEM format)
    pub key_path: PathBuf,
}

/// Server configuration
///
/// Contains:
/// - Listen address and optional TLS
/// - Relay path and upstream connect timeout
/// - Upstream endpoint, model and credentials
/// - Session defaults applied to every bridged session
/// - Connection limits
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // TLS configuration (optional)
    pub tls: Option<TlsConfig>,

    // Relay settings
    /// Only path accepted for caller connections
    pub relay_path: String,
    /// Upper bound on upstream readiness, in milliseconds
    pub connect_timeout_ms: u64,

    // Upstream settings
    pub upstream_url: String,
    pub realtime_model: Option<String>,
    /// OpenAI API key used for the upstream leg
    pub openai_api_key: Option<String>,

    /// Session control sent to the upstream before any caller message
    pub session_defaults: Option<SessionControl>,

    // Security settings
    pub max_websocket_connections: Option<usize>,
    pub max_connections_per_ip: u32,
}

/// Zeroize the upstream API key when ServerConfig is dropped.
impl Drop for ServerConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.openai_api_key {
            key.zeroize();
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables (and defaults) only.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = merge::merge_config(None)?;
        validation::validate_config(&config)?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values (loaded in main.rs at startup)
    /// 4. Default values
    ///
    /// After loading and merging, performs validation on the final configuration.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        validation::validate_config(&config)?;
        Ok(config)
    }

    /// Get the server address as a string
    ///
    /// Returns the address in the format "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if TLS is enabled
    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Connection parameters for one upstream session.
    pub fn upstream_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            url: self.upstream_url.clone(),
            api_key: self.openai_api_key.clone(),
            model: self.realtime_model.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::realtime::TurnDetectionConfig;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    // Helper to clean up environment variables
    fn cleanup_env_vars() {
        unsafe {
            env::remove_var("HOST");
            env::remove_var("PORT");
            env::remove_var("TLS_ENABLED");
            env::remove_var("TLS_CERT_PATH");
            env::remove_var("TLS_KEY_PATH");
            env::remove_var("RELAY_PATH");
            env::remove_var("UPSTREAM_CONNECT_TIMEOUT_MS");
            env::remove_var("UPSTREAM_URL");
            env::remove_var("REALTIME_MODEL");
            env::remove_var("OPENAI_API_KEY");
            env::remove_var("SESSION_VOICE");
            env::remove_var("SESSION_INSTRUCTIONS");
            env::remove_var("SESSION_TRANSCRIPTION_MODEL");
            env::remove_var("SESSION_TURN_DETECTION");
            env::remove_var("MAX_WEBSOCKET_CONNECTIONS");
            env::remove_var("MAX_CONNECTIONS_PER_IP");
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        cleanup_env_vars();

        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.relay_path, "/");
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.upstream_url, "wss://api.openai.com/v1/realtime");
        assert_eq!(
            config.realtime_model.as_deref(),
            Some("gpt-4o-realtime-preview-2024-10-01")
        );
        assert!(config.session_defaults.is_none());
        assert!(!config.is_tls_enabled());
        assert_eq!(config.max_websocket_connections, None);
        assert_eq!(config.max_connections_per_ip, DEFAULT_MAX_CONNECTIONS_PER_IP);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_values() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PORT", "9100");
            env::set_var("RELAY_PATH", "/relay");
            env::set_var("UPSTREAM_CONNECT_TIMEOUT_MS", "2500");
            env::set_var("OPENAI_API_KEY", "sk-env");
            env::set_var("SESSION_VOICE", "coral");
            env::set_var("SESSION_TURN_DETECTION", "disabled");
            env::set_var("MAX_WEBSOCKET_CONNECTIONS", "50");
        }

        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.relay_path, "/relay");
        assert_eq!(config.connect_timeout_ms, 2500);
        assert_eq!(config.max_websocket_connections, Some(50));

        let upstream = config.upstream_config();
        assert_eq!(upstream.api_key.as_deref(), Some("sk-env"));

        let defaults = config.session_defaults.clone().unwrap();
        assert_eq!(defaults.voice.as_deref(), Some("coral"));
        assert_eq!(defaults.turn_detection, TurnDetectionConfig::Disabled);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_tls_with_session_defaults() {
        cleanup_env_vars();
        unsafe {
            env::set_var("TLS_ENABLED", "true");
            env::set_var("TLS_CERT_PATH", "/etc/relay/cert.pem");
            env::set_var("TLS_KEY_PATH", "/etc/relay/key.pem");
            env::set_var("SESSION_VOICE", "sage");
        }

        let config = ServerConfig::from_env().unwrap();
        let tls = config.tls.as_ref().unwrap();
        assert_eq!(tls.cert_path, PathBuf::from("/etc/relay/cert.pem"));
        assert_eq!(tls.key_path, PathBuf::from("/etc/relay/key.pem"));
        assert_eq!(
            config.session_defaults.as_ref().unwrap().voice.as_deref(),
            Some("sage")
        );

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_port() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PORT", "not-a-port");
        }

        let result = ServerConfig::from_env();
        assert!(result.unwrap_err().to_string().contains("PORT"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_only() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let yaml_content = r#"
server:
  host: "127.0.0.1"
  port: 8080

relay:
  path: "/"
  connect_timeout_ms: 5000

upstream:
  url: "wss://upstream.example.com/v1/realtime"
  model: "gpt-4o-realtime-preview"
  api_key: "yaml-key"

session:
  voice: "coral"
  transcription_model: "whisper-1"
  turn_detection: "server_vad"
  threshold: 0.65
  prefix_padding_ms: 350
"#;

        fs::write(&config_path, yaml_content).unwrap();

        let config = ServerConfig::from_file(&config_path).unwrap();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.connect_timeout_ms, 5000);
        assert_eq!(config.upstream_url, "wss://upstream.example.com/v1/realtime");
        assert_eq!(config.openai_api_key.as_deref(), Some("yaml-key"));
        assert_eq!(
            config.session_defaults,
            Some(SessionControl::persona_defaults())
        );

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_overrides_env() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let yaml_content = r#"
server:
  host: "127.0.0.1"

upstream:
  api_key: "yaml-key"
"#;

        fs::write(&config_path, yaml_content).unwrap();

        unsafe {
            env::set_var("HOST", "0.0.0.0");
            env::set_var("PORT", "9200");
            env::set_var("OPENAI_API_KEY", "env-key");
        }

        let config = ServerConfig::from_file(&config_path).unwrap();

        // YAML overrides ENV
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.openai_api_key, Some("yaml-key".to_string()));
        // ENV value kept where YAML is silent
        assert_eq!(config.port, 9200);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_missing_file() {
        cleanup_env_vars();

        let config_path = PathBuf::from("/nonexistent/config.yaml");
        let result = ServerConfig::from_file(&config_path);

        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }

    #[test]
    #[serial]
    fn test_from_file_invalid_yaml() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("invalid.yaml");
        fs::write(&config_path, "invalid: yaml: [content").unwrap();

        let result = ServerConfig::from_file(&config_path);
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse YAML")
        );
    }

    #[test]
    #[serial]
    fn test_from_file_rejects_invalid_relay_path() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "relay:\n  path: \"relay\"\n").unwrap();

        let result = ServerConfig::from_file(&config_path);
        assert!(result.unwrap_err().to_string().contains("relay path"));
    }

    #[test]
    #[serial]
    fn test_tls_from_yaml() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(
            &config_path,
            r#"
server:
  tls:
    enabled: true
    cert_path: "/etc/relay/cert.pem"
    key_path: "/etc/relay/key.pem"
"#,
        )
        .unwrap();

        let config = ServerConfig::from_file(&config_path).unwrap();
        let tls = config.tls.clone().unwrap();
        assert_eq!(tls.cert_path, PathBuf::from("/etc/relay/cert.pem"));
        assert!(config.is_tls_enabled());

        fs::write(&config_path, "server:\n  tls:\n    enabled: true\n").unwrap();
        assert!(ServerConfig::from_file(&config_path).is_err());
    }
}
