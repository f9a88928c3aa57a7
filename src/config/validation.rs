use super::ServerConfig;

/// Validate a merged configuration
///
/// Checks:
/// - The relay path is absolute and not the health path
/// - The connect timeout is non-zero
/// - The upstream URL is a ws:// or wss:// URL
/// - Connection limits are non-zero
pub fn validate_config(config: &ServerConfig) -> Result<(), String> {
    if !config.relay_path.starts_with('/') {
        return Err(format!(
            "Invalid relay path '{}': must start with '/'",
            config.relay_path
        ));
    }

    if config.relay_path == "/health" {
        return Err("Invalid relay path '/health': reserved for the health check".to_string());
    }

    if config.connect_timeout_ms == 0 {
        return Err("Invalid connect timeout: must be greater than zero".to_string());
    }

    validate_upstream_url(&config.upstream_url)?;

    if config.max_connections_per_ip == 0 {
        return Err("max_connections_per_ip must be greater than zero".to_string());
    }
    if config.max_websocket_connections == Some(0) {
        return Err("max_websocket_connections must be greater than zero".to_string());
    }

    if let Some(ref tls) = config.tls {
        if tls.cert_path.as_os_str().is_empty() || tls.key_path.as_os_str().is_empty() {
            return Err("TLS cert_path and key_path must not be empty".to_string());
        }
    }

    Ok(())
}

fn validate_upstream_url(raw: &str) -> Result<(), String> {
    let parsed =
        url::Url::parse(raw).map_err(|e| format!("Invalid upstream URL '{raw}': {e}"))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(format!(
            "Invalid upstream URL '{raw}': scheme must be ws or wss, got {other}"
        )),
    }
}
