use std::fs;
use std::path::{Path, PathBuf};
use serde::{Serialize, Deserialize};
use crate::cdcrelay::router::RouteConfig;
use crate::cdcrelay::types::TableName;
use crate::error::{RelayError, ErrorCode};

fn default_keepalive_secs() -> u64 {
    15
}

fn default_client_buffer() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    /// Listener for the router, webhook and lifecycle endpoints
    pub http_addr: String,
    /// Listener for client delivery streams
    pub stream_addr: String,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Outbound frames queued per stream session before frames are dropped
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    pub known_tables: Vec<TableName>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, RelayError> {
        let content = fs::read_to_string(path)
            .map_err(|e| RelayError::new(ErrorCode::ConfigInvalid, format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, RelayError> {
        toml::from_str(content)
            .map_err(|e| RelayError::new(ErrorCode::ConfigInvalid, format!("Failed to parse TOML: {}", e)))
    }

    /// Save configuration to a TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), RelayError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| RelayError::new(ErrorCode::ConfigInvalid, format!("Failed to serialize to TOML: {}", e)))?;

        fs::write(path, content)
            .map_err(|e| RelayError::new(ErrorCode::ConfigInvalid, format!("Failed to write config file: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdcrelay::router::RoutingStrategy;

    const SAMPLE: &str = r#"
        id = "relay-1"
        http_addr = "127.0.0.1:8080"
        stream_addr = "127.0.0.1:9090"
        known_tables = ["trades", "games"]

        [[routes]]
        table = "trades"
        strategy = "precomputed"
        field = "symbol"
        namespace = "finance:subscribers"

        [[routes]]
        table = "games"
        strategy = "broadcast"
        namespace = "stream:subscribers"
        key = "sports"
    "#;

    #[test]
    fn defaults_fill_optional_fields() {
        let config = ServerConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.keepalive_secs, 15);
        assert_eq!(config.client_buffer, 64);
        assert!(config.webhook_secret.is_none());
        assert_eq!(config.routes.len(), 2);
        assert_eq!(
            config.routes[1].strategy,
            RoutingStrategy::Broadcast { namespace: "stream:subscribers".into(), key: "sports".into() }
        );
    }

    #[test]
    fn config_round_trips_through_a_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let config = ServerConfig::from_toml_str(SAMPLE).unwrap();
        config.to_toml_file(&path).unwrap();

        let reloaded = ServerConfig::from_toml_file(&path).unwrap();
        assert_eq!(reloaded.routes, config.routes);
        assert_eq!(reloaded.known_tables, config.known_tables);
    }

    #[test]
    fn unreadable_config_is_config_invalid() {
        let err = ServerConfig::from_toml_str("id = 3").unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ConfigInvalid));
    }
}
