use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use serde::{Serialize, Deserialize};
use crate::cdcrelay::types::{TableName, UserId};
use crate::error::{RelayError, ErrorCode};

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_idle_timeout_secs() -> u64 {
    45
}

fn default_wake_interval_secs() -> u64 {
    60
}

fn default_item_cap() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub stream_addr: String,
    pub user: UserId,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Silence on an open stream longer than this counts as a disconnect
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_wake_interval_secs")]
    pub wake_interval_secs: u64,
    /// Items retained per table
    #[serde(default = "default_item_cap")]
    pub item_cap: usize,
    /// Table -> natural key field; tables not listed use `id`
    #[serde(default)]
    pub natural_keys: HashMap<TableName, String>,
    /// Tables the demo surface subscribes to
    #[serde(default)]
    pub tables: Vec<TableName>,
}

impl ClientConfig {
    pub fn new(stream_addr: impl Into<String>, user: impl Into<UserId>) -> Self {
        Self {
            stream_addr: stream_addr.into(),
            user: user.into(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            wake_interval_secs: default_wake_interval_secs(),
            item_cap: default_item_cap(),
            natural_keys: HashMap::new(),
            tables: Vec::new(),
        }
    }

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

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }

    pub fn wake_interval(&self) -> Duration {
        Duration::from_secs(self.wake_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config = ClientConfig::from_toml_str(
            r#"
stream_addr = "127.0.0.1:7701"
user = "user-1"

[natural_keys]
trades = "symbol"
"#,
        )
        .unwrap();
        assert_eq!(config.base_delay(), Duration::from_secs(1));
        assert_eq!(config.max_delay(), Duration::from_secs(30));
        assert_eq!(config.item_cap, 50);
        assert_eq!(config.natural_keys.get("trades").map(String::as_str), Some("symbol"));
        assert!(config.tables.is_empty());
    }

    #[test]
    fn missing_user_is_rejected() {
        let err = ClientConfig::from_toml_str(r#"stream_addr = "127.0.0.1:7701""#).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ConfigInvalid));
    }
}
