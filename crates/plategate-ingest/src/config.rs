//! Ingestion service configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Central ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// HTTP + WebSocket bind address
    pub bind_addr: String,

    /// Pub/sub broker host
    pub mqtt_host: String,

    /// Pub/sub broker port
    pub mqtt_port: u16,

    /// Topic namespace prefix
    pub mqtt_namespace: String,

    /// Storage directory for accepted envelopes; `None` discards them
    pub store_path: Option<PathBuf>,

    /// Acknowledgment record retention in seconds. Must exceed the maximum
    /// retry span of the gateways feeding this service.
    pub dedup_retention_secs: u64,

    /// Plates of interest, normalized on load
    pub watchlist: Vec<String>,

    /// Expected bearer token; `None` disables authentication
    pub api_key: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_namespace: "plategate".to_string(),
            store_path: None,
            dedup_retention_secs: 86_400,
            watchlist: Vec::new(),
            api_key: None,
        }
    }
}

impl IngestConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the HTTP/WS bind address
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    /// Set the storage directory
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    /// Set the pub/sub broker
    pub fn with_broker(mut self, host: impl Into<String>, port: u16) -> Self {
        self.mqtt_host = host.into();
        self.mqtt_port = port;
        self
    }

    /// Add plates to the watch-list
    pub fn with_watchlist(mut self, plates: impl IntoIterator<Item = String>) -> Self {
        self.watchlist.extend(plates);
        self
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_file(&self, path: &str) -> crate::error::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = IngestConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.dedup_retention_secs, 86_400);
        assert!(config.store_path.is_none());
    }

    #[test]
    fn test_builder_chain() {
        let config = IngestConfig::new()
            .with_bind_addr("127.0.0.1:9090")
            .with_broker("broker.local", 8883)
            .with_watchlist(["AB123CD".to_string()]);
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.mqtt_host, "broker.local");
        assert_eq!(config.watchlist, vec!["AB123CD".to_string()]);
    }

    #[test]
    fn test_config_round_trip() {
        let config = IngestConfig::default().with_bind_addr("10.0.0.1:8080");
        let json = serde_json::to_string(&config).unwrap();
        let loaded: IngestConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.bind_addr, "10.0.0.1:8080");
    }
}
