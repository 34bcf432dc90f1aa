//! Gateway configuration
//!
//! Every tunable the delivery pipeline consults lives here: score weights and
//! band thresholds, breaker counts and cool-downs, retry backoff shape, queue
//! depth limits. The documented defaults are starting points, not validated
//! constants; operators are expected to tune them per deployment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Device identifier supplied by provisioning
    pub device_id: String,

    /// Checkpoint the device is installed at
    pub checkpoint_id: String,

    /// Transport endpoints
    pub endpoints: EndpointSettings,

    /// Delivery queue settings
    pub queue: QueueSettings,

    /// Retry/backoff settings
    pub retry: RetrySettings,

    /// Circuit breaker settings
    pub breaker: BreakerSettings,

    /// Connectivity monitor settings
    pub monitor: MonitorSettings,

    /// Health reporter settings
    pub reporter: ReporterSettings,

    /// Per-attempt send timeout in seconds
    pub attempt_timeout_secs: u64,

    /// Graceful shutdown drain timeout in seconds
    pub drain_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            device_id: "device-unset".to_string(),
            checkpoint_id: "checkpoint-unset".to_string(),
            endpoints: EndpointSettings::default(),
            queue: QueueSettings::default(),
            retry: RetrySettings::default(),
            breaker: BreakerSettings::default(),
            monitor: MonitorSettings::default(),
            reporter: ReporterSettings::default(),
            attempt_timeout_secs: 15,
            drain_timeout_secs: 10,
        }
    }
}

impl GatewayConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the device identity
    pub fn with_device(
        mut self,
        device_id: impl Into<String>,
        checkpoint_id: impl Into<String>,
    ) -> Self {
        self.device_id = device_id.into();
        self.checkpoint_id = checkpoint_id.into();
        self
    }

    /// Set the queue storage path
    pub fn with_queue_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.queue.path = Some(path.into());
        self
    }

    /// Point all three transports at a single server host
    pub fn with_server(mut self, host: impl Into<String>) -> Self {
        let host = host.into();
        self.endpoints.ws_url = format!("ws://{}:8765/ws", host);
        self.endpoints.http_base_url = format!("http://{}:8080", host);
        self.endpoints.mqtt_host = host;
        self
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: &str) -> plategate_core::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_file(&self, path: &str) -> plategate_core::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Transport endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSettings {
    /// Real-time channel WebSocket URL
    pub ws_url: String,

    /// Request/response channel base URL
    pub http_base_url: String,

    /// Pub/sub broker host
    pub mqtt_host: String,

    /// Pub/sub broker port
    pub mqtt_port: u16,

    /// Topic namespace prefix
    pub mqtt_namespace: String,

    /// Optional API key sent on register/ingest calls
    pub api_key: Option<String>,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8765/ws".to_string(),
            http_base_url: "http://127.0.0.1:8080".to_string(),
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_namespace: "plategate".to_string(),
            api_key: None,
        }
    }
}

/// Delivery queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Storage path; `None` keeps the queue in memory (tests only)
    pub path: Option<PathBuf>,

    /// Maximum pending records per priority band before eviction
    pub max_depth_per_band: usize,

    /// Pending age after which a record is promoted one priority band
    pub age_promotion_secs: i64,

    /// How long Acked/DeadLettered records are retained before purge
    pub retention_secs: i64,

    /// Payloads above this size use resumable byte-offset transfer
    pub resume_threshold_bytes: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            path: None,
            max_depth_per_band: 1000,
            age_promotion_secs: 300,
            retention_secs: 86_400, // 1 day
            resume_threshold_bytes: 256 * 1024,
        }
    }
}

/// Retry/backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Base backoff interval in milliseconds
    pub base_ms: u64,

    /// Backoff cap in milliseconds
    pub max_ms: u64,

    /// Jitter fraction applied as `(1 ± jitter)`
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            max_ms: 300_000, // 5 minutes
            jitter: 0.2,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures within the window that open the breaker
    pub failure_threshold: u32,

    /// Sliding failure window in seconds
    pub window_secs: u64,

    /// Initial cool-down before a half-open trial, in seconds
    pub cooldown_secs: u64,

    /// Cool-down growth cap in seconds
    pub cooldown_max_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 60,
            cooldown_secs: 30,
            cooldown_max_secs: 600,
        }
    }
}

/// Connectivity monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Active probe interval in seconds
    pub probe_interval_secs: u64,

    /// Bounded window of recent attempt outcomes per transport
    pub window: usize,

    /// Score weight for recent success ratio
    pub weight_success: f64,

    /// Score weight for normalized latency
    pub weight_latency: f64,

    /// Score weight for recency of last success
    pub weight_recency: f64,

    /// Latency at or above which the latency factor reaches zero, ms
    pub latency_norm_ms: f64,

    /// Seconds after which a last-success stops counting toward recency
    pub recency_horizon_secs: f64,

    /// Score at or above which the real-time channel is preferred
    pub realtime_threshold: f64,

    /// Score at or above which the request/response channel is preferred
    pub http_threshold: f64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            probe_interval_secs: 30,
            window: 20,
            weight_success: 0.5,
            weight_latency: 0.3,
            weight_recency: 0.2,
            latency_norm_ms: 2000.0,
            recency_horizon_secs: 120.0,
            realtime_threshold: 0.8,
            http_threshold: 0.5,
        }
    }
}

/// Health reporter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReporterSettings {
    /// Report interval in seconds
    pub interval_secs: u64,
}

impl Default for ReporterSettings {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.breaker.failure_threshold, 5);
        assert!(config.monitor.realtime_threshold > config.monitor.http_threshold);
        assert!(config.retry.base_ms > 0);
    }

    #[test]
    fn test_config_builder() {
        let config = GatewayConfig::new()
            .with_device("cam-07", "cp-east")
            .with_server("10.0.0.5");

        assert_eq!(config.device_id, "cam-07");
        assert_eq!(config.endpoints.mqtt_host, "10.0.0.5");
        assert!(config.endpoints.ws_url.contains("10.0.0.5"));
    }

    #[test]
    fn test_config_serialization() {
        let config = GatewayConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: GatewayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.breaker.cooldown_secs, parsed.breaker.cooldown_secs);
    }

    #[test]
    fn test_score_weights_sum_to_one() {
        let m = MonitorSettings::default();
        let sum = m.weight_success + m.weight_latency + m.weight_recency;
        assert!((sum - 1.0).abs() < 1e-9);
    }
}
