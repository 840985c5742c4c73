//! WolfMQ Configuration
//!
//! This module provides configuration structures for the WolfMQ
//! broker cluster coordination engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main WolfMQ configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfMqConfig {
    /// Broker-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    pub cluster: ClusterConfig,

    /// Takeover configuration
    #[serde(default)]
    pub takeover: TakeoverConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Broker instance name, unique within the cluster
    pub instance: String,

    /// Address to bind for cluster communication
    pub bind_address: String,

    /// Data directory for the takeover lock store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Advertised address for other brokers to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// List of peer broker addresses
    #[serde(default)]
    pub peers: Vec<String>,

    /// Enable HA takeover coordination
    #[serde(default = "default_true")]
    pub ha_enabled: bool,

    /// Explicitly designated master broker (identity key). When unset the
    /// master is the lowest identity key among operating members.
    #[serde(default)]
    pub master: Option<String>,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a broker is considered suspect, in milliseconds
    #[serde(default = "default_suspect_after_ms")]
    pub suspect_after_ms: u64,

    /// Silence after which a suspect broker is considered failed, in milliseconds
    #[serde(default = "default_failed_after_ms")]
    pub failed_after_ms: u64,
}

/// Takeover configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeoverConfig {
    /// Start takeover automatically when a peer is marked failed
    #[serde(default = "default_true")]
    pub auto: bool,

    /// Deadline for a takeover attempt before the watchdog aborts it,
    /// in milliseconds
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_ms: u64,

    /// How long finished takeover records are kept for duplicate detection,
    /// in seconds
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Path of the shared takeover lock database. Defaults to
    /// `<data_dir>/takeover_locks.db`.
    #[serde(default)]
    pub lock_path: Option<PathBuf>,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_heartbeat_interval_ms() -> u64 {
    500
}

fn default_suspect_after_ms() -> u64 {
    3000
}

fn default_failed_after_ms() -> u64 {
    9000
}

fn default_watchdog_ms() -> u64 {
    30000
}

fn default_retention_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfmq")
}

impl Default for TakeoverConfig {
    fn default() -> Self {
        Self {
            auto: true,
            watchdog_ms: default_watchdog_ms(),
            retention_secs: default_retention_secs(),
            lock_path: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfMqConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfMqConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfMqConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.instance.is_empty() {
            return Err(crate::Error::Config("node.instance cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config(
                "node.bind_address cannot be empty".into(),
            ));
        }

        if self.cluster.heartbeat_interval_ms == 0 {
            return Err(crate::Error::Config(
                "cluster.heartbeat_interval_ms must be positive".into(),
            ));
        }

        if self.cluster.suspect_after_ms < self.cluster.heartbeat_interval_ms {
            return Err(crate::Error::Config(
                "cluster.suspect_after_ms must be at least the heartbeat interval".into(),
            ));
        }

        if self.cluster.failed_after_ms <= self.cluster.suspect_after_ms {
            return Err(crate::Error::Config(
                "cluster.failed_after_ms must exceed cluster.suspect_after_ms".into(),
            ));
        }

        if self.takeover.watchdog_ms == 0 {
            return Err(crate::Error::Config(
                "takeover.watchdog_ms must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the takeover lock database path
    pub fn lock_db_path(&self) -> PathBuf {
        self.takeover
            .lock_path
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("takeover_locks.db"))
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    /// Get the suspect threshold as Duration
    pub fn suspect_after(&self) -> Duration {
        Duration::from_millis(self.cluster.suspect_after_ms)
    }

    /// Get the failed threshold as Duration
    pub fn failed_after(&self) -> Duration {
        Duration::from_millis(self.cluster.failed_after_ms)
    }

    /// Get the takeover watchdog deadline as Duration
    pub fn takeover_watchdog(&self) -> Duration {
        Duration::from_millis(self.takeover.watchdog_ms)
    }

    /// Get the finished-record retention window as Duration
    pub fn record_retention(&self) -> Duration {
        Duration::from_secs(self.takeover.retention_secs)
    }

    /// Starting-point configuration written by `wolfmq init`
    pub fn sample(instance: &str) -> Self {
        Self {
            node: NodeConfig {
                instance: instance.to_string(),
                bind_address: "0.0.0.0:7676".to_string(),
                data_dir: default_data_dir(),
                advertise_address: None,
            },
            cluster: ClusterConfig {
                peers: vec![
                    "mq2.example.com:7676".to_string(),
                    "mq3.example.com:7676".to_string(),
                ],
                ha_enabled: true,
                master: None,
                heartbeat_interval_ms: default_heartbeat_interval_ms(),
                suspect_after_ms: default_suspect_after_ms(),
                failed_after_ms: default_failed_after_ms(),
            },
            takeover: TakeoverConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
instance = "broker-1"
bind_address = "0.0.0.0:7676"
data_dir = "/var/lib/wolfmq"

[cluster]
peers = ["mq2.example.com:7676", "mq3.example.com:7676"]
ha_enabled = true

[takeover]
watchdog_ms = 20000
"#;

        let config = WolfMqConfig::from_str(toml).unwrap();
        assert_eq!(config.node.instance, "broker-1");
        assert_eq!(config.cluster.peers.len(), 2);
        assert!(config.cluster.ha_enabled);
        assert_eq!(config.takeover.watchdog_ms, 20000);
        assert_eq!(config.takeover.retention_secs, 300);
        assert_eq!(
            config.lock_db_path(),
            PathBuf::from("/var/lib/wolfmq/takeover_locks.db")
        );
    }

    #[test]
    fn test_sample_round_trips() {
        let sample = WolfMqConfig::sample("broker-1");
        sample.validate().unwrap();

        let rendered = toml::to_string_pretty(&sample).unwrap();
        let parsed = WolfMqConfig::from_str(&rendered).unwrap();
        assert_eq!(parsed.node.instance, "broker-1");
        assert_eq!(parsed.cluster.peers.len(), 2);
        assert!(parsed.cluster.ha_enabled);
    }

    #[test]
    fn test_reject_bad_thresholds() {
        let toml = r#"
[node]
instance = "broker-1"
bind_address = "0.0.0.0:7676"

[cluster]
heartbeat_interval_ms = 500
suspect_after_ms = 100
"#;

        assert!(WolfMqConfig::from_str(toml).is_err());
    }
}
