//! WolfRepl Configuration
//!
//! This module provides configuration structures for a replicating node.
//! `ReplicationConfig` can also be loaded on its own: it is the snapshot a
//! config source hands to a running node.

mod source;

pub use source::{config_channel, ChannelConfigSource, ConfigSender, ConfigSource, FileConfigSource, VersionedConfig};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::replication::Role;
use crate::wal::WalCapacity;

/// Main WolfRepl configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfReplConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Role and replication settings
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Write-Ahead Log configuration
    #[serde(default)]
    pub wal: WalConfig,

    /// Update fan-out configuration
    #[serde(default)]
    pub updates: UpdatesConfig,

    /// Heartbeat, convergence and shutdown timing
    #[serde(default)]
    pub sync: SyncConfig,

    /// Reconnect backoff
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    #[serde(default = "default_node_id")]
    pub id: String,

    /// DSN this node serves replication on
    pub dsn: String,
}

/// Replication role configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub role: Role,

    /// DSN of the node to follow (slave / cluster member)
    #[serde(default)]
    pub master_dsn: Option<String>,

    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// 0 accepts followers from any cluster
    #[serde(default)]
    pub cluster_id: u32,

    #[serde(default)]
    pub force_sync_on_logic_error: bool,

    #[serde(default)]
    pub force_sync_on_wrong_data_hash: bool,

    /// Replicated namespaces (empty = all)
    #[serde(default)]
    pub namespaces: Vec<String>,
}

/// Write-Ahead Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Records retained per namespace
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// Optional cap on retained bytes per namespace
    #[serde(default)]
    pub max_bytes: Option<usize>,
}

/// Update fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatesConfig {
    /// Events buffered per observer before the oldest are dropped
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// Sync timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Follower report interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Peers silent for longer are marked offline
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,

    /// WaitSync polling interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Bound on cancellation of role changes and shutdown
    #[serde(default = "default_admin_timeout_ms")]
    pub admin_timeout_ms: u64,

    /// Request timeout on replication links
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Reconnect backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Fraction of the delay randomized in both directions
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_node_id() -> String {
    format!("node-{}", uuid::Uuid::new_v4().simple())
}

fn default_app_name() -> String {
    "wolfrepl".to_string()
}

fn default_max_records() -> usize {
    WalCapacity::default().max_records
}

fn default_buffer_size() -> usize {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    500
}

fn default_peer_timeout_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_admin_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            role: Role::None,
            master_dsn: None,
            app_name: default_app_name(),
            cluster_id: 0,
            force_sync_on_logic_error: false,
            force_sync_on_wrong_data_hash: false,
            namespaces: Vec::new(),
        }
    }
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            max_bytes: None,
        }
    }
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            peer_timeout_ms: default_peer_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            admin_timeout_ms: default_admin_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
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

impl ReplicationConfig {
    /// Master role
    pub fn master() -> Self {
        Self {
            role: Role::Master,
            ..Self::default()
        }
    }

    /// Slave role following `master_dsn`
    pub fn slave(master_dsn: impl Into<String>) -> Self {
        Self {
            role: Role::Slave,
            master_dsn: Some(master_dsn.into()),
            ..Self::default()
        }
    }

    /// Cluster member following `master_dsn`
    pub fn cluster_member(master_dsn: impl Into<String>) -> Self {
        Self {
            role: Role::ClusterMember,
            master_dsn: Some(master_dsn.into()),
            ..Self::default()
        }
    }

    /// Load a standalone replication config from a TOML string
    pub fn parse(content: &str) -> crate::Result<Self> {
        let config: ReplicationConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.role.follows() {
            match self.master_dsn.as_deref() {
                Some(dsn) if !dsn.trim().is_empty() => {}
                _ => {
                    return Err(crate::Error::Config(format!(
                        "role {} requires master_dsn",
                        self.role
                    )))
                }
            }
        }

        if self.app_name.is_empty() {
            return Err(crate::Error::Config("app_name cannot be empty".into()));
        }

        if self.namespaces.iter().any(|n| n.trim().is_empty()) {
            return Err(crate::Error::Config(
                "namespaces cannot contain empty names".into(),
            ));
        }

        Ok(())
    }

    /// Check if `namespace` is replicated under this config
    pub fn replicates(&self, namespace: &str) -> bool {
        self.namespaces.is_empty() || self.namespaces.iter().any(|n| n == namespace)
    }
}

impl WolfReplConfig {
    /// Minimal config for a node serving at `dsn`
    pub fn new(id: impl Into<String>, dsn: impl Into<String>) -> Self {
        Self {
            node: NodeConfig {
                id: id.into(),
                dsn: dsn.into(),
            },
            replication: ReplicationConfig::default(),
            wal: WalConfig::default(),
            updates: UpdatesConfig::default(),
            sync: SyncConfig::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string
    pub fn parse(content: &str) -> crate::Result<Self> {
        let config: WolfReplConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.dsn.is_empty() {
            return Err(crate::Error::Config("node.dsn cannot be empty".into()));
        }

        if self.wal.max_records == 0 {
            return Err(crate::Error::Config("wal.max_records must be positive".into()));
        }

        if self.updates.buffer_size == 0 {
            return Err(crate::Error::Config(
                "updates.buffer_size must be positive".into(),
            ));
        }

        if self.sync.heartbeat_interval_ms == 0
            || self.sync.poll_interval_ms == 0
            || self.sync.request_timeout_ms == 0
        {
            return Err(crate::Error::Config(
                "sync intervals must be positive".into(),
            ));
        }

        if self.retry.backoff_multiplier < 1.0 {
            return Err(crate::Error::Config(
                "retry.backoff_multiplier must be at least 1.0".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(crate::Error::Config(
                "retry.jitter_factor must be within [0, 1]".into(),
            ));
        }

        if self.replication.master_dsn.as_deref() == Some(self.node.dsn.as_str()) {
            return Err(crate::Error::Config(
                "replication.master_dsn points at this node".into(),
            ));
        }

        self.replication.validate()
    }

    /// Serialize back to TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Default WAL retention for new namespaces
    pub fn wal_capacity(&self) -> WalCapacity {
        WalCapacity {
            max_records: self.wal.max_records,
            max_bytes: self.wal.max_bytes,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.sync.heartbeat_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.peer_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync.poll_interval_ms)
    }

    pub fn admin_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.admin_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "node-1"
dsn = "local://node-1"

[replication]
role = "slave"
master_dsn = "local://node-0"
cluster_id = 7
force_sync_on_wrong_data_hash = true
namespaces = ["ns1", "some"]

[wal]
max_records = 1000

[sync]
heartbeat_interval_ms = 100
"#;

        let config = WolfReplConfig::parse(toml).unwrap();
        assert_eq!(config.node.id, "node-1");
        assert_eq!(config.replication.role, Role::Slave);
        assert_eq!(config.replication.cluster_id, 7);
        assert!(config.replication.replicates("ns1"));
        assert!(!config.replication.replicates("ns2"));
        assert_eq!(config.wal_capacity(), WalCapacity::records(1000));
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(100));
        assert_eq!(config.retry.initial_delay_ms, 100);
    }

    #[test]
    fn test_slave_requires_master() {
        let config = ReplicationConfig {
            role: Role::Slave,
            ..ReplicationConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(ReplicationConfig::slave("local://m").validate().is_ok());
        assert!(ReplicationConfig::master().validate().is_ok());
    }

    #[test]
    fn test_zero_timeouts_are_rejected() {
        let mut config = WolfReplConfig::new("n1", "local://n1");
        assert!(config.validate().is_ok());
        config.sync.request_timeout_ms = 0;
        assert!(config.validate().is_err());
        config.sync.request_timeout_ms = 50;
        config.sync.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_standalone_replication_config() {
        let config = ReplicationConfig::parse(
            r#"
role = "cluster_member"
master_dsn = "local://node-0"
"#,
        )
        .unwrap();
        assert_eq!(config.role, Role::ClusterMember);
        assert!(config.replicates("anything"));

        assert!(ReplicationConfig::parse("role = \"leader\"").is_err());
    }

    #[test]
    fn test_default_config_roundtrips() {
        let config = WolfReplConfig::new("node-1", "local://node-1");
        let text = config.to_toml().unwrap();
        let parsed = WolfReplConfig::parse(&text).unwrap();
        assert_eq!(parsed.node.dsn, "local://node-1");
        assert_eq!(parsed.replication, config.replication);
    }

    #[test]
    fn test_self_follow_is_rejected() {
        let mut config = WolfReplConfig::new("node-1", "local://node-1");
        config.replication = ReplicationConfig::slave("local://node-1");
        assert!(config.validate().is_err());
    }
}
