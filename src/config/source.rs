//! Config sources
//!
//! Producers of versioned `ReplicationConfig` snapshots for a running node.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::ReplicationConfig;

/// Config snapshot with a monotonically increasing version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedConfig {
    pub version: u64,
    pub config: ReplicationConfig,
}

#[async_trait]
pub trait ConfigSource: Send {
    /// Wait for the next snapshot. `None` once the source is closed.
    async fn next(&mut self) -> Option<VersionedConfig>;
}

/// Create an in-process config source and its sender
pub fn config_channel() -> (ConfigSender, ChannelConfigSource) {
    let (tx, rx) = watch::channel(None);
    (
        ConfigSender {
            tx,
            version: AtomicU64::new(0),
        },
        ChannelConfigSource { rx },
    )
}

/// Publishing side of `config_channel`
pub struct ConfigSender {
    tx: watch::Sender<Option<VersionedConfig>>,
    version: AtomicU64,
}

impl ConfigSender {
    /// Publish `config` under the next version; returns that version
    pub fn send(&self, config: ReplicationConfig) -> u64 {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.send_versioned(VersionedConfig { version, config });
        version
    }

    /// Publish a snapshot with an explicit version
    pub fn send_versioned(&self, snapshot: VersionedConfig) {
        self.version.fetch_max(snapshot.version, Ordering::SeqCst);
        self.tx.send_replace(Some(snapshot));
    }
}

/// Receiving side of `config_channel`. Only the latest snapshot is kept.
pub struct ChannelConfigSource {
    rx: watch::Receiver<Option<VersionedConfig>>,
}

#[async_trait]
impl ConfigSource for ChannelConfigSource {
    async fn next(&mut self) -> Option<VersionedConfig> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(snapshot) = self.rx.borrow_and_update().clone() {
                return Some(snapshot);
            }
        }
    }
}

/// Polls a TOML file holding a `ReplicationConfig`.
///
/// Each content change that parses and validates becomes a new version;
/// invalid content is logged and skipped, so the last valid config stays
/// in force.
pub struct FileConfigSource {
    path: PathBuf,
    interval: Duration,
    last_content: Option<String>,
    version: u64,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            last_content: None,
            version: 0,
        }
    }

    async fn poll(&mut self) -> Option<VersionedConfig> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) => {
                tracing::debug!("Config file {} not readable: {}", self.path.display(), e);
                return None;
            }
        };
        if self.last_content.as_deref() == Some(content.as_str()) {
            return None;
        }

        let parsed = ReplicationConfig::parse(&content);
        self.last_content = Some(content);
        match parsed {
            Ok(config) => {
                self.version += 1;
                tracing::info!(
                    "Loaded replication config v{} from {}",
                    self.version,
                    self.path.display()
                );
                Some(VersionedConfig {
                    version: self.version,
                    config,
                })
            }
            Err(e) => {
                tracing::warn!(
                    "Rejected config in {}: {} (keeping last valid)",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn next(&mut self) -> Option<VersionedConfig> {
        loop {
            if let Some(snapshot) = self.poll().await {
                return Some(snapshot);
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
