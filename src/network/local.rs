//! In-process transport
//!
//! Nodes of one process reach each other through a shared registry of
//! bound services. Every message crosses the link encoded with bincode.
//! Each binding carries a cancellation token: rebinding, unbinding or
//! cutting a DSN off cancels it, which fails every request and closes
//! every stream opened through the old binding.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::{Link, ReplicationService, Transport};
use crate::config::{SyncConfig, WolfReplConfig};
use crate::error::{Error, Result};
use crate::replication::Message;

struct Binding {
    service: Arc<dyn ReplicationService>,
    token: CancellationToken,
}

#[derive(Default)]
struct Registry {
    bindings: HashMap<String, Binding>,
    unreachable: HashSet<String>,
}

/// Shared in-process network
#[derive(Clone)]
pub struct LocalNetwork {
    registry: Arc<RwLock<Registry>>,
    request_timeout: Duration,
    stream_capacity: usize,
}

impl LocalNetwork {
    pub fn new() -> Self {
        let sync = SyncConfig::default();
        Self::with_timeouts(Duration::from_millis(sync.request_timeout_ms), 4096)
    }

    /// Network with the request timeout and stream buffering of `config`
    pub fn from_config(config: &WolfReplConfig) -> Self {
        Self::with_timeouts(config.request_timeout(), config.updates.buffer_size)
    }

    pub fn with_timeouts(request_timeout: Duration, stream_capacity: usize) -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            request_timeout,
            stream_capacity: stream_capacity.max(1),
        }
    }

    /// Simulate a partition: while unreachable, connects and requests fail
    /// and open streams are closed.
    pub fn set_reachable(&self, dsn: &str, reachable: bool) {
        let mut registry = self.registry.write();
        if reachable {
            if registry.unreachable.remove(dsn) {
                if let Some(binding) = registry.bindings.get_mut(dsn) {
                    binding.token = CancellationToken::new();
                }
                tracing::info!("{} is reachable again", dsn);
            }
        } else if registry.unreachable.insert(dsn.to_string()) {
            if let Some(binding) = registry.bindings.get(dsn) {
                binding.token.cancel();
            }
            tracing::info!("{} cut off from the network", dsn);
        }
    }

    pub fn is_bound(&self, dsn: &str) -> bool {
        self.registry.read().bindings.contains_key(dsn)
    }

    fn endpoint(&self, dsn: &str) -> Result<(Arc<dyn ReplicationService>, CancellationToken)> {
        let registry = self.registry.read();
        if registry.unreachable.contains(dsn) {
            return Err(Error::ConnectionFailed {
                address: dsn.to_string(),
                reason: "unreachable".into(),
            });
        }
        match registry.bindings.get(dsn) {
            Some(binding) if !binding.token.is_cancelled() => {
                Ok((Arc::clone(&binding.service), binding.token.clone()))
            }
            _ => Err(Error::ConnectionFailed {
                address: dsn.to_string(),
                reason: "no service bound".into(),
            }),
        }
    }
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn connect(&self, dsn: &str) -> Result<Arc<dyn Link>> {
        let (service, token) = self.endpoint(dsn)?;
        tracing::debug!("Connected to {}", dsn);
        Ok(Arc::new(LocalLink {
            dsn: dsn.to_string(),
            service,
            token,
            request_timeout: self.request_timeout,
            stream_capacity: self.stream_capacity,
        }))
    }

    fn bind(&self, dsn: &str, service: Arc<dyn ReplicationService>) {
        let mut registry = self.registry.write();
        let binding = Binding {
            service,
            token: CancellationToken::new(),
        };
        if let Some(old) = registry.bindings.insert(dsn.to_string(), binding) {
            old.token.cancel();
        }
        tracing::debug!("Service bound at {}", dsn);
    }

    fn unbind(&self, dsn: &str) {
        if let Some(old) = self.registry.write().bindings.remove(dsn) {
            old.token.cancel();
            tracing::debug!("Service unbound from {}", dsn);
        }
    }
}

struct LocalLink {
    dsn: String,
    service: Arc<dyn ReplicationService>,
    token: CancellationToken,
    request_timeout: Duration,
    stream_capacity: usize,
}

impl LocalLink {
    fn broken(&self) -> Error {
        Error::ConnectionFailed {
            address: self.dsn.clone(),
            reason: "link closed".into(),
        }
    }

    fn transfer(message: &Message) -> Result<Message> {
        let bytes = message.serialize()?;
        Ok(Message::deserialize(&bytes)?)
    }
}

#[async_trait]
impl Link for LocalLink {
    async fn request(&self, message: Message) -> Result<Message> {
        if self.token.is_cancelled() {
            return Err(self.broken());
        }
        let message = Self::transfer(&message)?;

        let reply = tokio::select! {
            _ = self.token.cancelled() => return Err(self.broken()),
            reply = timeout(self.request_timeout, self.service.handle(message)) => {
                reply.map_err(|_| Error::ConnectionTimeout(self.dsn.clone()))?
            }
        };

        if self.token.is_cancelled() {
            return Err(self.broken());
        }
        Self::transfer(&reply)?.into_result()
    }

    async fn subscribe(&self, node_id: &str, namespaces: Vec<String>) -> Result<mpsc::Receiver<Message>> {
        if self.token.is_cancelled() {
            return Err(self.broken());
        }
        let mut upstream = self.service.open_stream(node_id, namespaces).await?;
        let (tx, rx) = mpsc::channel(self.stream_capacity);
        let token = self.token.clone();
        let dsn = self.dsn.clone();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => break,
                    message = upstream.recv() => message,
                };
                let Some(message) = message else { break };
                let message = match Self::transfer(&message) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!("Dropping undecodable stream message from {}: {}", dsn, e);
                        break;
                    }
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            tracing::debug!("Stream from {} closed", dsn);
        });

        Ok(rx)
    }

    fn is_alive(&self) -> bool {
        !self.token.is_cancelled()
    }
}
