//! Network Module
//!
//! Transport seam between a following node and the node it follows.
//! Wire encoding is left to transport implementations; the crate ships an
//! in-process transport with fault injection.

mod local;

pub use local::LocalNetwork;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::replication::Message;

/// Server side of replication, as exposed by a node that can be followed
#[async_trait]
pub trait ReplicationService: Send + Sync {
    /// Handle one request and produce its reply
    async fn handle(&self, message: Message) -> Message;

    /// Open the live update stream of a follower
    async fn open_stream(&self, node_id: &str, namespaces: Vec<String>) -> Result<mpsc::Receiver<Message>>;
}

/// Client side of an established connection
#[async_trait]
pub trait Link: Send + Sync {
    /// Send a request and wait for the reply. Error replies become `Err`.
    async fn request(&self, message: Message) -> Result<Message>;

    /// Subscribe to the live update stream
    async fn subscribe(&self, node_id: &str, namespaces: Vec<String>) -> Result<mpsc::Receiver<Message>>;

    fn is_alive(&self) -> bool;
}

/// Connects nodes by DSN
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, dsn: &str) -> Result<Arc<dyn Link>>;

    /// Start serving `service` at `dsn`, replacing any previous binding
    fn bind(&self, dsn: &str, service: Arc<dyn ReplicationService>);

    fn unbind(&self, dsn: &str);
}
