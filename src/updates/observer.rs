//! Observer capability and delivery bookkeeping

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::wal::WalRecord;

/// Replication connectivity as reported to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// DSN of the master this node follows, if any
    pub master: Option<String>,
    pub connected: bool,
    pub error: Option<String>,
}

/// Receiver of live updates.
///
/// Callbacks for one observer run one at a time, in order, on tokio's
/// blocking thread pool. A slow callback delays only its own observer's
/// queue, on any runtime flavor. Callbacks must not unsubscribe the
/// observer they are running for.
pub trait UpdatesObserver: Send + Sync {
    fn on_update(&self, record: &WalRecord);

    fn on_connection_state(&self, _status: &ConnectionStatus) {}
}

/// Queued item of an observer's buffer
#[derive(Debug, Clone)]
pub(crate) enum UpdateEvent {
    Record(Arc<WalRecord>),
    Connection(ConnectionStatus),
}

/// Delivery counters of one observer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserverStats {
    pub delivered: u64,
    /// Events discarded because the buffer was full
    pub dropped: u64,
    pub queued: usize,
}

/// Observer counting delivered records per namespace.
///
/// Lifecycle records are counted under the namespace that emitted them.
#[derive(Debug, Default)]
pub struct UpdatesCounter {
    counts: Mutex<HashMap<String, u64>>,
    connection: Mutex<Vec<ConnectionStatus>>,
}

impl UpdatesCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self, namespace: &str) -> u64 {
        self.counts.lock().get(namespace).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.lock().values().sum()
    }

    pub fn counts(&self) -> HashMap<String, u64> {
        self.counts.lock().clone()
    }

    pub fn connection_events(&self) -> Vec<ConnectionStatus> {
        self.connection.lock().clone()
    }
}

impl UpdatesObserver for UpdatesCounter {
    fn on_update(&self, record: &WalRecord) {
        *self
            .counts
            .lock()
            .entry(record.namespace().to_string())
            .or_insert(0) += 1;
    }

    fn on_connection_state(&self, status: &ConnectionStatus) {
        self.connection.lock().push(status.clone());
    }
}
