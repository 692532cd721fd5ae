//! WAL Record Types
//!
//! Defines the records that are appended to a namespace's WAL ring,
//! delivered to update observers and replayed by replicas.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Log Sequence Number: (namespace epoch, counter)
///
/// Counters are only comparable within one epoch. A new epoch is assigned
/// whenever a namespace is (re)created or renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn {
    pub epoch: u64,
    pub counter: u64,
}

impl Lsn {
    pub fn new(epoch: u64, counter: u64) -> Self {
        Self { epoch, counter }
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.epoch, self.counter)
    }
}

/// Content digest of a namespace after a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DataState {
    /// Order-independent hash of all items
    pub data_hash: u64,
    /// Number of items
    pub data_count: u64,
}

/// Replication bookkeeping for one namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationState {
    pub epoch: u64,
    /// Counter of the last appended record (None if nothing was ever appended)
    pub last_counter: Option<u64>,
    pub data_hash: u64,
    pub data_count: u64,
}

impl ReplicationState {
    /// LSN of the last appended record
    pub fn last_lsn(&self) -> Option<Lsn> {
        self.last_counter.map(|c| Lsn::new(self.epoch, c))
    }

    /// Check that two nodes hold identical content at the same WAL position
    pub fn converged_with(&self, other: &ReplicationState) -> bool {
        self == other
    }
}

/// Operation carried by a WAL record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalOp {
    /// Insert or replace an item
    ItemUpsert { key: String, item: Bytes },

    /// Delete an item
    ItemDelete { key: String },

    /// Namespace was created
    NamespaceOpen,

    /// Namespace was dropped; its epoch is retired
    NamespaceDrop,

    /// Namespace was renamed; the destination starts at `to_epoch`
    NamespaceRename { to: String, to_epoch: u64 },

    /// Raw replication bookkeeping (never stored in the ring)
    ReplicationStateSnapshot(ReplicationState),
}

impl WalOp {
    /// Check if this op changes namespace topology rather than items
    pub fn is_namespace_op(&self) -> bool {
        matches!(
            self,
            WalOp::NamespaceOpen | WalOp::NamespaceDrop | WalOp::NamespaceRename { .. }
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            WalOp::ItemUpsert { .. } => "ItemUpsert",
            WalOp::ItemDelete { .. } => "ItemDelete",
            WalOp::NamespaceOpen => "NamespaceOpen",
            WalOp::NamespaceDrop => "NamespaceDrop",
            WalOp::NamespaceRename { .. } => "NamespaceRename",
            WalOp::ReplicationStateSnapshot(_) => "ReplicationStateSnapshot",
        }
    }
}

/// Record header containing metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub lsn: Lsn,
    pub namespace: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// CRC32 of the payload bytes
    pub checksum: u32,
}

/// Full WAL record with header and operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    pub header: RecordHeader,
    pub op: WalOp,
}

impl WalRecord {
    /// Create a new record
    pub fn new(lsn: Lsn, namespace: impl Into<String>, op: WalOp) -> Self {
        let checksum = crc32fast::hash(&Self::payload_of(&op));
        Self {
            header: RecordHeader {
                lsn,
                namespace: namespace.into(),
                timestamp: chrono::Utc::now(),
                checksum,
            },
            op,
        }
    }

    /// Raw bookkeeping record describing a namespace's replication state
    pub fn state_snapshot(lsn: Lsn, namespace: impl Into<String>, state: ReplicationState) -> Self {
        Self::new(lsn, namespace, WalOp::ReplicationStateSnapshot(state))
    }

    pub fn lsn(&self) -> Lsn {
        self.header.lsn
    }

    pub fn namespace(&self) -> &str {
        &self.header.namespace
    }

    /// Bookkeeping records are raw; everything else is a user mutation
    pub fn is_raw(&self) -> bool {
        matches!(self.op, WalOp::ReplicationStateSnapshot(_))
    }

    /// Replication state carried by a raw record
    pub fn replication_state(&self) -> Option<&ReplicationState> {
        match &self.op {
            WalOp::ReplicationStateSnapshot(state) => Some(state),
            _ => None,
        }
    }

    /// Payload bytes: the user item, or the encoded bookkeeping snapshot
    pub fn payload(&self) -> Bytes {
        Self::payload_of(&self.op)
    }

    fn payload_of(op: &WalOp) -> Bytes {
        match op {
            WalOp::ItemUpsert { item, .. } => item.clone(),
            WalOp::ItemDelete { key } => Bytes::copy_from_slice(key.as_bytes()),
            WalOp::NamespaceRename { to, .. } => Bytes::copy_from_slice(to.as_bytes()),
            WalOp::ReplicationStateSnapshot(state) => {
                Bytes::from(bincode::serialize(state).unwrap_or_default())
            }
            WalOp::NamespaceOpen | WalOp::NamespaceDrop => Bytes::new(),
        }
    }

    /// Approximate memory footprint, used for byte-bounded rings
    pub fn size_bytes(&self) -> usize {
        let key_len = match &self.op {
            WalOp::ItemUpsert { key, .. } | WalOp::ItemDelete { key } => key.len(),
            _ => 0,
        };
        std::mem::size_of::<Self>() + self.header.namespace.len() + key_len + self.payload().len()
    }

    /// Verify checksum
    pub fn verify_checksum(&self) -> bool {
        crc32fast::hash(&self.payload()) == self.header.checksum
    }

    /// Serialize record to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize record from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
