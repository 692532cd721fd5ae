//! Replication Protocol
//!
//! Messages exchanged between a following node and the node it follows.

use serde::{Deserialize, Serialize};

use crate::engine::{NamespaceSnapshot, NamespaceState};
use crate::error::{Error, ErrorCode};
use crate::wal::WalRecord;

/// Protocol messages for node communication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // ========== Session ==========
    /// Handshake from a follower
    Hello {
        node_id: String,
        app_name: String,
        cluster_id: u32,
        /// Replicated namespaces (empty = all)
        namespaces: Vec<String>,
    },

    /// Handshake reply listing the master's namespaces
    Welcome {
        master_id: String,
        cluster_id: u32,
        namespaces: Vec<NamespaceState>,
    },

    /// Follower leaves cleanly
    Goodbye {
        node_id: String,
    },

    // ========== Catch-up ==========
    /// Records after `after` in `epoch` (`None`: from the start of the epoch)
    GetFrom {
        node_id: String,
        namespace: String,
        epoch: u64,
        after: Option<u64>,
    },

    /// GetFrom result: a raw state record followed by the records
    Records {
        namespace: String,
        records: Vec<WalRecord>,
    },

    /// Request a full copy of a namespace
    SnapshotRequest {
        node_id: String,
        namespace: String,
    },

    /// Full copy of a namespace (reply, or pushed by a forced sync)
    Snapshot(NamespaceSnapshot),

    /// End of a forced sync push
    SyncComplete,

    // ========== Live stream ==========
    /// One record appended on the master
    Update(WalRecord),

    // ========== Health ==========
    /// Periodic follower report
    Report {
        node_id: String,
        namespaces: Vec<NamespaceState>,
    },

    Ack,

    // ========== Error ==========
    Error {
        code: ErrorCode,
        namespace: Option<String>,
        message: String,
    },
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Error reply carrying `err`'s stable code
    pub fn error(err: &Error, namespace: Option<&str>) -> Self {
        Message::Error {
            code: err.code(),
            namespace: namespace.map(str::to_string),
            message: err.to_string(),
        }
    }

    /// Turn an error reply into an `Err`
    pub fn into_result(self) -> crate::error::Result<Message> {
        match self {
            Message::Error {
                code,
                namespace,
                message,
            } => Err(Error::from_remote(code, namespace, message)),
            other => Ok(other),
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "Hello",
            Message::Welcome { .. } => "Welcome",
            Message::Goodbye { .. } => "Goodbye",
            Message::GetFrom { .. } => "GetFrom",
            Message::Records { .. } => "Records",
            Message::SnapshotRequest { .. } => "SnapshotRequest",
            Message::Snapshot(_) => "Snapshot",
            Message::SyncComplete => "SyncComplete",
            Message::Update(_) => "Update",
            Message::Report { .. } => "Report",
            Message::Ack => "Ack",
            Message::Error { .. } => "Error",
        }
    }
}

/// Build an unexpected-reply error
pub fn unexpected(expected: &str, got: &Message) -> Error {
    Error::Replication(format!(
        "expected {} reply, got {}",
        expected,
        got.type_name()
    ))
}
