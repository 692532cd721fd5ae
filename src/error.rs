//! WolfRepl Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::wal::Lsn;

/// Result type alias for WolfRepl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error codes surfaced to callers of the replication core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Ok,
    OutdatedWal,
    NotFound,
    Conflict,
    ReadOnly,
    DataHash,
    Logic,
    Network,
    Timeout,
    Config,
    Params,
    Canceled,
    Internal,
}

/// WolfRepl error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // WAL errors
    #[error("Outdated WAL: requested position {requested:?} of namespace '{namespace}' is outside the retained window")]
    OutdatedWal {
        namespace: String,
        requested: Option<u64>,
    },

    #[error("LSN gap in namespace '{namespace}': expected {expected}, got {got}")]
    LsnGap {
        namespace: String,
        expected: Lsn,
        got: Lsn,
    },

    #[error("Epoch mismatch in namespace '{namespace}': local {local}, remote {remote}")]
    EpochMismatch {
        namespace: String,
        local: u64,
        remote: u64,
    },

    #[error("WAL serialization error: {0}")]
    WalSerialization(#[from] bincode::Error),

    // Namespace / item errors
    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Namespace already exists: {0}")]
    NamespaceExists(String),

    #[error("Item '{key}' not found in namespace '{namespace}'")]
    ItemNotFound { namespace: String, key: String },

    #[error("Unsupported query: {0}")]
    UnsupportedQuery(String),

    // Replication errors
    #[error("Namespace '{0}' is replicated and read-only on this node")]
    ReadOnly(String),

    #[error("Data hash mismatch in namespace '{namespace}' at LSN {lsn}: local {local:#x}, master {master:#x}")]
    WrongDataHash {
        namespace: String,
        lsn: Lsn,
        local: u64,
        master: u64,
    },

    #[error("Replication logic error: {0}")]
    LogicError(String),

    #[error("Cluster id mismatch: master {master}, replica {replica}")]
    ClusterMismatch { master: u32, replica: u32 },

    #[error("Replication error: {0}")]
    Replication(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // Sync errors
    #[error("Namespace '{namespace}' did not converge within {timeout_ms}ms")]
    SyncTimeout { namespace: String, timeout_ms: u64 },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::OutdatedWal { .. } => ErrorCode::OutdatedWal,
            Error::NamespaceNotFound(_) | Error::ItemNotFound { .. } => ErrorCode::NotFound,
            Error::NamespaceExists(_) => ErrorCode::Conflict,
            Error::ReadOnly(_) => ErrorCode::ReadOnly,
            Error::WrongDataHash { .. } => ErrorCode::DataHash,
            Error::LsnGap { .. } | Error::EpochMismatch { .. } | Error::LogicError(_) => {
                ErrorCode::Logic
            }
            Error::Network(_) | Error::ConnectionFailed { .. } => ErrorCode::Network,
            Error::ConnectionTimeout(_) | Error::SyncTimeout { .. } => ErrorCode::Timeout,
            Error::Config(_) | Error::ConfigParse(_) | Error::ClusterMismatch { .. } => {
                ErrorCode::Config
            }
            Error::UnsupportedQuery(_) => ErrorCode::Params,
            Error::Cancelled | Error::ShuttingDown => ErrorCode::Canceled,
            Error::WalSerialization(_)
            | Error::Replication(_)
            | Error::Io(_)
            | Error::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Rebuild an error reported by a remote node
    pub fn from_remote(code: ErrorCode, namespace: Option<String>, message: String) -> Self {
        match code {
            ErrorCode::OutdatedWal => Error::OutdatedWal {
                namespace: namespace.unwrap_or_default(),
                requested: None,
            },
            ErrorCode::NotFound => Error::NamespaceNotFound(namespace.unwrap_or(message)),
            ErrorCode::Conflict => Error::NamespaceExists(namespace.unwrap_or(message)),
            ErrorCode::ReadOnly => Error::ReadOnly(namespace.unwrap_or(message)),
            ErrorCode::Config => Error::Config(message),
            ErrorCode::Network | ErrorCode::Timeout => Error::Network(message),
            ErrorCode::Logic | ErrorCode::DataHash => Error::LogicError(message),
            ErrorCode::Canceled => Error::Cancelled,
            ErrorCode::Ok | ErrorCode::Params | ErrorCode::Internal => Error::Replication(message),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
        )
    }

    /// Check if this error can only be repaired by a full resync
    pub fn requires_full_sync(&self) -> bool {
        matches!(
            self,
            Error::OutdatedWal { .. } | Error::EpochMismatch { .. }
        )
    }

    /// Check if this error is an internal consistency failure during replay
    pub fn is_logic_error(&self) -> bool {
        matches!(
            self,
            Error::LsnGap { .. } | Error::LogicError(_) | Error::ItemNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outdated_wal_has_distinct_code() {
        let err = Error::OutdatedWal {
            namespace: "some".into(),
            requested: Some(503),
        };
        assert_eq!(err.code(), ErrorCode::OutdatedWal);
        assert!(err.requires_full_sync());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_network_errors_are_retryable() {
        let err = Error::ConnectionFailed {
            address: "local://node-1".into(),
            reason: "unreachable".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.code(), ErrorCode::Network);
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_remote_outdated_wal_keeps_code() {
        let err = Error::from_remote(ErrorCode::OutdatedWal, Some("some".into()), "gone".into());
        assert!(err.requires_full_sync());
        assert_eq!(err.code(), ErrorCode::OutdatedWal);
    }
}
