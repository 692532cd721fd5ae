//! WolfRepl - Replication core for embedded document stores
//!
//! Keeps namespaces of an embedded document store in sync across nodes
//! using a bounded, per-namespace Write-Ahead Log (WAL) ring.
//!
//! # Architecture
//!
//! Every mutation is applied to the namespace data, appended to the
//! namespace's WAL ring under an `(epoch, counter)` LSN and fanned out to
//! update observers. Followers (slaves and cluster members) replay the
//! master's records incrementally while their position is still retained,
//! and fall back to a full copy once it is not.
//!
//! # Features
//!
//! - Bounded WAL rings with runtime resize and `OutdatedWal` detection
//! - `GetFrom` catch-up and `#lsn` range queries
//! - Update multiplexer with per-observer namespace filters and
//!   drop-oldest buffers
//! - Master / slave / cluster member roles with dynamic switching
//! - Content hash verification and forced full syncs
//! - Pluggable transports and config sources

pub mod config;
pub mod engine;
pub mod error;
pub mod network;
pub mod node;
pub mod replication;
pub mod state;
pub mod storage;
pub mod updates;
pub mod wal;

pub use config::WolfReplConfig;
pub use error::{Error, ErrorCode, Result};
pub use node::Node;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ReplicationConfig, WolfReplConfig};
    pub use crate::error::{Error, ErrorCode, Result};
    pub use crate::network::LocalNetwork;
    pub use crate::node::Node;
    pub use crate::replication::{FollowerState, Role, RoleState};
    pub use crate::updates::{SubscriptionMode, UpdatesObserver};
    pub use crate::wal::{Lsn, Query, WalCapacity, WalRecord};
}
