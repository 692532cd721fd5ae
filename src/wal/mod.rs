//! Write-Ahead Log Module
//!
//! Bounded, in-memory, per-namespace log of mutations addressed by
//! (epoch, counter) LSNs. Serves incremental replication and the `#lsn`
//! range queries.

mod lsn;
mod query;
mod record;
mod ring;
mod store;

pub use lsn::{EpochSource, LsnAllocator};
pub use query::{CondType, LsnQuery, Query, LSN_COLUMN};
pub use record::{DataState, Lsn, RecordHeader, ReplicationState, WalOp, WalRecord};
pub use ring::{RingWindow, WalCapacity, WalRing};
pub use store::WalStore;
