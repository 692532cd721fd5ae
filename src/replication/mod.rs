//! Replication Module
//!
//! Handles namespace replication between a master and its followers:
//! wire messages, the serving side, the follower loop, the role state
//! machine and master-side sync tools.

pub mod protocol;
mod backoff;
mod client;
mod master;
mod role;
mod sync;

pub use protocol::{unexpected, Message};
pub use backoff::Backoff;
pub use client::{ClientHandle, ClientSettings, ReplicationClient};
pub use master::{MasterService, StreamTarget};
pub use role::{FollowerState, Role, RoleMachine, RoleState, RoleStatus};
pub use sync::SyncCoordinator;
