//! Replication role state machine
//!
//! `Idle`, `Master`, `Slave{..}` and `ClusterMember{..}` states, published
//! through a watch channel. Every role change starts a new role epoch; a
//! follower loop only updates the status while its epoch is current, so a
//! cancelled loop can never overwrite the state of its successor.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Configured role of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    None,
    Master,
    Slave,
    ClusterMember,
}

impl Role {
    /// Roles that follow another node
    pub fn follows(&self) -> bool {
        matches!(self, Role::Slave | Role::ClusterMember)
    }

    /// Roles that can be followed
    pub fn serves(&self) -> bool {
        matches!(self, Role::Master | Role::ClusterMember)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::None => write!(f, "none"),
            Role::Master => write!(f, "master"),
            Role::Slave => write!(f, "slave"),
            Role::ClusterMember => write!(f, "cluster_member"),
        }
    }
}

/// Progress of a following node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FollowerState {
    Connecting,
    Syncing,
    Synced,
    /// Parked until SwitchMaster or ForceSync
    Error,
}

/// Current state of the role machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleState {
    Idle,
    Master,
    Slave(FollowerState),
    ClusterMember(FollowerState),
}

impl RoleState {
    /// Entry state of `role`
    pub fn initial(role: Role) -> Self {
        match role {
            Role::None => RoleState::Idle,
            Role::Master => RoleState::Master,
            Role::Slave => RoleState::Slave(FollowerState::Connecting),
            Role::ClusterMember => RoleState::ClusterMember(FollowerState::Connecting),
        }
    }

    pub fn follower_state(&self) -> Option<FollowerState> {
        match self {
            RoleState::Slave(s) | RoleState::ClusterMember(s) => Some(*s),
            _ => None,
        }
    }

    fn with_follower_state(self, state: FollowerState) -> Self {
        match self {
            RoleState::Slave(_) => RoleState::Slave(state),
            RoleState::ClusterMember(_) => RoleState::ClusterMember(state),
            other => other,
        }
    }
}

/// Snapshot of the role machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleStatus {
    pub role: Role,
    pub state: RoleState,
    pub master_dsn: Option<String>,
    pub connected: bool,
    pub last_error: Option<String>,
    pub role_epoch: u64,
}

impl Default for RoleStatus {
    fn default() -> Self {
        Self {
            role: Role::None,
            state: RoleState::Idle,
            master_dsn: None,
            connected: false,
            last_error: None,
            role_epoch: 0,
        }
    }
}

/// Publisher of the role status
pub struct RoleMachine {
    tx: watch::Sender<RoleStatus>,
}

impl RoleMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RoleStatus::default());
        Self { tx }
    }

    pub fn status(&self) -> RoleStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RoleStatus> {
        self.tx.subscribe()
    }

    /// Enter `role`, starting a new role epoch
    pub fn begin(&self, role: Role, master_dsn: Option<String>) -> u64 {
        let mut epoch = 0;
        self.tx.send_modify(|status| {
            status.role_epoch += 1;
            status.role = role;
            status.state = RoleState::initial(role);
            status.master_dsn = master_dsn;
            status.connected = false;
            status.last_error = None;
            epoch = status.role_epoch;
        });
        tracing::info!("Role changed to {} (role epoch {})", role, epoch);
        epoch
    }

    /// Move a follower to `state`. Ignored once `epoch` is no longer current.
    pub fn set_follower_state(&self, epoch: u64, state: FollowerState, error: Option<String>) -> bool {
        self.tx.send_if_modified(|status| {
            if status.role_epoch != epoch || status.state.follower_state().is_none() {
                return false;
            }
            let next = status.state.with_follower_state(state);
            let changed = status.state != next || error.is_some();
            if status.state != next {
                tracing::debug!("{:?} -> {:?}", status.state, next);
            }
            status.state = next;
            if error.is_some() {
                status.last_error = error;
            }
            changed
        })
    }

    pub fn set_connected(&self, epoch: u64, connected: bool) -> bool {
        self.tx.send_if_modified(|status| {
            if status.role_epoch != epoch || status.connected == connected {
                return false;
            }
            status.connected = connected;
            true
        })
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.tx.borrow().role_epoch == epoch
    }

    /// Wait until the status satisfies `predicate`
    pub async fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> Result<RoleStatus>
    where
        F: FnMut(&RoleStatus) -> bool,
    {
        let mut rx = self.tx.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            loop {
                {
                    let status = rx.borrow_and_update();
                    if predicate(&status) {
                        return Ok(status.clone());
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(Error::ShuttingDown);
                }
            }
        })
        .await;
        match waited {
            Ok(result) => result,
            Err(_) => Err(Error::Replication(format!(
                "role status not reached within {}ms (now {:?})",
                timeout.as_millis(),
                self.status().state
            ))),
        }
    }
}

impl Default for RoleMachine {
    fn default() -> Self {
        Self::new()
    }
}
