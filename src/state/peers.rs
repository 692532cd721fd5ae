//! Peer Tracking
//!
//! Followers connected to a serving node: identity, allow-list, what they
//! last reported per namespace, and liveness.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::engine::NamespaceState;
use crate::wal::ReplicationState;

/// Peer status as seen by the node it follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    /// Handshake done, nothing reported yet
    Joining,
    /// Catching up (GetFrom or snapshot in progress)
    Syncing,
    /// Reporting regularly
    Active,
    /// Missed heartbeats beyond the peer timeout
    Offline,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerStatus::Joining => write!(f, "JOINING"),
            PeerStatus::Syncing => write!(f, "SYNCING"),
            PeerStatus::Active => write!(f, "ACTIVE"),
            PeerStatus::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// State of a single peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerState {
    pub id: String,
    pub app_name: String,
    /// Replicated namespaces (empty = all)
    pub namespaces: Vec<String>,
    pub status: PeerStatus,
    /// Last reported state per namespace
    pub reported: HashMap<String, ReplicationState>,
    /// Last heartbeat time (not serialized)
    #[serde(skip)]
    pub last_heartbeat: Option<Instant>,
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

impl PeerState {
    pub fn new(id: String, app_name: String, namespaces: Vec<String>) -> Self {
        Self {
            id,
            app_name,
            namespaces,
            status: PeerStatus::Joining,
            reported: HashMap::new(),
            last_heartbeat: Some(Instant::now()),
            joined_at: chrono::Utc::now(),
        }
    }

    /// Check if the peer is healthy (received heartbeat recently)
    pub fn is_healthy(&self, timeout: Duration) -> bool {
        match self.last_heartbeat {
            Some(last) => last.elapsed() < timeout,
            None => false,
        }
    }

    pub fn touch(&mut self) {
        self.last_heartbeat = Some(Instant::now());
    }

    pub fn replicates(&self, namespace: &str) -> bool {
        self.namespaces.is_empty() || self.namespaces.iter().any(|n| n == namespace)
    }
}

/// Peer registry of a serving node
pub struct PeerTracker {
    peers: RwLock<HashMap<String, PeerState>>,
    peer_timeout: Duration,
}

impl PeerTracker {
    pub fn new(peer_timeout: Duration) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            peer_timeout,
        }
    }

    /// Register (or re-register) a peer after its handshake
    pub async fn register(&self, id: &str, app_name: &str, namespaces: Vec<String>) {
        let mut peers = self.peers.write().await;
        let rejoined = peers.contains_key(id);
        peers.insert(
            id.to_string(),
            PeerState::new(id.to_string(), app_name.to_string(), namespaces),
        );
        if rejoined {
            tracing::info!("Peer '{}' ({}) rejoined", id, app_name);
        } else {
            tracing::info!("Peer '{}' ({}) joined", id, app_name);
        }
    }

    pub async fn remove(&self, id: &str) -> Option<PeerState> {
        let removed = self.peers.write().await.remove(id);
        if removed.is_some() {
            tracing::info!("Peer '{}' left", id);
        }
        removed
    }

    pub async fn mark_syncing(&self, id: &str) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(id) {
            peer.touch();
            if peer.status != PeerStatus::Active {
                peer.status = PeerStatus::Syncing;
            }
        }
    }

    /// Record a heartbeat report. Returns false for unknown peers.
    pub async fn record_report(&self, id: &str, states: &[NamespaceState]) -> bool {
        let mut peers = self.peers.write().await;
        let Some(peer) = peers.get_mut(id) else {
            tracing::warn!("Report from unknown peer '{}'", id);
            return false;
        };
        peer.touch();
        peer.reported = states
            .iter()
            .map(|s| (s.namespace.clone(), s.replication_state()))
            .collect();
        if peer.status != PeerStatus::Active {
            tracing::debug!("Peer '{}' is now active", id);
            peer.status = PeerStatus::Active;
        }
        true
    }

    /// Mark silent peers offline; returns the ids that changed
    pub async fn check_timeouts(&self) -> Vec<String> {
        let mut peers = self.peers.write().await;
        let mut timed_out = Vec::new();
        for (id, peer) in peers.iter_mut() {
            if peer.status != PeerStatus::Offline && !peer.is_healthy(self.peer_timeout) {
                peer.status = PeerStatus::Offline;
                timed_out.push(id.clone());
            }
        }
        for id in &timed_out {
            tracing::warn!("Peer '{}' missed heartbeats, marked offline", id);
        }
        timed_out
    }

    pub async fn get(&self, id: &str) -> Option<PeerState> {
        self.peers.read().await.get(id).cloned()
    }

    /// Peers that are not offline
    pub async fn live_peers(&self) -> Vec<PeerState> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.status != PeerStatus::Offline)
            .cloned()
            .collect()
    }

    /// Live peers replicating `namespace`
    pub async fn tracking(&self, namespace: &str) -> Vec<PeerState> {
        self.live_peers()
            .await
            .into_iter()
            .filter(|p| p.replicates(namespace))
            .collect()
    }

    pub async fn clear(&self) {
        self.peers.write().await.clear();
    }

    pub async fn summary(&self) -> PeerSummary {
        let peers = self.peers.read().await;
        let mut summary = PeerSummary {
            total_peers: peers.len(),
            ..PeerSummary::default()
        };
        for peer in peers.values() {
            match peer.status {
                PeerStatus::Joining => summary.joining_peers += 1,
                PeerStatus::Syncing => summary.syncing_peers += 1,
                PeerStatus::Active => summary.active_peers += 1,
                PeerStatus::Offline => summary.offline_peers += 1,
            }
        }
        summary
    }
}

/// Peer summary information
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub total_peers: usize,
    pub joining_peers: usize,
    pub syncing_peers: usize,
    pub active_peers: usize,
    pub offline_peers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::Lsn;

    fn state(namespace: &str, counter: u64) -> NamespaceState {
        NamespaceState {
            namespace: namespace.into(),
            epoch: 1,
            last_lsn: Some(Lsn::new(1, counter)),
            data_hash: counter,
            data_count: counter,
            first_retained: 0,
            retained: counter as usize,
        }
    }

    #[tokio::test]
    async fn test_peer_lifecycle() {
        let peers = PeerTracker::new(Duration::from_secs(5));
        peers.register("node-2", "app", vec!["ns1".into()]).await;
        assert_eq!(peers.get("node-2").await.unwrap().status, PeerStatus::Joining);

        peers.mark_syncing("node-2").await;
        assert_eq!(peers.get("node-2").await.unwrap().status, PeerStatus::Syncing);

        assert!(peers.record_report("node-2", &[state("ns1", 7)]).await);
        let peer = peers.get("node-2").await.unwrap();
        assert_eq!(peer.status, PeerStatus::Active);
        assert_eq!(peer.reported["ns1"].last_counter, Some(7));

        assert_eq!(peers.tracking("ns1").await.len(), 1);
        assert!(peers.tracking("ns2").await.is_empty());

        assert!(!peers.record_report("node-9", &[]).await);
        assert!(peers.remove("node-2").await.is_some());
        assert_eq!(peers.summary().await.total_peers, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_timeout() {
        let peers = PeerTracker::new(Duration::from_millis(50));
        peers.register("node-2", "app", Vec::new()).await;
        peers.record_report("node-2", &[]).await;
        assert!(peers.check_timeouts().await.is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(peers.check_timeouts().await, vec!["node-2".to_string()]);
        assert!(peers.live_peers().await.is_empty());
        assert_eq!(peers.summary().await.offline_peers, 1);

        // A report brings it back
        peers.record_report("node-2", &[]).await;
        assert_eq!(peers.live_peers().await.len(), 1);
    }
}
