//! Sync Coordinator
//!
//! Master-side convergence tools. `force_sync` pushes a full copy of every
//! namespace a follower replicates down its update stream, followed by
//! `SyncComplete`. `wait_sync` polls follower reports until every live peer
//! tracking a namespace reports the local replication state.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::master::MasterService;
use super::protocol::Message;
use crate::engine::Engine;
use crate::error::{Error, Result};

pub struct SyncCoordinator {
    engine: Arc<Engine>,
    master: Arc<MasterService>,
    poll_interval: Duration,
    send_timeout: Duration,
}

impl SyncCoordinator {
    pub fn new(
        engine: Arc<Engine>,
        master: Arc<MasterService>,
        poll_interval: Duration,
        send_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            master,
            poll_interval,
            send_timeout,
        }
    }

    /// Push complete datasets to all connected followers.
    /// Returns the number of followers that received the full push.
    pub async fn force_sync(&self) -> Result<usize> {
        let targets = self.master.stream_targets();
        let namespaces = self.engine.namespaces().await;
        let mut pushed = 0;

        for target in targets {
            let mut complete = true;
            for namespace in namespaces.iter().filter(|n| target.replicates(n)) {
                let snapshot = match self.engine.snapshot(namespace).await {
                    Ok(snapshot) => snapshot,
                    // Dropped concurrently; the follower learns it from the stream
                    Err(Error::NamespaceNotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                if target
                    .tx
                    .send_timeout(Message::Snapshot(snapshot), self.send_timeout)
                    .await
                    .is_err()
                {
                    tracing::warn!("Forced sync to '{}' failed, stream unavailable", target.node_id);
                    complete = false;
                    break;
                }
            }
            if complete
                && target
                    .tx
                    .send_timeout(Message::SyncComplete, self.send_timeout)
                    .await
                    .is_ok()
            {
                pushed += 1;
            }
        }

        tracing::info!("Forced sync pushed to {} followers", pushed);
        Ok(pushed)
    }

    /// Wait until every live follower of `namespace` reports the local state
    pub async fn wait_sync(&self, namespace: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let local = self
                .engine
                .namespace_state(namespace)
                .await
                .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))?
                .replication_state();

            let lagging: Vec<String> = self
                .master
                .peers()
                .tracking(namespace)
                .await
                .into_iter()
                .filter(|peer| {
                    !peer
                        .reported
                        .get(namespace)
                        .is_some_and(|reported| reported.converged_with(&local))
                })
                .map(|peer| peer.id)
                .collect();
            if lagging.is_empty() {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!("'{}' still lagging on {:?}", namespace, lagging);
                return Err(Error::SyncTimeout {
                    namespace: namespace.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NamespaceState;
    use crate::network::ReplicationService;
    use crate::state::PeerTracker;
    use crate::wal::WalCapacity;
    use bytes::Bytes;

    fn setup() -> (Arc<Engine>, Arc<MasterService>, SyncCoordinator) {
        let engine = Arc::new(Engine::new(WalCapacity::records(100), 1000));
        let peers = Arc::new(PeerTracker::new(Duration::from_secs(5)));
        let master = Arc::new(MasterService::new("master".into(), Arc::clone(&engine), peers, 64));
        let sync = SyncCoordinator::new(
            Arc::clone(&engine),
            Arc::clone(&master),
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        (engine, master, sync)
    }

    #[tokio::test]
    async fn test_wait_sync_without_peers() {
        let (engine, _master, sync) = setup();
        engine.open_namespace("ns1").await.unwrap();
        sync.wait_sync("ns1", Duration::from_millis(50)).await.unwrap();
        assert!(matches!(
            sync.wait_sync("missing", Duration::from_millis(50)).await,
            Err(Error::NamespaceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_sync_times_out_on_lagging_peer() {
        let (engine, master, sync) = setup();
        engine.open_namespace("ns1").await.unwrap();
        let stale: NamespaceState = engine.namespace_state("ns1").await.unwrap();
        engine.upsert("ns1", "a", Bytes::from_static(b"1")).await.unwrap();

        master.peers().register("slave", "test", Vec::new()).await;
        master.peers().record_report("slave", &[stale]).await;
        assert!(matches!(
            sync.wait_sync("ns1", Duration::from_millis(50)).await,
            Err(Error::SyncTimeout { .. })
        ));

        let current = engine.namespace_state("ns1").await.unwrap();
        master.peers().record_report("slave", &[current]).await;
        sync.wait_sync("ns1", Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn test_force_sync_pushes_snapshots() {
        let (engine, master, sync) = setup();
        engine.open_namespace("ns1").await.unwrap();
        engine.open_namespace("ns2").await.unwrap();
        engine.upsert("ns1", "a", Bytes::from_static(b"1")).await.unwrap();

        let mut stream = master.open_stream("slave", vec!["ns1".into()]).await.unwrap();
        assert_eq!(sync.force_sync().await.unwrap(), 1);

        let mut snapshots = Vec::new();
        loop {
            match stream.recv().await.unwrap() {
                Message::Snapshot(snapshot) => snapshots.push(snapshot.namespace),
                Message::SyncComplete => break,
                _ => {}
            }
        }
        assert_eq!(snapshots, vec!["ns1".to_string()]);
    }
}
