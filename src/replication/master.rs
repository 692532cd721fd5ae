//! Master Service
//!
//! Serving side of replication: handshakes, GetFrom catch-up, full
//! snapshots, follower reports and live update streams. Streams are fed by
//! the node's update multiplexer, so followers see records in the same
//! per-namespace order as local observers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::protocol::Message;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::network::ReplicationService;
use crate::state::PeerTracker;
use crate::updates::{SubscriptionMode, UpdatesObserver};
use crate::wal::WalRecord;

/// Forwards multiplexer deliveries into one follower's stream
struct StreamObserver {
    node_id: String,
    namespaces: Vec<String>,
    tx: mpsc::Sender<Message>,
    dropped: AtomicU64,
}

impl StreamObserver {
    fn replicates(&self, namespace: &str) -> bool {
        self.namespaces.is_empty() || self.namespaces.iter().any(|n| n == namespace)
    }
}

impl UpdatesObserver for StreamObserver {
    fn on_update(&self, record: &WalRecord) {
        if !self.replicates(record.namespace()) {
            return;
        }
        match self.tx.try_send(Message::Update(record.clone())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                // The follower sees the gap and catches up with GetFrom
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::trace!(
                    "Stream to '{}' full, dropped {} ({} total)",
                    self.node_id,
                    record.lsn(),
                    dropped
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Stream of a connected follower, as used by forced syncs
pub struct StreamTarget {
    pub node_id: String,
    pub namespaces: Vec<String>,
    pub tx: mpsc::Sender<Message>,
}

impl StreamTarget {
    pub fn replicates(&self, namespace: &str) -> bool {
        self.namespaces.is_empty() || self.namespaces.iter().any(|n| n == namespace)
    }
}

/// Replication service of a master or cluster member
pub struct MasterService {
    node_id: String,
    engine: Arc<Engine>,
    peers: Arc<PeerTracker>,
    cluster_id: RwLock<u32>,
    streams: Mutex<HashMap<String, Arc<StreamObserver>>>,
    stream_capacity: usize,
}

impl MasterService {
    pub fn new(node_id: String, engine: Arc<Engine>, peers: Arc<PeerTracker>, stream_capacity: usize) -> Self {
        Self {
            node_id,
            engine,
            peers,
            cluster_id: RwLock::new(0),
            streams: Mutex::new(HashMap::new()),
            stream_capacity: stream_capacity.max(1),
        }
    }

    pub fn set_cluster_id(&self, cluster_id: u32) {
        *self.cluster_id.write() = cluster_id;
    }

    pub fn peers(&self) -> &Arc<PeerTracker> {
        &self.peers
    }

    /// Live follower streams
    pub fn stream_targets(&self) -> Vec<StreamTarget> {
        self.streams
            .lock()
            .values()
            .filter(|s| !s.tx.is_closed())
            .map(|s| StreamTarget {
                node_id: s.node_id.clone(),
                namespaces: s.namespaces.clone(),
                tx: s.tx.clone(),
            })
            .collect()
    }

    fn close_stream(&self, node_id: &str) {
        let removed = self.streams.lock().remove(node_id);
        if let Some(stream) = removed {
            self.engine.updates().unsubscribe(&stream);
        }
    }

    fn prune_closed_streams(&self) {
        let closed: Vec<Arc<StreamObserver>> = {
            let mut streams = self.streams.lock();
            let ids: Vec<String> = streams
                .iter()
                .filter(|(_, s)| s.tx.is_closed())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| streams.remove(id)).collect()
        };
        for stream in closed {
            tracing::debug!("Stream to '{}' closed by follower", stream.node_id);
            self.engine.updates().unsubscribe(&stream);
        }
    }

    /// Drop every follower stream and forget all peers
    pub async fn close_all(&self) {
        let streams: Vec<Arc<StreamObserver>> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in &streams {
            self.engine.updates().unsubscribe(stream);
        }
        self.peers.clear().await;
        if !streams.is_empty() {
            tracing::info!("Closed {} follower streams", streams.len());
        }
    }

    async fn handle_hello(
        &self,
        node_id: String,
        app_name: String,
        cluster_id: u32,
        namespaces: Vec<String>,
    ) -> Message {
        let own_cluster = *self.cluster_id.read();
        if own_cluster != 0 && cluster_id != own_cluster {
            let err = Error::ClusterMismatch {
                master: own_cluster,
                replica: cluster_id,
            };
            tracing::warn!("Rejected follower '{}': {}", node_id, err);
            return Message::error(&err, None);
        }

        let states = self
            .engine
            .namespace_states()
            .await
            .into_iter()
            .filter(|s| namespaces.is_empty() || namespaces.contains(&s.namespace))
            .collect();
        self.peers.register(&node_id, &app_name, namespaces).await;

        Message::Welcome {
            master_id: self.node_id.clone(),
            cluster_id: own_cluster,
            namespaces: states,
        }
    }
}

#[async_trait]
impl ReplicationService for MasterService {
    async fn handle(&self, message: Message) -> Message {
        match message {
            Message::Hello {
                node_id,
                app_name,
                cluster_id,
                namespaces,
            } => self.handle_hello(node_id, app_name, cluster_id, namespaces).await,

            Message::GetFrom {
                node_id,
                namespace,
                epoch,
                after,
            } => {
                self.peers.mark_syncing(&node_id).await;
                match self.engine.wal().read_after(&namespace, epoch, after).await {
                    Ok(records) => {
                        tracing::debug!(
                            "Serving {} records of '{}' after {:?} to '{}'",
                            records.len().saturating_sub(1),
                            namespace,
                            after,
                            node_id
                        );
                        Message::Records {
                            records: records.iter().map(|r| (**r).clone()).collect(),
                            namespace,
                        }
                    }
                    Err(e) => Message::error(&e, Some(&namespace)),
                }
            }

            Message::SnapshotRequest { node_id, namespace } => {
                self.peers.mark_syncing(&node_id).await;
                match self.engine.snapshot(&namespace).await {
                    Ok(snapshot) => {
                        tracing::info!(
                            "Full sync of '{}' for '{}' ({} items)",
                            namespace,
                            node_id,
                            snapshot.items.len()
                        );
                        Message::Snapshot(snapshot)
                    }
                    Err(e) => Message::error(&e, Some(&namespace)),
                }
            }

            Message::Report { node_id, namespaces } => {
                self.prune_closed_streams();
                if self.peers.record_report(&node_id, &namespaces).await {
                    Message::Ack
                } else {
                    Message::error(
                        &Error::Replication(format!("unknown follower '{}'", node_id)),
                        None,
                    )
                }
            }

            Message::Goodbye { node_id } => {
                self.close_stream(&node_id);
                self.peers.remove(&node_id).await;
                Message::Ack
            }

            other => Message::error(
                &Error::Replication(format!("unexpected request {}", other.type_name())),
                None,
            ),
        }
    }

    async fn open_stream(&self, node_id: &str, namespaces: Vec<String>) -> Result<mpsc::Receiver<Message>> {
        let (tx, rx) = mpsc::channel(self.stream_capacity);
        let observer = Arc::new(StreamObserver {
            node_id: node_id.to_string(),
            namespaces: namespaces.clone(),
            tx,
            dropped: AtomicU64::new(0),
        });

        self.close_stream(node_id);
        self.engine
            .updates()
            .subscribe(observer.clone(), namespaces, SubscriptionMode::Replace);
        self.streams.lock().insert(node_id.to_string(), observer);
        tracing::debug!("Opened update stream for '{}'", node_id);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::WalCapacity;
    use bytes::Bytes;
    use std::time::Duration;

    async fn master() -> (Arc<Engine>, MasterService) {
        let engine = Arc::new(Engine::new(WalCapacity::records(100), 1000));
        let peers = Arc::new(PeerTracker::new(Duration::from_secs(5)));
        let service = MasterService::new("master".into(), Arc::clone(&engine), peers, 64);
        (engine, service)
    }

    fn hello(cluster_id: u32, namespaces: Vec<String>) -> Message {
        Message::Hello {
            node_id: "slave".into(),
            app_name: "test".into(),
            cluster_id,
            namespaces,
        }
    }

    #[tokio::test]
    async fn test_hello_lists_allowed_namespaces() {
        let (engine, service) = master().await;
        engine.open_namespace("ns1").await.unwrap();
        engine.open_namespace("ns2").await.unwrap();

        match service.handle(hello(0, vec!["ns2".into()])).await {
            Message::Welcome { namespaces, .. } => {
                assert_eq!(namespaces.len(), 1);
                assert_eq!(namespaces[0].namespace, "ns2");
            }
            other => panic!("unexpected reply {:?}", other),
        }
        assert!(service.peers().get("slave").await.is_some());
    }

    #[tokio::test]
    async fn test_cluster_id_mismatch_is_rejected() {
        let (_engine, service) = master().await;
        service.set_cluster_id(5);

        let reply = service.handle(hello(6, Vec::new())).await;
        assert!(matches!(reply.into_result(), Err(Error::Config(_))));
        assert!(service.handle(hello(5, Vec::new())).await.into_result().is_ok());
    }

    #[tokio::test]
    async fn test_get_from_outside_window_is_outdated() {
        let (engine, service) = master().await;
        let open = engine.open_namespace("some").await.unwrap();
        for i in 0..200 {
            engine.upsert("some", &i.to_string(), Bytes::from_static(b"x")).await.unwrap();
        }

        let request = |after| Message::GetFrom {
            node_id: "slave".into(),
            namespace: "some".into(),
            epoch: open.lsn().epoch,
            after: Some(after),
        };
        assert!(matches!(
            service.handle(request(10)).await.into_result(),
            Err(Error::OutdatedWal { .. })
        ));
        match service.handle(request(150)).await {
            Message::Records { records, .. } => assert_eq!(records.len(), 51),
            other => panic!("unexpected reply {:?}", other),
        }
        assert!(matches!(
            service.handle(request(u64::MAX)).await.into_result(),
            Err(Error::OutdatedWal { .. })
        ));
    }

    #[tokio::test]
    async fn test_stream_carries_allowed_updates() {
        let (engine, service) = master().await;
        engine.open_namespace("ns1").await.unwrap();
        engine.open_namespace("ns2").await.unwrap();

        let mut stream = service.open_stream("slave", vec!["ns1".into()]).await.unwrap();
        engine.upsert("ns2", "a", Bytes::from_static(b"2")).await.unwrap();
        engine.upsert("ns1", "a", Bytes::from_static(b"1")).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        match message {
            Message::Update(record) => assert_eq!(record.namespace(), "ns1"),
            other => panic!("unexpected message {:?}", other),
        }

        service.handle(Message::Goodbye { node_id: "slave".into() }).await;
        assert!(service.stream_targets().is_empty());
        assert_eq!(engine.updates().subscriber_count(), 0);
    }
}
