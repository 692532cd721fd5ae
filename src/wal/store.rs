//! WAL Store
//!
//! Registry of per-namespace rings. Appends to one namespace are
//! serialized by that ring's write lock; readers take a brief read lock
//! and leave with a snapshot of `Arc`ed records.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::record::{DataState, Lsn, ReplicationState, WalOp, WalRecord};
use super::ring::{RingWindow, WalCapacity, WalRing};
use crate::error::{Error, Result};

type RingHandle = Arc<RwLock<WalRing>>;

/// Per-namespace WAL rings of one node
pub struct WalStore {
    rings: RwLock<HashMap<String, RingHandle>>,
    default_capacity: WalCapacity,
}

impl WalStore {
    pub fn new(default_capacity: WalCapacity) -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub fn default_capacity(&self) -> WalCapacity {
        self.default_capacity
    }

    async fn ring(&self, namespace: &str) -> Result<RingHandle> {
        self.rings
            .read()
            .await
            .get(namespace)
            .cloned()
            .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))
    }

    fn retired(namespace: &str) -> Error {
        Error::NamespaceNotFound(namespace.to_string())
    }

    /// Create the ring of a new namespace incarnation and append its
    /// `NamespaceOpen` record (counter 0)
    pub async fn open(&self, namespace: &str, epoch: u64) -> Result<Arc<WalRecord>> {
        let mut rings = self.rings.write().await;
        if rings.contains_key(namespace) {
            return Err(Error::NamespaceExists(namespace.to_string()));
        }

        let mut ring = WalRing::new(namespace, epoch, self.default_capacity);
        let record = ring.append(WalOp::NamespaceOpen, DataState::default());
        rings.insert(namespace.to_string(), Arc::new(RwLock::new(ring)));

        tracing::debug!("WAL ring opened for '{}' at epoch {}", namespace, epoch);
        Ok(record)
    }

    /// Open a namespace from a replicated `NamespaceOpen` record
    pub async fn open_replicated(&self, record: WalRecord) -> Result<Arc<WalRecord>> {
        let namespace = record.namespace().to_string();
        let mut rings = self.rings.write().await;
        if rings.contains_key(&namespace) {
            return Err(Error::NamespaceExists(namespace));
        }

        let mut ring = WalRing::new(&namespace, record.lsn().epoch, self.default_capacity);
        let record = ring.append_replicated(record, DataState::default())?;
        rings.insert(namespace, Arc::new(RwLock::new(ring)));
        Ok(record)
    }

    /// Install (or replace) a ring positioned at a full-sync head.
    ///
    /// A replaced ring keeps its configured capacity.
    pub async fn install(
        &self,
        namespace: &str,
        epoch: u64,
        last: Option<u64>,
        data: DataState,
    ) -> WalCapacity {
        let mut rings = self.rings.write().await;
        let capacity = match rings.get(namespace) {
            Some(existing) => existing.read().await.capacity(),
            None => self.default_capacity,
        };
        let ring = WalRing::resume(namespace, epoch, last, data, capacity);
        rings.insert(namespace.to_string(), Arc::new(RwLock::new(ring)));
        capacity
    }

    /// Assign the next LSN, store the record, evict overflow
    pub async fn append(&self, namespace: &str, op: WalOp, data: DataState) -> Result<Arc<WalRecord>> {
        let ring = self.ring(namespace).await?;
        let mut ring = ring.write().await;
        if ring.is_retired() {
            return Err(Self::retired(namespace));
        }
        Ok(ring.append(op, data))
    }

    /// Store a record received from a master, verifying LSN continuity
    pub async fn append_replicated(&self, record: WalRecord, data: DataState) -> Result<Arc<WalRecord>> {
        let ring = self.ring(record.namespace()).await?;
        let mut ring = ring.write().await;
        if ring.is_retired() {
            return Err(Self::retired(record.namespace()));
        }
        ring.append_replicated(record, data)
    }

    /// Check that `lsn` would be accepted by `append_replicated`
    pub async fn expect_next(&self, namespace: &str, lsn: Lsn) -> Result<()> {
        let ring = self.ring(namespace).await?;
        let ring = ring.read().await;
        ring.expect_next(lsn)
    }

    /// All records with LSN > `from`, preceded by a raw state record
    pub async fn get_from(&self, namespace: &str, from: Lsn) -> Result<Vec<Arc<WalRecord>>> {
        self.read_after(namespace, from.epoch, Some(from.counter)).await
    }

    /// Records after `after` (`None`: from the beginning of the epoch)
    pub async fn read_after(
        &self,
        namespace: &str,
        epoch: u64,
        after: Option<u64>,
    ) -> Result<Vec<Arc<WalRecord>>> {
        let ring = self.ring(namespace).await?;
        let ring = ring.read().await;
        ring.read_after(epoch, after)
    }

    /// Change a namespace's retention window
    pub async fn resize(&self, namespace: &str, capacity: WalCapacity) -> Result<usize> {
        let ring = self.ring(namespace).await?;
        let evicted = ring.write().await.resize(capacity);
        if evicted > 0 {
            tracing::info!(
                "WAL of '{}' resized to {:?}, evicted {} records",
                namespace,
                capacity,
                evicted
            );
        }
        Ok(evicted)
    }

    /// Publish the final `NamespaceDrop` record and discard the ring
    pub async fn drop_namespace(&self, namespace: &str) -> Result<Arc<WalRecord>> {
        let mut rings = self.rings.write().await;
        let ring = rings
            .remove(namespace)
            .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))?;
        let record = ring.write().await.retire(WalOp::NamespaceDrop);
        Ok(record)
    }

    /// Publish a `NamespaceRename` record on the source and start the
    /// destination ring at `to_epoch`
    pub async fn rename(&self, from: &str, to: &str, to_epoch: u64) -> Result<Arc<WalRecord>> {
        let mut rings = self.rings.write().await;
        if rings.contains_key(to) {
            return Err(Error::NamespaceExists(to.to_string()));
        }
        let ring = rings
            .remove(from)
            .ok_or_else(|| Error::NamespaceNotFound(from.to_string()))?;

        let mut source = ring.write().await;
        let record = source.retire(WalOp::NamespaceRename {
            to: to.to_string(),
            to_epoch,
        });
        let destination = WalRing::resume(to, to_epoch, None, data_of(&source.state()), source.capacity());
        drop(source);

        rings.insert(to.to_string(), Arc::new(RwLock::new(destination)));
        Ok(record)
    }

    /// Apply a replicated drop / rename record
    pub async fn retire_replicated(&self, record: WalRecord) -> Result<Arc<WalRecord>> {
        let namespace = record.namespace().to_string();
        let mut rings = self.rings.write().await;
        let ring = rings
            .get(&namespace)
            .cloned()
            .ok_or_else(|| Error::NamespaceNotFound(namespace.clone()))?;

        let destination = match &record.op {
            WalOp::NamespaceRename { to, to_epoch } => {
                if rings.contains_key(to) {
                    return Err(Error::NamespaceExists(to.clone()));
                }
                Some((to.clone(), *to_epoch))
            }
            WalOp::NamespaceDrop => None,
            other => {
                return Err(Error::LogicError(format!(
                    "{} cannot retire namespace '{}'",
                    other.kind_name(),
                    namespace
                )))
            }
        };

        let mut source = ring.write().await;
        let record = source.retire_replicated(record)?;
        rings.remove(&namespace);
        if let Some((to, to_epoch)) = destination {
            let ring = WalRing::resume(&to, to_epoch, None, data_of(&source.state()), source.capacity());
            rings.insert(to, Arc::new(RwLock::new(ring)));
        }
        Ok(record)
    }

    /// Discard a ring without publishing anything
    pub async fn remove(&self, namespace: &str) -> bool {
        self.rings.write().await.remove(namespace).is_some()
    }

    pub async fn state(&self, namespace: &str) -> Option<ReplicationState> {
        let ring = self.ring(namespace).await.ok()?;
        let state = ring.read().await.state();
        Some(state)
    }

    pub async fn window(&self, namespace: &str) -> Option<RingWindow> {
        let ring = self.ring(namespace).await.ok()?;
        let window = ring.read().await.window();
        Some(window)
    }

    pub async fn capacity(&self, namespace: &str) -> Option<WalCapacity> {
        let ring = self.ring(namespace).await.ok()?;
        let capacity = ring.read().await.capacity();
        Some(capacity)
    }

    pub async fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rings.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

fn data_of(state: &ReplicationState) -> DataState {
    DataState {
        data_hash: state.data_hash,
        data_count: state.data_count,
    }
}
