//! Namespace Engine
//!
//! Couples document storage, the WAL store and the update multiplexer.
//! Every mutation runs under the namespace's writer lock: apply to the
//! data, append to the WAL, dispatch to observers. Holding the lock across
//! all three keeps WAL order, digest stamping and delivery order aligned.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::error::{Error, Result};
use crate::storage::{DocumentStore, NamespaceData};
use crate::updates::UpdatesMultiplexer;
use crate::wal::{
    EpochSource, Lsn, LsnQuery, ReplicationState, WalCapacity, WalOp, WalRecord, WalStore,
};

/// Replication-relevant view of one namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceState {
    pub namespace: String,
    pub epoch: u64,
    pub last_lsn: Option<Lsn>,
    pub data_hash: u64,
    pub data_count: u64,
    pub first_retained: u64,
    pub retained: usize,
}

impl NamespaceState {
    pub fn replication_state(&self) -> ReplicationState {
        ReplicationState {
            epoch: self.epoch,
            last_counter: self.last_lsn.map(|l| l.counter),
            data_hash: self.data_hash,
            data_count: self.data_count,
        }
    }
}

/// Complete content of a namespace at one WAL position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceSnapshot {
    pub namespace: String,
    pub state: ReplicationState,
    pub items: Vec<(String, Bytes)>,
}

/// Result of applying one replicated record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already applied (LSN at or below the local head)
    Duplicate,
    /// Record does not continue the local WAL; the namespace must be resynced
    Gap,
}

pub struct Engine {
    wal: WalStore,
    storage: DocumentStore,
    updates: UpdatesMultiplexer,
    epochs: EpochSource,
}

impl Engine {
    pub fn new(capacity: WalCapacity, updates_buffer: usize) -> Self {
        Self {
            wal: WalStore::new(capacity),
            storage: DocumentStore::new(),
            updates: UpdatesMultiplexer::new(updates_buffer),
            epochs: EpochSource::new(),
        }
    }

    pub fn wal(&self) -> &WalStore {
        &self.wal
    }

    pub fn storage(&self) -> &DocumentStore {
        &self.storage
    }

    pub fn updates(&self) -> &UpdatesMultiplexer {
        &self.updates
    }

    // Local mutations

    /// Take the writer lock of `namespace`. A handle that was renamed,
    /// dropped or replaced while waiting no longer belongs to that name.
    async fn lock_for_write(&self, namespace: &str) -> Result<OwnedMutexGuard<NamespaceData>> {
        let handle = self.storage.handle(namespace).await?;
        let data = Arc::clone(&handle).lock_owned().await;
        match self.storage.handle(namespace).await {
            Ok(current) if Arc::ptr_eq(&current, &handle) => Ok(data),
            _ => Err(Error::NamespaceNotFound(namespace.to_string())),
        }
    }

    pub async fn open_namespace(&self, namespace: &str) -> Result<Arc<WalRecord>> {
        let handle = self.storage.create(namespace).await?;
        let _data = handle.lock().await;

        let epoch = self.epochs.next_epoch();
        let record = match self.wal.open(namespace, epoch).await {
            Ok(record) => record,
            Err(e) => {
                self.storage.remove(namespace).await;
                return Err(e);
            }
        };
        self.updates.on_append(&record);
        tracing::info!("Namespace '{}' opened at epoch {}", namespace, epoch);
        Ok(record)
    }

    pub async fn drop_namespace(&self, namespace: &str) -> Result<Arc<WalRecord>> {
        let _data = self.lock_for_write(namespace).await?;

        let record = self.wal.drop_namespace(namespace).await?;
        self.storage.remove(namespace).await;
        self.updates.on_append(&record);
        tracing::info!("Namespace '{}' dropped at {}", namespace, record.lsn());
        Ok(record)
    }

    pub async fn rename_namespace(&self, from: &str, to: &str) -> Result<Arc<WalRecord>> {
        let mut data = self.lock_for_write(from).await?;
        if self.storage.contains(to).await {
            return Err(Error::NamespaceExists(to.to_string()));
        }

        let to_epoch = self.epochs.next_epoch();
        let record = self.wal.rename(from, to, to_epoch).await?;
        self.storage.rename(&mut data, to).await?;
        self.updates.on_append(&record);
        tracing::info!("Namespace '{}' renamed to '{}' (epoch {})", from, to, to_epoch);
        Ok(record)
    }

    // Storage changes only after the WAL accepted the record
    pub async fn upsert(&self, namespace: &str, key: &str, item: Bytes) -> Result<Lsn> {
        let mut data = self.lock_for_write(namespace).await?;

        let digest = data.digest_with(key, &item);
        let op = WalOp::ItemUpsert {
            key: key.to_string(),
            item: item.clone(),
        };
        let record = self.wal.append(namespace, op, digest).await?;
        data.upsert(key.to_string(), item);
        self.updates.on_append(&record);
        Ok(record.lsn())
    }

    pub async fn delete(&self, namespace: &str, key: &str) -> Result<Lsn> {
        let mut data = self.lock_for_write(namespace).await?;

        let digest = data.digest_without(key)?;
        let op = WalOp::ItemDelete {
            key: key.to_string(),
        };
        let record = self.wal.append(namespace, op, digest).await?;
        data.delete(key)?;
        self.updates.on_append(&record);
        Ok(record.lsn())
    }

    // Reads

    pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<Bytes>> {
        self.storage.get(namespace, key).await
    }

    pub async fn get_from(&self, namespace: &str, from: Lsn) -> Result<Vec<Arc<WalRecord>>> {
        self.wal.get_from(namespace, from).await
    }

    pub async fn query(&self, query: &LsnQuery) -> Result<Vec<Arc<WalRecord>>> {
        query.execute(&self.wal).await
    }

    pub async fn resize(&self, namespace: &str, capacity: WalCapacity) -> Result<usize> {
        self.wal.resize(namespace, capacity).await
    }

    pub async fn namespace_state(&self, namespace: &str) -> Option<NamespaceState> {
        let state = self.wal.state(namespace).await?;
        let window = self.wal.window(namespace).await?;
        Some(NamespaceState {
            namespace: namespace.to_string(),
            epoch: state.epoch,
            last_lsn: state.last_lsn(),
            data_hash: state.data_hash,
            data_count: state.data_count,
            first_retained: window.first_retained,
            retained: window.retained,
        })
    }

    pub async fn namespace_states(&self) -> Vec<NamespaceState> {
        let mut states = Vec::new();
        for namespace in self.wal.namespaces().await {
            if let Some(state) = self.namespace_state(&namespace).await {
                states.push(state);
            }
        }
        states
    }

    pub async fn namespaces(&self) -> Vec<String> {
        self.wal.namespaces().await
    }

    /// Consistent copy of a namespace's items and WAL head
    pub async fn snapshot(&self, namespace: &str) -> Result<NamespaceSnapshot> {
        let handle = self.storage.handle(namespace).await?;
        let data = handle.lock().await;
        let state = self
            .wal
            .state(namespace)
            .await
            .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))?;
        Ok(NamespaceSnapshot {
            namespace: namespace.to_string(),
            state,
            items: data.items(),
        })
    }

    // Replicated mutations

    /// Apply one record received from a master, keeping the master's LSN
    pub async fn apply_replicated(&self, record: WalRecord) -> Result<ApplyOutcome> {
        if record.is_raw() {
            return Ok(ApplyOutcome::Duplicate);
        }
        if !record.verify_checksum() {
            return Err(Error::LogicError(format!(
                "checksum mismatch on record {} of '{}'",
                record.lsn(),
                record.namespace()
            )));
        }
        self.epochs.observe(record.lsn().epoch);

        match &record.op {
            WalOp::NamespaceOpen => self.apply_open(record).await,
            WalOp::NamespaceDrop | WalOp::NamespaceRename { .. } => self.apply_retire(record).await,
            _ => self.apply_item(record).await,
        }
    }

    fn position(local: &ReplicationState, lsn: Lsn) -> ApplyOutcome {
        if local.epoch != lsn.epoch {
            return ApplyOutcome::Gap;
        }
        let next = local.last_counter.map(|c| c + 1).unwrap_or(0);
        if lsn.counter < next {
            ApplyOutcome::Duplicate
        } else if lsn.counter == next {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Gap
        }
    }

    async fn apply_open(&self, record: WalRecord) -> Result<ApplyOutcome> {
        let namespace = record.namespace().to_string();
        if let Some(local) = self.wal.state(&namespace).await {
            if local.epoch == record.lsn().epoch {
                return Ok(ApplyOutcome::Duplicate);
            }
            tracing::debug!(
                "Replacing stale incarnation of '{}' (epoch {} -> {})",
                namespace,
                local.epoch,
                record.lsn().epoch
            );
            self.discard(&namespace).await;
        }

        let handle = self.storage.create(&namespace).await?;
        let _data = handle.lock().await;
        let record = self.wal.open_replicated(record).await?;
        self.updates.on_append(&record);
        Ok(ApplyOutcome::Applied)
    }

    async fn apply_retire(&self, record: WalRecord) -> Result<ApplyOutcome> {
        let namespace = record.namespace().to_string();
        let handle = match self.storage.handle(&namespace).await {
            Ok(handle) => handle,
            Err(_) => return Ok(ApplyOutcome::Gap),
        };
        let mut data = handle.lock().await;
        let local = match self.wal.state(&namespace).await {
            Some(local) => local,
            None => return Ok(ApplyOutcome::Gap),
        };
        match Self::position(&local, record.lsn()) {
            ApplyOutcome::Applied => {}
            other => return Ok(other),
        }

        let rename_to = match &record.op {
            WalOp::NamespaceRename { to, .. } => Some(to.clone()),
            _ => None,
        };
        if let Some(to) = &rename_to {
            if self.storage.contains(to).await {
                // Leftover of an older incarnation of the destination
                self.discard(to).await;
            }
        }

        let record = self.wal.retire_replicated(record).await?;
        match rename_to {
            Some(to) => self.storage.rename(&mut data, &to).await?,
            None => {
                self.storage.remove(&namespace).await;
            }
        }
        self.updates.on_append(&record);
        Ok(ApplyOutcome::Applied)
    }

    async fn apply_item(&self, record: WalRecord) -> Result<ApplyOutcome> {
        let namespace = record.namespace().to_string();
        let handle = match self.storage.handle(&namespace).await {
            Ok(handle) => handle,
            Err(_) => return Ok(ApplyOutcome::Gap),
        };
        let mut data = handle.lock().await;
        let local = match self.wal.state(&namespace).await {
            Some(local) => local,
            None => return Ok(ApplyOutcome::Gap),
        };
        match Self::position(&local, record.lsn()) {
            ApplyOutcome::Applied => {}
            other => return Ok(other),
        }

        let digest = data.apply(&record.op)?;
        let record = self.wal.append_replicated(record, digest).await?;
        tracing::trace!("Applied replicated {} to '{}'", record.lsn(), namespace);
        self.updates.on_append(&record);
        Ok(ApplyOutcome::Applied)
    }

    /// Replace a namespace with a full-sync snapshot. The ring restarts
    /// empty right after the snapshot's head.
    pub async fn install_snapshot(&self, snapshot: NamespaceSnapshot) -> Result<()> {
        let NamespaceSnapshot {
            namespace,
            state,
            items,
        } = snapshot;
        self.epochs.observe(state.epoch);

        let handle = match self.storage.handle(&namespace).await {
            Ok(handle) => handle,
            Err(_) => self.storage.create(&namespace).await?,
        };
        let mut data = handle.lock().await;
        let rebuilt = NamespaceData::from_items(namespace.as_str(), items);
        let digest = rebuilt.state();
        if digest.data_hash != state.data_hash || digest.data_count != state.data_count {
            return Err(Error::LogicError(format!(
                "snapshot of '{}' does not match its own digest",
                namespace
            )));
        }
        *data = rebuilt;
        self.wal
            .install(&namespace, state.epoch, state.last_counter, digest)
            .await;

        tracing::info!(
            "Namespace '{}' installed from snapshot at epoch {} (last {:?}, {} items)",
            namespace,
            state.epoch,
            state.last_counter,
            state.data_count
        );
        Ok(())
    }

    /// Forget a namespace locally without publishing anything
    pub async fn discard(&self, namespace: &str) {
        if let Some(handle) = self.storage.remove(namespace).await {
            let _data = handle.lock().await;
        }
        self.wal.remove(namespace).await;
    }
}
