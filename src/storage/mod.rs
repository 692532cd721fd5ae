//! Document Storage
//!
//! In-memory namespace data standing in for the storage engine. Each
//! namespace keeps an order-independent content hash and an item count,
//! updated incrementally on every mutation so the digest can be stamped
//! into the WAL next to the record that produced it.
//!
//! A namespace's mutex doubles as its writer lock: the node holds it while
//! applying a mutation, appending the WAL record and dispatching updates.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::wal::{DataState, WalOp};

/// Hash contribution of one item
pub fn item_hash(key: &str, item: &[u8]) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(key.as_bytes());
    hasher.update(item);
    hasher.finalize() as u64
}

/// Items of one namespace
#[derive(Debug)]
pub struct NamespaceData {
    name: String,
    items: HashMap<String, Bytes>,
    data: DataState,
}

impl NamespaceData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: HashMap::new(),
            data: DataState::default(),
        }
    }

    /// Build from a full item set (full sync)
    pub fn from_items(name: impl Into<String>, items: Vec<(String, Bytes)>) -> Self {
        let mut data = Self::new(name);
        for (key, item) in items {
            data.upsert(key, item);
        }
        data
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert or replace an item, returning the digest afterwards
    pub fn upsert(&mut self, key: String, item: Bytes) -> DataState {
        let added = item_hash(&key, &item);
        match self.items.insert(key.clone(), item) {
            Some(previous) => {
                let removed = item_hash(&key, &previous);
                self.data.data_hash = self.data.data_hash.wrapping_sub(removed).wrapping_add(added);
            }
            None => {
                self.data.data_hash = self.data.data_hash.wrapping_add(added);
                self.data.data_count += 1;
            }
        }
        self.data
    }

    /// Delete an item, returning the digest afterwards
    pub fn delete(&mut self, key: &str) -> Result<DataState> {
        let item = self.items.remove(key).ok_or_else(|| Error::ItemNotFound {
            namespace: self.name.clone(),
            key: key.to_string(),
        })?;
        self.data.data_hash = self.data.data_hash.wrapping_sub(item_hash(key, &item));
        self.data.data_count -= 1;
        Ok(self.data)
    }

    /// Digest an upsert of `key` would produce, without applying it
    pub fn digest_with(&self, key: &str, item: &[u8]) -> DataState {
        let mut data = self.data;
        let added = item_hash(key, item);
        match self.items.get(key) {
            Some(previous) => {
                data.data_hash = data
                    .data_hash
                    .wrapping_sub(item_hash(key, previous))
                    .wrapping_add(added);
            }
            None => {
                data.data_hash = data.data_hash.wrapping_add(added);
                data.data_count += 1;
            }
        }
        data
    }

    /// Digest a delete of `key` would produce, without applying it
    pub fn digest_without(&self, key: &str) -> Result<DataState> {
        let item = self.items.get(key).ok_or_else(|| Error::ItemNotFound {
            namespace: self.name.clone(),
            key: key.to_string(),
        })?;
        let mut data = self.data;
        data.data_hash = data.data_hash.wrapping_sub(item_hash(key, item));
        data.data_count -= 1;
        Ok(data)
    }

    /// Apply a replicated item op
    pub fn apply(&mut self, op: &WalOp) -> Result<DataState> {
        match op {
            WalOp::ItemUpsert { key, item } => Ok(self.upsert(key.clone(), item.clone())),
            WalOp::ItemDelete { key } => self.delete(key),
            other => Err(Error::LogicError(format!(
                "{} is not an item operation",
                other.kind_name()
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.items.get(key).cloned()
    }

    /// All items, sorted by key
    pub fn items(&self) -> Vec<(String, Bytes)> {
        let mut items: Vec<(String, Bytes)> = self
            .items
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items
    }

    pub fn state(&self) -> DataState {
        self.data
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub type NamespaceHandle = Arc<Mutex<NamespaceData>>;

/// All namespaces of one node
pub struct DocumentStore {
    namespaces: RwLock<HashMap<String, NamespaceHandle>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    /// Create an empty namespace
    pub async fn create(&self, name: &str) -> Result<NamespaceHandle> {
        let mut namespaces = self.namespaces.write().await;
        if namespaces.contains_key(name) {
            return Err(Error::NamespaceExists(name.to_string()));
        }
        let handle = Arc::new(Mutex::new(NamespaceData::new(name)));
        namespaces.insert(name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    pub async fn handle(&self, name: &str) -> Result<NamespaceHandle> {
        self.namespaces
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NamespaceNotFound(name.to_string()))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.namespaces.read().await.contains_key(name)
    }

    /// Replace (or create) a namespace with a complete item set
    pub async fn install(&self, name: &str, items: Vec<(String, Bytes)>) -> DataState {
        let data = NamespaceData::from_items(name, items);
        let state = data.state();
        self.namespaces
            .write()
            .await
            .insert(name.to_string(), Arc::new(Mutex::new(data)));
        state
    }

    pub async fn remove(&self, name: &str) -> Option<NamespaceHandle> {
        self.namespaces.write().await.remove(name)
    }

    /// Move a namespace's items under a new name.
    ///
    /// The caller holds the source's lock, so it passes the locked data in.
    pub async fn rename(&self, data: &mut NamespaceData, to: &str) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        if namespaces.contains_key(to) {
            return Err(Error::NamespaceExists(to.to_string()));
        }
        let handle = namespaces
            .remove(&data.name)
            .ok_or_else(|| Error::NamespaceNotFound(data.name.clone()))?;
        data.name = to.to_string();
        namespaces.insert(to.to_string(), handle);
        Ok(())
    }

    pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<Bytes>> {
        let handle = self.handle(namespace).await?;
        let data = handle.lock().await;
        Ok(data.get(key))
    }

    pub async fn data_state(&self, namespace: &str) -> Result<DataState> {
        let handle = self.handle(namespace).await?;
        let data = handle.lock().await;
        Ok(data.state())
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_order_independent() {
        let mut a = NamespaceData::new("some");
        a.upsert("1".into(), Bytes::from_static(b"one"));
        a.upsert("2".into(), Bytes::from_static(b"two"));

        let mut b = NamespaceData::new("some");
        b.upsert("2".into(), Bytes::from_static(b"two"));
        b.upsert("1".into(), Bytes::from_static(b"one"));

        assert_eq!(a.state(), b.state());
        assert_eq!(a.state().data_count, 2);
    }

    #[test]
    fn test_replace_and_delete_restore_digest() {
        let mut data = NamespaceData::new("some");
        let empty = data.state();
        data.upsert("1".into(), Bytes::from_static(b"one"));
        let single = data.state();

        data.upsert("1".into(), Bytes::from_static(b"uno"));
        assert_eq!(data.state().data_count, 1);
        assert_ne!(data.state().data_hash, single.data_hash);

        data.upsert("1".into(), Bytes::from_static(b"one"));
        assert_eq!(data.state(), single);

        data.delete("1").unwrap();
        assert_eq!(data.state(), empty);
        assert!(matches!(data.delete("1"), Err(Error::ItemNotFound { .. })));
    }

    #[test]
    fn test_from_items_matches_incremental() {
        let mut incremental = NamespaceData::new("ns1");
        for i in 0..20 {
            incremental.upsert(i.to_string(), Bytes::from(vec![i as u8; 4]));
        }
        let rebuilt = NamespaceData::from_items("ns1", incremental.items());
        assert_eq!(rebuilt.state(), incremental.state());
    }

    #[tokio::test]
    async fn test_store_rename_moves_items() {
        let store = DocumentStore::new();
        let handle = store.create("ns1").await.unwrap();
        {
            let mut data = handle.lock().await;
            data.upsert("a".into(), Bytes::from_static(b"x"));
            store.rename(&mut data, "ns3").await.unwrap();
        }

        assert!(!store.contains("ns1").await);
        assert_eq!(
            store.get("ns3", "a").await.unwrap(),
            Some(Bytes::from_static(b"x"))
        );
        assert!(matches!(store.create("ns3").await, Err(Error::NamespaceExists(_))));
    }
}
