//! Replicating Node
//!
//! `Node` owns everything one replicating store needs: the engine (WAL
//! store, document storage, update multiplexer), the role machine, the
//! serving side and the follower loop. Role transitions are serialized by
//! a transition lock and made atomic w.r.t. local writes by the role gate:
//! writes hold it shared, the config swap holds it exclusively, so every
//! write belongs to exactly one role epoch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigSource, ReplicationConfig, VersionedConfig, WolfReplConfig};
use crate::engine::{Engine, NamespaceState};
use crate::error::{Error, Result};
use crate::network::{ReplicationService, Transport};
use crate::replication::{
    ClientHandle, ClientSettings, MasterService, ReplicationClient, RoleMachine, RoleState,
    RoleStatus, SyncCoordinator,
};
use crate::state::{PeerState, PeerSummary, PeerTracker};
use crate::updates::{ConnectionStatus, ObserverStats, SubscriptionMode, UpdatesObserver};
use crate::wal::{Lsn, LsnQuery, WalCapacity, WalRecord};

#[derive(Default)]
struct Runtime {
    started: bool,
    serving: bool,
    client: Option<ClientHandle>,
}

pub struct Node {
    config: WolfReplConfig,
    engine: Arc<Engine>,
    transport: Arc<dyn Transport>,
    master: Arc<MasterService>,
    sync: SyncCoordinator,
    roles: Arc<RoleMachine>,
    /// Current replication config; swapped only under the role gate
    replication: parking_lot::RwLock<ReplicationConfig>,
    role_gate: RwLock<()>,
    runtime: Mutex<Runtime>,
    config_version: AtomicU64,
    shutdown: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Create a node. It stays `Idle` until `start`.
    pub fn new(config: WolfReplConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        config.validate()?;

        let engine = Arc::new(Engine::new(config.wal_capacity(), config.updates.buffer_size));
        let peers = Arc::new(PeerTracker::new(config.peer_timeout()));
        let master = Arc::new(MasterService::new(
            config.node.id.clone(),
            Arc::clone(&engine),
            peers,
            config.updates.buffer_size,
        ));
        let sync = SyncCoordinator::new(
            Arc::clone(&engine),
            Arc::clone(&master),
            config.poll_interval(),
            config.admin_timeout(),
        );

        Ok(Arc::new(Self {
            replication: parking_lot::RwLock::new(ReplicationConfig::default()),
            engine,
            transport,
            master,
            sync,
            roles: Arc::new(RoleMachine::new()),
            role_gate: RwLock::new(()),
            runtime: Mutex::new(Runtime::default()),
            config_version: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
            config,
        }))
    }

    pub fn id(&self) -> &str {
        &self.config.node.id
    }

    pub fn dsn(&self) -> &str {
        &self.config.node.dsn
    }

    pub fn config(&self) -> &WolfReplConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Start background tasks and enter the configured role
    pub async fn start(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        {
            let mut runtime = self.runtime.lock().await;
            if runtime.started {
                return Err(Error::Config(format!("node '{}' already started", self.id())));
            }
            runtime.started = true;
        }

        self.spawn_peer_monitor();
        tracing::info!("Node '{}' starting at {}", self.id(), self.dsn());
        self.transition(self.config.replication.clone(), false).await
    }

    fn spawn_peer_monitor(&self) {
        let peers = Arc::clone(self.master.peers());
        let shutdown = self.shutdown.clone();
        let interval = self.config.heartbeat_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        peers.check_timeouts().await;
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    /// Stop serving and following, then join background tasks
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::info!("Node '{}' shutting down", self.id());
        self.shutdown.cancel();

        let admin_timeout = self.config.admin_timeout();
        {
            let mut runtime = self.runtime.lock().await;
            if let Some(client) = runtime.client.take() {
                client.stop(admin_timeout).await;
            }
            if runtime.serving {
                self.transport.unbind(self.dsn());
                runtime.serving = false;
            }
        }
        self.master.close_all().await;
        self.engine.updates().shutdown();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(admin_timeout, &mut task).await.is_err() {
                task.abort();
            }
        }
        tracing::info!("Node '{}' stopped", self.id());
    }

    // Role transitions

    pub fn replication_config(&self) -> ReplicationConfig {
        self.replication.read().clone()
    }

    /// Apply a new replication config. Returns false if nothing changed.
    /// A rejected config leaves the current role untouched.
    pub async fn apply_config(&self, next: ReplicationConfig) -> Result<bool> {
        next.validate()?;
        if next.master_dsn.as_deref() == Some(self.dsn()) {
            return Err(Error::Config(format!(
                "node '{}' cannot follow itself",
                self.id()
            )));
        }
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        if *self.replication.read() == next {
            return Ok(false);
        }
        self.transition(next, false).await?;
        Ok(true)
    }

    /// Apply a versioned snapshot; versions at or below the last applied one are ignored
    pub async fn apply_versioned(&self, snapshot: VersionedConfig) -> Result<bool> {
        let current = self.config_version.load(Ordering::SeqCst);
        if snapshot.version <= current {
            tracing::debug!(
                "Ignoring stale config v{} (applied v{})",
                snapshot.version,
                current
            );
            return Ok(false);
        }
        let changed = self.apply_config(snapshot.config).await?;
        self.config_version.fetch_max(snapshot.version, Ordering::SeqCst);
        Ok(changed)
    }

    pub fn config_version(&self) -> u64 {
        self.config_version.load(Ordering::SeqCst)
    }

    /// Follow `master_dsn` instead of the current master
    pub async fn switch_master(&self, master_dsn: &str) -> Result<()> {
        let mut next = self.replication_config();
        if !next.role.follows() {
            return Err(Error::Config(format!(
                "switch_master requires a following role, node is {}",
                next.role
            )));
        }
        next.master_dsn = Some(master_dsn.to_string());
        if *self.replication.read() == next {
            // Same master: reconnect from scratch, leaving any Error state
            return self.restart_client(false).await;
        }
        self.apply_config(next).await.map(|_| ())
    }

    /// Apply config snapshots from `source` until shutdown
    pub fn watch_config<S>(self: &Arc<Self>, mut source: S)
    where
        S: ConfigSource + 'static,
    {
        let node = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                let snapshot = tokio::select! {
                    _ = node.shutdown.cancelled() => break,
                    snapshot = source.next() => snapshot,
                };
                let Some(snapshot) = snapshot else { break };
                let version = snapshot.version;
                if let Err(e) = node.apply_versioned(snapshot).await {
                    tracing::warn!("Rejected config v{}: {} (keeping current role)", version, e);
                }
            }
            tracing::debug!("Config watcher of '{}' stopped", node.id());
        });
        self.tasks.lock().push(task);
    }

    async fn transition(&self, next: ReplicationConfig, force_full_sync: bool) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        if !runtime.started {
            return Err(Error::Config(format!("node '{}' is not started", self.id())));
        }

        let previous = self.replication_config();
        if let Some(client) = runtime.client.take() {
            client.stop(self.config.admin_timeout()).await;
            self.engine.updates().notify_connection_state(&ConnectionStatus {
                master: previous.master_dsn.clone(),
                connected: false,
                error: None,
            });
        }
        if runtime.serving && !next.role.serves() {
            self.transport.unbind(self.dsn());
            self.master.close_all().await;
            runtime.serving = false;
        }

        let role_epoch = {
            let _gate = self.role_gate.write().await;
            *self.replication.write() = next.clone();
            self.master.set_cluster_id(next.cluster_id);
            self.roles.begin(next.role, next.master_dsn.clone())
        };

        if next.role.serves() && !runtime.serving {
            let service: Arc<dyn ReplicationService> = self.master.clone();
            self.transport.bind(self.dsn(), service);
            runtime.serving = true;
        }
        if next.role.follows() {
            runtime.client = Some(self.spawn_client(&next, role_epoch, force_full_sync)?);
        }
        Ok(())
    }

    fn spawn_client(
        &self,
        replication: &ReplicationConfig,
        role_epoch: u64,
        force_full_sync: bool,
    ) -> Result<ClientHandle> {
        let master_dsn = replication
            .master_dsn
            .clone()
            .ok_or_else(|| Error::Config(format!("role {} requires master_dsn", replication.role)))?;
        let settings = ClientSettings {
            node_id: self.id().to_string(),
            master_dsn,
            replication: replication.clone(),
            heartbeat_interval: self.config.heartbeat_interval(),
            retry: self.config.retry.clone(),
            force_full_sync,
        };
        Ok(ReplicationClient::new(
            settings,
            Arc::clone(&self.engine),
            Arc::clone(&self.transport),
            Arc::clone(&self.roles),
            role_epoch,
        )
        .spawn())
    }

    async fn restart_client(&self, force_full_sync: bool) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let replication = self.replication_config();
        if !replication.role.follows() {
            return Ok(());
        }
        if let Some(client) = runtime.client.take() {
            client.stop(self.config.admin_timeout()).await;
        }
        let role_epoch = self
            .roles
            .begin(replication.role, replication.master_dsn.clone());
        runtime.client = Some(self.spawn_client(&replication, role_epoch, force_full_sync)?);
        Ok(())
    }

    // Sync

    /// Push full datasets to followers (serving roles) and resync from the
    /// master from scratch (following roles). Returns the number of
    /// followers pushed to.
    pub async fn force_sync(&self) -> Result<usize> {
        let role = self.replication.read().role;
        if role.follows() {
            self.restart_client(true).await?;
        }
        if role.serves() {
            return self.sync.force_sync().await;
        }
        Ok(0)
    }

    /// Wait until all live followers of `namespace` converge with this node
    pub async fn wait_sync(&self, namespace: &str, timeout: Duration) -> Result<()> {
        self.sync.wait_sync(namespace, timeout).await
    }

    // Status

    pub fn status(&self) -> RoleStatus {
        self.roles.status()
    }

    /// Wait until the role machine reaches `state`
    pub async fn wait_for_state(&self, state: RoleState, timeout: Duration) -> Result<RoleStatus> {
        self.roles.wait_for(timeout, |status| status.state == state).await
    }

    pub async fn peers(&self) -> PeerSummary {
        self.master.peers().summary().await
    }

    pub async fn peer(&self, id: &str) -> Option<PeerState> {
        self.master.peers().get(id).await
    }

    pub async fn namespace_state(&self, namespace: &str) -> Option<NamespaceState> {
        self.engine.namespace_state(namespace).await
    }

    pub async fn namespace_states(&self) -> Vec<NamespaceState> {
        self.engine.namespace_states().await
    }

    // Local writes

    fn check_writable(&self, namespace: &str) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let replication = self.replication.read();
        if replication.role.follows() && replication.replicates(namespace) {
            return Err(Error::ReadOnly(namespace.to_string()));
        }
        Ok(())
    }

    pub async fn open_namespace(&self, namespace: &str) -> Result<Arc<WalRecord>> {
        let _gate = self.role_gate.read().await;
        self.check_writable(namespace)?;
        self.engine.open_namespace(namespace).await
    }

    pub async fn drop_namespace(&self, namespace: &str) -> Result<Arc<WalRecord>> {
        let _gate = self.role_gate.read().await;
        self.check_writable(namespace)?;
        self.engine.drop_namespace(namespace).await
    }

    pub async fn rename_namespace(&self, from: &str, to: &str) -> Result<Arc<WalRecord>> {
        let _gate = self.role_gate.read().await;
        self.check_writable(from)?;
        self.check_writable(to)?;
        self.engine.rename_namespace(from, to).await
    }

    pub async fn upsert(&self, namespace: &str, key: &str, item: impl Into<Bytes>) -> Result<Lsn> {
        let _gate = self.role_gate.read().await;
        self.check_writable(namespace)?;
        self.engine.upsert(namespace, key, item.into()).await
    }

    pub async fn delete(&self, namespace: &str, key: &str) -> Result<Lsn> {
        let _gate = self.role_gate.read().await;
        self.check_writable(namespace)?;
        self.engine.delete(namespace, key).await
    }

    /// Change the WAL retention of one namespace; returns the evicted count
    pub async fn resize(&self, namespace: &str, capacity: WalCapacity) -> Result<usize> {
        self.engine.resize(namespace, capacity).await
    }

    // Reads

    pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<Bytes>> {
        self.engine.get(namespace, key).await
    }

    pub async fn get_from(&self, namespace: &str, from: Lsn) -> Result<Vec<Arc<WalRecord>>> {
        self.engine.get_from(namespace, from).await
    }

    pub async fn query(&self, query: &LsnQuery) -> Result<Vec<Arc<WalRecord>>> {
        self.engine.query(query).await
    }

    pub async fn namespaces(&self) -> Vec<String> {
        self.engine.namespaces().await
    }

    // Subscriptions

    pub fn subscribe<I, S>(&self, observer: Arc<dyn UpdatesObserver>, namespaces: I, mode: SubscriptionMode)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.engine.updates().subscribe(observer, namespaces, mode);
    }

    /// Remove an observer; nothing is delivered to it once this returns
    pub fn unsubscribe<O: ?Sized>(&self, observer: &Arc<O>) -> bool {
        self.engine.updates().unsubscribe(observer)
    }

    pub fn observer_stats<O: ?Sized>(&self, observer: &Arc<O>) -> Option<ObserverStats> {
        self.engine.updates().stats(observer)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.config.node.id)
            .field("dsn", &self.config.node.dsn)
            .field("role", &self.replication.read().role)
            .finish()
    }
}
