//! Replication Client
//!
//! Follower loop of a slave or cluster member. One session is:
//! connect, handshake, open the update stream, bring every replicated
//! namespace up to date, then apply streamed records while reporting
//! progress on every heartbeat. Transient failures end the session and the
//! loop reconnects with backoff; consistency failures park the follower in
//! `Error` until a forced sync repairs it or the role changes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::protocol::{unexpected, Message};
use super::role::{FollowerState, RoleMachine};
use crate::config::{ReplicationConfig, RetryConfig};
use crate::engine::{ApplyOutcome, Engine, NamespaceState};
use crate::error::{Error, Result};
use crate::network::{Link, Transport};
use crate::updates::ConnectionStatus;
use crate::wal::{Lsn, ReplicationState};

const GOODBYE_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings of one follower loop
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub node_id: String,
    pub master_dsn: String,
    pub replication: ReplicationConfig,
    pub heartbeat_interval: Duration,
    pub retry: RetryConfig,
    /// Ignore local state and copy every namespace from scratch
    pub force_full_sync: bool,
}

/// Handle of a running follower loop
pub struct ClientHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ClientHandle {
    /// Cancel the loop and wait for it; aborts it once `timeout` passes.
    /// Returns false if the loop had to be aborted.
    pub async fn stop(self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!("Replication client did not stop within {:?}, aborting", timeout);
                task.abort();
                false
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub struct ReplicationClient {
    settings: ClientSettings,
    engine: Arc<Engine>,
    transport: Arc<dyn Transport>,
    roles: Arc<RoleMachine>,
    role_epoch: u64,
    cancel: CancellationToken,
    link: Option<Arc<dyn Link>>,
}

impl ReplicationClient {
    pub fn new(
        settings: ClientSettings,
        engine: Arc<Engine>,
        transport: Arc<dyn Transport>,
        roles: Arc<RoleMachine>,
        role_epoch: u64,
    ) -> Self {
        Self {
            settings,
            engine,
            transport,
            roles,
            role_epoch,
            cancel: CancellationToken::new(),
            link: None,
        }
    }

    /// Run the loop on its own task
    pub fn spawn(self) -> ClientHandle {
        let cancel = self.cancel.clone();
        let task = tokio::spawn(self.run());
        ClientHandle { cancel, task }
    }

    pub async fn run(mut self) {
        let mut backoff = Backoff::new(self.settings.retry.clone());
        tracing::info!(
            "Replication client '{}' following {}",
            self.settings.node_id,
            self.settings.master_dsn
        );

        loop {
            if self.cancel.is_cancelled() || !self.roles.is_current(self.role_epoch) {
                break;
            }

            let error = match self.session(&mut backoff).await {
                Ok(()) => break,
                Err(e) => e,
            };
            self.link = None;
            if self.cancel.is_cancelled() {
                break;
            }

            if self.is_fatal(&error) {
                self.enter_error(&error);
                self.cancel.cancelled().await;
                break;
            }

            self.set_connected(false, Some(error.to_string()));
            self.roles.set_follower_state(
                self.role_epoch,
                FollowerState::Connecting,
                Some(error.to_string()),
            );
            let delay = backoff.next_delay();
            tracing::warn!(
                "Lost {} ({}), reconnecting in {:?} (attempt {})",
                self.settings.master_dsn,
                error,
                delay,
                backoff.attempt()
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if let Some(link) = self.link.take() {
            let goodbye = Message::Goodbye {
                node_id: self.settings.node_id.clone(),
            };
            let _ = tokio::time::timeout(GOODBYE_TIMEOUT, link.request(goodbye)).await;
        }
        self.set_connected(false, None);
        tracing::info!("Replication client stopped following {}", self.settings.master_dsn);
    }

    async fn session(&mut self, backoff: &mut Backoff) -> Result<()> {
        self.roles
            .set_follower_state(self.role_epoch, FollowerState::Connecting, None);

        let link = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            link = self.transport.connect(&self.settings.master_dsn) => link?,
        };
        let hello = Message::Hello {
            node_id: self.settings.node_id.clone(),
            app_name: self.settings.replication.app_name.clone(),
            cluster_id: self.settings.replication.cluster_id,
            namespaces: self.settings.replication.namespaces.clone(),
        };
        let (master_id, namespaces) = match self.request(link.as_ref(), hello).await? {
            Message::Welcome {
                master_id,
                namespaces,
                ..
            } => (master_id, namespaces),
            other => return Err(unexpected("Welcome", &other)),
        };

        // Subscribe before catching up so nothing appended meanwhile is missed
        let mut stream = link
            .subscribe(&self.settings.node_id, self.settings.replication.namespaces.clone())
            .await?;
        self.link = Some(Arc::clone(&link));
        backoff.reset();
        self.set_connected(true, None);
        tracing::info!(
            "Connected to master '{}' at {} ({} namespaces)",
            master_id,
            self.settings.master_dsn,
            namespaces.len()
        );

        self.roles
            .set_follower_state(self.role_epoch, FollowerState::Syncing, None);
        if let Err(e) = self.sync_all(link.as_ref(), &namespaces).await {
            if !self.is_fatal(&e) {
                return Err(e);
            }
            self.park(link.as_ref(), &mut stream, e).await?;
        }
        self.settings.force_full_sync = false;
        self.roles
            .set_follower_state(self.role_epoch, FollowerState::Synced, None);
        self.report(link.as_ref()).await?;

        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                message = stream.recv() => {
                    let Some(message) = message else {
                        return Err(Error::Network(format!(
                            "update stream from {} closed",
                            self.settings.master_dsn
                        )));
                    };
                    if let Err(e) = self.handle_stream_message(link.as_ref(), message).await {
                        if !self.is_fatal(&e) {
                            return Err(e);
                        }
                        self.park(link.as_ref(), &mut stream, e).await?;
                    }
                }
                _ = heartbeat.tick() => self.report(link.as_ref()).await?,
            }
        }
    }

    /// Request that gives up as soon as the loop is cancelled
    async fn request(&self, link: &dyn Link, message: Message) -> Result<Message> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            reply = link.request(message) => reply,
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn is_fatal(&self, error: &Error) -> bool {
        matches!(
            error,
            Error::ClusterMismatch { .. } | Error::Config(_) | Error::WrongDataHash { .. }
        ) || error.is_logic_error()
    }

    fn set_connected(&self, connected: bool, error: Option<String>) {
        let changed = self.roles.set_connected(self.role_epoch, connected);
        if changed || error.is_some() {
            self.engine.updates().notify_connection_state(&ConnectionStatus {
                master: Some(self.settings.master_dsn.clone()),
                connected,
                error,
            });
        }
    }

    fn enter_error(&self, error: &Error) {
        tracing::error!(
            "Replication from {} stopped: {}",
            self.settings.master_dsn,
            error
        );
        self.roles.set_follower_state(
            self.role_epoch,
            FollowerState::Error,
            Some(error.to_string()),
        );
    }

    /// Stay in `Error`, applying only snapshots pushed by a forced sync.
    /// Returns once the push completes.
    async fn park(&self, link: &dyn Link, stream: &mut mpsc::Receiver<Message>, error: Error) -> Result<()> {
        self.enter_error(&error);
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                message = stream.recv() => message,
            };
            match message {
                None => return Err(error),
                Some(Message::Snapshot(snapshot)) => {
                    let namespace = snapshot.namespace.clone();
                    self.engine.install_snapshot(snapshot).await?;
                    self.sync_namespace(link, &namespace, false).await?;
                }
                Some(Message::SyncComplete) => {
                    tracing::info!("Repaired by forced sync from {}", self.settings.master_dsn);
                    self.roles
                        .set_follower_state(self.role_epoch, FollowerState::Synced, None);
                    return self.report(link).await;
                }
                Some(_) => {}
            }
        }
    }

    fn replicated_states(&self, states: Vec<NamespaceState>) -> Vec<NamespaceState> {
        states
            .into_iter()
            .filter(|s| self.settings.replication.replicates(&s.namespace))
            .collect()
    }

    async fn report(&self, link: &dyn Link) -> Result<()> {
        let namespaces = self.replicated_states(self.engine.namespace_states().await);
        match self
            .request(
                link,
                Message::Report {
                    node_id: self.settings.node_id.clone(),
                    namespaces,
                },
            )
            .await?
        {
            Message::Ack => Ok(()),
            other => Err(unexpected("Ack", &other)),
        }
    }

    async fn sync_all(&self, link: &dyn Link, master: &[NamespaceState]) -> Result<()> {
        let master = self.replicated_states(master.to_vec());

        for local in self.engine.namespaces().await {
            if self.settings.replication.replicates(&local)
                && !master.iter().any(|s| s.namespace == local)
            {
                tracing::info!("Namespace '{}' is gone on the master, discarding", local);
                self.engine.discard(&local).await;
            }
        }

        for state in &master {
            self.check_cancelled()?;
            self.sync_namespace(link, &state.namespace, self.settings.force_full_sync)
                .await?;
        }
        Ok(())
    }

    /// Bring one namespace up to the master's head: incremental replay when
    /// the master still retains our position, full copy otherwise.
    async fn sync_namespace(&self, link: &dyn Link, namespace: &str, full: bool) -> Result<()> {
        if !full {
            if let Some(local) = self.engine.namespace_state(namespace).await {
                match self.catch_up(link, &local).await {
                    Ok(()) => return Ok(()),
                    Err(Error::NamespaceNotFound(_)) => {
                        self.engine.discard(namespace).await;
                        return Ok(());
                    }
                    Err(e) if e.requires_full_sync() => {
                        tracing::info!("'{}' needs a full sync: {}", namespace, e);
                    }
                    Err(e @ Error::WrongDataHash { .. })
                        if self.settings.replication.force_sync_on_wrong_data_hash =>
                    {
                        tracing::warn!("{}, forcing full sync", e);
                    }
                    Err(e)
                        if e.is_logic_error() && self.settings.replication.force_sync_on_logic_error =>
                    {
                        tracing::warn!("{}, forcing full sync of '{}'", e, namespace);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        self.full_sync(link, namespace).await
    }

    async fn catch_up(&self, link: &dyn Link, local: &NamespaceState) -> Result<()> {
        let namespace = local.namespace.as_str();
        let request = Message::GetFrom {
            node_id: self.settings.node_id.clone(),
            namespace: namespace.to_string(),
            epoch: local.epoch,
            after: local.last_lsn.map(|l| l.counter),
        };
        let records = match self.request(link, request).await? {
            Message::Records { records, .. } => records,
            other => return Err(unexpected("Records", &other)),
        };

        let mut master_state = None;
        let mut applied = 0usize;
        for record in records {
            if let Some(state) = record.replication_state() {
                master_state = Some(*state);
                continue;
            }
            self.check_cancelled()?;
            let lsn = record.lsn();
            match self.engine.apply_replicated(record).await? {
                ApplyOutcome::Applied => applied += 1,
                ApplyOutcome::Duplicate => {}
                ApplyOutcome::Gap => {
                    return Err(Error::LogicError(format!(
                        "record {} does not continue '{}' during replay",
                        lsn, namespace
                    )))
                }
            }
        }
        if applied > 0 {
            tracing::debug!("Replayed {} records of '{}'", applied, namespace);
        }

        match master_state {
            Some(master) => self.verify(namespace, &master).await,
            None => Ok(()),
        }
    }

    /// Compare content with the master once both sit at the same LSN
    async fn verify(&self, namespace: &str, master: &ReplicationState) -> Result<()> {
        let Some(local) = self.engine.namespace_state(namespace).await else {
            return Ok(());
        };
        let local = local.replication_state();
        if local.epoch != master.epoch || local.last_counter != master.last_counter {
            return Ok(());
        }
        if local.data_hash != master.data_hash || local.data_count != master.data_count {
            return Err(Error::WrongDataHash {
                namespace: namespace.to_string(),
                lsn: local
                    .last_lsn()
                    .unwrap_or_else(|| Lsn::new(local.epoch, 0)),
                local: local.data_hash,
                master: master.data_hash,
            });
        }
        Ok(())
    }

    async fn full_sync(&self, link: &dyn Link, namespace: &str) -> Result<()> {
        let request = Message::SnapshotRequest {
            node_id: self.settings.node_id.clone(),
            namespace: namespace.to_string(),
        };
        match self.request(link, request).await {
            Ok(Message::Snapshot(snapshot)) => self.engine.install_snapshot(snapshot).await,
            Ok(other) => Err(unexpected("Snapshot", &other)),
            Err(Error::NamespaceNotFound(_)) => {
                self.engine.discard(namespace).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_stream_message(&self, link: &dyn Link, message: Message) -> Result<()> {
        match message {
            Message::Update(record) => {
                let namespace = record.namespace().to_string();
                if !self.settings.replication.replicates(&namespace) {
                    return Ok(());
                }
                match self.engine.apply_replicated(record).await {
                    Ok(ApplyOutcome::Gap) => {
                        tracing::debug!("Gap in '{}', catching up", namespace);
                        self.sync_namespace(link, &namespace, false).await
                    }
                    Ok(_) => Ok(()),
                    Err(e) if e.is_logic_error() && self.settings.replication.force_sync_on_logic_error => {
                        tracing::warn!("{}, forcing full sync of '{}'", e, namespace);
                        self.sync_namespace(link, &namespace, true).await
                    }
                    Err(e) => Err(e),
                }
            }
            Message::Snapshot(snapshot) => {
                let namespace = snapshot.namespace.clone();
                self.roles
                    .set_follower_state(self.role_epoch, FollowerState::Syncing, None);
                self.engine.install_snapshot(snapshot).await?;
                self.sync_namespace(link, &namespace, false).await
            }
            Message::SyncComplete => {
                tracing::info!("Forced sync from {} complete", self.settings.master_dsn);
                self.roles
                    .set_follower_state(self.role_epoch, FollowerState::Synced, None);
                self.report(link).await
            }
            other => {
                tracing::debug!("Ignoring {} on the update stream", other.type_name());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{LocalNetwork, ReplicationService};
    use crate::replication::{MasterService, Role, RoleState};
    use crate::state::PeerTracker;
    use crate::wal::WalCapacity;
    use bytes::Bytes;

    struct Fixture {
        network: LocalNetwork,
        master: Arc<Engine>,
        replica: Arc<Engine>,
        roles: Arc<RoleMachine>,
    }

    fn fixture(capacity: usize) -> Fixture {
        let network = LocalNetwork::new();
        let master = Arc::new(Engine::new(WalCapacity::records(capacity), 1000));
        let peers = Arc::new(PeerTracker::new(Duration::from_secs(5)));
        let service: Arc<dyn ReplicationService> = Arc::new(MasterService::new(
            "master".into(),
            Arc::clone(&master),
            peers,
            1024,
        ));
        network.bind("local://master", service);
        Fixture {
            network,
            master,
            replica: Arc::new(Engine::new(WalCapacity::records(capacity), 1000)),
            roles: Arc::new(RoleMachine::new()),
        }
    }

    fn settings() -> ClientSettings {
        ClientSettings {
            node_id: "replica".into(),
            master_dsn: "local://master".into(),
            replication: ReplicationConfig::slave("local://master"),
            heartbeat_interval: Duration::from_millis(50),
            retry: RetryConfig {
                initial_delay_ms: 10,
                max_delay_ms: 50,
                backoff_multiplier: 2.0,
                jitter_factor: 0.0,
            },
            force_full_sync: false,
        }
    }

    fn start(fx: &Fixture, settings: ClientSettings) -> ClientHandle {
        let epoch = fx.roles.begin(Role::Slave, Some(settings.master_dsn.clone()));
        let transport: Arc<dyn Transport> = Arc::new(fx.network.clone());
        ReplicationClient::new(settings, Arc::clone(&fx.replica), transport, Arc::clone(&fx.roles), epoch)
            .spawn()
    }

    async fn converged(fx: &Fixture, namespace: &str) -> bool {
        for _ in 0..200 {
            let master = fx.master.namespace_state(namespace).await.map(|s| s.replication_state());
            let replica = fx.replica.namespace_state(namespace).await.map(|s| s.replication_state());
            if master.is_some() && master == replica {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_follows_live_writes() {
        let fx = fixture(1000);
        fx.master.open_namespace("ns1").await.unwrap();
        fx.master.upsert("ns1", "a", Bytes::from_static(b"1")).await.unwrap();

        let client = start(&fx, settings());
        fx.roles
            .wait_for(Duration::from_secs(2), |s| {
                s.state == RoleState::Slave(FollowerState::Synced)
            })
            .await
            .unwrap();

        for i in 0..20u8 {
            fx.master.upsert("ns1", &i.to_string(), Bytes::from(vec![i])).await.unwrap();
        }
        assert!(converged(&fx, "ns1").await);
        assert!(client.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_outdated_position_falls_back_to_full_sync() {
        let fx = fixture(10);
        let open = fx.master.open_namespace("some").await.unwrap();
        fx.replica.apply_replicated((*open).clone()).await.unwrap();
        for i in 0..50u8 {
            fx.master.upsert("some", &i.to_string(), Bytes::from(vec![i])).await.unwrap();
        }

        let client = start(&fx, settings());
        assert!(converged(&fx, "some").await);
        assert_eq!(fx.replica.storage().data_state("some").await.unwrap().data_count, 50);
        client.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_cluster_mismatch_parks_in_error() {
        let fx = fixture(100);
        let service = MasterService::new(
            "master".into(),
            Arc::clone(&fx.master),
            Arc::new(PeerTracker::new(Duration::from_secs(5))),
            64,
        );
        service.set_cluster_id(1);
        fx.network.bind("local://master", Arc::new(service));

        let mut settings = settings();
        settings.replication.cluster_id = 2;
        let client = start(&fx, settings);

        let status = fx
            .roles
            .wait_for(Duration::from_secs(2), |s| {
                s.state == RoleState::Slave(FollowerState::Error)
            })
            .await
            .unwrap();
        assert!(status.last_error.is_some());
        assert!(client.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_reconnects_after_partition() {
        let fx = fixture(1000);
        fx.master.open_namespace("ns1").await.unwrap();
        let client = start(&fx, settings());
        assert!(converged(&fx, "ns1").await);

        fx.network.set_reachable("local://master", false);
        fx.roles
            .wait_for(Duration::from_secs(2), |s| !s.connected)
            .await
            .unwrap();
        for i in 0..10u8 {
            fx.master.upsert("ns1", &i.to_string(), Bytes::from(vec![i])).await.unwrap();
        }

        fx.network.set_reachable("local://master", true);
        assert!(converged(&fx, "ns1").await);
        assert!(fx.roles.status().connected);
        client.stop(Duration::from_secs(1)).await;
    }
}
