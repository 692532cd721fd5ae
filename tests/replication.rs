//! Multi-node replication scenarios over the in-process transport

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use wolfrepl::config::{config_channel, ReplicationConfig, WolfReplConfig};
use wolfrepl::network::LocalNetwork;
use wolfrepl::replication::{FollowerState, RoleState};
use wolfrepl::updates::{SubscriptionMode, UpdatesCounter, UpdatesObserver};
use wolfrepl::wal::{CondType, Lsn, Query, WalCapacity, WalRecord};
use wolfrepl::{Error, Node};

const SYNCED: Duration = Duration::from_secs(5);

fn node(network: &LocalNetwork, id: &str, replication: ReplicationConfig, wal_records: usize) -> Arc<Node> {
    let mut config = WolfReplConfig::new(id, format!("local://{}", id));
    config.replication = replication;
    config.wal.max_records = wal_records;
    config.sync.heartbeat_interval_ms = 20;
    config.sync.poll_interval_ms = 10;
    config.retry.initial_delay_ms = 10;
    config.retry.max_delay_ms = 50;
    config.retry.jitter_factor = 0.0;
    Node::new(config, Arc::new(network.clone())).unwrap()
}

fn dsn(node: &Node) -> String {
    node.dsn().to_string()
}

async fn write(node: &Node, namespace: &str, keys: std::ops::Range<usize>) {
    for i in keys {
        node.upsert(namespace, &i.to_string(), format!("{{\"id\":{}}}", i).into_bytes())
            .await
            .unwrap();
    }
}

/// Poll until both nodes hold `namespace` at the same LSN with the same content
async fn converged(a: &Node, b: &Node, namespace: &str) -> bool {
    for _ in 0..500 {
        let left = a.namespace_state(namespace).await.map(|s| s.replication_state());
        let right = b.namespace_state(namespace).await.map(|s| s.replication_state());
        if left.is_some() && left == right {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn wait_until<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Records every delivered LSN
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(String, Lsn, &'static str)>>,
}

impl UpdatesObserver for Recorder {
    fn on_update(&self, record: &WalRecord) {
        self.seen
            .lock()
            .push((record.namespace().to_string(), record.lsn(), record.op.kind_name()));
    }
}

#[tokio::test]
async fn test_window_boundaries() {
    let network = LocalNetwork::new();
    let master = node(&network, "m", ReplicationConfig::master(), 1000);
    master.start().await.unwrap();

    let open = master.open_namespace("some").await.unwrap();
    let epoch = open.lsn().epoch;
    write(&master, "some", 0..502).await;

    assert_eq!(master.get_from("some", Lsn::new(epoch, 0)).await.unwrap().len(), 503);
    assert_eq!(master.get_from("some", Lsn::new(epoch, 502)).await.unwrap().len(), 1);
    assert!(matches!(
        master.get_from("some", Lsn::new(epoch, 503)).await,
        Err(Error::OutdatedWal { .. })
    ));

    let before: Vec<WalRecord> = master
        .get_from("some", Lsn::new(epoch, 402))
        .await
        .unwrap()
        .into_iter()
        .filter(|r| !r.is_raw())
        .map(|r| (*r).clone())
        .collect();

    master.resize("some", WalCapacity::records(100)).await.unwrap();
    let after = master.get_from("some", Lsn::new(epoch, 402)).await.unwrap();
    assert_eq!(after.len(), 101);
    assert!(after[0].is_raw());
    let after: Vec<WalRecord> = after.iter().skip(1).map(|r| (**r).clone()).collect();
    assert_eq!(before, after);
    assert!(matches!(
        master.get_from("some", Lsn::new(epoch, 401)).await,
        Err(Error::OutdatedWal { .. })
    ));

    // Same window through the #lsn column
    let query = Query::select("some").where_("#lsn", ">", Lsn::new(epoch, 402)).unwrap();
    assert_eq!(master.query(&query).await.unwrap().len(), 101);
    let query = Query::select("some").where_lsn(CondType::Ge, Lsn::new(epoch, 403));
    assert_eq!(master.query(&query).await.unwrap().len(), 101);

    master.shutdown().await;
}

#[tokio::test]
async fn test_slave_replays_incrementally_after_partition() {
    let network = LocalNetwork::new();
    let master = node(&network, "m", ReplicationConfig::master(), 1000);
    let slave = node(&network, "s", ReplicationConfig::slave("local://m"), 1000);
    master.start().await.unwrap();
    slave.start().await.unwrap();
    slave
        .wait_for_state(RoleState::Slave(FollowerState::Synced), SYNCED)
        .await
        .unwrap();

    master.open_namespace("ns1").await.unwrap();
    write(&master, "ns1", 0..10).await;
    assert!(converged(&master, &slave, "ns1").await);

    network.set_reachable(&dsn(&master), false);
    write(&master, "ns1", 10..20).await;
    network.set_reachable(&dsn(&master), true);
    assert!(converged(&master, &slave, "ns1").await);

    // Every record since the open was replayed, nothing was copied wholesale
    let state = slave.namespace_state("ns1").await.unwrap();
    assert_eq!(state.first_retained, 0);
    assert_eq!(state.retained, 21);
    assert_eq!(slave.get("ns1", "15").await.unwrap().unwrap(), &b"{\"id\":15}"[..]);

    slave.shutdown().await;
    master.shutdown().await;
}

#[tokio::test]
async fn test_outdated_slave_gets_full_copy() {
    let network = LocalNetwork::new();
    let master = node(&network, "m", ReplicationConfig::master(), 10);
    let slave = node(&network, "s", ReplicationConfig::slave("local://m"), 10);
    master.start().await.unwrap();
    slave.start().await.unwrap();
    slave
        .wait_for_state(RoleState::Slave(FollowerState::Synced), SYNCED)
        .await
        .unwrap();

    let open = master.open_namespace("ns1").await.unwrap();
    write(&master, "ns1", 0..5).await;
    assert!(converged(&master, &slave, "ns1").await);

    network.set_reachable(&dsn(&master), false);
    write(&master, "ns1", 5..55).await;
    network.set_reachable(&dsn(&master), true);
    assert!(converged(&master, &slave, "ns1").await);

    let state = slave.namespace_state("ns1").await.unwrap();
    assert_eq!(state.data_count, 55);
    assert_eq!(state.retained, 0);
    assert!(matches!(
        slave.get_from("ns1", Lsn::new(open.lsn().epoch, 10)).await,
        Err(Error::OutdatedWal { .. })
    ));

    slave.shutdown().await;
    master.shutdown().await;
}

#[tokio::test]
async fn test_rename_event_counts() {
    let network = LocalNetwork::new();
    let master = node(&network, "m", ReplicationConfig::master(), 1000);
    let slave = node(&network, "s", ReplicationConfig::slave("local://m"), 1000);

    let all = UpdatesCounter::new();
    let ns1 = UpdatesCounter::new();
    slave.subscribe(all.clone(), Vec::<String>::new(), SubscriptionMode::Replace);
    slave.subscribe(ns1.clone(), ["ns1"], SubscriptionMode::Replace);

    master.start().await.unwrap();
    slave.start().await.unwrap();
    slave
        .wait_for_state(RoleState::Slave(FollowerState::Synced), SYNCED)
        .await
        .unwrap();

    master.open_namespace("ns1").await.unwrap();
    write(&master, "ns1", 0..3).await;
    master.rename_namespace("ns1", "ns3").await.unwrap();
    write(&master, "ns3", 3..5).await;
    assert!(converged(&master, &slave, "ns3").await);

    // open + 3 items + rename under ns1, 2 items under ns3
    assert!(wait_until(|| all.total() == 7).await);
    assert_eq!(all.count("ns1"), 5);
    assert_eq!(all.count("ns3"), 2);
    assert!(wait_until(|| ns1.total() == 5).await);
    assert_eq!(ns1.count("ns3"), 0);
    assert_eq!(slave.namespaces().await, vec!["ns3".to_string()]);

    slave.shutdown().await;
    master.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_role_switching_converges() {
    let network = LocalNetwork::new();
    let nodes: Vec<Arc<Node>> = ["n1", "n2", "n3"]
        .iter()
        .map(|id| node(&network, id, ReplicationConfig::default(), 1000))
        .collect();
    let recorder = Arc::new(Recorder::default());
    nodes[2].subscribe(recorder.clone(), Vec::<String>::new(), SubscriptionMode::Replace);
    for n in &nodes {
        n.start().await.unwrap();
    }

    for round in 0..3 {
        let master = &nodes[round];
        master.apply_config(ReplicationConfig::master()).await.unwrap();
        for follower in nodes.iter().filter(|n| n.id() != master.id()) {
            follower
                .apply_config(ReplicationConfig::slave(dsn(master)))
                .await
                .unwrap();
            follower
                .wait_for_state(RoleState::Slave(FollowerState::Synced), SYNCED)
                .await
                .unwrap();
        }

        if round == 0 {
            master.open_namespace("ns1").await.unwrap();
        }
        write(master, "ns1", round * 20..(round + 1) * 20).await;
        master.wait_sync("ns1", SYNCED).await.unwrap();

        for follower in nodes.iter().filter(|n| n.id() != master.id()) {
            assert_eq!(
                master.namespace_state("ns1").await.unwrap().replication_state(),
                follower.namespace_state("ns1").await.unwrap().replication_state()
            );
        }
    }
    assert_eq!(nodes[0].namespace_state("ns1").await.unwrap().data_count, 60);

    // n3 saw every record exactly once, replicated or local
    assert!(wait_until(|| recorder.seen.lock().len() == 61).await);
    let seen = recorder.seen.lock().clone();
    let unique: HashSet<Lsn> = seen.iter().map(|(_, lsn, _)| *lsn).collect();
    assert_eq!(unique.len(), seen.len());
    assert!(seen.windows(2).all(|w| w[0].1 < w[1].1));

    for n in &nodes {
        n.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_role_handover_under_continuous_writes() {
    let network = LocalNetwork::new();
    let nodes: Vec<Arc<Node>> = ["n1", "n2", "n3"]
        .iter()
        .map(|id| node(&network, id, ReplicationConfig::default(), 10_000))
        .collect();
    for n in &nodes {
        n.start().await.unwrap();
    }
    nodes[0].apply_config(ReplicationConfig::master()).await.unwrap();
    for follower in &nodes[1..] {
        follower
            .apply_config(ReplicationConfig::slave(dsn(&nodes[0])))
            .await
            .unwrap();
        follower
            .wait_for_state(RoleState::Slave(FollowerState::Synced), SYNCED)
            .await
            .unwrap();
    }
    nodes[0].open_namespace("ns1").await.unwrap();

    let current = Arc::new(Mutex::new(Arc::clone(&nodes[0])));
    let stop = CancellationToken::new();
    let writer = {
        let current = Arc::clone(&current);
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut accepted = Vec::new();
            let mut i = 0usize;
            while !stop.is_cancelled() {
                let target = current.lock().clone();
                let key = format!("w{}", i);
                match target.upsert("ns1", &key, format!("{{\"id\":{}}}", i).into_bytes()).await {
                    Ok(lsn) => accepted.push((key, lsn)),
                    Err(Error::ReadOnly(_)) => {}
                    Err(e) => panic!("write {} failed: {}", i, e),
                }
                i += 1;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            accepted
        })
    };

    // Each round hands the master role to the node following the current one
    for round in 1..=4 {
        let old = Arc::clone(&nodes[(round - 1) % 3]);
        let new = Arc::clone(&nodes[round % 3]);
        let third = Arc::clone(&nodes[(round + 1) % 3]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Read-only from here on, still serving its followers
        old.apply_config(ReplicationConfig::cluster_member(dsn(&new)))
            .await
            .unwrap();
        assert!(converged(&old, &new, "ns1").await);
        new.apply_config(ReplicationConfig::master()).await.unwrap();
        *current.lock() = Arc::clone(&new);
        third
            .apply_config(ReplicationConfig::slave(dsn(&new)))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.cancel();
    let accepted = writer.await.unwrap();
    assert!(!accepted.is_empty());

    let master = Arc::clone(&nodes[4 % 3]);
    master.wait_sync("ns1", SYNCED).await.unwrap();
    for n in &nodes {
        assert!(converged(&master, n, "ns1").await);
    }

    // Accepted writes form one gap-free history: no LSN reused, none lost
    let lsns: HashSet<Lsn> = accepted.iter().map(|(_, lsn)| *lsn).collect();
    assert_eq!(lsns.len(), accepted.len());
    assert!(accepted
        .iter()
        .enumerate()
        .all(|(i, (_, lsn))| lsn.counter == i as u64 + 1));
    let state = master.namespace_state("ns1").await.unwrap();
    assert_eq!(state.data_count, accepted.len() as u64);
    assert_eq!(state.last_lsn, accepted.last().map(|(_, lsn)| *lsn));
    for n in &nodes {
        for (key, _) in &accepted {
            assert!(n.get("ns1", key).await.unwrap().is_some(), "{} missing {}", n.id(), key);
        }
    }

    for n in &nodes {
        n.shutdown().await;
    }
}

#[tokio::test]
async fn test_cluster_member_relays_to_its_followers() {
    let network = LocalNetwork::new();
    let master = node(&network, "m", ReplicationConfig::master(), 1000);
    let relay = node(&network, "r", ReplicationConfig::cluster_member("local://m"), 1000);
    let leaf = node(&network, "l", ReplicationConfig::slave("local://r"), 1000);
    for n in [&master, &relay, &leaf] {
        n.start().await.unwrap();
    }
    leaf.wait_for_state(RoleState::Slave(FollowerState::Synced), SYNCED)
        .await
        .unwrap();

    master.open_namespace("ns1").await.unwrap();
    write(&master, "ns1", 0..10).await;
    assert!(converged(&master, &leaf, "ns1").await);
    assert!(matches!(
        relay.upsert("ns1", "x", &b"1"[..]).await,
        Err(Error::ReadOnly(_))
    ));

    for n in [&leaf, &relay, &master] {
        n.shutdown().await;
    }
}

#[tokio::test]
async fn test_cluster_mismatch_until_reconfigured() {
    let network = LocalNetwork::new();
    let mut master_config = ReplicationConfig::master();
    master_config.cluster_id = 7;
    let master = node(&network, "m", master_config, 1000);
    let mut slave_config = ReplicationConfig::slave("local://m");
    slave_config.cluster_id = 8;
    let slave = node(&network, "s", slave_config.clone(), 1000);
    master.start().await.unwrap();
    slave.start().await.unwrap();

    let status = slave
        .wait_for_state(RoleState::Slave(FollowerState::Error), SYNCED)
        .await
        .unwrap();
    assert!(status.last_error.unwrap().contains("Cluster id mismatch"));
    assert_eq!(master.peers().await.total_peers, 0);

    slave_config.cluster_id = 7;
    slave.apply_config(slave_config).await.unwrap();
    slave
        .wait_for_state(RoleState::Slave(FollowerState::Synced), SYNCED)
        .await
        .unwrap();
    assert!(wait_until(|| slave.status().connected).await);

    slave.shutdown().await;
    master.shutdown().await;
}

#[tokio::test]
async fn test_wait_sync_times_out_while_partitioned() {
    let network = LocalNetwork::new();
    let master = node(&network, "m", ReplicationConfig::master(), 1000);
    let slave = node(&network, "s", ReplicationConfig::slave("local://m"), 1000);
    master.start().await.unwrap();
    slave.start().await.unwrap();
    slave
        .wait_for_state(RoleState::Slave(FollowerState::Synced), SYNCED)
        .await
        .unwrap();

    master.open_namespace("ns1").await.unwrap();
    write(&master, "ns1", 0..5).await;
    master.wait_sync("ns1", SYNCED).await.unwrap();
    assert_eq!(master.peers().await.total_peers, 1);

    network.set_reachable(&dsn(&master), false);
    write(&master, "ns1", 5..10).await;
    assert!(matches!(
        master.wait_sync("ns1", Duration::from_millis(200)).await,
        Err(Error::SyncTimeout { .. })
    ));

    network.set_reachable(&dsn(&master), true);
    master.wait_sync("ns1", SYNCED).await.unwrap();
    assert!(converged(&master, &slave, "ns1").await);

    slave.shutdown().await;
    master.shutdown().await;
}

#[tokio::test]
async fn test_force_sync_repairs_diverged_slave() {
    let network = LocalNetwork::new();
    let a = node(&network, "a", ReplicationConfig::master(), 1000);
    let b = node(&network, "b", ReplicationConfig::master(), 1000);
    a.start().await.unwrap();
    b.start().await.unwrap();

    // Same epoch and counters on both sides, different content
    a.open_namespace("x").await.unwrap();
    b.open_namespace("x").await.unwrap();
    a.upsert("x", "k", &b"from-a"[..]).await.unwrap();
    b.upsert("x", "k", &b"from-b"[..]).await.unwrap();

    b.apply_config(ReplicationConfig::slave("local://a")).await.unwrap();
    let status = b
        .wait_for_state(RoleState::Slave(FollowerState::Error), SYNCED)
        .await
        .unwrap();
    assert!(status.last_error.unwrap().contains("hash mismatch"));

    assert_eq!(a.force_sync().await.unwrap(), 1);
    b.wait_for_state(RoleState::Slave(FollowerState::Synced), SYNCED)
        .await
        .unwrap();
    assert!(converged(&a, &b, "x").await);
    assert_eq!(b.get("x", "k").await.unwrap().unwrap(), &b"from-a"[..]);

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_wrong_hash_with_force_flag_resyncs() {
    let network = LocalNetwork::new();
    let a = node(&network, "a", ReplicationConfig::master(), 1000);
    let b = node(&network, "b", ReplicationConfig::master(), 1000);
    a.start().await.unwrap();
    b.start().await.unwrap();

    a.open_namespace("x").await.unwrap();
    b.open_namespace("x").await.unwrap();
    a.upsert("x", "k", &b"from-a"[..]).await.unwrap();
    b.upsert("x", "k", &b"from-b"[..]).await.unwrap();

    let mut replication = ReplicationConfig::slave("local://a");
    replication.force_sync_on_wrong_data_hash = true;
    b.apply_config(replication).await.unwrap();
    b.wait_for_state(RoleState::Slave(FollowerState::Synced), SYNCED)
        .await
        .unwrap();
    assert!(converged(&a, &b, "x").await);

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_slave_force_sync_copies_from_scratch() {
    let network = LocalNetwork::new();
    let master = node(&network, "m", ReplicationConfig::master(), 1000);
    let slave = node(&network, "s", ReplicationConfig::slave("local://m"), 1000);
    master.start().await.unwrap();
    slave.start().await.unwrap();

    master.open_namespace("ns1").await.unwrap();
    write(&master, "ns1", 0..10).await;
    assert!(converged(&master, &slave, "ns1").await);
    assert_eq!(slave.namespace_state("ns1").await.unwrap().retained, 11);

    slave.force_sync().await.unwrap();
    slave
        .wait_for_state(RoleState::Slave(FollowerState::Synced), SYNCED)
        .await
        .unwrap();

    // A full copy leaves the local ring empty at the master's position
    let mut retained = usize::MAX;
    for _ in 0..500 {
        retained = slave.namespace_state("ns1").await.unwrap().retained;
        if retained == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(retained, 0);
    assert!(converged(&master, &slave, "ns1").await);

    slave.shutdown().await;
    master.shutdown().await;
}

#[tokio::test]
async fn test_config_source_drives_roles() {
    let network = LocalNetwork::new();
    let master = node(&network, "m", ReplicationConfig::master(), 1000);
    let other = node(&network, "o", ReplicationConfig::default(), 1000);
    master.start().await.unwrap();
    other.start().await.unwrap();
    assert_eq!(other.status().state, RoleState::Idle);

    let (sender, source) = config_channel();
    other.watch_config(source);

    sender.send(ReplicationConfig::slave("local://m"));
    other
        .wait_for_state(RoleState::Slave(FollowerState::Synced), SYNCED)
        .await
        .unwrap();

    // Invalid snapshots are rejected and the role is kept
    sender.send(ReplicationConfig {
        role: wolfrepl::replication::Role::Slave,
        ..ReplicationConfig::default()
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(other.status().state, RoleState::Slave(FollowerState::Synced));

    let version = sender.send(ReplicationConfig::master());
    other.wait_for_state(RoleState::Master, SYNCED).await.unwrap();
    assert!(wait_until(|| other.config_version() == version).await);

    other.shutdown().await;
    master.shutdown().await;
}
