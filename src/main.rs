//! WolfRepl - Replication core for embedded document stores
//!
//! Command line front end: config scaffolding and validation, plus an
//! in-process demo cluster.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfrepl::config::{ReplicationConfig, WolfReplConfig};
use wolfrepl::network::{LocalNetwork, Transport};
use wolfrepl::replication::{FollowerState, RoleState};
use wolfrepl::updates::{SubscriptionMode, UpdatesCounter};
use wolfrepl::Node;

/// WolfRepl - Replication core for embedded document stores
#[derive(Parser)]
#[command(name = "wolfrepl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfrepl.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfrepl.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,

        /// DSN this node serves replication on
        #[arg(long, default_value = "local://node-1")]
        dsn: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info {
        /// Print the resolved configuration as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run an in-process cluster: writes, role switches, convergence report
    Demo {
        /// Items written per phase
        #[arg(short, long, default_value_t = 200)]
        items: usize,

        /// WAL records retained per namespace
        #[arg(long, default_value_t = 100)]
        wal_records: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Init {
            output,
            node_id,
            dsn,
        } => run_init(output, node_id, dsn),
        Commands::Validate => run_validate(cli.config),
        Commands::Info { json } => run_info(cli.config, json),
        Commands::Demo { items, wal_records } => run_demo(items, wal_records).await,
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Write a default configuration file
fn run_init(output: PathBuf, node_id: String, dsn: String) -> anyhow::Result<()> {
    let config = WolfReplConfig::new(node_id, dsn);
    let content = format!(
        "# WolfRepl Configuration\n# Generated configuration file\n\n{}",
        config.to_toml()?
    );

    std::fs::write(&output, content)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("\nSet [replication] role and master_dsn to join a cluster.");
    println!("Then check it with: wolfrepl validate --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match WolfReplConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  DSN: {}", config.node.dsn);
            println!("  Role: {}", config.replication.role);
            if let Some(master) = &config.replication.master_dsn {
                println!("  Master: {}", master);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf, json: bool) -> anyhow::Result<()> {
    let config = WolfReplConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let replication = &config.replication;
    println!("WolfRepl Node Information");
    println!("=========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("DSN:              {}", config.node.dsn);
    println!();
    println!("Replication:");
    println!("  Role:           {}", replication.role);
    println!("  Master:         {}", replication.master_dsn.as_deref().unwrap_or("-"));
    println!("  App Name:       {}", replication.app_name);
    println!("  Cluster ID:     {}", replication.cluster_id);
    if replication.namespaces.is_empty() {
        println!("  Namespaces:     (all)");
    } else {
        println!("  Namespaces:     {:?}", replication.namespaces);
    }
    println!(
        "  Force Sync:     logic error {}, wrong data hash {}",
        replication.force_sync_on_logic_error, replication.force_sync_on_wrong_data_hash
    );
    println!();
    println!("WAL Configuration:");
    println!("  Max Records:    {}", config.wal.max_records);
    match config.wal.max_bytes {
        Some(bytes) => println!("  Max Bytes:      {}", bytes),
        None => println!("  Max Bytes:      unbounded"),
    }
    println!();
    println!("Sync Configuration:");
    println!("  Heartbeat:      {} ms", config.sync.heartbeat_interval_ms);
    println!("  Peer Timeout:   {} ms", config.sync.peer_timeout_ms);
    println!("  Buffer Size:    {}", config.updates.buffer_size);

    Ok(())
}

fn demo_node(
    network: &LocalNetwork,
    id: &str,
    replication: ReplicationConfig,
    wal_records: usize,
) -> anyhow::Result<Arc<Node>> {
    let mut config = WolfReplConfig::new(id, format!("local://{}", id));
    config.replication = replication;
    config.wal.max_records = wal_records;
    config.sync.heartbeat_interval_ms = 50;
    let transport: Arc<dyn Transport> = Arc::new(network.clone());
    Ok(Node::new(config, transport)?)
}

async fn write_items(node: &Node, namespace: &str, from: usize, count: usize) -> anyhow::Result<()> {
    for i in from..from + count {
        let item = format!("{{\"id\":{},\"writer\":\"{}\"}}", i, node.id());
        node.upsert(namespace, &i.to_string(), item.into_bytes()).await?;
    }
    Ok(())
}

async fn converge(nodes: &[&Arc<Node>], namespace: &str) -> anyhow::Result<()> {
    let timeout = Duration::from_secs(10);
    futures::future::try_join_all(nodes.iter().map(|n| n.wait_sync(namespace, timeout)))
        .await
        .with_context(|| format!("waiting for '{}' to converge", namespace))?;
    Ok(())
}

/// Run an in-process three node cluster
async fn run_demo(items: usize, wal_records: usize) -> anyhow::Result<()> {
    let network = LocalNetwork::from_config(&WolfReplConfig::new("demo", "local://demo"));
    let synced = Duration::from_secs(10);

    let n1 = demo_node(&network, "n1", ReplicationConfig::master(), wal_records)?;
    let n2 = demo_node(&network, "n2", ReplicationConfig::slave("local://n1"), wal_records)?;
    let n3 = demo_node(
        &network,
        "n3",
        ReplicationConfig::cluster_member("local://n1"),
        wal_records,
    )?;

    let counter = UpdatesCounter::new();
    n3.subscribe(counter.clone(), Vec::<String>::new(), SubscriptionMode::Replace);

    n1.start().await?;
    n2.start().await?;
    n3.start().await?;

    println!("Phase 1: n1 is master");
    n1.open_namespace("items").await?;
    write_items(&n1, "items", 0, items).await?;
    n2.wait_for_state(RoleState::Slave(FollowerState::Synced), synced).await?;
    converge(&[&n1], "items").await?;

    println!("Phase 2: n2 takes over, n1 and n3 follow it");
    n2.apply_config(ReplicationConfig::master()).await?;
    n1.apply_config(ReplicationConfig::slave("local://n2")).await?;
    n3.switch_master("local://n2").await?;
    n1.wait_for_state(RoleState::Slave(FollowerState::Synced), synced).await?;
    write_items(&n2, "items", items, items).await?;
    converge(&[&n2], "items").await?;

    println!("Phase 3: cut n2 off, write past the followers' WAL window, heal");
    network.set_reachable("local://n2", false);
    write_items(&n2, "items", 2 * items, wal_records * 2).await?;
    network.set_reachable("local://n2", true);
    converge(&[&n2], "items").await?;

    let report = serde_json::json!({
        "nodes": [
            { "id": n1.id(), "status": n1.status(), "items": n1.namespace_state("items").await },
            { "id": n2.id(), "status": n2.status(), "items": n2.namespace_state("items").await },
            { "id": n3.id(), "status": n3.status(), "items": n3.namespace_state("items").await },
        ],
        "n3_observed": counter.counts(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    for node in [&n3, &n1, &n2] {
        node.shutdown().await;
    }
    Ok(())
}
