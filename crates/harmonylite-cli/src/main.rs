//! HarmonyLite binary: parses `--config` and the rest of the CLI surface, opens
//! the local database, and drives the core engine's workers. The engine
//! crate itself never touches argv or the filesystem for configuration —
//! this binary is the only thing that does.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use harmonylite_core::broker::Broker;
use harmonylite_core::lease::Lease;
use harmonylite_core::rusqlite::Connection;
use harmonylite_core::{cluster_registry, dead_letter, node, NatsBroker, Node};
use log::{error, info};

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "harmonylite", author, version, about = "Leaderless multi-master SQLite replicator", long_about = None)]
struct Args {
    /// Path to the TOML config file.
    #[arg(long)]
    config: PathBuf,

    /// Override the config file's node id.
    #[arg(long)]
    node_id: Option<u64>,

    /// Remove this node's CDC triggers and auxiliary tables, then exit.
    #[arg(long)]
    cleanup: bool,

    /// Force an immediate snapshot upload, then exit.
    #[arg(long)]
    save_snapshot: bool,

    /// Print this node's local schema fingerprint, then exit.
    #[arg(long)]
    schema_status: bool,

    /// Print every known node's schema fingerprint from the cluster registry, then exit.
    #[arg(long)]
    schema_status_cluster: bool,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load(&args.config)?;
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }

    let node_config = config.to_node_config(env!("CARGO_PKG_VERSION"));
    let broker: Arc<dyn Broker> = Arc::new(NatsBroker::connect(&config.broker_url).await?);

    let mut restored_seq_map = None;
    if node_config.restore_on_boot && !node_config.db_path.exists() {
        let store = broker.object_store(&node_config.snapshot_path_prefix);
        match harmonylite_core::snapshot::restore(
            store.as_ref(),
            &node_config.snapshot_path_prefix,
            &node_config.db_path,
        )
        .await?
        {
            harmonylite_core::snapshot::RestoreOutcome::Restored { seq_map } => {
                info!("restored database from snapshot for node {}", node_config.node_id);
                restored_seq_map = Some(seq_map);
            }
            harmonylite_core::snapshot::RestoreOutcome::NotFound => {
                info!("no snapshot found for node {}, starting empty", node_config.node_id);
            }
        }
    }

    let (node, conn) = Node::open(node_config, broker.clone())?;
    if let Some(seq_map) = restored_seq_map {
        node.adopt_restored_seq_map(seq_map).await;
    }

    if args.cleanup {
        node.remove_cdc_artifacts(&conn).await?;
        info!("removed CDC artifacts for node {}", config.node_id);
        return Ok(());
    }

    if args.schema_status {
        println!("local schema fingerprint: {}", node.fingerprint().await);
        return Ok(());
    }

    if args.schema_status_cluster {
        let kv = broker.kv_bucket(cluster_registry::REGISTRY_BUCKET);
        let known: Vec<_> = (0..64).collect();
        let records = cluster_registry::read_cluster(kv, &known).await?;
        for (node_id, record) in &records {
            println!("node {node_id}: {} (v{})", record.schema_hash, record.version);
        }
        let converged = cluster_registry::all_converged(node.fingerprint().await, &records);
        println!("converged: {converged}");
        return Ok(());
    }

    if args.save_snapshot {
        // `run_snapshot_ticker` loops until shutdown; a forced one-shot
        // snapshot just runs the same publish path directly.
        let tmp_path = std::env::temp_dir().join(format!("harmonylite-snapshot-{}.db", config.node_id));
        harmonylite_core::snapshot::backup_to_file(&conn, &tmp_path)?;
        let seq_map = node.current_seq_map().await?;
        let store = broker.object_store(&config.snapshot_path_prefix);
        harmonylite_core::snapshot::publish(
            store.as_ref(),
            &config.snapshot_path_prefix,
            &tmp_path,
            &seq_map,
        )
        .await?;
        let _ = std::fs::remove_file(&tmp_path);
        info!("snapshot published for node {}", config.node_id);
        return Ok(());
    }

    dead_letter::ensure_table(&conn)?;
    run_workers(node, conn).await
}

async fn run_workers(node: Node, conn: Connection) -> Result<(), Box<dyn std::error::Error>> {
    let shard_count = node.config.shard_count;
    let lease_ttl = node.config.lease_ttl;
    let lease_kv = node.broker.kv_bucket(harmonylite_core::lease::LEASE_BUCKET);
    let lease = Lease::new(lease_kv, node.config.node_id, lease_ttl);

    let node = Arc::new(node);
    let publisher = node::publisher_for(&node);
    publisher.ensure_streams().await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Each worker gets its own connection to the database file (WAL mode,
    // enabled in `Node::open`) rather than sharing one, since
    // `rusqlite::Connection` is `Send` but not `Sync`. The reader keeps the
    // connection returned by `Node::open` since that's the one carrying the
    // update-hook registration.
    let reader_node = node.clone();
    let reader_rx = shutdown_rx.clone();
    let reader_handle = tokio::spawn(async move {
        reader_node
            .run_reader(&conn, &publisher, std::time::Duration::from_secs(2), reader_rx)
            .await
    });

    let mut shard_handles = Vec::with_capacity(shard_count as usize);
    for shard in 0..shard_count {
        let shard_node = node.clone();
        let shard_conn = shard_node.open_connection()?;
        let shard_rx = shutdown_rx.clone();
        shard_handles.push(tokio::spawn(async move {
            shard_node.run_shard_subscriber(&shard_conn, shard, shard_rx).await
        }));
    }

    let fp_node = node.clone();
    let fp_conn = fp_node.open_connection()?;
    let fp_rx = shutdown_rx.clone();
    let fingerprint_handle = tokio::spawn(async move { fp_node.run_fingerprint_ticker(&fp_conn, fp_rx).await });

    let cleanup_node = node.clone();
    let cleanup_conn = cleanup_node.open_connection()?;
    let cleanup_rx = shutdown_rx.clone();
    let cleanup_handle = tokio::spawn(async move { cleanup_node.run_cleanup_ticker(&cleanup_conn, cleanup_rx).await });

    let snapshot_node = node.clone();
    let snapshot_conn = snapshot_node.open_connection()?;
    let snapshot_rx = shutdown_rx.clone();
    let snapshot_handle = tokio::spawn(async move {
        let mut lease = lease;
        snapshot_node.run_snapshot_ticker(&snapshot_conn, &mut lease, snapshot_rx).await
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received, draining workers");
    let _ = shutdown_tx.send(true);

    let _ = reader_handle.await;
    for handle in shard_handles {
        let _ = handle.await;
    }
    let _ = fingerprint_handle.await;
    let _ = cleanup_handle.await;
    let _ = snapshot_handle.await;
    Ok(())
}
