//! Top-level orchestrator: wires the local SQLite connection, the watched
//! tables, and a [`Broker`] together and runs the reader/publisher/applier
//! workers concurrently, each on its own connection. Analogous to the
//! builder pattern a connection-wrapping sync layer would use, but built around a
//! plain configuration struct handed in by the CLI rather than parsed here
//! (the core crate never touches the filesystem for configuration).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use rusqlite::Connection;
use tokio::sync::{Notify, RwLock};

use crate::applier::{self, ShardState};
use crate::broker::Broker;
use crate::change_log;
use crate::cluster_registry;
use crate::dead_letter;
use crate::envelope::NodeId;
use crate::error::Result;
use crate::lease::Lease;
use crate::metrics::Metrics;
use crate::publisher::{Publisher, PublisherConfig};
use crate::reader::{self, ReaderConfig};
use crate::schema::{SchemaFingerprint, WatchedTable};
use crate::sharding::{self, stream_name};
use crate::snapshot::{self, SeqMap};

/// Plain configuration handed to the node by the CLI binary, after it has
/// parsed a config file or flags — this struct carries no parsing logic of
/// its own.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub db_path: PathBuf,
    pub watched_tables: Vec<String>,
    pub shard_count: u32,
    pub compressed: bool,
    pub stream_prefix: String,
    pub subject_prefix: String,
    pub scan_max_changes: usize,
    pub cleanup_interval: Duration,
    pub fingerprint_recompute_interval: Duration,
    pub snapshot_interval: Duration,
    pub snapshot_path_prefix: String,
    pub restore_on_boot: bool,
    pub lease_ttl: Duration,
    pub software_version: String,
}

/// Runtime node: owns the local connection handle and in-process state.
/// Workers borrow `Arc<Node>` so they can share the metrics and the list of
/// watched tables without each owning a copy.
pub struct Node {
    pub config: NodeConfig,
    pub broker: Arc<dyn Broker>,
    pub metrics: Arc<Metrics>,
    tables: RwLock<Vec<WatchedTable>>,
    fingerprint: RwLock<SchemaFingerprint>,
    wake: Arc<Notify>,
    /// Per-shard sequence a restored snapshot was taken at, if any. A shard
    /// subscriber consults this once, on its first fetch, to skip replaying
    /// everything the snapshot already reflects.
    restored_seq_map: RwLock<SeqMap>,
}

impl Node {
    /// Open the local database, install the change-log store for every
    /// configured watched table, and compute the initial fingerprint.
    pub fn open(config: NodeConfig, broker: Arc<dyn Broker>) -> Result<(Self, Connection)> {
        let conn = Connection::open(&config.db_path)?;
        // WAL mode lets each worker (reader, per-shard applier, snapshot
        // uploader) hold its own connection to the same file concurrently,
        // since `rusqlite::Connection` isn't `Sync`.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        change_log::ensure_suppress_control(&conn)?;
        dead_letter::ensure_table(&conn)?;

        let mut tables = Vec::with_capacity(config.watched_tables.len());
        for name in &config.watched_tables {
            tables.push(WatchedTable::introspect(&conn, name)?);
        }
        change_log::install(&conn, &tables)?;

        let fingerprint = SchemaFingerprint::compute(&tables);
        let wake = Arc::new(Notify::new());
        reader::install_update_hook(&conn, wake.clone());

        let node = Node {
            config,
            broker,
            metrics: Arc::new(Metrics::new()),
            tables: RwLock::new(tables),
            fingerprint: RwLock::new(fingerprint),
            wake,
            restored_seq_map: RwLock::new(SeqMap::default()),
        };
        Ok((node, conn))
    }

    /// Record the seq-map recovered from a boot-time snapshot restore, so
    /// shard subscribers can log the floor they're resuming from. The
    /// durable consumer itself (keyed by this node's stable durable name)
    /// already resumes from its last-acked broker-side position; this is
    /// purely for operators to confirm a restore landed where expected.
    pub async fn adopt_restored_seq_map(&self, seq_map: SeqMap) {
        *self.restored_seq_map.write().await = seq_map;
    }

    fn shard_stream_name(&self, shard: u32) -> String {
        let base = stream_name(&self.config.stream_prefix, shard);
        if self.config.compressed {
            format!("{base}-c")
        } else {
            base
        }
    }

    /// Open another connection to this node's database file. WAL mode
    /// (enabled once, in [`Node::open`]) lets each worker hold its own
    /// connection concurrently rather than serializing through a mutex.
    pub fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.config.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    pub async fn fingerprint(&self) -> SchemaFingerprint {
        *self.fingerprint.read().await
    }

    async fn recompute_fingerprint(&self, conn: &Connection) -> Result<SchemaFingerprint> {
        let mut tables = self.tables.write().await;
        for table in tables.iter_mut() {
            *table = WatchedTable::introspect(conn, &table.name)?;
        }
        let fp = SchemaFingerprint::compute(&tables);
        *self.fingerprint.write().await = fp;
        Ok(fp)
    }

    /// Run the change-reader loop: wait for an update-hook wake (or the
    /// polling interval, whichever comes first), drain every watched
    /// table's unpublished rows, and publish each resulting event.
    pub async fn run_reader(
        &self,
        conn: &Connection,
        publisher: &Publisher,
        poll_interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        let reader_config = ReaderConfig {
            scan_max_changes: self.config.scan_max_changes,
        };
        loop {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reader shutting down");
                        return Ok(());
                    }
                }
            }

            let fp = self.fingerprint().await;
            let tables = self.tables.read().await.clone();
            for table in &tables {
                let events = reader::drain_table(conn, table, &reader_config, fp)?;
                for event in &events {
                    match publisher.publish(event, table).await {
                        Ok(()) => {
                            self.metrics.record_publish();
                            // Mark published only now: a crash between the
                            // publish above and this call just means the
                            // next wake republishes (and the broker dedups
                            // by idempotency key), never silently drops it.
                            if let Err(e) = change_log::mark_published(conn, table, &[event.id]) {
                                warn!("failed to mark change-log row {} published for table {}: {e}", event.id, table.name);
                            }
                        }
                        Err(e) => warn!("publish failed for table {}: {e}", table.name),
                    }
                }
            }
        }
    }

    /// Run one shard's subscription loop until shutdown. Reports state
    /// transitions to the metrics gauge.
    pub async fn run_shard_subscriber(
        &self,
        conn: &Connection,
        shard: u32,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        let stream = self.shard_stream_name(shard);
        self.broker
            .ensure_stream(&stream, Default::default())
            .await?;
        let durable_name = format!("node-{}", self.config.node_id);
        let consumer = self.broker.durable_consumer(&stream, &durable_name).await?;

        if let Some(floor) = self.restored_seq_map.read().await.sequences.get(&shard) {
            info!("shard {shard} resuming from restored snapshot floor {floor}");
        }

        loop {
            if *shutdown.borrow() {
                info!("shard {shard} subscriber shutting down");
                return Ok(());
            }

            let fp = self.fingerprint().await;
            let tables = self.tables.read().await.clone();
            if tables.is_empty() {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            match applier::run_once(
                consumer.as_ref(),
                conn,
                self.config.node_id,
                fp,
                &tables,
                self.config.compressed,
                &self.metrics,
                50,
            )
            .await
            {
                Ok(ShardState::Paused) => {
                    self.metrics.set_shard_paused(shard, true);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                Ok(_) => {
                    self.metrics.set_shard_paused(shard, false);
                }
                Err(e) => {
                    error!("shard {shard} subscriber error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Periodically recompute and republish the schema fingerprint.
    pub async fn run_fingerprint_ticker(
        &self,
        conn: &Connection,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.fingerprint_recompute_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
            let fp = self.recompute_fingerprint(conn).await?;
            let kv = self.broker.kv_bucket(cluster_registry::REGISTRY_BUCKET);
            cluster_registry::publish(kv.as_ref(), self.config.node_id, fp, &self.config.software_version).await?;
        }
    }

    /// Periodically delete old published change-log rows for every watched
    /// table.
    pub async fn run_cleanup_ticker(
        &self,
        conn: &Connection,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.cleanup_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
            let tables = self.tables.read().await.clone();
            for table in &tables {
                change_log::cleanup(conn, table, self.config.cleanup_interval)?;
            }
        }
    }

    /// If this node holds the snapshot lease, periodically back up the
    /// database and upload it along with the current seq-map.
    pub async fn run_snapshot_ticker(
        &self,
        conn: &Connection,
        lease: &mut Lease,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.snapshot_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        if lease.is_held() {
                            self.publish_snapshot(conn).await?;
                            lease.release().await?;
                            self.metrics.set_lease_held(false);
                        }
                        return Ok(());
                    }
                }
            }

            if !lease.is_held() {
                lease.try_acquire().await?;
            } else {
                lease.renew().await?;
            }
            self.metrics.set_lease_held(lease.is_held());

            if lease.is_held() {
                match self.publish_snapshot(conn).await {
                    Ok(()) => self.metrics.record_snapshot_result(true),
                    Err(e) => {
                        warn!("snapshot publish failed: {e}");
                        self.metrics.record_snapshot_result(false);
                    }
                }
            }
        }
    }

    async fn publish_snapshot(&self, conn: &Connection) -> Result<()> {
        let tmp_dir = std::env::temp_dir();
        let tmp_path = tmp_dir.join(format!("harmonylite-snapshot-{}.db", self.config.node_id));
        snapshot::backup_to_file(conn, &tmp_path)?;

        let seq_map = self.current_seq_map().await?;
        let store = self.broker.object_store(&self.config.snapshot_path_prefix);
        let result = snapshot::publish(store.as_ref(), &self.config.snapshot_path_prefix, &tmp_path, &seq_map).await;
        let _ = std::fs::remove_file(&tmp_path);
        result
    }

    /// Each shard's durable-consumer position under this node's own name, so
    /// a node restoring from this snapshot later knows roughly how much of
    /// the stream it can skip replaying.
    pub async fn current_seq_map(&self) -> Result<SeqMap> {
        let durable_name = format!("node-{}", self.config.node_id);
        let mut seq_map = SeqMap::default();
        for shard in 0..self.config.shard_count {
            let stream = self.shard_stream_name(shard);
            self.broker.ensure_stream(&stream, Default::default()).await?;
            let consumer = self.broker.durable_consumer(&stream, &durable_name).await?;
            seq_map.sequences.insert(shard, consumer.last_sequence().await?);
        }
        Ok(seq_map)
    }

    /// Remove every change-log table/trigger this node installed. Used by
    /// `--cleanup`.
    pub async fn remove_cdc_artifacts(&self, conn: &Connection) -> Result<()> {
        let tables = self.tables.read().await.clone();
        change_log::remove_all(conn, &tables)
    }
}

/// Build a [`Publisher`] for `node`, sharing its broker and node id.
pub fn publisher_for(node: &Node) -> Publisher {
    Publisher::new(
        node.broker.clone(),
        node.config.node_id,
        PublisherConfig {
            shard_count: node.config.shard_count,
            compressed: node.config.compressed,
            stream_prefix: node.config.stream_prefix.clone(),
            subject_prefix: node.config.subject_prefix.clone(),
            ..Default::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::FakeBroker;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path, node_id: NodeId) -> NodeConfig {
        NodeConfig {
            node_id,
            db_path: dir.join(format!("node-{node_id}.db")),
            watched_tables: vec!["books".into()],
            shard_count: 1,
            compressed: false,
            stream_prefix: sharding::DEFAULT_STREAM_PREFIX.to_string(),
            subject_prefix: sharding::DEFAULT_SUBJECT_PREFIX.to_string(),
            scan_max_changes: 100,
            cleanup_interval: Duration::from_secs(60),
            fingerprint_recompute_interval: Duration::from_secs(300),
            snapshot_interval: Duration::from_secs(3600),
            snapshot_path_prefix: format!("node-{node_id}"),
            restore_on_boot: false,
            lease_ttl: Duration::from_secs(30),
            software_version: "0.1.0".into(),
        }
    }

    #[tokio::test]
    async fn open_installs_change_log_for_watched_tables() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("node-1.db");
        {
            let setup = Connection::open(&db_path).unwrap();
            setup
                .execute("CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT)", [])
                .unwrap();
        }

        let broker = FakeBroker::new();
        let config = test_config(dir.path(), 1);
        let (node, conn) = Node::open(config, broker).unwrap();

        conn.execute("INSERT INTO books (id, title) VALUES (1, 'Dune')", [])
            .unwrap();
        let fp = node.fingerprint().await;
        let tables = node.tables.read().await.clone();
        let events = reader::drain_table(&conn, &tables[0], &ReaderConfig::default(), fp).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn remove_cdc_artifacts_drops_triggers() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("node-1.db");
        {
            let setup = Connection::open(&db_path).unwrap();
            setup
                .execute("CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT)", [])
                .unwrap();
        }
        let broker = FakeBroker::new();
        let config = test_config(dir.path(), 1);
        let (node, conn) = Node::open(config, broker).unwrap();
        node.remove_cdc_artifacts(&conn).await.unwrap();

        conn.execute("INSERT INTO books (id, title) VALUES (1, 'Dune')", [])
            .unwrap();
        let tables = node.tables.read().await.clone();
        let result = reader::drain_table(&conn, &tables[0], &ReaderConfig::default(), node.fingerprint().await);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn current_seq_map_reflects_each_shard_durable_consumers_last_sequence() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("node-1.db");
        {
            let setup = Connection::open(&db_path).unwrap();
            setup
                .execute("CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT)", [])
                .unwrap();
        }
        let broker = FakeBroker::new();
        let mut config = test_config(dir.path(), 1);
        config.shard_count = 2;
        let (node, _conn) = Node::open(config, broker.clone()).unwrap();

        broker.ensure_stream(&node.shard_stream_name(0), Default::default()).await.unwrap();
        broker.publish(&node.shard_stream_name(0), "s", "k1", vec![1]).await.unwrap();
        broker.publish(&node.shard_stream_name(0), "s", "k2", vec![2]).await.unwrap();

        let seq_map = node.current_seq_map().await.unwrap();
        assert_eq!(seq_map.sequences.get(&0), Some(&2));
        assert_eq!(seq_map.sequences.get(&1), Some(&0));
    }

    #[tokio::test]
    async fn adopt_restored_seq_map_updates_node_state() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("node-1.db");
        {
            let setup = Connection::open(&db_path).unwrap();
            setup
                .execute("CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT)", [])
                .unwrap();
        }
        let broker = FakeBroker::new();
        let config = test_config(dir.path(), 1);
        let (node, _conn) = Node::open(config, broker).unwrap();

        let mut seq_map = SeqMap::default();
        seq_map.sequences.insert(0, 99);
        node.adopt_restored_seq_map(seq_map.clone()).await;
        assert_eq!(*node.restored_seq_map.read().await, seq_map);
    }
}
