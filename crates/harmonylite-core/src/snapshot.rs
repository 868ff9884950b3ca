//! Snapshot Engine: a consistent file-level copy of the local
//! database plus a per-shard consumer sequence map, uploaded to a blob
//! store so late or reset nodes can catch up without replaying the entire
//! shard history.

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::backup::Backup;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::broker::ObjectStore;
use crate::error::{HarmonyError, Result};

pub const SNAPSHOT_DB_KEY: &str = "snapshot.db";
pub const SEQ_MAP_KEY: &str = "seq-map.cbor";

/// Per-shard durable-consumer sequence, captured alongside a snapshot so a
/// warm-booted node resumes without replaying from zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SeqMap {
    pub sequences: BTreeMap<u32, u64>,
}

impl SeqMap {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| HarmonyError::Snapshot(format!("encode seq-map: {e}")))?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes)
            .map_err(|e| HarmonyError::Snapshot(format!("decode seq-map: {e}")))
    }
}

/// Copy the live database at `source` into a fresh in-memory buffer using
/// SQLite's online backup API, so the copy is internally consistent even
/// while writers are active. Uses a temp file on disk rather than an
/// in-memory target because the database may exceed available memory.
pub fn backup_to_file(source: &Connection, dest_path: &Path) -> Result<()> {
    let mut dest = Connection::open(dest_path).map_err(HarmonyError::from)?;
    let backup = Backup::new(source, &mut dest).map_err(HarmonyError::from)?;
    backup
        .run_to_completion(100, std::time::Duration::from_millis(10), None)
        .map_err(HarmonyError::from)?;
    Ok(())
}

/// Publish a snapshot: the already-backed-up DB file at `db_path` plus the
/// current `seq_map`, uploaded under `path_prefix`. Only the lease holder
/// calls this.
pub async fn publish(
    store: &dyn ObjectStore,
    path_prefix: &str,
    db_path: &Path,
    seq_map: &SeqMap,
) -> Result<()> {
    let db_bytes = tokio::fs::read(db_path)
        .await
        .map_err(|e| HarmonyError::Snapshot(format!("read snapshot file: {e}")))?;
    store
        .put(&format!("{path_prefix}/{SNAPSHOT_DB_KEY}"), db_bytes)
        .await?;
    store
        .put(&format!("{path_prefix}/{SEQ_MAP_KEY}"), seq_map.encode()?)
        .await?;
    Ok(())
}

/// Outcome of a restore attempt on boot.
pub enum RestoreOutcome {
    /// No snapshot existed; caller should start from the earliest available
    /// broker sequence (or empty, for a freshly created stream).
    NotFound,
    /// Snapshot was downloaded to `db_path` and `seq_map` is ready to seed
    /// each shard subscriber's starting position.
    Restored { seq_map: SeqMap },
}

/// Download the latest snapshot (if any) to `db_path`, returning the
/// seq-map so shard subscribers can resume at the right position.
pub async fn restore(
    store: &dyn ObjectStore,
    path_prefix: &str,
    db_path: &Path,
) -> Result<RestoreOutcome> {
    let Some(db_bytes) = store.get(&format!("{path_prefix}/{SNAPSHOT_DB_KEY}")).await? else {
        return Ok(RestoreOutcome::NotFound);
    };
    tokio::fs::write(db_path, &db_bytes)
        .await
        .map_err(|e| HarmonyError::Snapshot(format!("write restored db: {e}")))?;

    let seq_map = match store.get(&format!("{path_prefix}/{SEQ_MAP_KEY}")).await? {
        Some(bytes) => SeqMap::decode(&bytes)?,
        None => SeqMap::default(),
    };
    Ok(RestoreOutcome::Restored { seq_map })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::FakeObjectStore;
    use tempfile::tempdir;

    #[test]
    fn backup_copies_committed_rows() {
        let source = Connection::open_in_memory().unwrap();
        source
            .execute("CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT)", [])
            .unwrap();
        source
            .execute("INSERT INTO books (id, title) VALUES (1, 'Dune')", [])
            .unwrap();

        let dir = tempdir().unwrap();
        let dest_path = dir.path().join("snapshot.db");
        backup_to_file(&source, &dest_path).unwrap();

        let restored = Connection::open(&dest_path).unwrap();
        let title: String = restored
            .query_row("SELECT title FROM books WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(title, "Dune");
    }

    #[tokio::test]
    async fn publish_then_restore_round_trips_db_and_seq_map() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("live.db");
        tokio::fs::write(&db_path, b"fake-db-bytes").await.unwrap();

        let mut seq_map = SeqMap::default();
        seq_map.sequences.insert(0, 42);
        seq_map.sequences.insert(1, 7);

        let store = FakeObjectStore::default();
        publish(&store, "node-1", &db_path, &seq_map).await.unwrap();

        let restore_path = dir.path().join("restored.db");
        let outcome = restore(&store, "node-1", &restore_path).await.unwrap();
        match outcome {
            RestoreOutcome::Restored { seq_map: restored_map } => {
                assert_eq!(restored_map, seq_map);
                let bytes = tokio::fs::read(&restore_path).await.unwrap();
                assert_eq!(bytes, b"fake-db-bytes");
            }
            RestoreOutcome::NotFound => panic!("expected a snapshot"),
        }
    }

    #[tokio::test]
    async fn restore_with_no_snapshot_returns_not_found() {
        let store = FakeObjectStore::default();
        let dir = tempdir().unwrap();
        let outcome = restore(&store, "node-1", &dir.path().join("x.db")).await.unwrap();
        assert!(matches!(outcome, RestoreOutcome::NotFound));
    }
}
