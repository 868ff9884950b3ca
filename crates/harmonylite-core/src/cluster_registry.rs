//! Cluster schema registry: one record per node in the broker's KV,
//! publishing this node's schema fingerprint so peers (and operators, via
//! `--schema-status-cluster`) can see the cluster's convergence state.
//! Distinct from [`schema::WatchedTable`](crate::schema) bookkeeping, which
//! is purely in-process — this module is the only thing that touches the
//! broker's KV bucket for schema state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::KvBucket;
use crate::envelope::NodeId;
use crate::error::{HarmonyError, Result};
use crate::schema::SchemaFingerprint;

pub const REGISTRY_BUCKET: &str = "harmonylite-schema-registry";
/// Records older than this are considered stale and ignored by readers.
pub const REGISTRY_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub schema_hash: String,
    pub version: String,
    pub updated_at: DateTime<Utc>,
}

fn key_for(node_id: NodeId) -> String {
    format!("node-{node_id}")
}

/// Publish this node's current fingerprint to the registry bucket.
pub async fn publish(
    kv: &dyn KvBucket,
    node_id: NodeId,
    fingerprint: SchemaFingerprint,
    version: &str,
) -> Result<()> {
    let record = RegistryRecord {
        schema_hash: fingerprint.to_hex(),
        version: version.to_string(),
        updated_at: Utc::now(),
    };
    let bytes = serde_json::to_vec(&record)
        .map_err(|e| HarmonyError::Decode(format!("encode registry record: {e}")))?;
    kv.put(&key_for(node_id), bytes).await?;
    Ok(())
}

/// Read one node's registry record, if present and not stale.
pub async fn read(kv: &dyn KvBucket, node_id: NodeId) -> Result<Option<RegistryRecord>> {
    let Some((bytes, _revision)) = kv.get(&key_for(node_id)).await? else {
        return Ok(None);
    };
    let record: RegistryRecord = serde_json::from_slice(&bytes)
        .map_err(|e| HarmonyError::Decode(format!("decode registry record: {e}")))?;
    if is_stale(&record) {
        return Ok(None);
    }
    Ok(Some(record))
}

fn is_stale(record: &RegistryRecord) -> bool {
    (Utc::now() - record.updated_at).num_seconds() > REGISTRY_TTL_SECS
}

/// Read every node's record out of `known_node_ids`, skipping stale or
/// absent entries. Used by `--schema-status-cluster`.
pub async fn read_cluster(
    kv: Arc<dyn KvBucket>,
    known_node_ids: &[NodeId],
) -> Result<Vec<(NodeId, RegistryRecord)>> {
    let mut out = Vec::new();
    for &node_id in known_node_ids {
        if let Some(record) = read(kv.as_ref(), node_id).await? {
            out.push((node_id, record));
        }
    }
    Ok(out)
}

/// Whether every present (non-stale) record in the cluster shares the same
/// schema hash as `local`. Nodes with no record yet (never published) are
/// excluded rather than treated as mismatched.
pub fn all_converged(local: SchemaFingerprint, records: &[(NodeId, RegistryRecord)]) -> bool {
    let local_hex = local.to_hex();
    records.iter().all(|(_, r)| r.schema_hash == local_hex)
}
