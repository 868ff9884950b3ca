//! Publisher: shard-selects a change event, derives its broker
//! idempotency key, and publishes it with bounded retry for transient
//! broker I/O.

use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::broker::{Broker, StreamOpts};
use crate::codec;
use crate::envelope::{ChangeEvent, NodeId, ReplicationEnvelope};
use crate::error::{HarmonyError, Result};
use crate::schema::WatchedTable;
use crate::sharding::{self, stream_name, subject_name};

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub shard_count: u32,
    pub compressed: bool,
    pub stream_prefix: String,
    pub subject_prefix: String,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        PublisherConfig {
            shard_count: 16,
            compressed: false,
            stream_prefix: sharding::DEFAULT_STREAM_PREFIX.to_string(),
            subject_prefix: sharding::DEFAULT_SUBJECT_PREFIX.to_string(),
            max_retries: 5,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

pub struct Publisher {
    broker: Arc<dyn Broker>,
    node_id: NodeId,
    config: PublisherConfig,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, node_id: NodeId, config: PublisherConfig) -> Self {
        Publisher {
            broker,
            node_id,
            config,
        }
    }

    /// Ensure every shard stream this publisher can address exists.
    pub async fn ensure_streams(&self) -> Result<()> {
        for shard in 0..self.config.shard_count {
            let name = self.shard_stream_name(shard);
            self.broker
                .ensure_stream(&name, StreamOpts::default())
                .await?;
        }
        Ok(())
    }

    /// Publish a single event, retrying transient broker errors with bounded
    /// exponential backoff. Configuration errors and anything else fatal are
    /// propagated immediately.
    pub async fn publish(&self, event: &ChangeEvent, table: &WatchedTable) -> Result<()> {
        let pk_columns: Vec<&str> = table
            .primary_key_columns()
            .into_iter()
            .map(|c| c.name.as_str())
            .collect();
        let pk_bytes = event.primary_key_bytes(&pk_columns);
        let shard = sharding::shard_for_primary_key(&pk_bytes, self.config.shard_count);

        let envelope = ReplicationEnvelope {
            from_node_id: self.node_id,
            payload: event.clone(),
        };
        let payload = codec::encode(&envelope, self.config.compressed)?;
        let idempotency_key = idempotency_key(self.node_id, &event.table_name, event.id);

        let stream = self.shard_stream_name(shard);
        let subject = subject_name(&self.config.subject_prefix, shard);

        let mut attempt = 0;
        loop {
            match self
                .broker
                .publish(&stream, &subject, &idempotency_key, payload.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(HarmonyError::Transient(msg)) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        "publish to {stream} attempt {attempt} failed, retrying: {msg}"
                    );
                    tokio::time::sleep(self.config.retry_base_delay * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn shard_stream_name(&self, shard: u32) -> String {
        let base = stream_name(&self.config.stream_prefix, shard);
        if self.config.compressed {
            format!("{base}-c")
        } else {
            base
        }
    }
}

/// Idempotency key: identifies one specific change-log row on this node, so
/// the broker dedups a retried publish of the same not-yet-acked write
/// without swallowing a later, distinct write to the same primary key (each
/// write gets its own change-log id, even when it touches the same row).
fn idempotency_key(node_id: NodeId, table_name: &str, change_log_id: i64) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(node_id.to_be_bytes());
    hasher.update([0u8]);
    hasher.update(table_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(change_log_id.to_be_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
