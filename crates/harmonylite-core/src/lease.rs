//! Leader Lease: single-writer election for the snapshot uploader,
//! realized as a TTL'd compare-and-swap key in the broker KV.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::broker::KvBucket;
use crate::envelope::NodeId;
use crate::error::{HarmonyError, Result};

pub const LEASE_BUCKET: &str = "harmonylite-leader";
pub const LEASE_KEY: &str = "snapshot_leader";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseValue {
    holder: NodeId,
    expires_at: DateTime<Utc>,
}

/// Tracks whether this node currently believes it holds the snapshot lease,
/// and the KV revision needed to renew or release it.
pub struct Lease {
    kv: Arc<dyn KvBucket>,
    node_id: NodeId,
    ttl: Duration,
    revision: Option<u64>,
}

impl Lease {
    pub fn new(kv: Arc<dyn KvBucket>, node_id: NodeId, ttl: Duration) -> Self {
        Lease {
            kv,
            node_id,
            ttl,
            revision: None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.revision.is_some()
    }

    /// Attempt to acquire the lease. Succeeds if the key is absent, or if
    /// the existing holder's lease has expired (stolen by CAS-overwriting
    /// it at its current revision).
    pub async fn try_acquire(&mut self) -> Result<bool> {
        match self.kv.get(LEASE_KEY).await? {
            None => match self.create(None).await {
                Ok(()) => Ok(true),
                Err(_) => Ok(false),
            },
            Some((bytes, revision)) => {
                let current = decode(&bytes)?;
                if current.expires_at > Utc::now() {
                    return Ok(false);
                }
                match self.create(Some(revision)).await {
                    Ok(()) => Ok(true),
                    Err(_) => Ok(false),
                }
            }
        }
    }

    async fn create(&mut self, expected_revision: Option<u64>) -> Result<()> {
        let value = LeaseValue {
            holder: self.node_id,
            expires_at: Utc::now() + chrono::Duration::from_std(self.ttl).unwrap(),
        };
        let bytes = encode(&value)?;
        let revision = match expected_revision {
            None => self.kv.create(LEASE_KEY, bytes).await?,
            Some(rev) => self.kv.compare_and_swap(LEASE_KEY, rev, bytes).await?,
        };
        self.revision = Some(revision);
        info!("node {} acquired snapshot lease", self.node_id);
        Ok(())
    }

    /// Renew the lease before it expires. Only valid while held; does
    /// nothing (returns `Ok(false)`) if this node doesn't currently hold it.
    pub async fn renew(&mut self) -> Result<bool> {
        let Some(revision) = self.revision else {
            return Ok(false);
        };
        let value = LeaseValue {
            holder: self.node_id,
            expires_at: Utc::now() + chrono::Duration::from_std(self.ttl).unwrap(),
        };
        let bytes = encode(&value)?;
        match self.kv.compare_and_swap(LEASE_KEY, revision, bytes).await {
            Ok(new_revision) => {
                self.revision = Some(new_revision);
                Ok(true)
            }
            Err(_) => {
                self.revision = None;
                Ok(false)
            }
        }
    }

    /// Release the lease if held, on graceful shutdown.
    pub async fn release(&mut self) -> Result<()> {
        if self.revision.is_some() {
            self.kv.delete(LEASE_KEY).await?;
            self.revision = None;
        }
        Ok(())
    }
}

fn encode(value: &LeaseValue) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| HarmonyError::Decode(format!("encode lease: {e}")))
}

fn decode(bytes: &[u8]) -> Result<LeaseValue> {
    serde_json::from_slice(bytes).map_err(|e| HarmonyError::Decode(format!("decode lease: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::FakeKvBucket;

    #[tokio::test]
    async fn first_candidate_acquires_uncontested() {
        let kv: Arc<dyn KvBucket> = Arc::new(FakeKvBucket::default());
        let mut lease = Lease::new(kv, 1, Duration::from_secs(30));
        assert!(lease.try_acquire().await.unwrap());
        assert!(lease.is_held());
    }

    #[tokio::test]
    async fn second_candidate_fails_while_unexpired() {
        let kv: Arc<dyn KvBucket> = Arc::new(FakeKvBucket::default());
        let mut a = Lease::new(kv.clone(), 1, Duration::from_secs(30));
        let mut b = Lease::new(kv, 2, Duration::from_secs(30));
        assert!(a.try_acquire().await.unwrap());
        assert!(!b.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn release_lets_another_candidate_acquire() {
        let kv: Arc<dyn KvBucket> = Arc::new(FakeKvBucket::default());
        let mut a = Lease::new(kv.clone(), 1, Duration::from_secs(30));
        let mut b = Lease::new(kv, 2, Duration::from_secs(30));
        assert!(a.try_acquire().await.unwrap());
        a.release().await.unwrap();
        assert!(b.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn renew_keeps_the_lease_alive() {
        let kv: Arc<dyn KvBucket> = Arc::new(FakeKvBucket::default());
        let mut lease = Lease::new(kv, 1, Duration::from_secs(30));
        lease.try_acquire().await.unwrap();
        assert!(lease.renew().await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_stolen() {
        let kv: Arc<dyn KvBucket> = Arc::new(FakeKvBucket::default());
        let mut a = Lease::new(kv.clone(), 1, Duration::from_millis(1));
        assert!(a.try_acquire().await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut b = Lease::new(kv, 2, Duration::from_secs(30));
        assert!(b.try_acquire().await.unwrap());
    }
}
