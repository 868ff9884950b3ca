//! Broker contract: the durable stream/KV/object-store surface the
//! engine depends on, kept as a trait so the real `async-nats` backend and
//! the in-memory test double satisfy the same interface. Nothing in this
//! module talks to a wire protocol directly outside of [`NatsBroker`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{HarmonyError, Result};

/// A single delivered message pulled from a durable consumer.
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub payload: Vec<u8>,
    pub sequence: u64,
    pub delivery_count: u64,
}

/// Stream creation options; auto-created on startup if missing.
#[derive(Debug, Clone)]
pub struct StreamOpts {
    pub max_entries: i64,
    pub replicas: usize,
}

impl Default for StreamOpts {
    fn default() -> Self {
        StreamOpts {
            max_entries: -1,
            replicas: 1,
        }
    }
}

/// A durable pull consumer bound to one shard's stream.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn fetch(&self, batch: usize, wait: Duration) -> Result<Vec<Message>>;
    async fn ack(&self, msg: &Message) -> Result<()>;
    async fn nak_with_delay(&self, msg: &Message, delay: Duration) -> Result<()>;
    /// Last sequence known to the broker for this stream (for seq-map restore).
    async fn last_sequence(&self) -> Result<u64>;
}

/// TTL + compare-and-swap key-value bucket, used for the schema registry and
/// the leader lease.
#[async_trait]
pub trait KvBucket: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>>;
    /// Succeeds only if the key doesn't currently exist; returns the new revision.
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<u64>;
    /// Succeeds only if the key's current revision equals `expected_revision`.
    async fn compare_and_swap(&self, key: &str, expected_revision: u64, value: Vec<u8>) -> Result<u64>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Snapshot blob sink.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// The full broker contract a [`publisher`](crate::publisher) and
/// [`applier`](crate::applier) need: stream publish/consume, a KV bucket
/// accessor, and an object store accessor.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn ensure_stream(&self, stream: &str, opts: StreamOpts) -> Result<()>;
    async fn publish(&self, stream: &str, subject: &str, idempotency_key: &str, payload: Vec<u8>) -> Result<()>;
    async fn durable_consumer(&self, stream: &str, durable_name: &str) -> Result<Arc<dyn Consumer>>;
    fn kv_bucket(&self, bucket: &str) -> Arc<dyn KvBucket>;
    fn object_store(&self, bucket: &str) -> Arc<dyn ObjectStore>;
}

// ---------------------------------------------------------------------
// In-memory fake broker, used by the integration test harness.
// ---------------------------------------------------------------------

#[derive(Default)]
struct FakeStreamState {
    messages: Vec<Message>,
    next_sequence: u64,
    idempotency_keys: std::collections::HashSet<String>,
}

/// In-process broker double. Each shard stream is a plain `Vec<Message>`
/// shared across all consumers registered against it — consumers track
/// their own cursor so multiple nodes can pull independently, mirroring a
/// real durable-consumer's per-consumer position.
pub struct FakeBroker {
    streams: Mutex<HashMap<String, Arc<Mutex<FakeStreamState>>>>,
    consumers: Mutex<HashMap<(String, String), Arc<FakeConsumer>>>,
    kv: Mutex<HashMap<String, Arc<FakeKvBucket>>>,
    objects: Mutex<HashMap<String, Arc<FakeObjectStore>>>,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeBroker {
            streams: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            kv: Mutex::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
        })
    }

    async fn stream_state(&self, stream: &str) -> Arc<Mutex<FakeStreamState>> {
        let mut streams = self.streams.lock().await;
        streams
            .entry(stream.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(FakeStreamState::default())))
            .clone()
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn ensure_stream(&self, stream: &str, _opts: StreamOpts) -> Result<()> {
        self.stream_state(stream).await;
        Ok(())
    }

    async fn publish(&self, stream: &str, subject: &str, idempotency_key: &str, payload: Vec<u8>) -> Result<()> {
        let state = self.stream_state(stream).await;
        let mut state = state.lock().await;
        if !state.idempotency_keys.insert(idempotency_key.to_string()) {
            return Ok(());
        }
        state.next_sequence += 1;
        let sequence = state.next_sequence;
        state.messages.push(Message {
            subject: subject.to_string(),
            payload,
            sequence,
            delivery_count: 0,
        });
        Ok(())
    }

    async fn durable_consumer(&self, stream: &str, durable_name: &str) -> Result<Arc<dyn Consumer>> {
        // A durable consumer's position is tied to its name on the broker,
        // not to the caller's handle — re-requesting the same (stream, name)
        // must resume from where it left off, the way a real JetStream
        // durable consumer survives a client reconnect.
        let key = (stream.to_string(), durable_name.to_string());
        let mut consumers = self.consumers.lock().await;
        if let Some(existing) = consumers.get(&key) {
            return Ok(existing.clone());
        }
        let state = self.stream_state(stream).await;
        let consumer = Arc::new(FakeConsumer {
            state,
            durable_name: durable_name.to_string(),
            cursor: Mutex::new(0),
        });
        consumers.insert(key, consumer.clone());
        Ok(consumer)
    }

    fn kv_bucket(&self, bucket: &str) -> Arc<dyn KvBucket> {
        // `try_lock` is safe here: this path only ever runs from async
        // contexts that don't hold the mutex already.
        let mut kv = self.kv.try_lock().expect("kv bucket map uncontended");
        kv.entry(bucket.to_string())
            .or_insert_with(|| Arc::new(FakeKvBucket::default()))
            .clone()
    }

    fn object_store(&self, bucket: &str) -> Arc<dyn ObjectStore> {
        let mut objects = self.objects.try_lock().expect("object store map uncontended");
        objects
            .entry(bucket.to_string())
            .or_insert_with(|| Arc::new(FakeObjectStore::default()))
            .clone()
    }
}

struct FakeConsumer {
    state: Arc<Mutex<FakeStreamState>>,
    #[allow(dead_code)]
    durable_name: String,
    cursor: Mutex<usize>,
}

#[async_trait]
impl Consumer for FakeConsumer {
    async fn fetch(&self, batch: usize, _wait: Duration) -> Result<Vec<Message>> {
        let state = self.state.lock().await;
        let mut cursor = self.cursor.lock().await;
        let start = *cursor;
        let end = (start + batch).min(state.messages.len());
        let batch = state.messages[start..end].to_vec();
        *cursor = end;
        Ok(batch)
    }

    async fn ack(&self, _msg: &Message) -> Result<()> {
        Ok(())
    }

    async fn nak_with_delay(&self, msg: &Message, _delay: Duration) -> Result<()> {
        let mut cursor = self.cursor.lock().await;
        if *cursor > 0 && msg.sequence > 0 {
            *cursor -= 1;
        }
        Ok(())
    }

    async fn last_sequence(&self) -> Result<u64> {
        Ok(self.state.lock().await.next_sequence)
    }
}

#[derive(Default)]
struct FakeKvEntry {
    value: Vec<u8>,
    revision: u64,
}

#[derive(Default)]
pub struct FakeKvBucket {
    entries: Mutex<HashMap<String, FakeKvEntry>>,
}

#[async_trait]
impl KvBucket for FakeKvBucket {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).map(|e| (e.value.clone(), e.revision)))
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(key) {
            return Err(HarmonyError::Transient(format!(
                "key {key} already exists"
            )));
        }
        entries.insert(key.to_string(), FakeKvEntry { value, revision: 1 });
        Ok(1)
    }

    async fn compare_and_swap(&self, key: &str, expected_revision: u64, value: Vec<u8>) -> Result<u64> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get(key)
            .ok_or_else(|| HarmonyError::Transient(format!("key {key} missing")))?;
        if entry.revision != expected_revision {
            return Err(HarmonyError::Transient(format!(
                "revision mismatch for {key}: expected {expected_revision}, got {}",
                entry.revision
            )));
        }
        let revision = entry.revision + 1;
        entries.insert(key.to_string(), FakeKvEntry { value, revision });
        Ok(revision)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let mut entries = self.entries.lock().await;
        let revision = entries.get(key).map(|e| e.revision + 1).unwrap_or(1);
        entries.insert(key.to_string(), FakeKvEntry { value, revision });
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.objects.lock().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.lock().await.get(key).cloned())
    }
}
