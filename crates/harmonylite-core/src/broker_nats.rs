//! `async-nats` JetStream implementation of the [`Broker`](crate::broker::Broker)
//! contract. This is the only module that speaks the broker's wire protocol
//! directly — everything else in the crate depends on the trait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer::PullConsumer, kv, object_store as nats_object_store};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::broker::{Broker, Consumer, KvBucket, Message, ObjectStore, StreamOpts};
use crate::error::{HarmonyError, Result};

pub struct NatsBroker {
    jetstream: jetstream::Context,
}

impl NatsBroker {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| HarmonyError::Transient(format!("nats connect failed: {e}")))?;
        Ok(NatsBroker {
            jetstream: jetstream::new(client),
        })
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn ensure_stream(&self, stream: &str, opts: StreamOpts) -> Result<()> {
        self.jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: stream.to_string(),
                subjects: vec![format!("{stream}.>")],
                max_messages: opts.max_entries,
                num_replicas: opts.replicas,
                ..Default::default()
            })
            .await
            .map_err(|e| HarmonyError::Transient(format!("ensure_stream {stream} failed: {e}")))?;
        Ok(())
    }

    async fn publish(
        &self,
        _stream: &str,
        subject: &str,
        idempotency_key: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", idempotency_key);
        self.jetstream
            .publish_with_headers(subject.to_string(), headers, payload.into())
            .await
            .map_err(|e| HarmonyError::Transient(format!("publish {subject} failed: {e}")))?
            .await
            .map_err(|e| HarmonyError::Transient(format!("publish ack {subject} failed: {e}")))?;
        Ok(())
    }

    async fn durable_consumer(&self, stream: &str, durable_name: &str) -> Result<Arc<dyn Consumer>> {
        let stream_handle = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| HarmonyError::Transient(format!("get_stream {stream} failed: {e}")))?;
        let consumer: PullConsumer = stream_handle
            .get_or_create_consumer(
                durable_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(durable_name.to_string()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| HarmonyError::Transient(format!("consumer {durable_name} failed: {e}")))?;
        Ok(Arc::new(NatsConsumer {
            consumer,
            pending_acks: Mutex::new(HashMap::new()),
        }))
    }

    fn kv_bucket(&self, bucket: &str) -> Arc<dyn KvBucket> {
        Arc::new(NatsKvBucket {
            jetstream: self.jetstream.clone(),
            bucket: bucket.to_string(),
        })
    }

    fn object_store(&self, bucket: &str) -> Arc<dyn ObjectStore> {
        Arc::new(NatsObjectStore {
            jetstream: self.jetstream.clone(),
            bucket: bucket.to_string(),
        })
    }
}

struct NatsConsumer {
    consumer: PullConsumer,
    /// The real ack/nak handle for each fetched-but-not-yet-acked message,
    /// keyed by stream sequence since that's all the plain [`Message`] the
    /// rest of the crate works with carries. Removed once acked or naked.
    pending_acks: Mutex<HashMap<u64, jetstream::Message>>,
}

#[async_trait]
impl Consumer for NatsConsumer {
    async fn fetch(&self, batch: usize, wait: Duration) -> Result<Vec<Message>> {
        use futures::StreamExt;

        let mut messages = self
            .consumer
            .batch()
            .max_messages(batch)
            .expires(wait)
            .messages()
            .await
            .map_err(|e| HarmonyError::Transient(format!("fetch failed: {e}")))?;

        let mut out = Vec::with_capacity(batch);
        let mut pending = self.pending_acks.lock().await;
        while let Some(msg) = messages.next().await {
            let msg = msg.map_err(|e| HarmonyError::Transient(format!("message error: {e}")))?;
            let info = msg
                .info()
                .map_err(|e| HarmonyError::Transient(format!("message info error: {e}")))?;
            let sequence = info.stream_sequence;
            out.push(Message {
                subject: msg.subject.to_string(),
                payload: msg.payload.to_vec(),
                sequence,
                delivery_count: info.delivered as u64,
            });
            pending.insert(sequence, msg);
        }
        Ok(out)
    }

    async fn ack(&self, msg: &Message) -> Result<()> {
        let handle = self.pending_acks.lock().await.remove(&msg.sequence);
        if let Some(handle) = handle {
            handle
                .ack()
                .await
                .map_err(|e| HarmonyError::Transient(format!("ack seq {} failed: {e}", msg.sequence)))?;
        }
        Ok(())
    }

    async fn nak_with_delay(&self, msg: &Message, delay: Duration) -> Result<()> {
        let handle = self.pending_acks.lock().await.remove(&msg.sequence);
        if let Some(handle) = handle {
            handle
                .ack_with(jetstream::AckKind::Nak(Some(delay)))
                .await
                .map_err(|e| HarmonyError::Transient(format!("nak seq {} failed: {e}", msg.sequence)))?;
        }
        Ok(())
    }

    async fn last_sequence(&self) -> Result<u64> {
        let info = self
            .consumer
            .info()
            .await
            .map_err(|e| HarmonyError::Transient(format!("consumer info failed: {e}")))?;
        Ok(info.stream_info.state.last_sequence)
    }
}

struct NatsKvBucket {
    jetstream: jetstream::Context,
    bucket: String,
}

impl NatsKvBucket {
    async fn store(&self) -> Result<kv::Store> {
        self.jetstream
            .get_or_create_key_value(kv::Config {
                bucket: self.bucket.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| HarmonyError::Transient(format!("kv bucket {} failed: {e}", self.bucket)))
    }
}

#[async_trait]
impl KvBucket for NatsKvBucket {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let store = self.store().await?;
        let entry = store
            .entry(key)
            .await
            .map_err(|e| HarmonyError::Transient(format!("kv get {key} failed: {e}")))?;
        Ok(entry.map(|e| (e.value.to_vec(), e.revision)))
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let store = self.store().await?;
        store
            .create(key, value.into())
            .await
            .map_err(|e| HarmonyError::Transient(format!("kv create {key} failed: {e}")))
    }

    async fn compare_and_swap(&self, key: &str, expected_revision: u64, value: Vec<u8>) -> Result<u64> {
        let store = self.store().await?;
        store
            .update(key, value.into(), expected_revision)
            .await
            .map_err(|e| HarmonyError::Transient(format!("kv cas {key} failed: {e}")))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let store = self.store().await?;
        store
            .put(key, value.into())
            .await
            .map_err(|e| HarmonyError::Transient(format!("kv put {key} failed: {e}")))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let store = self.store().await?;
        store
            .delete(key)
            .await
            .map_err(|e| HarmonyError::Transient(format!("kv delete {key} failed: {e}")))
    }
}

struct NatsObjectStore {
    jetstream: jetstream::Context,
    bucket: String,
}

impl NatsObjectStore {
    async fn store(&self) -> Result<nats_object_store::ObjectStore> {
        self.jetstream
            .get_or_create_object_store(nats_object_store::Config {
                bucket: self.bucket.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| HarmonyError::Transient(format!("object store {} failed: {e}", self.bucket)))
    }
}

#[async_trait]
impl ObjectStore for NatsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let store = self.store().await?;
        store
            .put(key, &mut bytes.as_slice())
            .await
            .map_err(|e| HarmonyError::Transient(format!("object put {key} failed: {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        use tokio::io::AsyncReadExt;

        let store = self.store().await?;
        match store.get(key).await {
            Ok(mut object) => {
                let mut buf = Vec::new();
                object
                    .read_to_end(&mut buf)
                    .await
                    .map_err(|e| HarmonyError::Transient(format!("object read {key} failed: {e}")))?;
                Ok(Some(buf))
            }
            Err(e) if e.kind() == nats_object_store::GetErrorKind::NotFound => Ok(None),
            Err(e) => Err(HarmonyError::Transient(format!("object get {key} failed: {e}"))),
        }
    }
}
