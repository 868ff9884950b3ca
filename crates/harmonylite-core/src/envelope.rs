//! Wire types exchanged between nodes over the replication log.
//!
//! Mirrors the shape of a CDC message: an originating node id (for
//! [echo suppression](crate::applier)) wrapping a [`ChangeEvent`] whose row
//! is a `table_name -> value` map, tagged with the publisher's schema
//! fingerprint so the [applier](crate::applier) can gate on it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::schema::SchemaFingerprint;
use crate::value::Value;

/// Identifies a node in the cluster. Carried on every envelope so appliers
/// can discard their own publishes (self-echo suppression).
pub type NodeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Insert => "insert",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(ChangeType::Insert),
            "update" => Some(ChangeType::Update),
            "delete" => Some(ChangeType::Delete),
            _ => None,
        }
    }
}

/// A single row-level change, sufficient to reproduce the row's state on any
/// peer. `row` uses a `BTreeMap` so non-PK column ordering is deterministic
/// on the wire without needing to track an explicit column list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Monotonic local id from the change-log row that produced this event.
    pub id: i64,
    pub change_type: ChangeType,
    pub table_name: String,
    pub row: BTreeMap<String, Value>,
    /// The publisher's schema fingerprint at the time of capture.
    pub table_hash: [u8; 32],
}

impl ChangeEvent {
    pub fn table_fingerprint(&self) -> SchemaFingerprint {
        SchemaFingerprint(self.table_hash)
    }

    /// Extract the primary-key tuple as a canonical byte string, given the
    /// key's column names in order. Used both for shard selection and for
    /// the broker idempotency key.
    pub fn primary_key_bytes(&self, pk_columns: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for name in pk_columns {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            match self.row.get(*name) {
                Some(v) => encode_value_for_key(v, &mut out),
                None => out.push(0xff),
            }
            out.push(0);
        }
        out
    }
}

fn encode_value_for_key(v: &Value, out: &mut Vec<u8>) {
    match v {
        Value::Null => out.push(0),
        Value::Integer(i) => {
            out.push(1);
            out.extend_from_slice(&i.to_be_bytes());
        }
        Value::Real(f) => {
            out.push(2);
            out.extend_from_slice(&f.to_be_bytes());
        }
        Value::Bool(b) => {
            out.push(3);
            out.push(*b as u8);
        }
        Value::Text(s) => {
            out.push(4);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Blob(b) => {
            out.push(5);
            out.extend_from_slice(b);
        }
        Value::Time(t) => {
            out.push(6);
            out.extend_from_slice(&t.timestamp_nanos_opt().unwrap_or(0).to_be_bytes());
        }
    }
}

/// The unit actually sent over the broker: originating node id + payload.
/// An applier discards any envelope whose `from_node_id` equals its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationEnvelope {
    pub from_node_id: NodeId,
    pub payload: ChangeEvent,
}
