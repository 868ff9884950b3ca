pub mod applier;
pub mod broker;
pub mod broker_nats;
pub mod change_log;
pub mod cluster_registry;
pub mod codec;
pub mod dead_letter;
pub mod envelope;
pub mod error;
pub mod lease;
pub mod metrics;
pub mod node;
pub mod publisher;
pub mod reader;
pub mod schema;
pub mod sharding;
pub mod snapshot;
pub mod value;
pub mod watched_table_registry;

pub use broker::{Broker, Consumer, FakeBroker, KvBucket, ObjectStore};
pub use broker_nats::NatsBroker;
pub use envelope::{ChangeEvent, ChangeType, NodeId, ReplicationEnvelope};
pub use error::{HarmonyError, Result};
pub use node::{Node, NodeConfig};
pub use schema::{ColumnDescriptor, SchemaFingerprint, WatchedTable};
pub use value::Value;
pub use watched_table_registry::WatchedTableDecl;

#[cfg(feature = "derive")]
pub mod derive {
    pub use harmonylite_derive::*;
}

pub use rusqlite;
pub use async_trait;
pub use inventory;
