//! Error taxonomy for the replication engine.
//!
//! Mirrors the failure categories the engine actually distinguishes at
//! runtime (see the component design notes on each worker): transient broker
//! I/O is retried, schema mismatches pause a shard rather than erroring,
//! decode failures and poisoned rows are recorded rather than propagated.
//! Only configuration errors are fatal at startup.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarmonyError {
    #[error("broker I/O error (transient): {0}")]
    Transient(String),

    #[error("local database busy: {0}")]
    EngineBusy(#[from] rusqlite::Error),

    #[error("schema fingerprint mismatch: local={local} remote={remote}")]
    SchemaMismatch { local: String, remote: String },

    #[error("failed to decode event payload: {0}")]
    Decode(String),

    #[error("applier failed to write row table={table} pk={pk}: {reason}")]
    Applier {
        table: String,
        pk: String,
        reason: String,
    },

    #[error("snapshot operation failed: {0}")]
    Snapshot(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, HarmonyError>;
