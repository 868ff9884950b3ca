//! Shard assignment: a row's primary key deterministically picks one of the
//! cluster's shard logs, so every node publishes and subscribes to the same
//! shard for a given row regardless of which node wrote it first.

use sha2::{Digest, Sha256};

/// Map a primary-key byte string to a shard index in `0..shard_count`.
///
/// Hashes with SHA-256 rather than a faster non-cryptographic hash so shard
/// placement is stable across process restarts and architectures without
/// needing to pin a specific hasher's algorithm version.
pub fn shard_for_primary_key(pk_bytes: &[u8], shard_count: u32) -> u32 {
    assert!(shard_count > 0, "shard_count must be positive");
    let digest = Sha256::digest(pk_bytes);
    let mut acc = [0u8; 8];
    acc.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(acc) % shard_count as u64) as u32
}

pub const DEFAULT_STREAM_PREFIX: &str = "harmonylite-shard";
pub const DEFAULT_SUBJECT_PREFIX: &str = "harmonylite.shard";

/// Stream name for a shard under `prefix`, e.g. `<prefix>-3`. Two clusters
/// configured with distinct prefixes never collide on the same broker.
pub fn stream_name(prefix: &str, shard: u32) -> String {
    format!("{prefix}-{shard}")
}

/// Subject name for a shard under `prefix`, matching the stream name so a
/// single durable consumer per shard can subscribe without a subject filter.
pub fn subject_name(prefix: &str, shard: u32) -> String {
    format!("{prefix}.{shard}")
}
