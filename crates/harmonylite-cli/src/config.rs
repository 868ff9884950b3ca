//! TOML configuration surface. The core engine crate never touches
//! the filesystem for configuration; this module owns loading and handing
//! the result to [`harmonylite_core::NodeConfig`] as a plain struct.

use std::path::{Path, PathBuf};
use std::time::Duration;

use harmonylite_core::NodeConfig;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub node_id: u64,
    pub database_path: PathBuf,
    pub watched_tables: Vec<String>,
    pub broker_url: String,
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default = "default_scan_max_changes")]
    pub scan_max_changes: usize,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_fingerprint_recompute_interval_secs")]
    pub fingerprint_recompute_interval_secs: u64,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "default_snapshot_path_prefix")]
    pub snapshot_path_prefix: String,
    #[serde(default)]
    pub restore_on_boot: bool,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

fn default_shard_count() -> u32 {
    16
}
fn default_stream_prefix() -> String {
    harmonylite_core::sharding::DEFAULT_STREAM_PREFIX.to_string()
}
fn default_subject_prefix() -> String {
    harmonylite_core::sharding::DEFAULT_SUBJECT_PREFIX.to_string()
}
fn default_scan_max_changes() -> usize {
    500
}
fn default_cleanup_interval_secs() -> u64 {
    300
}
fn default_fingerprint_recompute_interval_secs() -> u64 {
    300
}
fn default_snapshot_interval_secs() -> u64 {
    3600
}
fn default_snapshot_path_prefix() -> String {
    "harmonylite".to_string()
}
fn default_lease_ttl_secs() -> u64 {
    30
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_node_config(&self, version: &str) -> NodeConfig {
        NodeConfig {
            node_id: self.node_id,
            db_path: self.database_path.clone(),
            watched_tables: self.watched_tables.clone(),
            shard_count: self.shard_count,
            compressed: self.compressed,
            stream_prefix: self.stream_prefix.clone(),
            subject_prefix: self.subject_prefix.clone(),
            scan_max_changes: self.scan_max_changes,
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            fingerprint_recompute_interval: Duration::from_secs(
                self.fingerprint_recompute_interval_secs,
            ),
            snapshot_interval: Duration::from_secs(self.snapshot_interval_secs),
            snapshot_path_prefix: self.snapshot_path_prefix.clone(),
            restore_on_boot: self.restore_on_boot,
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            software_version: version.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn minimal_config_fills_in_defaults() {
        let file = write_config(
            r#"
            node_id = 1
            database_path = "/tmp/harmonylite.db"
            watched_tables = ["books"]
            broker_url = "nats://localhost:4222"
            "#,
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.shard_count, 16);
        assert_eq!(config.scan_max_changes, 500);
        assert_eq!(config.stream_prefix, "harmonylite-shard");
    }

    #[test]
    fn explicit_values_override_defaults() {
        let file = write_config(
            r#"
            node_id = 2
            database_path = "/tmp/harmonylite.db"
            watched_tables = ["books", "authors"]
            broker_url = "nats://localhost:4222"
            shard_count = 4
            compressed = true
            "#,
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.shard_count, 4);
        assert!(config.compressed);
        assert_eq!(config.watched_tables, vec!["books", "authors"]);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Config::load(Path::new("/nonexistent/harmonylite.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let file = write_config("this is not valid toml {{{");
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn stream_and_subject_prefixes_reach_the_node_config() {
        let file = write_config(
            r#"
            node_id = 3
            database_path = "/tmp/harmonylite.db"
            watched_tables = ["books"]
            broker_url = "nats://localhost:4222"
            stream_prefix = "cluster-a-shard"
            subject_prefix = "cluster-a.shard"
            restore_on_boot = true
            "#,
        );
        let config = Config::load(file.path()).unwrap();
        let node_config = config.to_node_config("0.1.0");
        assert_eq!(node_config.stream_prefix, "cluster-a-shard");
        assert_eq!(node_config.subject_prefix, "cluster-a.shard");
        assert!(node_config.restore_on_boot);
    }
}
