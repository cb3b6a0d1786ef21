//! Configuration for a metadata node.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command log replication settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandLogConfig {
    /// Acknowledgements (local copy included) needed to commit an entry.
    /// `None` means a majority of the local copy plus replicas.
    pub write_quorum: Option<usize>,
    /// How long to wait for a single replica before counting it as failed.
    pub replica_timeout_ms: u64,
    /// Entries kept behind the latest snapshot before the log is compacted.
    /// Nodes lagging further than this must restore from a snapshot.
    pub retain_entries: u64,
}

impl Default for CommandLogConfig {
    fn default() -> Self {
        Self {
            write_quorum: None,
            replica_timeout_ms: 5_000,
            retain_entries: 10_000,
        }
    }
}

/// Configuration for a metadata node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// URL this node is reachable at; it identifies the node in the cluster.
    pub bind_url: String,
    /// Directory for the on-disk store. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Reject queries from anonymous callers.
    pub authentication_enabled: bool,
    /// Create a `default` retention policy together with every new database.
    pub retention_auto_create: bool,
    /// Interval between retention enforcement passes.
    pub retention_check_interval_secs: u64,
    /// Interval between shard group pre-creation passes.
    pub shard_group_precreate_check_secs: u64,
    /// How far ahead of the current time shard groups are pre-created.
    pub shard_group_precreate_advance_secs: u64,
    /// Default deadline for waiting on a submitted command to be applied.
    pub sync_timeout_ms: u64,
    /// Take a local snapshot after this many applied entries.
    pub snapshot_interval: u64,
    /// Maximum number of apply outcomes kept for submitters to collect.
    pub outcome_capacity: usize,
    /// PBKDF2 iterations for new password hashes.
    pub password_hash_iterations: u32,
    /// Command log replication settings.
    pub command_log: CommandLogConfig,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            bind_url: String::from("http://localhost:8086"),
            data_dir: None,
            authentication_enabled: false,
            retention_auto_create: true,
            retention_check_interval_secs: 600,
            shard_group_precreate_check_secs: 600,
            shard_group_precreate_advance_secs: 1_800,
            sync_timeout_ms: 5_000,
            snapshot_interval: 1_000,
            outcome_capacity: 1_024,
            password_hash_iterations: 10_000,
            command_log: CommandLogConfig::default(),
        }
    }
}

impl MetaConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: MetaConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that would make the node unusable.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_url.is_empty() {
            anyhow::bail!("bind_url must be set");
        }
        if self.retention_check_interval_secs == 0 {
            anyhow::bail!("retention_check_interval_secs must be non-zero");
        }
        if self.shard_group_precreate_check_secs == 0 {
            anyhow::bail!("shard_group_precreate_check_secs must be non-zero");
        }
        if self.snapshot_interval == 0 {
            anyhow::bail!("snapshot_interval must be non-zero");
        }
        if self.password_hash_iterations == 0 {
            anyhow::bail!("password_hash_iterations must be non-zero");
        }
        Ok(())
    }

    /// Interval between retention enforcement passes.
    pub fn retention_check_interval(&self) -> Duration {
        Duration::from_secs(self.retention_check_interval_secs)
    }

    /// Interval between shard group pre-creation passes.
    pub fn shard_group_precreate_check_interval(&self) -> Duration {
        Duration::from_secs(self.shard_group_precreate_check_secs)
    }

    /// Pre-creation look-ahead.
    pub fn shard_group_precreate_advance(&self) -> Duration {
        Duration::from_secs(self.shard_group_precreate_advance_secs)
    }

    /// Default Sync deadline.
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}
