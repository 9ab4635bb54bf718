//! Configuration types for Archivum
//!
//! Every section is defaulted so a partial TOML file (or none at all) yields
//! a usable configuration. Durations are stored as plain integers the way
//! they appear in the file and exposed through accessor methods.

use crate::error::{Error, Result};
use crate::types::{Capacity, CapacityStatus, NodeId, StorageMode, StorageNodeDescriptor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for Archivum
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local storage nodes hosted by this process
    pub node: NodeConfig,
    /// Capacity directory configuration
    pub directory: DirectoryConfig,
    /// Attribute record persistence
    pub attributes: AttributeConfig,
    /// Saga execution
    pub saga: SagaConfig,
    /// Temporary-to-permanent finalization
    pub finalize: FinalizeConfig,
    /// Background reclamation
    pub gc: GcConfig,
    /// Administrative leases
    pub admin: AdminConfig,
    /// Logging
    pub logging: LoggingConfig,
    /// HTTP surface of the daemon
    pub listen: ListenConfig,
}

impl Config {
    /// Parse a configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject internally inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.directory.heartbeat_interval_secs == 0 {
            return Err(Error::Configuration(
                "directory.heartbeat_interval_secs must be positive".into(),
            ));
        }
        if self.directory.ttl_secs <= self.directory.heartbeat_interval_secs {
            return Err(Error::Configuration(format!(
                "directory.ttl_secs ({}) must exceed heartbeat_interval_secs ({})",
                self.directory.ttl_secs, self.directory.heartbeat_interval_secs
            )));
        }
        if self.attributes.inline_limit_bytes == 0 {
            return Err(Error::Configuration(
                "attributes.inline_limit_bytes must be positive".into(),
            ));
        }
        if self.gc.max_attempts == 0 {
            return Err(Error::Configuration("gc.max_attempts must be positive".into()));
        }
        if self.gc.batch_size == 0 {
            return Err(Error::Configuration("gc.batch_size must be positive".into()));
        }
        if self.finalize.copy_chunk_bytes == 0 {
            return Err(Error::Configuration(
                "finalize.copy_chunk_bytes must be positive".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for node in &self.node.nodes {
            if !seen.insert(node.node_id.clone()) {
                return Err(Error::Configuration(format!(
                    "duplicate node_id '{}'",
                    node.node_id
                )));
            }
        }
        Ok(())
    }
}

/// Local storage nodes and process data directory
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Data directory for the catalog and spool files
    pub data_dir: PathBuf,
    /// Storage nodes served by this process
    pub nodes: Vec<LocalNodeConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/archivum"),
            nodes: Vec::new(),
        }
    }
}

/// One storage node hosted locally
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalNodeConfig {
    pub node_id: NodeId,
    pub mode: StorageMode,
    /// Root directory holding the node's blobs and attribute records
    pub root: PathBuf,
    /// Provisioned capacity in bytes
    pub total_capacity: u64,
    /// Placement priority; lower is filled first
    #[serde(default)]
    pub priority: u32,
}

/// Capacity directory configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Interval between heartbeats published by each node
    pub heartbeat_interval_secs: u64,
    /// Age after which an entry without heartbeat is stale (three missed beats)
    pub ttl_secs: u64,
    /// Maximum age of the cached last-known-good snapshot
    pub snapshot_max_staleness_secs: u64,
    /// Remote directory endpoint; `None` hosts the directory in-process
    pub endpoint: Option<String>,
    /// Timeout for remote directory requests
    pub request_timeout_ms: u64,
    /// Emergency floor used when neither the live directory nor the cache serve
    pub static_nodes: Vec<StaticNodeConfig>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            ttl_secs: 90,
            snapshot_max_staleness_secs: 600,
            endpoint: None,
            request_timeout_ms: 2000,
            static_nodes: Vec::new(),
        }
    }
}

impl DirectoryConfig {
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    #[must_use]
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.ttl_secs))
    }

    #[must_use]
    pub fn snapshot_max_staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.snapshot_max_staleness_secs))
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Statically configured node, used as the last fallback tier
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StaticNodeConfig {
    pub node_id: NodeId,
    pub mode: StorageMode,
    pub total_capacity: u64,
    #[serde(default)]
    pub used_capacity: u64,
    #[serde(default)]
    pub priority: u32,
}

impl StaticNodeConfig {
    /// Descriptor for this node as of `now`
    #[must_use]
    pub fn descriptor(&self, now: DateTime<Utc>) -> StorageNodeDescriptor {
        StorageNodeDescriptor {
            node_id: self.node_id.clone(),
            mode: self.mode,
            capacity: Capacity::from_usage(self.total_capacity, self.used_capacity),
            status: CapacityStatus::Ok,
            priority: self.priority,
            last_heartbeat: now,
        }
    }
}

/// Attribute record persistence
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeConfig {
    /// Serialized records above this size use the pointer form
    pub inline_limit_bytes: usize,
    /// How long a writer waits for the per-file exclusion window
    pub lock_wait_ms: u64,
}

impl Default for AttributeConfig {
    fn default() -> Self {
        Self {
            inline_limit_bytes: 4096,
            lock_wait_ms: 5000,
        }
    }
}

impl AttributeConfig {
    #[must_use]
    pub const fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

/// Saga execution
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Default per-step timeout
    pub step_timeout_secs: u64,
    /// Attempts for a step failing with a retryable error
    pub step_retries: u32,
    /// Base backoff between step attempts (doubles each retry)
    pub retry_backoff_ms: u64,
    /// Interval of the background directory-publish retry loop
    pub publish_retry_interval_secs: u64,
    /// Give up on a directory publication after this many attempts; `None` never gives up
    pub publish_retry_max_attempts: Option<u32>,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 300,
            step_retries: 3,
            retry_backoff_ms: 200,
            publish_retry_interval_secs: 60,
            publish_retry_max_attempts: None,
        }
    }
}

impl SagaConfig {
    #[must_use]
    pub const fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    #[must_use]
    pub const fn publish_retry_interval(&self) -> Duration {
        Duration::from_secs(self.publish_retry_interval_secs)
    }
}

/// Temporary-to-permanent finalization
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizeConfig {
    /// Delay between commit and physical removal of the source copy
    pub safety_margin_secs: u64,
    /// Chunk size of the prepare-phase copy
    pub copy_chunk_bytes: usize,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            safety_margin_secs: 24 * 60 * 60,
            copy_chunk_bytes: 1024 * 1024,
        }
    }
}

impl FinalizeConfig {
    #[must_use]
    pub fn safety_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.safety_margin_secs))
    }
}

/// Background reclamation
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Interval between collection cycles
    pub interval_secs: u64,
    /// Minimum age of an unreferenced physical file before it is reclaimed
    pub orphan_grace_secs: u64,
    /// Attempts before a task is parked for manual review
    pub max_attempts: u32,
    /// First retry delay; doubles with each failed attempt
    pub backoff_base_secs: u64,
    /// Maximum tasks executed per cycle
    pub batch_size: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: 6 * 60 * 60,
            orphan_grace_secs: 7 * 24 * 60 * 60,
            max_attempts: 3,
            backoff_base_secs: 60,
            batch_size: 100,
        }
    }
}

impl GcConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub fn orphan_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.orphan_grace_secs))
    }

    /// Delay before retry number `attempts` (1-based)
    #[must_use]
    pub fn backoff_for(&self, attempts: u32) -> chrono::Duration {
        let exp = attempts.saturating_sub(1).min(20);
        chrono::Duration::seconds(secs_i64(self.backoff_base_secs.saturating_mul(1_u64 << exp)))
    }
}

/// Administrative leases
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Default lifetime of an administrative lease
    pub lease_ttl_secs: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 60 * 60,
        }
    }
}

impl AdminConfig {
    #[must_use]
    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.lease_ttl_secs))
    }
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// HTTP surface of the daemon (heartbeat ingestion, health)
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub addr: SocketAddr,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 9300)),
        }
    }
}

fn secs_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX / 1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.directory.heartbeat_interval_secs, 30);
        assert_eq!(config.directory.ttl_secs, 90);
        assert_eq!(config.attributes.inline_limit_bytes, 4096);
        assert_eq!(config.finalize.safety_margin(), chrono::Duration::hours(24));
        assert_eq!(config.gc.interval(), Duration::from_secs(6 * 3600));
        assert_eq!(config.gc.orphan_grace(), chrono::Duration::days(7));
        assert_eq!(config.gc.max_attempts, 3);
        assert!(config.saga.publish_retry_max_attempts.is_none());
        assert_eq!(config.listen.addr.port(), 9300);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [directory]
            ttl_secs = 120

            [[node.nodes]]
            node_id = "tmp-01"
            mode = "temporary_crud"
            root = "/srv/tmp-01"
            total_capacity = 1000000000000
            priority = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.directory.ttl_secs, 120);
        assert_eq!(config.directory.heartbeat_interval_secs, 30);
        assert_eq!(config.node.nodes.len(), 1);
        assert_eq!(config.node.nodes[0].mode, StorageMode::TemporaryCrud);
    }

    #[test]
    fn test_validate_rejects_short_ttl() {
        let mut config = Config::default();
        config.directory.ttl_secs = 30;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_backoff_doubles() {
        let gc = GcConfig::default();
        assert_eq!(gc.backoff_for(1), chrono::Duration::seconds(60));
        assert_eq!(gc.backoff_for(2), chrono::Duration::seconds(120));
        assert_eq!(gc.backoff_for(3), chrono::Duration::seconds(240));
    }
}
