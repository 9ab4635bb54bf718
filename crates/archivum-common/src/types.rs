//! Core type definitions for Archivum
//!
//! This module defines the identifiers, enums and descriptors shared by
//! every component: file and node identities, retention policies, storage
//! node modes and the capacity model published through the directory.

use chrono::{DateTime, Duration, Utc};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// One gigabyte (decimal, as storage vendors count it)
pub const GB: u64 = 1_000_000_000;

/// One terabyte (decimal)
pub const TB: u64 = 1_000 * GB;

/// Globally unique identifier of one file version
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
#[serde(transparent)]
pub struct FileId(Uuid);

impl FileId {
    /// Generate a new random file ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of a storage node (operator-assigned, e.g. "tmp-01")
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(transparent)]
#[display("{_0}")]
pub struct NodeId(String);

impl NodeId {
    /// Create a node ID
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the node ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:?})", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of a saga instance
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into, Display)]
#[serde(transparent)]
#[display("{_0}")]
pub struct SagaId(Uuid);

impl SagaId {
    /// Generate a new random saga ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SagaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SagaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SagaId({})", self.0)
    }
}

impl FromStr for SagaId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Retention policy of a file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Subject to TTL, stored on the mutable tier
    #[display("temporary")]
    Temporary,
    /// Long-term, stored on the append-only tier
    #[display("permanent")]
    Permanent,
}

impl RetentionPolicy {
    /// Storage mode pool a file with this policy must be placed in
    #[must_use]
    pub const fn required_mode(self) -> StorageMode {
        match self {
            Self::Temporary => StorageMode::TemporaryCrud,
            Self::Permanent => StorageMode::PermanentAppendOnly,
        }
    }
}

/// Operating mode of a storage node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Full create/read/update/delete, holds temporary files
    #[display("temporary_crud")]
    TemporaryCrud,
    /// Append-only, holds permanent files
    #[display("permanent_append_only")]
    PermanentAppendOnly,
    /// Serves reads only
    #[display("read_only")]
    ReadOnly,
    /// Keeps attribute records only, no file bytes
    #[display("archive_metadata_only")]
    ArchiveMetadataOnly,
}

impl StorageMode {
    /// Whether new file bytes may be written to a node in this mode
    #[must_use]
    pub const fn accepts_writes(self) -> bool {
        matches!(self, Self::TemporaryCrud | Self::PermanentAppendOnly)
    }

    /// Whether files on a node in this mode may be removed by user operations.
    ///
    /// Append-only nodes still release superseded data through garbage
    /// collection, never through a user delete.
    #[must_use]
    pub const fn allows_user_delete(self) -> bool {
        matches!(self, Self::TemporaryCrud)
    }
}

/// Capacity of a storage node in bytes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

impl Capacity {
    /// Build a capacity from total and used bytes
    #[must_use]
    pub const fn from_usage(total: u64, used: u64) -> Self {
        Self {
            total,
            used,
            free: total.saturating_sub(used),
        }
    }

    /// Capacity with `bytes` additionally held back (reservations)
    #[must_use]
    pub const fn with_held(self, bytes: u64) -> Self {
        Self::from_usage(self.total, self.used.saturating_add(bytes))
    }
}

/// Capacity status tier, ordered by severity
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapacityStatus {
    #[default]
    #[display("OK")]
    Ok,
    #[display("WARNING")]
    Warning,
    #[display("CRITICAL")]
    Critical,
    #[display("FULL")]
    Full,
}

/// Descriptor a storage node publishes to the capacity directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNodeDescriptor {
    pub node_id: NodeId,
    pub mode: StorageMode,
    pub capacity: Capacity,
    pub status: CapacityStatus,
    /// Placement priority; lower values are filled first
    pub priority: u32,
    pub last_heartbeat: DateTime<Utc>,
}

impl StorageNodeDescriptor {
    /// Whether this entry has outlived `ttl` without a heartbeat
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.signed_duration_since(self.last_heartbeat) > ttl
    }
}

/// Priority of a cleanup task; sorts high first
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPriority {
    #[display("high")]
    High,
    #[display("normal")]
    Normal,
    #[display("low")]
    Low,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_maps_to_mode_pool() {
        assert_eq!(
            RetentionPolicy::Temporary.required_mode(),
            StorageMode::TemporaryCrud
        );
        assert_eq!(
            RetentionPolicy::Permanent.required_mode(),
            StorageMode::PermanentAppendOnly
        );
    }

    #[test]
    fn test_capacity_with_held() {
        let cap = Capacity::from_usage(100, 40);
        assert_eq!(cap.free, 60);
        let held = cap.with_held(70);
        assert_eq!(held.used, 110);
        assert_eq!(held.free, 0);
    }

    #[test]
    fn test_status_severity_order() {
        assert!(CapacityStatus::Ok < CapacityStatus::Warning);
        assert!(CapacityStatus::Critical < CapacityStatus::Full);
        assert!(CleanupPriority::High < CleanupPriority::Low);
    }

    #[test]
    fn test_descriptor_staleness() {
        let now = Utc::now();
        let desc = StorageNodeDescriptor {
            node_id: NodeId::new("n1"),
            mode: StorageMode::TemporaryCrud,
            capacity: Capacity::from_usage(TB, 0),
            status: CapacityStatus::Ok,
            priority: 1,
            last_heartbeat: now - Duration::seconds(91),
        };
        assert!(desc.is_stale(now, Duration::seconds(90)));
        assert!(!desc.is_stale(now, Duration::seconds(120)));
    }

    #[test]
    fn test_file_id_round_trips_through_string() {
        let id = FileId::new();
        let parsed: FileId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
