//! Stored types for catalog persistence.
//!
//! These types are serialized to redb via bincode. Saga instances are
//! stored as opaque JSON owned by the engine, so they do not appear here.

use archivum_common::{CleanupPriority, FileId, NodeId, RetentionPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---- Metadata cache ----

/// Metadata cache row: the queryable projection of an attribute record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIndexEntry {
    pub file_id: FileId,
    pub node_id: NodeId,
    pub original_filename: String,
    pub retention_policy: RetentionPolicy,
    pub file_size: u64,
    pub sha256: String,
    pub version: u64,
    pub ttl_expires_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

// ---- Finalization ----

/// Phase of a two-phase finalization
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalizePhase {
    /// Copy to the target is in progress; nothing is committed
    Preparing,
    /// Target copy verified; commit may proceed
    Prepared,
    /// Record switched; only bookkeeping remains
    Committed,
}

/// Durable intent of an in-flight finalization
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeIntent {
    pub file_id: FileId,
    pub source_node: NodeId,
    pub target_node: NodeId,
    /// Directory reservation held on the target for the copy
    pub reservation_id: String,
    pub phase: FinalizePhase,
    pub started_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

/// Superseded source copy that may be removed once `delete_after` passes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledSourceCleanup {
    pub file_id: FileId,
    pub source_node: NodeId,
    pub finalized_at: DateTime<Utc>,
    pub delete_after: DateTime<Utc>,
}

impl ScheduledSourceCleanup {
    /// Catalog key
    #[must_use]
    pub fn key(&self) -> String {
        source_cleanup_key(&self.file_id, &self.source_node)
    }
}

/// Catalog key of a scheduled source cleanup
#[must_use]
pub fn source_cleanup_key(file_id: &FileId, node_id: &NodeId) -> String {
    format!("{file_id}/{node_id}")
}

// ---- Cleanup queue ----

/// What a cleanup task reclaims
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CleanupAction {
    /// Temporary file past its TTL
    ExpireTemporary,
    /// Source copy of a finalized file whose safety margin elapsed
    ReclaimSource,
    /// Physical file without an attribute record, past the grace period
    RemoveOrphan,
    /// Residue left behind by a saga whose compensation did not complete
    CompensationResidue,
}

impl CleanupAction {
    /// Short tag used in keys and logs
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::ExpireTemporary => "expire",
            Self::ReclaimSource => "reclaim_source",
            Self::RemoveOrphan => "orphan",
            Self::CompensationResidue => "residue",
        }
    }
}

/// A unit of background reclamation work
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupTask {
    pub file_id: FileId,
    pub node_id: NodeId,
    pub action: CleanupAction,
    pub priority: CleanupPriority,
    pub due_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CleanupTask {
    /// Create a fresh task due at `due_at`
    #[must_use]
    pub fn new(
        file_id: FileId,
        node_id: NodeId,
        action: CleanupAction,
        priority: CleanupPriority,
        due_at: DateTime<Utc>,
    ) -> Self {
        Self {
            file_id,
            node_id,
            action,
            priority,
            due_at,
            attempts: 0,
            last_error: None,
            created_at: due_at,
        }
    }

    /// Deduplication key: one task per action, node and file
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.action.tag(), self.node_id, self.file_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_task_key_dedupes_by_action_node_file() {
        let file_id = FileId::new();
        let now = Utc::now();
        let a = CleanupTask::new(
            file_id,
            NodeId::new("tmp-01"),
            CleanupAction::RemoveOrphan,
            CleanupPriority::Low,
            now,
        );
        let mut b = a.clone();
        b.attempts = 2;
        assert_eq!(a.key(), b.key());

        let c = CleanupTask::new(
            file_id,
            NodeId::new("tmp-01"),
            CleanupAction::ExpireTemporary,
            CleanupPriority::Normal,
            now,
        );
        assert_ne!(a.key(), c.key());
    }
}
