//! Saga orchestration
//!
//! A saga is a declared list of [`StepKind`]s. Each step knows how to
//! execute and how to compensate itself; the orchestrator runs them in
//! order, persists progress after every step and, when a strict step fails,
//! walks the completed steps backwards running their compensations.
//!
//! ```text
//! PENDING -> RUNNING -> COMPLETED
//!               |
//!               +-> COMPENSATING -> COMPENSATED
//!                        |
//!                        +-> FAILED (cleanup task queued)
//! ```

mod definitions;
mod log;
mod orchestrator;
mod steps;

pub use definitions::{
    delete_context, delete_steps, transfer_context, transfer_steps, upload_steps,
};
pub use log::SagaLog;
pub use orchestrator::SagaOrchestrator;
pub use steps::{EngineSteps, StepExecutor};

use archivum_catalog::FileIndexEntry;
use archivum_common::{FileId, NodeId, SagaId};
use archivum_storage::AttributeRecord;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Operation a saga implements
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum SagaKind {
    #[display("upload")]
    Upload,
    #[display("delete")]
    Delete,
    #[display("transfer")]
    Transfer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    #[display("pending")]
    Pending,
    #[display("running")]
    Running,
    #[display("compensating")]
    Compensating,
    #[display("completed")]
    Completed,
    /// Rolled back to the pre-saga state
    #[display("compensated")]
    Compensated,
    /// Compensation could not finish; a cleanup task owns the residue
    #[display("failed")]
    Failed,
}

impl SagaState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Compensated | Self::Failed)
    }
}

/// One step of a saga
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[display("reserve_space")]
    ReserveSpace,
    #[display("transfer_bytes")]
    TransferBytes,
    #[display("copy_from_source")]
    CopyFromSource,
    #[display("write_attribute_record")]
    WriteAttributeRecord,
    #[display("update_metadata_cache")]
    UpdateMetadataCache,
    #[display("tombstone_record")]
    TombstoneRecord,
    #[display("remove_cache_row")]
    RemoveCacheRow,
    #[display("purge_file")]
    PurgeFile,
    #[display("schedule_source_cleanup")]
    ScheduleSourceCleanup,
    #[display("publish_to_directory")]
    PublishToDirectory,
}

impl StepKind {
    /// Strict steps trigger compensation on failure. Directory publication
    /// does not: it is retried in the background instead.
    #[must_use]
    pub const fn is_strict(self) -> bool {
        !matches!(self, Self::PublishToDirectory)
    }
}

/// Data the steps of one saga share and persist
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SagaContext {
    pub file_id: FileId,
    /// Node the saga writes to (or deletes from)
    pub node_id: NodeId,
    /// Transfer source
    pub source_node: Option<NodeId>,
    /// Spooled upload bytes
    pub spool_path: Option<PathBuf>,
    pub size: u64,
    pub sha256: String,
    /// Record to write (upload, transfer) or the record as it was before
    /// the saga touched it (delete)
    pub record: Option<AttributeRecord>,
    /// Cache row as it was when the saga was created
    pub cache_before: Option<FileIndexEntry>,
}

impl SagaContext {
    #[must_use]
    pub fn new(file_id: FileId, node_id: NodeId) -> Self {
        Self {
            file_id,
            node_id,
            source_node: None,
            spool_path: None,
            size: 0,
            sha256: String::new(),
            record: None,
            cache_before: None,
        }
    }
}

/// Durable state of one saga
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    pub saga_id: SagaId,
    pub kind: SagaKind,
    pub steps: Vec<StepKind>,
    /// Index of the next step to execute
    pub current_step: usize,
    pub state: SagaState,
    pub context: SagaContext,
    /// Next step to compensate, counting down
    pub compensation_cursor: Option<usize>,
    pub failed_step: Option<usize>,
    pub last_error: Option<String>,
    /// Directory publication failed and is queued for background retry
    pub publish_pending: bool,
    pub publish_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaInstance {
    #[must_use]
    pub fn new(kind: SagaKind, steps: Vec<StepKind>, context: SagaContext, now: DateTime<Utc>) -> Self {
        Self {
            saga_id: SagaId::new(),
            kind,
            steps,
            current_step: 0,
            state: SagaState::Pending,
            context,
            compensation_cursor: None,
            failed_step: None,
            last_error: None,
            publish_pending: false,
            publish_attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reservation id for this saga's capacity hold
    #[must_use]
    pub fn reservation_id(&self) -> String {
        reservation_id(self.saga_id)
    }

    #[must_use]
    pub fn status(&self) -> SagaStatus {
        SagaStatus {
            saga_id: self.saga_id,
            kind: self.kind,
            file_id: self.context.file_id,
            state: self.state,
            current_step: self.current_step,
            current_step_name: self.steps.get(self.current_step).map(ToString::to_string),
            failed_step: self
                .failed_step
                .and_then(|i| self.steps.get(i))
                .map(ToString::to_string),
            last_error: self.last_error.clone(),
            publish_pending: self.publish_pending,
        }
    }
}

/// Reservation id derived from a saga id
#[must_use]
pub fn reservation_id(saga_id: SagaId) -> String {
    format!("saga/{saga_id}")
}

/// Answer to a saga status query
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SagaStatus {
    pub saga_id: SagaId,
    pub kind: SagaKind,
    pub file_id: FileId,
    pub state: SagaState,
    pub current_step: usize,
    pub current_step_name: Option<String>,
    pub failed_step: Option<String>,
    pub last_error: Option<String>,
    pub publish_pending: bool,
}

/// What a caller learns about a saga that was started.
///
/// An operation that returns `Err` before a saga starts never applied anything.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OperationOutcome {
    /// Every step applied
    Completed,
    /// The file is durable; directory publication is queued for retry
    CompletedPublishPending,
    /// A strict step failed and everything it and earlier steps did was undone
    RolledBack { failed_step: String, error: String },
    /// A strict step failed and compensation could not finish; a cleanup task owns the rest
    CleanupPending { failed_step: String, error: String },
}

impl OperationOutcome {
    /// Whether the operation's effect is durable
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Completed | Self::CompletedPublishPending)
    }
}
