//! Archivum Engine - storage coordination
//!
//! Everything that spans more than one node or store lives here: sagas for
//! upload, delete and transfer, two-phase finalization of temporary files,
//! background reclamation and deferred directory publication.
//!
//! [`StorageEngine`] is the entry point; the coordinators it wires together
//! are exposed for the daemon's background loops and for tests.

pub mod context;
pub mod engine;
pub mod events;
pub mod finalize;
pub mod gc;
pub mod lease;
pub mod node;
pub mod publish;
pub mod saga;

#[cfg(test)]
mod testutil;

pub use context::{ActiveFiles, EngineContext};
pub use engine::{
    OperationResult, REBUILD_LEASE, RecoveryReport, StorageEngine, UploadRequest, UploadResult,
};
pub use events::{EventBus, FileEvent};
pub use finalize::{FinalizationCoordinator, FinalizeOutcome};
pub use gc::{CycleReport, ExecutionSummary, GC_LEASE, GarbageCollector};
pub use lease::{Lease, LeaseManager};
pub use node::{NodeRegistry, StorageNode};
pub use publish::{PublishRetrier, PublishRetryReport};
pub use saga::{OperationOutcome, SagaKind, SagaState, SagaStatus, StepExecutor, StepKind};
