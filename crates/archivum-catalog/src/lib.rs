//! Archivum Catalog - durable bookkeeping shared by all storage nodes
//!
//! This crate implements the relational side of the system on top of redb:
//! overflow storage for oversized attribute records, the metadata cache,
//! and the logs that make sagas, finalization and reclamation restartable.

pub mod store;
pub mod tables;
pub mod types;

// Re-exports
pub use store::{Catalog, CatalogError, CatalogResult};
pub use types::{
    CleanupAction, CleanupTask, FileIndexEntry, FinalizeIntent, FinalizePhase,
    ScheduledSourceCleanup,
};
