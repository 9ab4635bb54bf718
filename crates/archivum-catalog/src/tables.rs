//! Redb table definitions for the catalog.

use redb::TableDefinition;

// Attribute records too large to live inline on a storage node.
// Key: "node_id/file_id/nonce", one per write, Value: JSON-encoded record
pub const OVERFLOW_RECORDS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("overflow_records");

// Metadata cache: where each file lives and what it is.
// Key: file_id, Value: bincode FileIndexEntry
pub const FILE_INDEX: TableDefinition<&str, &[u8]> = TableDefinition::new("file_index");

// Saga progress, persisted after every step.
// Key: saga_id, Value: JSON-encoded saga instance
pub const SAGAS: TableDefinition<&str, &[u8]> = TableDefinition::new("sagas");

// Two-phase finalization intents.
// Key: file_id, Value: bincode FinalizeIntent
pub const FINALIZATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("finalizations");

// Superseded source copies waiting out their safety margin.
// Key: "file_id/node_id", Value: bincode ScheduledSourceCleanup
pub const SOURCE_CLEANUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("source_cleanups");

// Cleanup queue and tasks parked for manual review.
// Key: CleanupTask::key(), Value: bincode CleanupTask
pub const CLEANUP_TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("cleanup_tasks");
pub const PARKED_TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("parked_tasks");
