//! Step lists of the built-in sagas and the contexts they start from

use super::{SagaContext, StepKind};
use crate::context::EngineContext;
use archivum_common::{NodeId, Result};
use archivum_storage::AttributeRecord;

/// reserve -> transfer bytes -> write record -> update cache -> publish
#[must_use]
pub fn upload_steps() -> Vec<StepKind> {
    vec![
        StepKind::ReserveSpace,
        StepKind::TransferBytes,
        StepKind::WriteAttributeRecord,
        StepKind::UpdateMetadataCache,
        StepKind::PublishToDirectory,
    ]
}

/// tombstone -> drop cache row -> purge bytes and record -> publish
#[must_use]
pub fn delete_steps() -> Vec<StepKind> {
    vec![
        StepKind::TombstoneRecord,
        StepKind::RemoveCacheRow,
        StepKind::PurgeFile,
        StepKind::PublishToDirectory,
    ]
}

/// Same-mode rebalance. The source copy is only reclaimed by the collector
/// once the safety margin has passed.
#[must_use]
pub fn transfer_steps() -> Vec<StepKind> {
    vec![
        StepKind::ReserveSpace,
        StepKind::CopyFromSource,
        StepKind::WriteAttributeRecord,
        StepKind::UpdateMetadataCache,
        StepKind::ScheduleSourceCleanup,
        StepKind::PublishToDirectory,
    ]
}

/// Context for deleting `record` from `node_id`
pub fn delete_context(
    engine: &EngineContext,
    node_id: NodeId,
    record: AttributeRecord,
) -> Result<SagaContext> {
    let mut saga = SagaContext::new(record.file_id, node_id);
    saga.size = record.file_size;
    saga.sha256.clone_from(&record.sha256);
    saga.cache_before = engine.catalog.get_file_index(&record.file_id)?;
    saga.record = Some(record);
    Ok(saga)
}

/// Context for moving `record` from `source` to `target`
pub fn transfer_context(
    engine: &EngineContext,
    source: NodeId,
    target: NodeId,
    record: &AttributeRecord,
) -> Result<SagaContext> {
    let mut saga = SagaContext::new(record.file_id, target.clone());
    saga.source_node = Some(source);
    saga.size = record.file_size;
    saga.sha256.clone_from(&record.sha256);
    saga.cache_before = engine.catalog.get_file_index(&record.file_id)?;
    let mut moved = record.clone();
    moved.storage_node_id = target;
    saga.record = Some(moved);
    Ok(saga)
}
