use super::{SagaContext, StepKind, reservation_id};
use crate::context::{EngineContext, index_entry};
use archivum_catalog::ScheduledSourceCleanup;
use archivum_common::{Error, Result, SagaId};
use archivum_placement::Reservation;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Executes and compensates saga steps.
///
/// Both directions must be idempotent: the orchestrator re-runs a step after
/// a crash or a retryable failure.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, saga_id: SagaId, step: StepKind, saga: &mut SagaContext) -> Result<()>;

    async fn compensate(&self, saga_id: SagaId, step: StepKind, saga: &mut SagaContext)
    -> Result<()>;
}

/// Step implementations against real nodes, catalog and directory
pub struct EngineSteps {
    engine: Arc<EngineContext>,
    cancel: CancellationToken,
}

impl EngineSteps {
    pub fn new(engine: Arc<EngineContext>, cancel: CancellationToken) -> Self {
        Self { engine, cancel }
    }

    fn record<'a>(saga: &'a SagaContext, step: StepKind) -> Result<&'a archivum_storage::AttributeRecord> {
        saga.record
            .as_ref()
            .ok_or_else(|| Error::invalid_state(format!("{step} needs a record in the saga context")))
    }
}

#[async_trait]
impl StepExecutor for EngineSteps {
    async fn execute(&self, saga_id: SagaId, step: StepKind, saga: &mut SagaContext) -> Result<()> {
        let engine = &self.engine;
        let node = engine.nodes.get(&saga.node_id)?;
        let now = engine.clock.now();

        match step {
            StepKind::ReserveSpace => {
                engine
                    .directory
                    .reserve(Reservation {
                        id: reservation_id(saga_id),
                        node_id: saga.node_id.clone(),
                        bytes: saga.size,
                    })
                    .await
            }
            StepKind::TransferBytes => {
                let spool = saga
                    .spool_path
                    .as_ref()
                    .ok_or_else(|| Error::invalid_state("upload has no spooled bytes"))?;
                node.blobs
                    .put_from_path(&saga.file_id, spool, &saga.sha256, &self.cancel)
                    .await
                    .map(|_| ())
            }
            StepKind::CopyFromSource => {
                let source_id = saga
                    .source_node
                    .as_ref()
                    .ok_or_else(|| Error::invalid_state("transfer has no source node"))?;
                let source = engine.nodes.get(source_id)?;
                if node.blobs.exists(&saga.file_id).await?
                    && node.blobs.verify(&saga.file_id, &saga.sha256).await.is_ok()
                {
                    debug!(file_id = %saga.file_id, "Target already holds a verified copy");
                    return Ok(());
                }
                source
                    .blobs
                    .copy_to(
                        &saga.file_id,
                        &node.blobs,
                        engine.config.finalize.copy_chunk_bytes,
                        &saga.sha256,
                        &self.cancel,
                    )
                    .await
                    .map(|_| ())
            }
            StepKind::WriteAttributeRecord => node.attributes.write(Self::record(saga, step)?),
            StepKind::UpdateMetadataCache => {
                let entry = index_entry(Self::record(saga, step)?, now);
                Ok(engine.catalog.put_file_index(&entry)?)
            }
            StepKind::TombstoneRecord => node.attributes.tombstone(&saga.file_id, now).map(|_| ()),
            StepKind::RemoveCacheRow => Ok(engine.catalog.delete_file_index(&saga.file_id)?),
            StepKind::PurgeFile => {
                node.blobs.delete(&saga.file_id).await?;
                node.attributes.delete(&saga.file_id)?;
                Ok(())
            }
            StepKind::ScheduleSourceCleanup => {
                let source_id = saga
                    .source_node
                    .clone()
                    .ok_or_else(|| Error::invalid_state("transfer has no source node"))?;
                let source = engine.nodes.get(&source_id)?;
                let target_id = saga.node_id.clone();
                source.attributes.update(&saga.file_id, |r| {
                    r.storage_node_id = target_id;
                    Ok(())
                })?;
                engine.catalog.schedule_source_cleanup(&ScheduledSourceCleanup {
                    file_id: saga.file_id,
                    source_node: source_id,
                    finalized_at: now,
                    delete_after: now + engine.config.finalize.safety_margin(),
                })?;
                Ok(())
            }
            StepKind::PublishToDirectory => {
                let id = reservation_id(saga_id);
                engine
                    .directory
                    .publish(node.descriptor(now), Some(&id))
                    .await
                    .map(|_| ())
            }
        }
    }

    async fn compensate(
        &self,
        saga_id: SagaId,
        step: StepKind,
        saga: &mut SagaContext,
    ) -> Result<()> {
        let engine = &self.engine;
        let node = engine.nodes.get(&saga.node_id)?;

        match step {
            StepKind::ReserveSpace => {
                engine.directory.release(&reservation_id(saga_id)).await?;
                Ok(())
            }
            StepKind::TransferBytes | StepKind::CopyFromSource => {
                node.blobs.delete(&saga.file_id).await?;
                Ok(())
            }
            StepKind::WriteAttributeRecord => {
                node.attributes.delete(&saga.file_id)?;
                Ok(())
            }
            StepKind::UpdateMetadataCache | StepKind::RemoveCacheRow => {
                match &saga.cache_before {
                    Some(entry) => engine.catalog.put_file_index(entry)?,
                    None => engine.catalog.delete_file_index(&saga.file_id)?,
                }
                Ok(())
            }
            StepKind::TombstoneRecord => {
                let was_tombstoned = saga.record.as_ref().is_some_and(|r| r.is_tombstoned());
                if !was_tombstoned {
                    node.attributes.clear_tombstone(&saga.file_id)?;
                }
                Ok(())
            }
            StepKind::PurgeFile => {
                // Nothing can be restored once either half is gone
                let blob = node.blobs.exists(&saga.file_id).await?;
                let record = node.attributes.read(&saga.file_id)?.is_some();
                if blob && record {
                    Ok(())
                } else {
                    Err(Error::invalid_state(format!(
                        "file {} already partially purged from {}",
                        saga.file_id, saga.node_id
                    )))
                }
            }
            StepKind::ScheduleSourceCleanup => {
                let Some(source_id) = saga.source_node.clone() else {
                    return Ok(());
                };
                engine
                    .catalog
                    .delete_source_cleanup(&saga.file_id, &source_id)?;
                let source = engine.nodes.get(&source_id)?;
                if let Some(read) = source.attributes.read(&saga.file_id)?
                    && read.record.storage_node_id != source_id
                {
                    source.attributes.update(&saga.file_id, |r| {
                        r.storage_node_id = source_id.clone();
                        Ok(())
                    })?;
                }
                Ok(())
            }
            StepKind::PublishToDirectory => Ok(()),
        }
    }
}
