//! The storage engine facade
//!
//! Wires the catalog, the local nodes, the directory and the coordinators
//! together and exposes the file operations.

use crate::context::{ActiveFiles, EngineContext, supersedes};
use crate::events::{EventBus, FileEvent};
use crate::finalize::{FinalizationCoordinator, FinalizeOutcome};
use crate::gc::GarbageCollector;
use crate::lease::LeaseManager;
use crate::node::NodeRegistry;
use crate::publish::PublishRetrier;
use crate::saga::{
    EngineSteps, OperationOutcome, SagaContext, SagaKind, SagaOrchestrator, SagaStatus,
    StepExecutor, delete_context, delete_steps, transfer_context, transfer_steps, upload_steps,
};
use archivum_catalog::Catalog;
use archivum_common::{
    Clock, Config, Error, FileId, NodeId, Result, RetentionPolicy, SagaId,
};
use archivum_placement::{CapacityDirectory, StorageSelector};
use archivum_storage::{AttributeRecord, OverflowStore, SCHEMA_VERSION, digest_file};
use chrono::Duration;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Name of the lease guarding a metadata cache rebuild
pub const REBUILD_LEASE: &str = "metadata-rebuild";

/// A file to store
#[derive(Clone, Debug)]
pub struct UploadRequest {
    /// Spooled bytes on local disk
    pub source: PathBuf,
    pub original_filename: String,
    pub uploaded_by: String,
    pub mime_type: String,
    pub retention_policy: RetentionPolicy,
    /// Lifetime of a temporary file; ignored for permanent ones
    pub ttl: Option<Duration>,
    pub custom_attributes: Map<String, Value>,
    /// Earlier version this upload replaces
    pub supersedes: Option<FileId>,
}

impl UploadRequest {
    pub fn new(
        source: impl Into<PathBuf>,
        original_filename: impl Into<String>,
        uploaded_by: impl Into<String>,
        retention_policy: RetentionPolicy,
    ) -> Self {
        Self {
            source: source.into(),
            original_filename: original_filename.into(),
            uploaded_by: uploaded_by.into(),
            mime_type: "application/octet-stream".to_string(),
            retention_policy,
            ttl: None,
            custom_attributes: Map::new(),
            supersedes: None,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.custom_attributes.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn superseding(mut self, previous: FileId) -> Self {
        self.supersedes = Some(previous);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    pub saga_id: SagaId,
    pub file_id: FileId,
    pub node_id: NodeId,
    pub sha256: String,
    pub file_size: u64,
    pub outcome: OperationOutcome,
    /// Set when placement ran on cached or static directory data
    pub degraded: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OperationResult {
    pub saga_id: SagaId,
    pub file_id: FileId,
    pub node_id: NodeId,
    pub outcome: OperationOutcome,
}

/// What startup recovery settled
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub finalizations: Vec<(FileId, FinalizeOutcome)>,
    pub sagas: Vec<(SagaId, OperationOutcome)>,
}

pub struct StorageEngine {
    ctx: Arc<EngineContext>,
    orchestrator: Arc<SagaOrchestrator>,
    finalizer: Arc<FinalizationCoordinator>,
    collector: Arc<GarbageCollector>,
    publisher: Arc<PublishRetrier>,
    leases: Arc<LeaseManager>,
    shutdown: CancellationToken,
}

impl StorageEngine {
    /// Open the engine over the configured local nodes
    pub async fn open(
        config: Config,
        directory: Arc<dyn CapacityDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::open_with(config, directory, clock, |steps| steps).await
    }

    /// Like [`open`](Self::open), letting the caller wrap the step executor
    pub async fn open_with<F>(
        config: Config,
        directory: Arc<dyn CapacityDirectory>,
        clock: Arc<dyn Clock>,
        wrap_steps: F,
    ) -> Result<Self>
    where
        F: FnOnce(Arc<dyn StepExecutor>) -> Arc<dyn StepExecutor>,
    {
        config.validate()?;
        tokio::fs::create_dir_all(&config.node.data_dir).await?;
        let catalog = Arc::new(Catalog::open(config.node.data_dir.join("catalog.redb"))?);
        let overflow: Arc<dyn OverflowStore> = catalog.clone();
        let nodes = Arc::new(
            NodeRegistry::open(&config.node.nodes, &overflow, &config.attributes).await?,
        );
        let selector = Arc::new(
            StorageSelector::new(Arc::clone(&directory), Arc::clone(&clock), config.directory.ttl())
                .restricted_to(nodes.ids()),
        );
        info!(nodes = nodes.len(), data_dir = %config.node.data_dir.display(), "Storage engine opened");

        let ctx = Arc::new(EngineContext {
            config: Arc::new(config),
            catalog,
            nodes,
            directory,
            selector,
            clock: Arc::clone(&clock),
            events: EventBus::default(),
            active: ActiveFiles::default(),
        });

        let shutdown = CancellationToken::new();
        let steps: Arc<dyn StepExecutor> =
            Arc::new(EngineSteps::new(Arc::clone(&ctx), shutdown.child_token()));
        let orchestrator = Arc::new(SagaOrchestrator::new(Arc::clone(&ctx), wrap_steps(steps)));
        let leases = Arc::new(LeaseManager::new(clock));
        let finalizer = Arc::new(FinalizationCoordinator::new(
            Arc::clone(&ctx),
            shutdown.child_token(),
        ));
        let collector = Arc::new(GarbageCollector::new(
            Arc::clone(&ctx),
            Arc::clone(&orchestrator),
            Arc::clone(&leases),
        ));
        let publisher = Arc::new(PublishRetrier::new(Arc::clone(&ctx)));

        Ok(Self {
            ctx,
            orchestrator,
            finalizer,
            collector,
            publisher,
            leases,
            shutdown,
        })
    }

    /// Store a file on the first eligible node of its retention pool.
    ///
    /// Errors before the saga starts (placement, unreadable spool, busy
    /// file) leave nothing behind.
    pub async fn upload(&self, request: UploadRequest) -> Result<UploadResult> {
        let digest = digest_file(&request.source).await?;
        let version = match request.supersedes {
            Some(previous) => self.ctx.locate(&previous)?.1.version + 1,
            None => 1,
        };
        let placement = self
            .ctx
            .selector
            .select_for_policy(request.retention_policy, digest.size)
            .await?;
        let degraded = placement.degraded().map(|e| e.to_string());
        if let Some(reason) = &degraded {
            warn!(node_id = %placement.node_id, "Upload placed on degraded directory data: {reason}");
        }

        let now = self.ctx.clock.now();
        let file_id = FileId::new();
        let ttl_expires_at = match (request.retention_policy, request.ttl) {
            (RetentionPolicy::Temporary, Some(ttl)) => Some(now + ttl),
            _ => None,
        };
        let record = AttributeRecord {
            file_id,
            original_filename: request.original_filename,
            storage_filename: file_id.to_string(),
            uploaded_by: request.uploaded_by,
            uploaded_at: now,
            version,
            file_size: digest.size,
            mime_type: request.mime_type,
            sha256: digest.sha256.clone(),
            retention_policy: request.retention_policy,
            ttl_expires_at,
            storage_node_id: placement.node_id.clone(),
            finalized_at: None,
            schema_version: SCHEMA_VERSION,
            custom_attributes: request.custom_attributes,
            tombstoned_at: None,
        };

        let mut saga = SagaContext::new(file_id, placement.node_id.clone());
        saga.spool_path = Some(request.source);
        saga.size = digest.size;
        saga.sha256.clone_from(&digest.sha256);
        saga.record = Some(record);

        let instance = self.orchestrator.start(SagaKind::Upload, upload_steps(), saga)?;
        let saga_id = instance.saga_id;
        let outcome = self.orchestrator.run(instance).await?;
        if outcome.is_applied() {
            self.ctx.events.emit(FileEvent::Uploaded {
                file_id,
                node_id: placement.node_id.clone(),
                sha256: digest.sha256.clone(),
                file_size: digest.size,
            });
        }

        Ok(UploadResult {
            saga_id,
            file_id,
            node_id: placement.node_id,
            sha256: digest.sha256,
            file_size: digest.size,
            outcome,
            degraded,
        })
    }

    /// Delete a file from a node whose mode allows user deletes
    pub async fn delete(&self, file_id: FileId) -> Result<OperationResult> {
        let (node, record) = self.ctx.locate(&file_id)?;
        if !node.mode.allows_user_delete() {
            return Err(Error::invalid_state(format!(
                "node {} is {} and does not accept deletes",
                node.id, node.mode
            )));
        }
        let saga = delete_context(&self.ctx, node.id.clone(), record)?;
        let instance = self.orchestrator.start(SagaKind::Delete, delete_steps(), saga)?;
        let saga_id = instance.saga_id;
        let outcome = self.orchestrator.run(instance).await?;
        if outcome.is_applied() {
            self.ctx.events.emit(FileEvent::Deleted {
                file_id,
                node_id: node.id.clone(),
            });
        }
        Ok(OperationResult {
            saga_id,
            file_id,
            node_id: node.id.clone(),
            outcome,
        })
    }

    /// Move a file to another node of the same mode.
    ///
    /// The source copy is reclaimed after the safety margin.
    pub async fn transfer(&self, file_id: FileId, target: Option<NodeId>) -> Result<OperationResult> {
        let (source, record) = self.ctx.locate(&file_id)?;
        if record.is_tombstoned() {
            return Err(Error::invalid_state(format!("{file_id} is being deleted")));
        }
        let target_id = match target {
            Some(target_id) => {
                let node = self.ctx.nodes.get(&target_id)?;
                if node.id == source.id {
                    return Err(Error::invalid_argument(format!(
                        "{file_id} already lives on {target_id}"
                    )));
                }
                if node.mode != source.mode {
                    return Err(Error::invalid_argument(format!(
                        "cannot transfer from {} node {} to {} node {}",
                        source.mode, source.id, node.mode, node.id
                    )));
                }
                target_id
            }
            None => {
                self.ctx
                    .selector
                    .select_excluding(source.mode, record.file_size, Some(&source.id))
                    .await?
                    .node_id
            }
        };

        let saga = transfer_context(&self.ctx, source.id.clone(), target_id.clone(), &record)?;
        let instance = self
            .orchestrator
            .start(SagaKind::Transfer, transfer_steps(), saga)?;
        let saga_id = instance.saga_id;
        let outcome = self.orchestrator.run(instance).await?;
        Ok(OperationResult {
            saga_id,
            file_id,
            node_id: target_id,
            outcome,
        })
    }

    /// Promote a temporary file to permanent storage
    pub async fn finalize(&self, file_id: FileId) -> Result<FinalizeOutcome> {
        self.finalizer.finalize(file_id).await
    }

    /// The authoritative record of a file
    pub fn read(&self, file_id: FileId) -> Result<AttributeRecord> {
        let (_, record) = self.ctx.locate(&file_id)?;
        if record.is_tombstoned() {
            return Err(Error::RecordNotFound(file_id));
        }
        Ok(record)
    }

    pub fn saga_status(&self, saga_id: SagaId) -> Result<SagaStatus> {
        self.orchestrator.status(saga_id)
    }

    /// Settle work a previous process left unfinished
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let finalizations = self.finalizer.recover().await?;
        let sagas = self.orchestrator.resume_pending().await?;
        if !finalizations.is_empty() || !sagas.is_empty() {
            info!(
                finalizations = finalizations.len(),
                sagas = sagas.len(),
                "Recovery finished"
            );
        }
        Ok(RecoveryReport {
            finalizations,
            sagas,
        })
    }

    /// Rebuild the metadata cache from the attribute records on every node.
    ///
    /// Holds the rebuild lease for the duration; returns the number of rows.
    pub fn rebuild_metadata_cache(&self, holder: &str) -> Result<usize> {
        let lease = self
            .leases
            .acquire(REBUILD_LEASE, holder, self.ctx.config.admin.lease_ttl())?;
        let result = self.rebuild_index();
        self.leases.release(&lease);
        result
    }

    fn rebuild_index(&self) -> Result<usize> {
        let mut authoritative: BTreeMap<FileId, AttributeRecord> = BTreeMap::new();
        for node in self.ctx.nodes.iter() {
            for file_id in node.attributes.list_file_ids()? {
                let Some(read) = node.attributes.read(&file_id)? else {
                    continue;
                };
                let record = read.record;
                if record.storage_node_id != node.id || record.is_tombstoned() {
                    continue;
                }
                match authoritative.get(&file_id) {
                    Some(current) if !supersedes(&record, current) => {}
                    _ => {
                        authoritative.insert(file_id, record);
                    }
                }
            }
        }

        let now = self.ctx.clock.now();
        let entries: Vec<_> = authoritative
            .values()
            .map(|record| crate::context::index_entry(record, now))
            .collect();
        self.ctx.catalog.replace_file_index(&entries)?;
        info!(rows = entries.len(), "Metadata cache rebuilt");
        Ok(entries.len())
    }

    /// Publish a fresh descriptor for every local node. Returns how many
    /// the directory accepted.
    pub async fn publish_heartbeats(&self) -> usize {
        let now = self.ctx.clock.now();
        let beats = self.ctx.nodes.iter().map(|node| {
            let descriptor = node.descriptor(now);
            async move { (node.id.clone(), self.ctx.directory.heartbeat(descriptor).await) }
        });
        let mut accepted = 0;
        for (node_id, result) in futures::future::join_all(beats).await {
            match result {
                Ok(_) => accepted += 1,
                Err(e) => warn!(%node_id, error = %e, "Heartbeat rejected"),
            }
        }
        accepted
    }

    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<FileEvent> {
        self.ctx.events.subscribe()
    }

    #[must_use]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    #[must_use]
    pub fn finalizer(&self) -> Arc<FinalizationCoordinator> {
        Arc::clone(&self.finalizer)
    }

    #[must_use]
    pub fn collector(&self) -> Arc<GarbageCollector> {
        Arc::clone(&self.collector)
    }

    #[must_use]
    pub fn publisher(&self) -> Arc<PublishRetrier> {
        Arc::clone(&self.publisher)
    }

    #[must_use]
    pub fn leases(&self) -> Arc<LeaseManager> {
        Arc::clone(&self.leases)
    }

    /// Token cancelled by [`shutdown`](Self::shutdown); background loops watch it
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel in-flight copies and stop background loops
    pub fn shutdown(&self) {
        info!("Storage engine shutting down");
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::{SagaState, StepKind};
    use crate::testutil::{FailAt, Harness, SlowAt, record_for};
    use archivum_common::StorageMode;

    #[tokio::test]
    async fn test_upload_finalize_and_reclaim_end_to_end() {
        let h = Harness::new().await;
        let data: Vec<u8> = (0..10 * 1024 * 1024_u32).map(|i| (i % 251) as u8).collect();
        let uploaded = h.upload_temp(&data).await;

        assert_eq!(uploaded.outcome, OperationOutcome::Completed);
        assert_eq!(uploaded.node_id, NodeId::new("tmp-01"));
        let record = h.engine.read(uploaded.file_id).unwrap();
        assert_eq!(record.sha256, archivum_common::sha256_hex(&data));
        assert_eq!(record.file_size, data.len() as u64);
        assert_eq!(record.retention_policy, RetentionPolicy::Temporary);

        let FinalizeOutcome::Committed { target_node, .. } =
            h.engine.finalize(uploaded.file_id).await.unwrap()
        else {
            panic!("finalize did not commit");
        };
        let record = h.engine.read(uploaded.file_id).unwrap();
        assert_eq!(record.retention_policy, RetentionPolicy::Permanent);
        assert_eq!(record.storage_node_id, target_node);

        let source = h.engine.context().nodes.get(&uploaded.node_id).unwrap();
        h.clock.advance(Duration::hours(23));
        h.engine.collector().run_cycle().await.unwrap();
        assert!(source.blobs.exists(&uploaded.file_id).await.unwrap());

        h.clock.advance(Duration::hours(1) + Duration::seconds(1));
        h.engine.collector().run_cycle().await.unwrap();
        assert!(!source.blobs.exists(&uploaded.file_id).await.unwrap());
        assert!(source.attributes.read(&uploaded.file_id).unwrap().is_none());

        // Still readable from the permanent node
        let record = h.engine.read(uploaded.file_id).unwrap();
        assert_eq!(record.storage_node_id, target_node);
    }

    #[tokio::test]
    async fn test_failure_at_each_strict_upload_step_rolls_back() {
        for (index, step) in upload_steps().into_iter().enumerate() {
            if !step.is_strict() {
                continue;
            }
            let h = Harness::with_steps(|inner| Arc::new(FailAt::new(inner, step))).await;
            let spool = h.spool(b"atomic or nothing").await;
            let result = h
                .engine
                .upload(UploadRequest::new(&spool, "a.bin", "alice", RetentionPolicy::Temporary))
                .await
                .unwrap();

            assert_eq!(
                result.outcome,
                OperationOutcome::RolledBack {
                    failed_step: step.to_string(),
                    error: "internal error: injected failure".to_string()
                },
                "step {index}"
            );
            let ctx = h.engine.context();
            for node in ctx.nodes.iter() {
                assert!(!node.blobs.exists(&result.file_id).await.unwrap(), "step {index}");
                assert!(node.attributes.read(&result.file_id).unwrap().is_none(), "step {index}");
            }
            assert!(ctx.catalog.get_file_index(&result.file_id).unwrap().is_none());
            assert_eq!(h.directory.reservation_count(), 0, "step {index}");
            let status = h.engine.saga_status(result.saga_id).unwrap();
            assert_eq!(status.state, SagaState::Compensated);
            assert_eq!(status.failed_step.as_deref(), Some(step.to_string().as_str()));
            assert!(!ctx.active.is_active(&result.file_id));
        }
    }

    #[tokio::test]
    async fn test_publish_failure_completes_with_pending_flag() {
        let h = Harness::with_steps(|inner| {
            Arc::new(FailAt::new(inner, StepKind::PublishToDirectory))
        })
        .await;
        let uploaded = h.upload_temp(b"durable but unpublished").await;
        assert_eq!(uploaded.outcome, OperationOutcome::CompletedPublishPending);
        assert!(h.engine.read(uploaded.file_id).is_ok());
        let status = h.engine.saga_status(uploaded.saga_id).unwrap();
        assert_eq!(status.state, SagaState::Completed);
        assert!(status.publish_pending);

        let report = h.engine.publisher().retry_pending().await.unwrap();
        assert_eq!(report.published, 1);
        assert!(!h.engine.saga_status(uploaded.saga_id).unwrap().publish_pending);
        assert_eq!(h.directory.reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_step_timeout_triggers_compensation() {
        let h = Harness::with(
            |config| config.saga.step_timeout_secs = 1,
            |inner| Arc::new(SlowAt::new(inner, StepKind::TransferBytes)),
        )
        .await;
        let spool = h.spool(b"slow disk").await;
        let result = h
            .engine
            .upload(UploadRequest::new(&spool, "slow.bin", "alice", RetentionPolicy::Temporary))
            .await
            .unwrap();
        let OperationOutcome::RolledBack { failed_step, error } = result.outcome else {
            panic!("expected rollback, got {:?}", result.outcome);
        };
        assert_eq!(failed_step, "transfer_bytes");
        assert!(error.contains("timed out"), "{error}");
        assert_eq!(h.directory.reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_resume_after_crash_is_idempotent() {
        let h = Harness::new().await;
        let spool = h.spool(b"resume me").await;
        let ctx = h.engine.context();

        // A saga that got as far as the record write before the process died
        let digest = digest_file(&spool).await.unwrap();
        let file_id = FileId::new();
        let node_id = NodeId::new("tmp-01");
        let mut saga = SagaContext::new(file_id, node_id.clone());
        saga.spool_path = Some(spool.clone());
        saga.size = digest.size;
        saga.sha256.clone_from(&digest.sha256);
        saga.record = Some(record_for(file_id, &node_id, &digest.sha256, digest.size, h.clock.now()));
        let mut instance = h
            .engine
            .orchestrator
            .start(SagaKind::Upload, upload_steps(), saga)
            .unwrap();
        instance.state = SagaState::Running;
        instance.current_step = 2;
        ctx.nodes
            .get(&node_id)
            .unwrap()
            .blobs
            .put_from_path(&file_id, &spool, &digest.sha256, &CancellationToken::new())
            .await
            .unwrap();
        h.engine.orchestrator.log().save(&instance).unwrap();
        ctx.active.release(&file_id);

        let report = h.engine.recover().await.unwrap();
        assert_eq!(report.sagas, vec![(instance.saga_id, OperationOutcome::Completed)]);
        assert_eq!(h.engine.read(file_id).unwrap().sha256, digest.sha256);
        assert!(ctx.catalog.get_file_index(&file_id).unwrap().is_some());

        // Nothing left to resume
        assert!(h.engine.recover().await.unwrap().sagas.is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_mode_rules() {
        let h = Harness::new().await;
        let uploaded = h.upload_temp(b"short lived").await;
        let mut events = h.engine.events();

        let deleted = h.engine.delete(uploaded.file_id).await.unwrap();
        assert_eq!(deleted.outcome, OperationOutcome::Completed);
        assert!(matches!(h.engine.read(uploaded.file_id), Err(Error::RecordNotFound(_))));
        let node = h.engine.context().nodes.get(&uploaded.node_id).unwrap();
        assert!(!node.blobs.exists(&uploaded.file_id).await.unwrap());
        assert!(matches!(events.try_recv().unwrap(), FileEvent::Deleted { .. }));

        let spool = h.spool(b"forever").await;
        let permanent = h
            .engine
            .upload(UploadRequest::new(&spool, "p.bin", "alice", RetentionPolicy::Permanent))
            .await
            .unwrap();
        assert_eq!(permanent.node_id, NodeId::new("perm-01"));
        assert!(matches!(
            h.engine.delete(permanent.file_id).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_transfer_moves_within_mode() {
        let h = Harness::new().await;
        let uploaded = h.upload_temp(b"rebalance").await;

        assert!(matches!(
            h.engine
                .transfer(uploaded.file_id, Some(NodeId::new("perm-01")))
                .await,
            Err(Error::InvalidArgument(_))
        ));

        let moved = h.engine.transfer(uploaded.file_id, None).await.unwrap();
        assert_eq!(moved.outcome, OperationOutcome::Completed);
        assert_eq!(moved.node_id, NodeId::new("tmp-02"));
        let record = h.engine.read(uploaded.file_id).unwrap();
        assert_eq!(record.storage_node_id, moved.node_id);
        let ctx = h.engine.context();
        assert_eq!(ctx.nodes.get(&moved.node_id).unwrap().mode, StorageMode::TemporaryCrud);
        assert_eq!(ctx.catalog.load_source_cleanups().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_supersede_bumps_version() {
        let h = Harness::new().await;
        let first = h.upload_temp(b"v1").await;
        let spool = h.spool(b"v2").await;
        let second = h
            .engine
            .upload(
                UploadRequest::new(&spool, "doc.txt", "alice", RetentionPolicy::Temporary)
                    .superseding(first.file_id)
                    .with_attribute("project", Value::from("apollo")),
            )
            .await
            .unwrap();
        let record = h.engine.read(second.file_id).unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.custom_attributes["project"], "apollo");
        assert_ne!(first.file_id, second.file_id);
    }

    #[tokio::test]
    async fn test_rebuild_metadata_cache_from_records() {
        let h = Harness::new().await;
        let a = h.upload_temp(b"a").await;
        let b = h.upload_temp(b"b").await;
        h.engine.finalize(b.file_id).await.unwrap();
        let ctx = h.engine.context();
        ctx.catalog.replace_file_index(&[]).unwrap();

        let _held = h
            .engine
            .leases()
            .acquire(REBUILD_LEASE, "other-admin", Duration::minutes(5))
            .unwrap();
        assert!(matches!(
            h.engine.rebuild_metadata_cache("admin"),
            Err(Error::LockContention { .. })
        ));
        h.engine.leases().force_release(REBUILD_LEASE, "admin");

        assert_eq!(h.engine.rebuild_metadata_cache("admin").unwrap(), 2);
        assert_eq!(
            ctx.catalog.get_file_index(&a.file_id).unwrap().unwrap().node_id,
            a.node_id
        );
        assert_eq!(
            ctx.catalog.get_file_index(&b.file_id).unwrap().unwrap().node_id,
            NodeId::new("perm-01")
        );
    }

    async fn upload_large_record(h: &Harness) -> UploadResult {
        let spool = h.spool(b"bytes with a long description").await;
        let result = h
            .engine
            .upload(
                UploadRequest::new(&spool, "big.bin", "alice", RetentionPolicy::Temporary)
                    .with_attribute("notes", Value::from("n".repeat(5000))),
            )
            .await
            .unwrap();
        assert_eq!(result.outcome, OperationOutcome::Completed);
        let node = h.engine.context().nodes.get(&result.node_id).unwrap();
        let read = node.attributes.read(&result.file_id).unwrap().unwrap();
        assert_eq!(read.form, archivum_storage::RecordForm::Pointer);
        result
    }

    #[tokio::test]
    async fn test_pointer_record_survives_finalize_and_source_reclaim() {
        let h = Harness::new().await;
        let uploaded = upload_large_record(&h).await;

        let outcome = h.engine.finalize(uploaded.file_id).await.unwrap();
        assert!(matches!(outcome, FinalizeOutcome::Committed { .. }));

        h.clock.advance(Duration::hours(25));
        let report = h.engine.collector().run_cycle().await.unwrap();
        assert_eq!(report.sources_queued, 1);
        assert_eq!(report.execution.succeeded, 1);

        let ctx = h.engine.context();
        let source = ctx.nodes.get(&uploaded.node_id).unwrap();
        assert!(source.attributes.read(&uploaded.file_id).unwrap().is_none());
        assert!(ctx.catalog.list_overflow_keys("tmp-01/").unwrap().is_empty());

        let record = h.engine.read(uploaded.file_id).unwrap();
        assert_eq!(record.storage_node_id, NodeId::new("perm-01"));
        assert_eq!(record.retention_policy, RetentionPolicy::Permanent);
        assert_eq!(record.custom_attributes["notes"], "n".repeat(5000));
    }

    #[tokio::test]
    async fn test_failed_transfer_of_pointer_record_restores_source() {
        let h = Harness::with_steps(|inner| {
            Arc::new(FailAt::new(inner, StepKind::UpdateMetadataCache))
        })
        .await;
        let uploaded = upload_large_record(&h).await;
        let ctx = h.engine.context();
        let source = ctx.nodes.get(&uploaded.node_id).unwrap();
        let before = source.attributes.get(&uploaded.file_id).unwrap();

        let moved = h
            .engine
            .transfer(uploaded.file_id, Some(NodeId::new("tmp-02")))
            .await
            .unwrap();
        assert!(
            matches!(moved.outcome, OperationOutcome::RolledBack { .. }),
            "{:?}",
            moved.outcome
        );

        assert_eq!(source.attributes.get(&uploaded.file_id).unwrap(), before);
        assert_eq!(h.engine.read(uploaded.file_id).unwrap(), before);
        let target = ctx.nodes.get(&NodeId::new("tmp-02")).unwrap();
        assert!(target.attributes.read(&uploaded.file_id).unwrap().is_none());
        assert!(!target.blobs.exists(&uploaded.file_id).await.unwrap());
        assert!(ctx.catalog.list_overflow_keys("tmp-02/").unwrap().is_empty());
        assert!(ctx.catalog.load_source_cleanups().unwrap().is_empty());
        assert_eq!(h.directory.reservation_count(), 0);
    }
}
