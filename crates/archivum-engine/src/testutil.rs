//! Shared fixtures for engine tests

use crate::engine::{StorageEngine, UploadRequest, UploadResult};
use crate::saga::{SagaContext, StepExecutor, StepKind};
use archivum_common::config::LocalNodeConfig;
use archivum_common::{
    Config, Error, FileId, ManualClock, NodeId, Result, RetentionPolicy, SagaId, StorageMode, TB,
};
use archivum_placement::MemoryDirectory;
use archivum_storage::{AttributeRecord, SCHEMA_VERSION};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Engine over two temporary and two permanent nodes in a temp dir
pub struct Harness {
    pub temp: TempDir,
    pub clock: Arc<ManualClock>,
    pub directory: Arc<MemoryDirectory>,
    pub engine: StorageEngine,
    spooled: AtomicUsize,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(|_| {}, |steps| steps).await
    }

    pub async fn with_steps<W>(wrap: W) -> Self
    where
        W: FnOnce(Arc<dyn StepExecutor>) -> Arc<dyn StepExecutor>,
    {
        Self::with(|_| {}, wrap).await
    }

    pub async fn with<C, W>(configure: C, wrap: W) -> Self
    where
        C: FnOnce(&mut Config),
        W: FnOnce(Arc<dyn StepExecutor>) -> Arc<dyn StepExecutor>,
    {
        let temp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.node.data_dir = temp.path().join("data");
        config.node.nodes = [
            ("tmp-01", StorageMode::TemporaryCrud, 1),
            ("tmp-02", StorageMode::TemporaryCrud, 2),
            ("perm-01", StorageMode::PermanentAppendOnly, 1),
            ("perm-02", StorageMode::PermanentAppendOnly, 2),
        ]
        .into_iter()
        .map(|(id, mode, priority)| LocalNodeConfig {
            node_id: NodeId::new(id),
            mode,
            root: temp.path().join(id),
            total_capacity: TB,
            priority,
        })
        .collect();
        config.saga.retry_backoff_ms = 1;
        configure(&mut config);

        let clock = ManualClock::shared();
        let directory = Arc::new(MemoryDirectory::new(clock.clone()));
        let engine = StorageEngine::open_with(config, directory.clone(), clock.clone(), wrap)
            .await
            .unwrap();
        assert_eq!(engine.publish_heartbeats().await, 4);

        Self {
            temp,
            clock,
            directory,
            engine,
            spooled: AtomicUsize::new(0),
        }
    }

    /// Write `bytes` to a fresh spool file
    pub async fn spool(&self, bytes: &[u8]) -> PathBuf {
        let dir = self.temp.path().join("spool");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let n = self.spooled.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("upload-{n}"));
        tokio::fs::write(&path, bytes).await.unwrap();
        path
    }

    /// Upload `bytes` as a temporary file and expect it to complete
    pub async fn upload_temp(&self, bytes: &[u8]) -> UploadResult {
        let spool = self.spool(bytes).await;
        let result = self
            .engine
            .upload(UploadRequest::new(&spool, "file.bin", "alice", RetentionPolicy::Temporary))
            .await
            .unwrap();
        assert!(result.outcome.is_applied(), "{:?}", result.outcome);
        result
    }
}

/// A temporary record as an upload would write it
pub fn record_for(
    file_id: FileId,
    node_id: &NodeId,
    sha256: &str,
    size: u64,
    now: DateTime<Utc>,
) -> AttributeRecord {
    AttributeRecord {
        file_id,
        original_filename: "file.bin".into(),
        storage_filename: file_id.to_string(),
        uploaded_by: "alice".into(),
        uploaded_at: now,
        version: 1,
        file_size: size,
        mime_type: "application/octet-stream".into(),
        sha256: sha256.into(),
        retention_policy: RetentionPolicy::Temporary,
        ttl_expires_at: None,
        storage_node_id: node_id.clone(),
        finalized_at: None,
        schema_version: SCHEMA_VERSION,
        custom_attributes: serde_json::Map::new(),
        tombstoned_at: None,
    }
}

/// Runs `step` and then reports it as failed
pub struct FailAt {
    inner: Arc<dyn StepExecutor>,
    step: StepKind,
}

impl FailAt {
    pub fn new(inner: Arc<dyn StepExecutor>, step: StepKind) -> Self {
        Self { inner, step }
    }
}

#[async_trait]
impl StepExecutor for FailAt {
    async fn execute(&self, saga_id: SagaId, step: StepKind, saga: &mut SagaContext) -> Result<()> {
        self.inner.execute(saga_id, step, saga).await?;
        if step == self.step {
            return Err(Error::internal("injected failure"));
        }
        Ok(())
    }

    async fn compensate(
        &self,
        saga_id: SagaId,
        step: StepKind,
        saga: &mut SagaContext,
    ) -> Result<()> {
        self.inner.compensate(saga_id, step, saga).await
    }
}

/// Stalls on `step` long enough to hit any test timeout
pub struct SlowAt {
    inner: Arc<dyn StepExecutor>,
    step: StepKind,
}

impl SlowAt {
    pub fn new(inner: Arc<dyn StepExecutor>, step: StepKind) -> Self {
        Self { inner, step }
    }
}

#[async_trait]
impl StepExecutor for SlowAt {
    async fn execute(&self, saga_id: SagaId, step: StepKind, saga: &mut SagaContext) -> Result<()> {
        if step == self.step {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        }
        self.inner.execute(saga_id, step, saga).await
    }

    async fn compensate(
        &self,
        saga_id: SagaId,
        step: StepKind,
        saga: &mut SagaContext,
    ) -> Result<()> {
        self.inner.compensate(saga_id, step, saga).await
    }
}
