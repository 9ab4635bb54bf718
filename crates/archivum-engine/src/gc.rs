//! Background reclamation
//!
//! Each cycle runs under the `gc` lease:
//!
//! 1. sweep temp files left by interrupted writes
//! 2. queue expired temporary files, source copies whose safety margin has
//!    passed and orphans older than the grace period
//! 3. execute due tasks by priority, retrying failures with backoff and
//!    parking a task once it runs out of attempts
//!
//! Every handler re-checks its precondition before removing anything, so a
//! task that became obsolete between scan and execution is a no-op.

use crate::context::EngineContext;
use crate::events::FileEvent;
use crate::lease::LeaseManager;
use crate::saga::{SagaKind, SagaOrchestrator, delete_context, delete_steps};
use archivum_catalog::{CleanupAction, CleanupTask};
use archivum_common::{CleanupPriority, Error, FileId, Result, StorageMode};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Name of the lease held for a collection cycle
pub const GC_LEASE: &str = "gc";

/// Task execution counts from one cycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    pub succeeded: usize,
    pub retried: usize,
    pub parked: usize,
}

/// What a collection cycle did
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Another holder had the lease
    pub skipped: bool,
    pub temp_files_swept: usize,
    pub expired_queued: usize,
    pub sources_queued: usize,
    pub orphans_queued: usize,
    pub execution: ExecutionSummary,
}

pub struct GarbageCollector {
    engine: Arc<EngineContext>,
    orchestrator: Arc<SagaOrchestrator>,
    leases: Arc<LeaseManager>,
    holder: String,
}

impl GarbageCollector {
    pub fn new(
        engine: Arc<EngineContext>,
        orchestrator: Arc<SagaOrchestrator>,
        leases: Arc<LeaseManager>,
    ) -> Self {
        Self {
            engine,
            orchestrator,
            leases,
            holder: format!("gc-{}", std::process::id()),
        }
    }

    /// One full cycle, skipped if another collector holds the lease
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let lease = match self
            .leases
            .acquire(GC_LEASE, &self.holder, self.engine.config.admin.lease_ttl())
        {
            Ok(lease) => lease,
            Err(Error::LockContention { resource }) => {
                info!(%resource, "GC cycle skipped, lease held elsewhere");
                return Ok(CycleReport {
                    skipped: true,
                    ..CycleReport::default()
                });
            }
            Err(e) => return Err(e),
        };

        let result = self.cycle().await;
        self.leases.release(&lease);
        let report = result?;
        info!(
            swept = report.temp_files_swept,
            expired = report.expired_queued,
            sources = report.sources_queued,
            orphans = report.orphans_queued,
            succeeded = report.execution.succeeded,
            retried = report.execution.retried,
            parked = report.execution.parked,
            "GC cycle finished"
        );
        Ok(report)
    }

    async fn cycle(&self) -> Result<CycleReport> {
        Ok(CycleReport {
            skipped: false,
            temp_files_swept: self.sweep_temp_files().await?,
            expired_queued: self.scan_expired()?,
            sources_queued: self.scan_finalized_sources()?,
            orphans_queued: self.scan_orphans().await?,
            execution: self.execute_due().await?,
        })
    }

    /// Remove partial writes nobody is working on
    pub async fn sweep_temp_files(&self) -> Result<usize> {
        let busy = self.busy_files()?;
        let mut swept = 0;
        for node in self.engine.nodes.iter() {
            swept += node.attributes.sweep_temp_files()?;
            swept += node
                .blobs
                .sweep_temp_files(|id| busy.contains(id) || self.engine.active.is_active(id))
                .await?;
        }
        Ok(swept)
    }

    /// Queue temporary files whose TTL has passed
    pub fn scan_expired(&self) -> Result<usize> {
        let now = self.engine.clock.now();
        let mut queued = 0;
        for node in self.engine.nodes.iter() {
            if node.mode != StorageMode::TemporaryCrud {
                continue;
            }
            for file_id in node.attributes.list_file_ids()? {
                let Some(read) = node.attributes.read(&file_id)? else {
                    continue;
                };
                let record = read.record;
                if record.storage_node_id != node.id
                    || record.is_tombstoned()
                    || !record.is_expired(now)
                {
                    continue;
                }
                let task = CleanupTask::new(
                    file_id,
                    node.id.clone(),
                    CleanupAction::ExpireTemporary,
                    CleanupPriority::Normal,
                    now,
                );
                if self.engine.catalog.enqueue_cleanup_task(&task)? {
                    debug!(%file_id, node_id = %node.id, "Queued expired file");
                    queued += 1;
                }
            }
        }
        Ok(queued)
    }

    /// Queue superseded source copies whose safety margin has passed
    pub fn scan_finalized_sources(&self) -> Result<usize> {
        let now = self.engine.clock.now();
        let mut queued = 0;
        for cleanup in self.engine.catalog.load_source_cleanups()? {
            if cleanup.delete_after > now {
                continue;
            }
            let task = CleanupTask::new(
                cleanup.file_id,
                cleanup.source_node.clone(),
                CleanupAction::ReclaimSource,
                CleanupPriority::Normal,
                now,
            );
            if self.engine.catalog.enqueue_cleanup_task(&task)? {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Queue physical files with no attribute record, once past the grace period.
    ///
    /// Files with an operation in flight are never candidates: an upload
    /// holds bytes before its record exists.
    pub async fn scan_orphans(&self) -> Result<usize> {
        let now = self.engine.clock.now();
        let grace = self.engine.config.gc.orphan_grace();
        let busy = self.busy_files()?;
        let mut queued = 0;

        for node in self.engine.nodes.iter() {
            for blob in node.blobs.list().await? {
                let file_id = blob.file_id;
                if busy.contains(&file_id)
                    || self.engine.active.is_active(&file_id)
                    || node.attributes.is_locked(&file_id)
                    || node.attributes.read(&file_id)?.is_some()
                {
                    continue;
                }
                if now.signed_duration_since(blob.modified) < grace {
                    debug!(%file_id, node_id = %node.id, "Unreferenced file still within grace period");
                    continue;
                }
                let orphan = Error::OrphanDataDetected {
                    file_id,
                    node_id: node.id.clone(),
                };
                warn!(size = blob.size, "{orphan}");
                let task = CleanupTask::new(
                    file_id,
                    node.id.clone(),
                    CleanupAction::RemoveOrphan,
                    CleanupPriority::Low,
                    now,
                );
                if self.engine.catalog.enqueue_cleanup_task(&task)? {
                    queued += 1;
                }
            }
        }
        Ok(queued)
    }

    /// Execute due tasks, highest priority first
    pub async fn execute_due(&self) -> Result<ExecutionSummary> {
        let now = self.engine.clock.now();
        let gc = &self.engine.config.gc;
        let mut due: Vec<_> = self
            .engine
            .catalog
            .load_cleanup_tasks()?
            .into_iter()
            .filter(|t| t.due_at <= now)
            .collect();
        due.sort_by_key(|t| (t.priority, t.due_at));
        due.truncate(gc.batch_size);

        let mut summary = ExecutionSummary::default();
        for mut task in due {
            match self.execute(&task).await {
                Ok(()) => {
                    self.engine.catalog.delete_cleanup_task(&task.key())?;
                    summary.succeeded += 1;
                }
                Err(e) => {
                    task.attempts += 1;
                    task.last_error = Some(e.to_string());
                    if task.attempts >= gc.max_attempts {
                        error!(
                            file_id = %task.file_id,
                            node_id = %task.node_id,
                            action = task.action.tag(),
                            attempts = task.attempts,
                            error = %e,
                            "Cleanup task parked for manual review"
                        );
                        self.engine.catalog.park_cleanup_task(&task)?;
                        self.engine.events.emit(FileEvent::TaskParked {
                            file_id: task.file_id,
                            node_id: task.node_id.clone(),
                            action: task.action,
                            attempts: task.attempts,
                            last_error: task.last_error.clone(),
                        });
                        summary.parked += 1;
                    } else {
                        task.due_at = now + gc.backoff_for(task.attempts);
                        warn!(
                            file_id = %task.file_id,
                            action = task.action.tag(),
                            attempts = task.attempts,
                            retry_at = %task.due_at,
                            error = %e,
                            "Cleanup task failed, will retry"
                        );
                        self.engine.catalog.put_cleanup_task(&task)?;
                        summary.retried += 1;
                    }
                }
            }
        }
        Ok(summary)
    }

    async fn execute(&self, task: &CleanupTask) -> Result<()> {
        match task.action {
            CleanupAction::ExpireTemporary => self.expire(task).await,
            CleanupAction::ReclaimSource => self.reclaim_source(task).await,
            CleanupAction::RemoveOrphan => self.remove_orphan(task).await,
            CleanupAction::CompensationResidue => self.clear_residue(task).await,
        }
    }

    async fn expire(&self, task: &CleanupTask) -> Result<()> {
        let node = self.engine.nodes.get(&task.node_id)?;
        let Some(read) = node.attributes.read(&task.file_id)? else {
            return Ok(());
        };
        let record = read.record;
        // Finalized or transferred since the scan
        if record.storage_node_id != node.id || !record.is_expired(self.engine.clock.now()) {
            debug!(file_id = %task.file_id, "Expiry no longer applies");
            return Ok(());
        }

        let saga = delete_context(&self.engine, node.id.clone(), record)?;
        let instance = self
            .orchestrator
            .start(SagaKind::Delete, delete_steps(), saga)?;
        let outcome = self.orchestrator.run(instance).await?;
        if !outcome.is_applied() {
            return Err(Error::internal(format!("expiry delete did not apply: {outcome:?}")));
        }
        info!(file_id = %task.file_id, node_id = %node.id, "Expired temporary file removed");
        self.engine.events.emit(FileEvent::Deleted {
            file_id: task.file_id,
            node_id: node.id.clone(),
        });
        Ok(())
    }

    async fn reclaim_source(&self, task: &CleanupTask) -> Result<()> {
        let engine = &self.engine;
        let Some(cleanup) = engine
            .catalog
            .load_source_cleanups()?
            .into_iter()
            .find(|c| c.file_id == task.file_id && c.source_node == task.node_id)
        else {
            return Ok(());
        };
        if engine.clock.now() < cleanup.delete_after {
            return Err(Error::invalid_state(format!(
                "safety margin for {} on {} runs until {}",
                cleanup.file_id, cleanup.source_node, cleanup.delete_after
            )));
        }
        if engine.active.is_active(&task.file_id) {
            return Err(Error::lock_contention(format!("file {}", task.file_id)));
        }

        let source = engine.nodes.get(&cleanup.source_node)?;
        if let Some(read) = source.attributes.read(&task.file_id)? {
            let home = read.record.storage_node_id;
            if home == source.id {
                // The move was undone; the source is authoritative again
                warn!(file_id = %task.file_id, node_id = %source.id, "Source copy is authoritative, not reclaiming");
                engine
                    .catalog
                    .delete_source_cleanup(&task.file_id, &source.id)?;
                return Ok(());
            }
            let target = engine.nodes.get(&home)?;
            let target_holds_copy = target.attributes.read(&task.file_id)?.is_some()
                && target.blobs.exists(&task.file_id).await?;
            if !target_holds_copy {
                return Err(Error::invalid_state(format!(
                    "authoritative copy of {} missing on {home}; keeping source",
                    task.file_id
                )));
            }
        }

        source.blobs.delete(&task.file_id).await?;
        source.attributes.delete(&task.file_id)?;
        engine
            .catalog
            .delete_source_cleanup(&task.file_id, &source.id)?;
        info!(file_id = %task.file_id, node_id = %source.id, "Source copy reclaimed");
        engine.events.emit(FileEvent::SourceReclaimed {
            file_id: task.file_id,
            node_id: source.id.clone(),
        });
        Ok(())
    }

    async fn remove_orphan(&self, task: &CleanupTask) -> Result<()> {
        let node = self.engine.nodes.get(&task.node_id)?;
        if node.attributes.read(&task.file_id)?.is_some() {
            debug!(file_id = %task.file_id, "Orphan gained a record, keeping it");
            return Ok(());
        }
        if self.engine.active.is_active(&task.file_id) || node.attributes.is_locked(&task.file_id) {
            return Err(Error::lock_contention(format!("file {}", task.file_id)));
        }
        if node.blobs.delete(&task.file_id).await? {
            info!(file_id = %task.file_id, node_id = %node.id, "Orphaned file removed");
        }
        Ok(())
    }

    /// Finish what a failed compensation left: bytes, record and cache row of
    /// a file that is not live on the node
    async fn clear_residue(&self, task: &CleanupTask) -> Result<()> {
        let engine = &self.engine;
        if engine.active.is_active(&task.file_id) {
            return Err(Error::lock_contention(format!("file {}", task.file_id)));
        }
        let node = engine.nodes.get(&task.node_id)?;
        if let Some(read) = node.attributes.read(&task.file_id)?
            && read.record.storage_node_id != node.id
        {
            // Source copy awaiting reclaim; its own schedule owns it
            return Ok(());
        }
        if let Some(read) = node.attributes.read(&task.file_id)?
            && !read.record.is_tombstoned()
            && node.blobs.exists(&task.file_id).await?
        {
            debug!(file_id = %task.file_id, "Residue resolved, file is live");
            return Ok(());
        }

        node.blobs.delete(&task.file_id).await?;
        node.attributes.delete(&task.file_id)?;
        if engine
            .catalog
            .get_file_index(&task.file_id)?
            .is_some_and(|row| row.node_id == node.id)
        {
            engine.catalog.delete_file_index(&task.file_id)?;
        }
        info!(file_id = %task.file_id, node_id = %node.id, "Saga residue cleared");
        Ok(())
    }

    /// Tasks parked for manual review
    pub fn parked_tasks(&self) -> Result<Vec<CleanupTask>> {
        Ok(self.engine.catalog.load_parked_tasks()?)
    }

    /// Return a parked task to the queue with a fresh attempt budget
    pub fn requeue_parked(&self, key: &str) -> Result<bool> {
        let requeued = self
            .engine
            .catalog
            .requeue_parked_task(key, self.engine.clock.now())?;
        if requeued {
            info!(task = key, "Parked cleanup task requeued");
        }
        Ok(requeued)
    }

    /// Files referenced by unfinished sagas or finalizations
    fn busy_files(&self) -> Result<HashSet<FileId>> {
        let mut busy = self.orchestrator.log().unfinished_files()?;
        busy.extend(
            self.engine
                .catalog
                .load_finalize_intents()?
                .into_iter()
                .map(|i| i.file_id),
        );
        Ok(busy)
    }

    /// Run cycles on `interval` until cancelled
    pub async fn run(self: Arc<Self>, interval: std::time::Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.run_cycle().await {
                error!("GC cycle failed: {e}");
            }
        }
        debug!("GC loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::UploadRequest;
    use crate::testutil::Harness;
    use archivum_common::{Clock, NodeId, RetentionPolicy};
    use chrono::Duration;

    #[tokio::test]
    async fn test_expired_temporary_file_is_removed() {
        let h = Harness::new().await;
        let spool = h.spool(b"ephemeral").await;
        let uploaded = h
            .engine
            .upload(
                UploadRequest::new(&spool, "e.bin", "alice", RetentionPolicy::Temporary)
                    .with_ttl(Duration::hours(1)),
            )
            .await
            .unwrap();
        let keep = h.upload_temp(b"no ttl").await;
        let gc = h.engine.collector();

        let report = gc.run_cycle().await.unwrap();
        assert_eq!(report.expired_queued, 0);

        h.clock.advance(Duration::hours(1));
        let report = gc.run_cycle().await.unwrap();
        assert_eq!(report.expired_queued, 1);
        assert_eq!(report.execution.succeeded, 1);
        assert!(matches!(
            h.engine.read(uploaded.file_id),
            Err(Error::RecordNotFound(_))
        ));
        let node = h.engine.context().nodes.get(&uploaded.node_id).unwrap();
        assert!(!node.blobs.exists(&uploaded.file_id).await.unwrap());
        assert!(h.engine.read(keep.file_id).is_ok());
    }

    #[tokio::test]
    async fn test_finalized_file_is_not_expired() {
        let h = Harness::new().await;
        let spool = h.spool(b"promoted in time").await;
        let uploaded = h
            .engine
            .upload(
                UploadRequest::new(&spool, "p.bin", "alice", RetentionPolicy::Temporary)
                    .with_ttl(Duration::hours(1)),
            )
            .await
            .unwrap();
        h.engine.finalize(uploaded.file_id).await.unwrap();

        h.clock.advance(Duration::hours(2));
        let report = h.engine.collector().run_cycle().await.unwrap();
        assert_eq!(report.expired_queued, 0);
        assert!(h.engine.read(uploaded.file_id).is_ok());
    }

    #[tokio::test]
    async fn test_orphans_respect_grace_and_active_files() {
        let h = Harness::new().await;
        let ctx = h.engine.context();
        let node = ctx.nodes.get(&NodeId::new("perm-02")).unwrap();
        let spool = h.spool(b"bytes without a record").await;
        let sha = archivum_common::sha256_hex(b"bytes without a record");
        let orphan = FileId::new();
        let in_flight = FileId::new();
        for id in [orphan, in_flight] {
            node.blobs
                .put_from_path(&id, &spool, &sha, &CancellationToken::new())
                .await
                .unwrap();
        }
        let gc = h.engine.collector();

        assert_eq!(gc.scan_orphans().await.unwrap(), 0);

        ctx.active.claim(in_flight, "upload-saga").unwrap();
        h.clock.advance(Duration::days(8));
        assert_eq!(gc.scan_orphans().await.unwrap(), 1);
        assert_eq!(gc.execute_due().await.unwrap().succeeded, 1);
        assert!(!node.blobs.exists(&orphan).await.unwrap());
        assert!(node.blobs.exists(&in_flight).await.unwrap());
    }

    #[tokio::test]
    async fn test_failing_task_backs_off_then_parks() {
        let h = Harness::new().await;
        let ctx = h.engine.context();
        let mut events = h.engine.events();
        let now = h.clock.now();
        let task = CleanupTask::new(
            FileId::new(),
            NodeId::new("missing-node"),
            CleanupAction::RemoveOrphan,
            CleanupPriority::Low,
            now,
        );
        ctx.catalog.enqueue_cleanup_task(&task).unwrap();
        let gc = h.engine.collector();

        let first = gc.execute_due().await.unwrap();
        assert_eq!(first.retried, 1);
        let queued = ctx.catalog.load_cleanup_tasks().unwrap();
        assert_eq!(queued[0].attempts, 1);
        assert_eq!(queued[0].due_at, now + ctx.config.gc.backoff_for(1));

        // Not due yet
        assert_eq!(gc.execute_due().await.unwrap(), ExecutionSummary::default());

        h.clock.advance(Duration::hours(1));
        assert_eq!(gc.execute_due().await.unwrap().retried, 1);
        h.clock.advance(Duration::hours(1));
        assert_eq!(gc.execute_due().await.unwrap().parked, 1);

        assert!(ctx.catalog.load_cleanup_tasks().unwrap().is_empty());
        let parked = gc.parked_tasks().unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].attempts, 3);
        assert!(matches!(
            events.try_recv().unwrap(),
            FileEvent::TaskParked { attempts: 3, .. }
        ));
        // Parked tasks are not re-queued by scans
        assert!(!ctx.catalog.enqueue_cleanup_task(&task).unwrap());

        assert!(gc.requeue_parked(&task.key()).unwrap());
        let queued = ctx.catalog.load_cleanup_tasks().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].attempts, 0);
        assert!(gc.parked_tasks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_skipped_while_lease_held() {
        let h = Harness::new().await;
        let _held = h
            .engine
            .leases()
            .acquire(GC_LEASE, "other-process", Duration::minutes(10))
            .unwrap();
        let report = h.engine.collector().run_cycle().await.unwrap();
        assert!(report.skipped);
    }

    #[tokio::test]
    async fn test_residue_is_cleared_when_file_is_not_live() {
        let h = Harness::new().await;
        let ctx = h.engine.context();
        let node = ctx.nodes.get(&NodeId::new("tmp-01")).unwrap();
        let spool = h.spool(b"half written").await;
        let file_id = FileId::new();
        node.blobs
            .put_from_path(
                &file_id,
                &spool,
                &archivum_common::sha256_hex(b"half written"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let task = CleanupTask::new(
            file_id,
            node.id.clone(),
            CleanupAction::CompensationResidue,
            CleanupPriority::High,
            h.clock.now(),
        );
        ctx.catalog.enqueue_cleanup_task(&task).unwrap();

        let live = h.upload_temp(b"live file").await;
        let live_task = CleanupTask::new(
            live.file_id,
            live.node_id.clone(),
            CleanupAction::CompensationResidue,
            CleanupPriority::High,
            h.clock.now(),
        );
        ctx.catalog.enqueue_cleanup_task(&live_task).unwrap();

        let summary = h.engine.collector().execute_due().await.unwrap();
        assert_eq!(summary.succeeded, 2);
        assert!(!node.blobs.exists(&file_id).await.unwrap());
        assert!(h.engine.read(live.file_id).is_ok());
    }
}
