//! Temporary-to-permanent finalization
//!
//! Two phases, each recorded in a durable [`FinalizeIntent`]:
//!
//! 1. **Prepare** copies the bytes to a permanent node under a directory
//!    reservation and verifies the target digest. Nothing is visible to
//!    readers yet; any failure deletes the partial copy and aborts.
//! 2. **Commit** writes the finalized record on the target, then switches
//!    the source record to point at it in one atomic replace. Once commit
//!    has started the operation only rolls forward.
//!
//! The source copy stays in place until the collector reclaims it after
//! the safety margin.

use crate::context::{EngineContext, finalize_reservation_id, index_entry};
use crate::events::FileEvent;
use crate::node::StorageNode;
use archivum_catalog::{FinalizeIntent, FinalizePhase, ScheduledSourceCleanup};
use archivum_common::{Error, FileId, NodeId, Result, RetentionPolicy, StorageMode};
use archivum_placement::Reservation;
use archivum_storage::{AttributeRecord, SCHEMA_VERSION};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Result of a finalization request
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FinalizeOutcome {
    /// Verified copy on `target_node`; commit may proceed
    Prepared { target_node: NodeId },
    /// The record now names `target_node` as its permanent home
    Committed {
        target_node: NodeId,
        finalized_at: DateTime<Utc>,
    },
    /// Nothing changed; the partial copy was removed
    Aborted { reason: String },
}

pub struct FinalizationCoordinator {
    engine: Arc<EngineContext>,
    cancel: CancellationToken,
}

impl FinalizationCoordinator {
    pub fn new(engine: Arc<EngineContext>, cancel: CancellationToken) -> Self {
        Self { engine, cancel }
    }

    /// Prepare and commit in one call
    pub async fn finalize(&self, file_id: FileId) -> Result<FinalizeOutcome> {
        let _claim = self.engine.active.guard(file_id, &owner(file_id))?;
        match self.prepare_claimed(file_id).await? {
            FinalizeOutcome::Prepared { .. } => self.commit_claimed(file_id).await,
            other => Ok(other),
        }
    }

    /// Phase one only
    pub async fn prepare(&self, file_id: FileId) -> Result<FinalizeOutcome> {
        let _claim = self.engine.active.guard(file_id, &owner(file_id))?;
        self.prepare_claimed(file_id).await
    }

    /// Phase two of a prepared finalization
    pub async fn commit(&self, file_id: FileId) -> Result<FinalizeOutcome> {
        let _claim = self.engine.active.guard(file_id, &owner(file_id))?;
        self.commit_claimed(file_id).await
    }

    /// Abandon a finalization that has not started committing
    pub async fn abort(&self, file_id: FileId, reason: &str) -> Result<FinalizeOutcome> {
        let _claim = self.engine.active.guard(file_id, &owner(file_id))?;
        let intent = self
            .engine
            .catalog
            .get_finalize_intent(&file_id)?
            .ok_or_else(|| Error::invalid_state(format!("no finalization of {file_id} in progress")))?;
        if intent.phase == FinalizePhase::Committed || intent.finalized_at.is_some() {
            return Err(Error::invalid_state(format!(
                "finalization of {file_id} has started committing and can only roll forward"
            )));
        }
        self.rollback_prepare(&intent).await?;
        warn!(%file_id, reason, "Finalization aborted");
        Ok(FinalizeOutcome::Aborted {
            reason: reason.to_string(),
        })
    }

    /// Settle every intent left by a previous process.
    ///
    /// Interrupted prepares are aborted; anything that reached PREPARED is
    /// rolled forward.
    pub async fn recover(&self) -> Result<Vec<(FileId, FinalizeOutcome)>> {
        let mut settled = Vec::new();
        for intent in self.engine.catalog.load_finalize_intents()? {
            let file_id = intent.file_id;
            let _claim = match self.engine.active.guard(file_id, &owner(file_id)) {
                Ok(claim) => claim,
                Err(e) => {
                    warn!(%file_id, error = %e, "Finalization busy, not recovering now");
                    continue;
                }
            };
            let outcome = match intent.phase {
                FinalizePhase::Preparing if intent.finalized_at.is_none() => {
                    self.rollback_prepare(&intent).await?;
                    FinalizeOutcome::Aborted {
                        reason: "prepare interrupted by restart".to_string(),
                    }
                }
                _ => self.commit_claimed(file_id).await?,
            };
            info!(%file_id, ?outcome, "Recovered finalization");
            settled.push((file_id, outcome));
        }
        Ok(settled)
    }

    async fn prepare_claimed(&self, file_id: FileId) -> Result<FinalizeOutcome> {
        let engine = &self.engine;
        if let Some(intent) = engine.catalog.get_finalize_intent(&file_id)? {
            return match intent.phase {
                FinalizePhase::Prepared => Ok(FinalizeOutcome::Prepared {
                    target_node: intent.target_node,
                }),
                FinalizePhase::Preparing => Err(Error::invalid_state(format!(
                    "prepare of {file_id} was interrupted; recovery must settle it first"
                ))),
                FinalizePhase::Committed => Err(Error::invalid_state(format!(
                    "{file_id} is already committing"
                ))),
            };
        }

        let (source, record) = engine.locate(&file_id)?;
        if record.is_tombstoned() {
            return Err(Error::invalid_state(format!("{file_id} is being deleted")));
        }
        if record.retention_policy == RetentionPolicy::Permanent {
            return Err(Error::invalid_state(format!("{file_id} is already permanent")));
        }

        // Nothing has been touched if placement fails
        let placement = engine
            .selector
            .select_excluding(StorageMode::PermanentAppendOnly, record.file_size, Some(&source.id))
            .await?;
        if let Some(degraded) = placement.degraded() {
            warn!(%file_id, "Finalization target chosen from degraded directory: {degraded}");
        }
        let target = engine.nodes.get(&placement.node_id)?;

        let mut intent = FinalizeIntent {
            file_id,
            source_node: source.id.clone(),
            target_node: target.id.clone(),
            reservation_id: finalize_reservation_id(&file_id, &target.id),
            phase: FinalizePhase::Preparing,
            started_at: engine.clock.now(),
            finalized_at: None,
        };
        engine.catalog.put_finalize_intent(&intent)?;
        info!(%file_id, source = %source.id, target = %target.id, "Finalization prepare started");

        match self.copy_and_verify(&source, &target, &record, &intent).await {
            Ok(()) => {
                intent.phase = FinalizePhase::Prepared;
                engine.catalog.put_finalize_intent(&intent)?;
                info!(%file_id, target = %target.id, "Finalization prepared");
                Ok(FinalizeOutcome::Prepared {
                    target_node: target.id.clone(),
                })
            }
            Err(e) => {
                warn!(%file_id, target = %target.id, error = %e, "Finalization prepare failed, aborting");
                self.rollback_prepare(&intent).await?;
                Ok(FinalizeOutcome::Aborted {
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn copy_and_verify(
        &self,
        source: &StorageNode,
        target: &StorageNode,
        record: &AttributeRecord,
        intent: &FinalizeIntent,
    ) -> Result<()> {
        self.engine
            .directory
            .reserve(Reservation {
                id: intent.reservation_id.clone(),
                node_id: target.id.clone(),
                bytes: record.file_size,
            })
            .await?;

        let cancel = self.cancel.child_token();
        source
            .blobs
            .copy_to(
                &record.file_id,
                &target.blobs,
                self.engine.config.finalize.copy_chunk_bytes,
                &record.sha256,
                &cancel,
            )
            .await?;
        // Re-read what landed rather than trusting the stream digest
        target.blobs.verify(&record.file_id, &record.sha256).await
    }

    /// Undo a prepare: drop the target copy, the reservation and the intent
    async fn rollback_prepare(&self, intent: &FinalizeIntent) -> Result<()> {
        let engine = &self.engine;
        let target = engine.nodes.get(&intent.target_node)?;
        // The target must not be holding an authoritative record before removing bytes
        if target.attributes.read(&intent.file_id)?.is_none() {
            target.blobs.delete(&intent.file_id).await?;
        }
        if let Err(e) = engine.directory.release(&intent.reservation_id).await {
            warn!(file_id = %intent.file_id, error = %e, "Failed to release finalization reservation");
        }
        engine.catalog.delete_finalize_intent(&intent.file_id)?;
        Ok(())
    }

    async fn commit_claimed(&self, file_id: FileId) -> Result<FinalizeOutcome> {
        let engine = &self.engine;
        let mut intent = engine
            .catalog
            .get_finalize_intent(&file_id)?
            .ok_or_else(|| Error::invalid_state(format!("{file_id} has no prepared finalization")))?;
        if intent.phase == FinalizePhase::Preparing && intent.finalized_at.is_none() {
            return Err(Error::invalid_state(format!("{file_id} is not prepared")));
        }
        let source = engine.nodes.get(&intent.source_node)?;
        let target = engine.nodes.get(&intent.target_node)?;

        // Fixing the timestamp first makes every later step repeatable
        let finalized_at = match intent.finalized_at {
            Some(at) => at,
            None => {
                let at = engine.clock.now();
                intent.finalized_at = Some(at);
                engine.catalog.put_finalize_intent(&intent)?;
                at
            }
        };

        if intent.phase != FinalizePhase::Committed {
            let current = match target.attributes.read(&file_id)? {
                Some(read) if read.record.finalized_at.is_some() => read.record,
                _ => source.attributes.get(&file_id)?,
            };
            let mut committed = current;
            committed.retention_policy = RetentionPolicy::Permanent;
            committed.storage_node_id = target.id.clone();
            committed.finalized_at = Some(finalized_at);
            committed.ttl_expires_at = None;
            committed.schema_version = SCHEMA_VERSION;

            target.attributes.write(&committed)?;
            // The switch readers observe
            source.attributes.update(&file_id, |record| {
                *record = committed.clone();
                Ok(())
            })?;
            engine
                .catalog
                .put_file_index(&index_entry(&committed, engine.clock.now()))?;

            intent.phase = FinalizePhase::Committed;
            engine.catalog.put_finalize_intent(&intent)?;
            info!(%file_id, target = %target.id, %finalized_at, "Finalization committed");
        }

        engine.catalog.schedule_source_cleanup(&ScheduledSourceCleanup {
            file_id,
            source_node: source.id.clone(),
            finalized_at,
            delete_after: finalized_at + engine.config.finalize.safety_margin(),
        })?;

        let descriptor = target.descriptor(engine.clock.now());
        if let Err(e) = engine
            .directory
            .publish(descriptor, Some(&intent.reservation_id))
            .await
        {
            // The next heartbeat carries the usage; only the hold lingers
            error!(%file_id, target = %target.id, error = %e, "Failed to publish finalized target");
            if let Err(e) = engine.directory.release(&intent.reservation_id).await {
                warn!(%file_id, error = %e, "Failed to release finalization reservation");
            }
        }

        engine.catalog.delete_finalize_intent(&file_id)?;
        engine.events.emit(FileEvent::Finalized {
            file_id,
            source_node: source.id.clone(),
            target_node: target.id.clone(),
            finalized_at,
        });
        Ok(FinalizeOutcome::Committed {
            target_node: target.id.clone(),
            finalized_at,
        })
    }
}

fn owner(file_id: FileId) -> String {
    format!("finalize/{file_id}")
}
