//! Background retry of directory publication
//!
//! A saga whose publish step failed has completed: the file is durable and
//! indexed. Only discoverability is behind, so the descriptor is re-published
//! here on an interval until it succeeds or the configured ceiling is hit.

use crate::context::EngineContext;
use crate::saga::{SagaLog, SagaState, reservation_id};
use archivum_common::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counts from one retry pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishRetryReport {
    pub published: usize,
    pub failed: usize,
    pub abandoned: usize,
}

pub struct PublishRetrier {
    engine: Arc<EngineContext>,
    log: SagaLog,
}

impl PublishRetrier {
    pub fn new(engine: Arc<EngineContext>) -> Self {
        Self {
            log: SagaLog::new(Arc::clone(&engine.catalog)),
            engine,
        }
    }

    /// Retry every pending publication once
    pub async fn retry_pending(&self) -> Result<PublishRetryReport> {
        let mut report = PublishRetryReport::default();
        let ceiling = self.engine.config.saga.publish_retry_max_attempts;

        for mut saga in self.log.load_all()? {
            if saga.state != SagaState::Completed || !saga.publish_pending {
                continue;
            }
            let reservation = reservation_id(saga.saga_id);
            let result = match self.engine.nodes.get(&saga.context.node_id) {
                Ok(node) => {
                    let descriptor = node.descriptor(self.engine.clock.now());
                    self.engine
                        .directory
                        .publish(descriptor, Some(&reservation))
                        .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(_) => {
                    info!(saga_id = %saga.saga_id, node_id = %saga.context.node_id, "Deferred directory publication succeeded");
                    saga.publish_pending = false;
                    saga.last_error = None;
                    report.published += 1;
                }
                Err(e) => {
                    saga.publish_attempts += 1;
                    saga.last_error = Some(e.to_string());
                    if ceiling.is_some_and(|max| saga.publish_attempts >= max) {
                        error!(
                            saga_id = %saga.saga_id,
                            attempts = saga.publish_attempts,
                            error = %e,
                            "Giving up on directory publication; the next heartbeat carries current usage"
                        );
                        saga.publish_pending = false;
                        if let Err(e) = self.engine.directory.release(&reservation).await {
                            warn!(saga_id = %saga.saga_id, error = %e, "Failed to release reservation of abandoned publication");
                        }
                        report.abandoned += 1;
                    } else {
                        debug!(saga_id = %saga.saga_id, attempts = saga.publish_attempts, error = %e, "Directory publication still failing");
                        report.failed += 1;
                    }
                }
            }
            saga.updated_at = self.engine.clock.now();
            self.log.save(&saga)?;
        }
        Ok(report)
    }

    /// Retry on `interval` until cancelled
    pub async fn run(self: Arc<Self>, interval: std::time::Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.retry_pending().await {
                Ok(report) if report != PublishRetryReport::default() => {
                    info!(?report, "Publish retry pass finished");
                }
                Ok(_) => {}
                Err(e) => error!("Publish retry pass failed: {e}"),
            }
        }
        debug!("Publish retry loop stopped");
    }
}
