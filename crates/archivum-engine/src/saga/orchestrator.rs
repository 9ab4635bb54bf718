use super::{
    OperationOutcome, SagaContext, SagaInstance, SagaKind, SagaLog, SagaState, SagaStatus,
    StepExecutor, StepKind,
};
use crate::context::EngineContext;
use archivum_catalog::{CleanupAction, CleanupTask};
use archivum_common::config::SagaConfig;
use archivum_common::{CleanupPriority, Error, Result, SagaId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Drives sagas forward, and backward when a strict step fails
pub struct SagaOrchestrator {
    engine: Arc<EngineContext>,
    log: SagaLog,
    executor: Arc<dyn StepExecutor>,
    config: SagaConfig,
}

#[derive(Clone, Copy)]
enum Direction {
    Execute,
    Compensate,
}

impl SagaOrchestrator {
    pub fn new(engine: Arc<EngineContext>, executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            log: SagaLog::new(Arc::clone(&engine.catalog)),
            config: engine.config.saga.clone(),
            engine,
            executor,
        }
    }

    #[must_use]
    pub fn log(&self) -> &SagaLog {
        &self.log
    }

    /// Create and persist a saga in the PENDING state.
    ///
    /// Fails without side effects if another operation holds the file.
    pub fn start(
        &self,
        kind: SagaKind,
        steps: Vec<StepKind>,
        context: SagaContext,
    ) -> Result<SagaInstance> {
        let instance = SagaInstance::new(kind, steps, context, self.engine.clock.now());
        let file_id = instance.context.file_id;
        self.engine
            .active
            .claim(file_id, &instance.saga_id.to_string())?;
        if let Err(e) = self.log.save(&instance) {
            self.engine.active.release(&file_id);
            return Err(e);
        }
        info!(saga_id = %instance.saga_id, %kind, %file_id, "Saga created");
        Ok(instance)
    }

    /// Run a saga to a terminal state
    pub async fn run(&self, mut instance: SagaInstance) -> Result<OperationOutcome> {
        let file_id = instance.context.file_id;
        let result = self.drive(&mut instance).await;
        self.engine.active.release(&file_id);
        result
    }

    /// Resume every non-terminal saga found in the log
    pub async fn resume_pending(&self) -> Result<Vec<(SagaId, OperationOutcome)>> {
        let mut resumed = Vec::new();
        for instance in self.log.load_all()? {
            if instance.state.is_terminal() {
                continue;
            }
            let saga_id = instance.saga_id;
            let owner = saga_id.to_string();
            if let Err(e) = self.engine.active.claim(instance.context.file_id, &owner) {
                warn!(%saga_id, error = %e, "Saga file busy, not resuming now");
                continue;
            }
            info!(
                %saga_id,
                kind = %instance.kind,
                state = %instance.state,
                step = instance.current_step,
                "Resuming saga"
            );
            let outcome = self.run(instance).await?;
            resumed.push((saga_id, outcome));
        }
        Ok(resumed)
    }

    /// Status of a saga
    pub fn status(&self, saga_id: SagaId) -> Result<SagaStatus> {
        Ok(self.log.load(saga_id)?.status())
    }

    async fn drive(&self, instance: &mut SagaInstance) -> Result<OperationOutcome> {
        if instance.state == SagaState::Compensating {
            return self.compensate(instance).await;
        }
        if instance.state == SagaState::Pending {
            instance.state = SagaState::Running;
            self.persist(instance)?;
        }

        while instance.current_step < instance.steps.len() {
            let index = instance.current_step;
            let step = instance.steps[index];
            debug!(saga_id = %instance.saga_id, %step, index, "Saga step started");

            match self
                .attempt(instance.saga_id, step, &mut instance.context, Direction::Execute)
                .await
            {
                Ok(()) => {
                    info!(saga_id = %instance.saga_id, %step, "Saga step completed");
                }
                Err(e) if !step.is_strict() => {
                    warn!(
                        saga_id = %instance.saga_id,
                        %step,
                        error = %e,
                        "Non-strict saga step failed, queued for background retry"
                    );
                    instance.publish_pending = true;
                    instance.last_error = Some(e.to_string());
                }
                Err(e) => {
                    error!(saga_id = %instance.saga_id, %step, error = %e, "Saga step failed, compensating");
                    instance.state = SagaState::Compensating;
                    instance.failed_step = Some(index);
                    // The failed step may have partially applied; its compensation is idempotent
                    instance.compensation_cursor = Some(index);
                    instance.last_error = Some(e.to_string());
                    self.persist(instance)?;
                    return self.compensate(instance).await;
                }
            }

            instance.current_step += 1;
            self.persist(instance)?;
        }

        instance.state = SagaState::Completed;
        self.persist(instance)?;
        info!(
            saga_id = %instance.saga_id,
            kind = %instance.kind,
            file_id = %instance.context.file_id,
            publish_pending = instance.publish_pending,
            "Saga completed"
        );
        Ok(if instance.publish_pending {
            OperationOutcome::CompletedPublishPending
        } else {
            OperationOutcome::Completed
        })
    }

    async fn compensate(&self, instance: &mut SagaInstance) -> Result<OperationOutcome> {
        let failed_step = instance
            .failed_step
            .and_then(|i| instance.steps.get(i))
            .map_or_else(|| "unknown".to_string(), ToString::to_string);
        let cause = instance.last_error.clone().unwrap_or_default();

        while let Some(index) = instance.compensation_cursor {
            let step = instance.steps[index];
            info!(saga_id = %instance.saga_id, %step, "Compensating saga step");

            if let Err(e) = self
                .attempt(instance.saga_id, step, &mut instance.context, Direction::Compensate)
                .await
            {
                error!(
                    saga_id = %instance.saga_id,
                    %step,
                    error = %e,
                    "Compensation failed, handing residue to cleanup"
                );
                instance.state = SagaState::Failed;
                instance.last_error = Some(format!("{cause}; compensation of {step} failed: {e}"));
                self.persist(instance)?;
                self.queue_residue(instance, &e)?;
                return Ok(OperationOutcome::CleanupPending {
                    failed_step,
                    error: cause,
                });
            }

            instance.compensation_cursor = index.checked_sub(1);
            self.persist(instance)?;
        }

        instance.state = SagaState::Compensated;
        self.persist(instance)?;
        info!(saga_id = %instance.saga_id, %failed_step, "Saga rolled back");
        Ok(OperationOutcome::RolledBack {
            failed_step,
            error: cause,
        })
    }

    /// One step in one direction, with a timeout and bounded retries
    async fn attempt(
        &self,
        saga_id: SagaId,
        step: StepKind,
        context: &mut SagaContext,
        direction: Direction,
    ) -> Result<()> {
        let timeout = self.config.step_timeout();
        let mut attempt = 0;
        loop {
            let fut = match direction {
                Direction::Execute => self.executor.execute(saga_id, step, context),
                Direction::Compensate => self.executor.compensate(saga_id, step, context),
            };
            let result = match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(Error::SagaStepTimeout {
                    step: step.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            };

            match result {
                Err(e) if e.is_retryable() && attempt < self.config.step_retries => {
                    attempt += 1;
                    let backoff = self.config.retry_backoff() * 2_u32.saturating_pow(attempt - 1);
                    debug!(%saga_id, %step, attempt, error = %e, "Retrying saga step");
                    tokio::time::sleep(backoff.min(Duration::from_secs(30))).await;
                }
                other => return other,
            }
        }
    }

    fn persist(&self, instance: &mut SagaInstance) -> Result<()> {
        instance.updated_at = self.engine.clock.now();
        self.log.save(instance)
    }

    fn queue_residue(&self, instance: &SagaInstance, cause: &Error) -> Result<()> {
        let mut task = CleanupTask::new(
            instance.context.file_id,
            instance.context.node_id.clone(),
            CleanupAction::CompensationResidue,
            CleanupPriority::High,
            self.engine.clock.now(),
        );
        task.last_error = Some(cause.to_string());
        self.engine.catalog.enqueue_cleanup_task(&task)?;
        Ok(())
    }
}
