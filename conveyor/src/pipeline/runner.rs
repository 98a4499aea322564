//! Drives a leased job through the stage sequence.
//!
//! The runner owns every record mutation while the lease is held. Stage
//! failures are state, not errors: they end the run with a
//! [`RunOutcome`] telling the worker whether to ack or requeue. An `Err`
//! from [`PipelineRunner::run`] always means the infrastructure failed
//! mid-run (store unavailable), in which case the worker nacks without
//! touching the retry budget.

use super::{PipelineContext, StageRegistry};
use crate::broadcast::ProgressBroadcaster;
use crate::core::{CheckpointValue, Job, ProgressEvent};
use crate::errors::{ConveyorError, ErrorCode};
use crate::limiter::RateLimiter;
use crate::retry::{FailureKind, RetryPolicy};
use crate::store::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default wall-clock budget per stage attempt.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(120);

/// How a single leased execution of a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All stages done; the job is terminally COMPLETED. Ack.
    Completed,
    /// Permanent failure or exhausted retry budget. Ack.
    Failed,
    /// Cancellation observed at a stage boundary. Ack.
    Cancelled,
    /// Transient failure with budget remaining; requeue after the delay.
    Retry(Duration),
    /// The record was already terminal on arrival (duplicate delivery).
    /// Ack without touching the record.
    AlreadyTerminal,
}

/// Executes the registered stage sequence against one job at a time.
///
/// A single runner instance is shared by all workers; per-job state
/// lives entirely in the job record passed through [`run`](Self::run).
pub struct PipelineRunner {
    registry: Arc<StageRegistry>,
    store: Arc<dyn JobStore>,
    broadcaster: Arc<ProgressBroadcaster>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    stage_timeout: Duration,
}

impl PipelineRunner {
    /// Creates a runner over the given registry and infrastructure.
    #[must_use]
    pub fn new(
        registry: Arc<StageRegistry>,
        store: Arc<dyn JobStore>,
        broadcaster: Arc<ProgressBroadcaster>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            store,
            broadcaster,
            limiter,
            policy,
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
        }
    }

    /// Sets the per-stage attempt timeout.
    #[must_use]
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Runs the job from its first un-checkpointed stage.
    ///
    /// Checkpointed stages are skipped, never re-executed; the
    /// cancellation flag is re-read from the store at every stage
    /// boundary and once more before the completed transition.
    ///
    /// # Errors
    ///
    /// Only infrastructure failures ([`ConveyorError::Transport`] from
    /// the store) surface as `Err`.
    pub async fn run(&self, mut job: Job) -> Result<RunOutcome, ConveyorError> {
        if job.is_terminal() {
            debug!(job_id = %job.id, status = %job.status, "redelivered terminal job, nothing to do");
            return Ok(RunOutcome::AlreadyTerminal);
        }

        job.mark_processing();
        self.persist(&mut job).await?;

        let total_stages = self.registry.len();
        let resumed_from = job.checkpoints.len();
        if resumed_from > 0 {
            info!(job_id = %job.id, completed_stages = resumed_from, "resuming from checkpoint");
        }

        for descriptor in self.registry.stages() {
            if job.checkpoints.contains_key(&descriptor.name) {
                continue;
            }

            if self.cancel_requested(&mut job).await? {
                return self.finish_cancelled(job).await;
            }

            self.broadcaster
                .publish(ProgressEvent::stage_started(job.id, &descriptor.name, job.progress));

            if descriptor.executor.rate_limited() {
                self.limiter.acquire(descriptor.executor.cost()).await;
            }

            let ctx = PipelineContext::from_job(&job);
            let attempt =
                tokio::time::timeout(self.stage_timeout, descriptor.executor.execute(&ctx)).await;

            match attempt {
                Ok(Ok(payload)) => {
                    job.record_checkpoint(
                        CheckpointValue::new(&descriptor.name, payload),
                        total_stages,
                    );
                    self.persist(&mut job).await?;
                    info!(job_id = %job.id, stage = %descriptor.name, progress = job.progress, "stage completed");
                    self.broadcaster.publish(ProgressEvent::stage_completed(
                        job.id,
                        &descriptor.name,
                        job.progress,
                    ));
                }
                Ok(Err(failure)) => {
                    let kind = self.policy.classify(&failure.reason);
                    let code = match kind {
                        FailureKind::Transient => ErrorCode::StageTransient,
                        FailureKind::Permanent => ErrorCode::StageValidation,
                    };
                    return self
                        .finish_failed(job, &descriptor.name, code, kind, failure.reason)
                        .await;
                }
                Err(_) => {
                    // A stage that exceeds its budget is treated like any
                    // other transient failure.
                    let reason = format!(
                        "stage '{}' exceeded its {}s time budget",
                        descriptor.name,
                        self.stage_timeout.as_secs()
                    );
                    return self
                        .finish_failed(
                            job,
                            &descriptor.name,
                            ErrorCode::StageTimeout,
                            FailureKind::Transient,
                            reason,
                        )
                        .await;
                }
            }
        }

        // A cancel may have landed while the final stage ran.
        if self.cancel_requested(&mut job).await? {
            return self.finish_cancelled(job).await;
        }

        job.mark_completed();
        self.store.update(&job).await?;
        info!(job_id = %job.id, "job completed");
        self.broadcaster.publish(ProgressEvent::job_completed(job.id));
        Ok(RunOutcome::Completed)
    }

    /// Writes the record back, first folding in a cancellation flag that
    /// may have been set durably while this execution was running. A
    /// non-terminal full-record write must never erase the flag, or the
    /// next boundary check would read back its own stale copy.
    async fn persist(&self, job: &mut Job) -> Result<(), ConveyorError> {
        if !job.cancel_requested {
            if let Some(fresh) = self.store.get(job.id).await? {
                job.cancel_requested = fresh.cancel_requested;
            }
        }
        self.store.update(job).await
    }

    /// Re-reads the advisory cancellation flag from the store.
    ///
    /// A record that vanished mid-run is treated as not cancelled; the
    /// local flag still applies.
    async fn cancel_requested(&self, job: &mut Job) -> Result<bool, ConveyorError> {
        if !job.cancel_requested {
            if let Some(fresh) = self.store.get(job.id).await? {
                job.cancel_requested = fresh.cancel_requested;
            }
        }
        Ok(job.cancel_requested)
    }

    async fn finish_cancelled(&self, mut job: Job) -> Result<RunOutcome, ConveyorError> {
        job.mark_cancelled();
        self.store.update(&job).await?;
        info!(job_id = %job.id, progress = job.progress, "job cancelled at stage boundary");
        self.broadcaster
            .publish(ProgressEvent::job_cancelled(job.id, job.progress));
        Ok(RunOutcome::Cancelled)
    }

    async fn finish_failed(
        &self,
        mut job: Job,
        stage: &str,
        code: ErrorCode,
        kind: FailureKind,
        reason: String,
    ) -> Result<RunOutcome, ConveyorError> {
        if kind == FailureKind::Transient && job.retry_count < job.max_retries {
            let delay = self.policy.backoff_delay(job.retry_count + 1);
            job.record_retry(code, reason.clone(), delay);
            self.persist(&mut job).await?;
            warn!(
                job_id = %job.id,
                stage,
                %code,
                retry_count = job.retry_count,
                max_retries = job.max_retries,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "transient stage failure, retry scheduled"
            );
            self.broadcaster
                .publish(ProgressEvent::stage_failed(job.id, stage, job.progress, code));
            return Ok(RunOutcome::Retry(delay));
        }

        let final_code = if kind == FailureKind::Transient {
            ErrorCode::RetriesExhausted
        } else {
            code
        };
        job.mark_failed(final_code, reason.clone());
        self.store.update(&job).await?;
        warn!(
            job_id = %job.id,
            stage,
            code = %final_code,
            retry_count = job.retry_count,
            reason = %reason,
            "job terminally failed"
        );
        self.broadcaster
            .publish(ProgressEvent::stage_failed(job.id, stage, job.progress, code));
        self.broadcaster
            .publish(ProgressEvent::job_failed(job.id, job.progress, final_code));
        Ok(RunOutcome::Failed)
    }
}
