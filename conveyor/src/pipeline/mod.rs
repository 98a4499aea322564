//! Stage executors, the ordered stage registry and per-execution context.
//!
//! Stages are opaque units of work with a defined success/failure
//! contract: a stage executor is a function of the pipeline context that
//! returns either a success payload (checkpointed, never re-executed) or
//! a failure reason string (classified by the retry policy). Executors
//! must tolerate re-invocation whenever their prior attempt's output was
//! never checkpointed, since delivery is at-least-once.

mod runner;

pub use runner::{PipelineRunner, RunOutcome, DEFAULT_STAGE_TIMEOUT};

use crate::core::{CheckpointValue, Job, JobId};
use crate::errors::ConveyorError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A stage failure with a human-readable reason.
///
/// The reason string is what the retry policy's classifier matches on,
/// and what ends up in the job record's `error_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    /// Why the stage failed.
    pub reason: String,
}

impl StageFailure {
    /// Creates a failure with the given reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl From<String> for StageFailure {
    fn from(reason: String) -> Self {
        Self { reason }
    }
}

impl From<&str> for StageFailure {
    fn from(reason: &str) -> Self {
        Self::new(reason)
    }
}

/// Trait for pipeline stage executors.
///
/// Executors hold no mutable state across invocations. Side effects, if
/// any, must be idempotent on the stage's own output: once checkpointed
/// the stage is skipped on every redelivery, and until checkpointed it
/// may run again in full.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Executes the stage against the job's context.
    async fn execute(&self, ctx: &PipelineContext) -> Result<serde_json::Value, StageFailure>;

    /// Whether this stage calls the bounded external dependency and must
    /// pass the shared rate limiter first. Defaults to false.
    fn rate_limited(&self) -> bool {
        false
    }

    /// Token cost charged against the rate limiter per attempt.
    fn cost(&self) -> u32 {
        1
    }
}

/// A simple function-based stage executor.
pub struct FnStage<F>
where
    F: Fn(&PipelineContext) -> Result<serde_json::Value, StageFailure> + Send + Sync,
{
    func: F,
    rate_limited: bool,
}

impl<F> FnStage<F>
where
    F: Fn(&PipelineContext) -> Result<serde_json::Value, StageFailure> + Send + Sync,
{
    /// Creates a function-based stage.
    pub fn new(func: F) -> Self {
        Self {
            func,
            rate_limited: false,
        }
    }

    /// Marks the stage as calling the bounded dependency.
    #[must_use]
    pub fn rate_limited(mut self) -> Self {
        self.rate_limited = true;
        self
    }
}

#[async_trait]
impl<F> StageExecutor for FnStage<F>
where
    F: Fn(&PipelineContext) -> Result<serde_json::Value, StageFailure> + Send + Sync,
{
    async fn execute(&self, ctx: &PipelineContext) -> Result<serde_json::Value, StageFailure> {
        (self.func)(ctx)
    }

    fn rate_limited(&self) -> bool {
        self.rate_limited
    }
}

/// A named stage in the registered order.
#[derive(Clone)]
pub struct StageDescriptor {
    /// The stage name; key of its checkpoint.
    pub name: String,
    /// The executor invoked for this stage.
    pub executor: Arc<dyn StageExecutor>,
}

impl fmt::Debug for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDescriptor").field("name", &self.name).finish()
    }
}

/// The static, ordered stage sequence shared across all jobs.
///
/// Immutable after [`build`](StageRegistryBuilder::build); stages
/// execute strictly in registration order.
#[derive(Debug, Clone)]
pub struct StageRegistry {
    stages: Vec<StageDescriptor>,
}

impl StageRegistry {
    /// Starts building a registry.
    #[must_use]
    pub fn builder() -> StageRegistryBuilder {
        StageRegistryBuilder { stages: Vec::new() }
    }

    /// The registered stages in execution order.
    #[must_use]
    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    /// Number of registered stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if no stages are registered. Never true for a built
    /// registry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Returns true if `checkpoints`' key set is a prefix of the
    /// registered stage order.
    #[must_use]
    pub fn is_checkpoint_prefix(&self, checkpoints: &BTreeMap<String, CheckpointValue>) -> bool {
        let mut seen_gap = false;
        let mut matched = 0;
        for descriptor in &self.stages {
            if checkpoints.contains_key(&descriptor.name) {
                if seen_gap {
                    return false;
                }
                matched += 1;
            } else {
                seen_gap = true;
            }
        }
        matched == checkpoints.len()
    }
}

/// Builder for [`StageRegistry`].
#[derive(Default)]
pub struct StageRegistryBuilder {
    stages: Vec<StageDescriptor>,
}

impl StageRegistryBuilder {
    /// Appends a stage. Order of calls is execution order.
    #[must_use]
    pub fn stage(mut self, name: impl Into<String>, executor: Arc<dyn StageExecutor>) -> Self {
        self.stages.push(StageDescriptor {
            name: name.into(),
            executor,
        });
        self
    }

    /// Validates and builds the registry.
    ///
    /// # Errors
    ///
    /// [`ConveyorError::InvalidPipeline`] if the registry is empty or a
    /// stage name is registered twice.
    pub fn build(self) -> Result<StageRegistry, ConveyorError> {
        if self.stages.is_empty() {
            return Err(ConveyorError::InvalidPipeline(
                "at least one stage must be registered".to_string(),
            ));
        }

        for (index, descriptor) in self.stages.iter().enumerate() {
            if self.stages[..index].iter().any(|other| other.name == descriptor.name) {
                return Err(ConveyorError::InvalidPipeline(format!(
                    "duplicate stage name '{}'",
                    descriptor.name
                )));
            }
        }

        Ok(StageRegistry { stages: self.stages })
    }
}

/// Per-execution context handed to stage executors.
///
/// Exclusively owned by the single execution driving the job; the
/// queue's lease guarantees at most one active execution per job id, so
/// no part of the context is shared across concurrent executions.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// The job being executed.
    pub job_id: JobId,
    /// Owner reference, for stages that partition external resources.
    pub owner: String,
    /// The submission's source payload reference.
    pub input: serde_json::Value,
    /// The submission's options.
    pub options: serde_json::Value,
    /// Checkpoints of stages completed so far, for downstream stages
    /// that consume upstream outputs.
    pub checkpoints: BTreeMap<String, CheckpointValue>,
}

impl PipelineContext {
    /// Builds the context for one stage attempt from the job record.
    #[must_use]
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            owner: job.owner.clone(),
            input: job.input.clone(),
            options: job.options.clone(),
            checkpoints: job.checkpoints.clone(),
        }
    }

    /// Looks up an upstream stage's checkpoint.
    #[must_use]
    pub fn checkpoint(&self, stage: &str) -> Option<&CheckpointValue> {
        self.checkpoints.get(stage)
    }

    /// Decodes an upstream stage's checkpoint into its typed payload.
    ///
    /// # Errors
    ///
    /// Fails with a [`StageFailure`] naming the missing or malformed
    /// upstream stage, so the failure classifies as permanent.
    pub fn decode_checkpoint<T: DeserializeOwned>(&self, stage: &str) -> Result<T, StageFailure> {
        let checkpoint = self
            .checkpoint(stage)
            .ok_or_else(|| StageFailure::new(format!("checkpoint for stage '{stage}' not found")))?;
        checkpoint
            .decode()
            .map_err(|e| StageFailure::new(format!("invalid checkpoint payload for '{stage}': {e}")))
    }
}
