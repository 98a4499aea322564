//! The job record and its lifecycle transitions.

use super::CheckpointValue;
use crate::errors::ErrorCode;
use crate::utils::{generate_uuid, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Identifier for a job record.
pub type JobId = Uuid;

/// Top-level status of a job.
///
/// Transitions are monotonic: `Pending → Processing → {Completed |
/// Failed | Cancelled}`. The current stage index within `Processing` is
/// not a distinct status; it is observable only through the checkpoint
/// map and the latest progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted but not yet picked up by a worker.
    Pending,
    /// A worker is driving the job through its stages (or a retry is
    /// pending requeue).
    Processing,
    /// All stages completed.
    Completed,
    /// Terminally failed; `error_code` is always set.
    Failed,
    /// Cancelled by an external request; never carries an error code.
    Cancelled,
}

impl JobStatus {
    /// Returns true if the status never transitions further.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A submission request for a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Owner reference (opaque to the engine).
    pub owner: String,

    /// The source payload reference handed to stage executors.
    pub input: serde_json::Value,

    /// Requested options handed to stage executors.
    #[serde(default)]
    pub options: serde_json::Value,

    /// Per-job override of the retry budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl JobSpec {
    /// Creates a spec with the given owner and input payload.
    #[must_use]
    pub fn new(owner: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            owner: owner.into(),
            input,
            options: serde_json::Value::Object(serde_json::Map::new()),
            max_retries: None,
        }
    }

    /// Sets stage options.
    #[must_use]
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    /// Overrides the retry budget for this job.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A durable job record.
///
/// Invariants maintained by the engine:
/// - the checkpoint map only grows, and its key set is always a prefix of
///   the registered stage order;
/// - `retry_count <= max_retries` while the job is non-terminal;
/// - `completed_at` and `error_code` are mutually exclusive.
///
/// All mutations after submission go through the single leased executor,
/// except `cancel_requested`, which the cancellation boundary flips
/// durably and the executor observes at stage boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique id.
    pub id: JobId,

    /// Owner reference.
    pub owner: String,

    /// Current status.
    pub status: JobStatus,

    /// The source payload reference.
    pub input: serde_json::Value,

    /// Requested options.
    pub options: serde_json::Value,

    /// Completed stage outputs keyed by stage name.
    #[serde(default)]
    pub checkpoints: BTreeMap<String, CheckpointValue>,

    /// Progress fraction in `[0, 1]`.
    pub progress: f64,

    /// Retries consumed so far.
    pub retry_count: u32,

    /// Retry budget for transient failures.
    pub max_retries: u32,

    /// When the next retry becomes visible, while one is pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<Timestamp>,

    /// Latest failure code, set before any retry or terminal transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,

    /// Human-readable failure reason accompanying `error_code`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Durable advisory cancellation flag.
    #[serde(default)]
    pub cancel_requested: bool,

    /// Submission time.
    pub created_at: Timestamp,

    /// First dequeue time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,

    /// Terminal completion or failure time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,

    /// Cancellation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<Timestamp>,
}

impl Job {
    /// Creates a fresh `Pending` record from a submission spec.
    #[must_use]
    pub fn new(spec: JobSpec, default_max_retries: u32) -> Self {
        Self {
            id: generate_uuid(),
            owner: spec.owner,
            status: JobStatus::Pending,
            input: spec.input,
            options: spec.options,
            checkpoints: BTreeMap::new(),
            progress: 0.0,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            next_retry_at: None,
            error_code: None,
            error_message: None,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancelled_at: None,
        }
    }

    /// Returns true if the job is in a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Marks the job as picked up by a worker. Records `started_at` only
    /// on the first transition; redeliveries keep the original value.
    pub fn mark_processing(&mut self) {
        self.status = JobStatus::Processing;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Records a completed stage's checkpoint and recomputes progress as
    /// `completed_stage_count / total_stage_count`.
    pub fn record_checkpoint(&mut self, value: CheckpointValue, total_stages: usize) {
        self.checkpoints.insert(value.stage.clone(), value);
        if total_stages > 0 {
            self.progress = self.checkpoints.len() as f64 / total_stages as f64;
        }
    }

    /// Records a transient stage failure that will be retried.
    ///
    /// The failure reason is recorded before the retry so the latest
    /// failure stays visible while the requeue delay elapses.
    pub fn record_retry(&mut self, code: ErrorCode, message: impl Into<String>, delay: Duration) {
        debug_assert!(self.retry_count < self.max_retries);
        self.retry_count += 1;
        self.error_code = Some(code);
        self.error_message = Some(message.into());
        self.next_retry_at = Utc::now().checked_add_signed(
            chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
        );
    }

    /// Marks the job terminally completed.
    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.progress = 1.0;
        self.error_code = None;
        self.error_message = None;
        self.next_retry_at = None;
        self.completed_at = Some(Utc::now());
    }

    /// Marks the job terminally failed with a code and message.
    pub fn mark_failed(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error_code = Some(code);
        self.error_message = Some(message.into());
        self.next_retry_at = None;
        self.completed_at = Some(Utc::now());
    }

    /// Marks the job terminally cancelled. Clears any failure fields: a
    /// cancelled job never carries an error code.
    pub fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.error_code = None;
        self.error_message = None;
        self.next_retry_at = None;
        self.cancelled_at = Some(Utc::now());
    }
}
