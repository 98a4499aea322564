//! Progress events published on stage transitions.

use super::JobId;
use crate::errors::ErrorCode;
use crate::utils::Timestamp;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressEventType {
    /// A stage attempt has begun.
    StageStarted,
    /// A stage completed and its checkpoint was recorded.
    StageCompleted,
    /// A stage attempt failed (a retry may still be pending).
    StageFailed,
    /// All stages completed; the job is terminally COMPLETED.
    JobCompleted,
    /// The job is terminally FAILED.
    JobFailed,
    /// The job is terminally CANCELLED.
    JobCancelled,
}

impl ProgressEventType {
    /// Returns true if the event marks the job reaching a terminal state.
    ///
    /// Subscriber streams end after observing a terminal event.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::JobCompleted | Self::JobFailed | Self::JobCancelled)
    }
}

impl fmt::Display for ProgressEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StageStarted => write!(f, "stage-started"),
            Self::StageCompleted => write!(f, "stage-completed"),
            Self::StageFailed => write!(f, "stage-failed"),
            Self::JobCompleted => write!(f, "job-completed"),
            Self::JobFailed => write!(f, "job-failed"),
            Self::JobCancelled => write!(f, "job-cancelled"),
        }
    }
}

/// An immutable progress message published to subscribers of a job.
///
/// Delivery is at-most-once per subscriber instance with no replay: a
/// subscriber that attaches after an event was published never sees it.
/// Callers needing the latest known state read the job record first, then
/// subscribe for subsequent events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// The job this event belongs to.
    pub job_id: JobId,

    /// The event kind.
    pub event_type: ProgressEventType,

    /// The stage involved, for stage-level events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_name: Option<String>,

    /// Progress fraction in `[0, 1]` at the time of the event.
    pub progress: f64,

    /// When the event was published (UTC).
    pub timestamp: Timestamp,

    /// Failure code, for stage-failed and job-failed events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl ProgressEvent {
    fn new(job_id: JobId, event_type: ProgressEventType, progress: f64) -> Self {
        Self {
            job_id,
            event_type,
            stage_name: None,
            progress,
            timestamp: Utc::now(),
            error_code: None,
        }
    }

    /// Creates a stage-started event.
    #[must_use]
    pub fn stage_started(job_id: JobId, stage: &str, progress: f64) -> Self {
        let mut event = Self::new(job_id, ProgressEventType::StageStarted, progress);
        event.stage_name = Some(stage.to_string());
        event
    }

    /// Creates a stage-completed event.
    #[must_use]
    pub fn stage_completed(job_id: JobId, stage: &str, progress: f64) -> Self {
        let mut event = Self::new(job_id, ProgressEventType::StageCompleted, progress);
        event.stage_name = Some(stage.to_string());
        event
    }

    /// Creates a stage-failed event.
    #[must_use]
    pub fn stage_failed(job_id: JobId, stage: &str, progress: f64, code: ErrorCode) -> Self {
        let mut event = Self::new(job_id, ProgressEventType::StageFailed, progress);
        event.stage_name = Some(stage.to_string());
        event.error_code = Some(code);
        event
    }

    /// Creates a job-completed event. Progress is forced to `1.0`.
    #[must_use]
    pub fn job_completed(job_id: JobId) -> Self {
        Self::new(job_id, ProgressEventType::JobCompleted, 1.0)
    }

    /// Creates a job-failed event.
    #[must_use]
    pub fn job_failed(job_id: JobId, progress: f64, code: ErrorCode) -> Self {
        let mut event = Self::new(job_id, ProgressEventType::JobFailed, progress);
        event.error_code = Some(code);
        event
    }

    /// Creates a job-cancelled event. Cancelled jobs carry no error code.
    #[must_use]
    pub fn job_cancelled(job_id: JobId, progress: f64) -> Self {
        Self::new(job_id, ProgressEventType::JobCancelled, progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::generate_uuid;

    #[test]
    fn test_terminal_event_types() {
        assert!(ProgressEventType::JobCompleted.is_terminal());
        assert!(ProgressEventType::JobFailed.is_terminal());
        assert!(ProgressEventType::JobCancelled.is_terminal());
        assert!(!ProgressEventType::StageStarted.is_terminal());
        assert!(!ProgressEventType::StageFailed.is_terminal());
    }

    #[test]
    fn test_event_type_serializes_kebab_case() {
        let json = serde_json::to_string(&ProgressEventType::StageCompleted).unwrap();
        assert_eq!(json, r#""stage-completed""#);
    }

    #[test]
    fn test_stage_failed_carries_code() {
        let event = ProgressEvent::stage_failed(generate_uuid(), "render", 0.5, ErrorCode::StageTransient);
        assert_eq!(event.stage_name.as_deref(), Some("render"));
        assert_eq!(event.error_code, Some(ErrorCode::StageTransient));
    }

    #[test]
    fn test_job_completed_forces_full_progress() {
        let event = ProgressEvent::job_completed(generate_uuid());
        assert!((event.progress - 1.0).abs() < f64::EPSILON);
        assert!(event.stage_name.is_none());
        assert!(event.error_code.is_none());
    }

    #[test]
    fn test_job_cancelled_has_no_error_code() {
        let event = ProgressEvent::job_cancelled(generate_uuid(), 0.25);
        assert!(event.error_code.is_none());
    }
}
