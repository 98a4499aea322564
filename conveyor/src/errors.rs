//! Error types for the conveyor engine.
//!
//! Two layers of errors exist and must not be conflated:
//!
//! - [`ConveyorError`] covers infrastructure and caller errors: the queue
//!   or store being unreachable, stale leases, lookups against unknown or
//!   finished jobs. These propagate as `Err` and are retried (or reported)
//!   by the worker pool's own logic, never charged against a job's retry
//!   budget.
//! - [`ErrorCode`] is the closed vocabulary recorded on a job record when
//!   a stage attempt fails. Stage failures never leave the pipeline runner
//!   as `Err`; they become record state plus progress events.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Closed vocabulary of failure codes recorded on job records.
///
/// A terminally `FAILED` job always carries one of these; a `CANCELLED`
/// job never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// A stage attempt exceeded its wall-clock budget. Classified transient.
    StageTimeout,
    /// A stage failed in a way expected to succeed on retry (network,
    /// rate limits, connection resets). Classified transient.
    StageTransient,
    /// A stage failed on malformed or invalid input/output. Classified
    /// permanent; does not consume retries.
    StageValidation,
    /// A transient failure persisted past `max_retries`.
    RetriesExhausted,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StageTimeout => write!(f, "stage_timeout"),
            Self::StageTransient => write!(f, "stage_transient"),
            Self::StageValidation => write!(f, "stage_validation"),
            Self::RetriesExhausted => write!(f, "retries_exhausted"),
        }
    }
}

/// The main error type for conveyor operations.
#[derive(Debug, Error)]
pub enum ConveyorError {
    /// The queue or store backing transport is unavailable.
    #[error("transport error: {0}")]
    Transport(String),

    /// An ack/nack/extend was attempted with a lease token that is no
    /// longer live (the lease expired and the job was redelivered).
    #[error("stale lease for job {job_id}")]
    StaleLease {
        /// The job the lease referred to.
        job_id: Uuid,
    },

    /// No job record exists for the given id.
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// The operation targets a job already in a terminal state.
    #[error("job {0} is already terminal")]
    JobAlreadyTerminal(Uuid),

    /// A pipeline was registered with an invalid stage set.
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConveyorError {
    /// Creates a transport error from any displayable cause.
    #[must_use]
    pub fn transport(cause: impl fmt::Display) -> Self {
        Self::Transport(cause.to_string())
    }

    /// Returns true if the error is a transport-layer failure that the
    /// caller should retry with its own backoff.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::StageTimeout.to_string(), "stage_timeout");
        assert_eq!(ErrorCode::RetriesExhausted.to_string(), "retries_exhausted");
    }

    #[test]
    fn test_error_code_serialize_snake_case() {
        let json = serde_json::to_string(&ErrorCode::StageValidation).unwrap();
        assert_eq!(json, r#""stage_validation""#);

        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorCode::StageValidation);
    }

    #[test]
    fn test_transport_constructor() {
        let err = ConveyorError::transport("connection refused");
        assert!(err.is_transport());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_stale_lease_display() {
        let id = Uuid::new_v4();
        let err = ConveyorError::StaleLease { job_id: id };
        assert!(err.to_string().contains(&id.to_string()));
        assert!(!err.is_transport());
    }
}
