//! The job queue boundary: ordered delivery with leases.
//!
//! The queue is the sole arbiter of execution ownership: `dequeue` hands
//! a job reference to exactly one worker under a time-bounded exclusive
//! lease. Two workers never hold a live lease for the same job id; a
//! lease that is neither acked nor extended before its deadline makes
//! the job visible again for redelivery.

mod memory;

pub use memory::{MemoryQueue, DEFAULT_LEASE_TIMEOUT};

use crate::core::JobId;
use crate::errors::ConveyorError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// A time-bounded, exclusive claim on a queued job.
#[derive(Debug, Clone)]
pub struct Lease {
    /// The leased job.
    pub job_id: JobId,
    /// Token proving ownership; ack/nack/extend with a token that is no
    /// longer live fail with [`ConveyorError::StaleLease`].
    pub token: Uuid,
    /// When the lease expires and the job becomes redeliverable.
    pub deadline: Instant,
}

/// Ordered delivery of job references to workers with visibility/ack
/// semantics.
///
/// Implementations report backing-transport failures as
/// [`ConveyorError::Transport`]; callers apply their own backoff before
/// retrying the queue operation itself, distinct from job-level retry.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Makes the job visible to workers after `delay`. Enqueueing an id
    /// the queue already tracks (queued, delayed or leased) is a no-op.
    async fn enqueue(&self, job_id: JobId, delay: Duration) -> Result<(), ConveyorError>;

    /// Hands one job to the caller under a fresh lease, or `None` if no
    /// job became visible within `poll_timeout`.
    async fn dequeue(&self, poll_timeout: Duration) -> Result<Option<Lease>, ConveyorError>;

    /// Removes the job from the queue permanently.
    async fn ack(&self, lease: &Lease) -> Result<(), ConveyorError>;

    /// Returns the job to the queue, visible again after `delay`.
    async fn nack(&self, lease: &Lease, delay: Duration) -> Result<(), ConveyorError>;

    /// Pushes the lease deadline out to now + `extra`, for stages that
    /// legitimately outlive the default visibility timeout.
    async fn extend(&self, lease: &Lease, extra: Duration) -> Result<Lease, ConveyorError>;
}
