//! The embedding boundary: submission, status, cancellation and
//! progress subscription.

use crate::broadcast::{ProgressBroadcaster, ProgressStream};
use crate::core::{Job, JobId, JobSpec, JobStatus};
use crate::errors::ConveyorError;
use crate::queue::JobQueue;
use crate::store::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// The caller-facing surface of the engine.
///
/// The service owns no execution state; it writes records, enqueues
/// ids and hands out progress streams. Workers do the rest.
pub struct JobService {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    broadcaster: Arc<ProgressBroadcaster>,
    default_max_retries: u32,
}

impl JobService {
    /// Creates a service over the given store, queue and broadcaster.
    #[must_use]
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        broadcaster: Arc<ProgressBroadcaster>,
        default_max_retries: u32,
    ) -> Self {
        Self {
            store,
            queue,
            broadcaster,
            default_max_retries,
        }
    }

    /// Submits a new job and returns its id.
    ///
    /// The record write is durable before the id becomes visible to
    /// workers, so a dequeued id always has a record to load.
    ///
    /// # Errors
    ///
    /// [`ConveyorError::Transport`] if the store or queue is
    /// unavailable.
    pub async fn submit(&self, spec: JobSpec) -> Result<JobId, ConveyorError> {
        let job = Job::new(spec, self.default_max_retries);
        let id = job.id;
        self.store.insert(job).await?;
        self.queue.enqueue(id, Duration::ZERO).await?;
        info!(job_id = %id, "job submitted");
        Ok(id)
    }

    /// Reads the current record for a job.
    ///
    /// # Errors
    ///
    /// [`ConveyorError::JobNotFound`] for unknown ids.
    pub async fn get(&self, id: JobId) -> Result<Job, ConveyorError> {
        self.store
            .get(id)
            .await?
            .ok_or(ConveyorError::JobNotFound(id))
    }

    /// Lists an owner's jobs, optionally filtered by status, newest
    /// first.
    ///
    /// # Errors
    ///
    /// [`ConveyorError::Transport`] if the store is unavailable.
    pub async fn list(
        &self,
        owner: &str,
        status: Option<JobStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Job>, ConveyorError> {
        self.store.list(owner, status, offset, limit).await
    }

    /// Requests cancellation of a job and returns the updated record.
    ///
    /// The request is advisory: the executor observes the flag at its
    /// next stage boundary, so the job may still complete in-flight
    /// work (or even finish) before the cancellation lands.
    ///
    /// # Errors
    ///
    /// [`ConveyorError::JobNotFound`] for unknown ids,
    /// [`ConveyorError::JobAlreadyTerminal`] for finished jobs.
    pub async fn cancel(&self, id: JobId) -> Result<Job, ConveyorError> {
        let job = self.store.request_cancel(id).await?;
        info!(job_id = %id, "cancellation requested");
        Ok(job)
    }

    /// Subscribes to a job's progress events.
    ///
    /// Unknown and already-terminal jobs yield a stream that ends
    /// immediately; callers wanting the final state read the record via
    /// [`get`](Self::get).
    ///
    /// # Errors
    ///
    /// [`ConveyorError::Transport`] if the store lookup fails.
    pub async fn subscribe(&self, id: JobId) -> Result<ProgressStream, ConveyorError> {
        // Attach before the record check: a terminal event published
        // between the two is then received instead of missed, and a
        // topic created for an already-finished job is retired rather
        // than left to hang its subscriber.
        let stream = self.broadcaster.subscribe(id);
        match self.store.get(id).await? {
            Some(job) if !job.is_terminal() => Ok(stream),
            _ => Ok(self.broadcaster.retire(id, stream)),
        }
    }
}
