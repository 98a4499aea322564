//! The durable job record store boundary.
//!
//! The engine treats storage as an abstract keyed record store. All
//! record mutations after submission go through the single leased
//! executor, so the store needs no cross-job locking; the only field
//! written from outside the lease is the advisory cancellation flag,
//! which [`JobStore::request_cancel`] flips durably.

mod memory;

pub use memory::MemoryJobStore;

use crate::core::{Job, JobId, JobStatus};
use crate::errors::ConveyorError;
use async_trait::async_trait;

/// Durable keyed storage for job records.
///
/// Implementations must make `insert` durable before returning: the
/// submission boundary enqueues a job only after its record write has
/// been acknowledged.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new record. Returns a transport error if the backing
    /// store is unavailable.
    async fn insert(&self, job: Job) -> Result<(), ConveyorError>;

    /// Reads the current record for a job id.
    async fn get(&self, id: JobId) -> Result<Option<Job>, ConveyorError>;

    /// Writes the full record. Called only by the leased executor.
    async fn update(&self, job: &Job) -> Result<(), ConveyorError>;

    /// Durably sets the cancellation flag and returns the updated record.
    ///
    /// # Errors
    ///
    /// [`ConveyorError::JobNotFound`] if no record exists,
    /// [`ConveyorError::JobAlreadyTerminal`] if the job already finished.
    async fn request_cancel(&self, id: JobId) -> Result<Job, ConveyorError>;

    /// Lists records for an owner, optionally filtered by status, with
    /// offset/limit paging. Ordered by creation time descending.
    async fn list(
        &self,
        owner: &str,
        status: Option<JobStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Job>, ConveyorError>;
}
