//! In-memory job store for tests and single-process embedders.

use super::JobStore;
use crate::core::{Job, JobId, JobStatus};
use crate::errors::ConveyorError;
use async_trait::async_trait;
use dashmap::DashMap;

/// A [`JobStore`] backed by a concurrent in-process map.
///
/// "Durable" here means the write is visible to every other handle of
/// the same store before the call returns, which is what the engine's
/// contracts rely on in tests.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: DashMap<JobId, Job>,
}

impl MemoryJobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<(), ConveyorError> {
        self.records.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, ConveyorError> {
        Ok(self.records.get(&id).map(|entry| entry.clone()))
    }

    async fn update(&self, job: &Job) -> Result<(), ConveyorError> {
        self.records.insert(job.id, job.clone());
        Ok(())
    }

    async fn request_cancel(&self, id: JobId) -> Result<Job, ConveyorError> {
        let mut entry = self
            .records
            .get_mut(&id)
            .ok_or(ConveyorError::JobNotFound(id))?;

        if entry.is_terminal() {
            return Err(ConveyorError::JobAlreadyTerminal(id));
        }

        entry.cancel_requested = true;
        Ok(entry.clone())
    }

    async fn list(
        &self,
        owner: &str,
        status: Option<JobStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Job>, ConveyorError> {
        let mut jobs: Vec<Job> = self
            .records
            .iter()
            .filter(|entry| entry.owner == owner)
            .filter(|entry| status.map_or(true, |s| entry.status == s))
            .map(|entry| entry.clone())
            .collect();

        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JobSpec;
    use pretty_assertions::assert_eq;

    fn job_for(owner: &str) -> Job {
        Job::new(JobSpec::new(owner, serde_json::json!({})), 3)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryJobStore::new();
        let job = job_for("alice");
        let id = job.id;

        store.insert(job).await.unwrap();

        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.owner, "alice");
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = MemoryJobStore::new();
        assert!(store.get(crate::utils::generate_uuid()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_replaces_record() {
        let store = MemoryJobStore::new();
        let mut job = job_for("alice");
        let id = job.id;
        store.insert(job.clone()).await.unwrap();

        job.mark_processing();
        store.update(&job).await.unwrap();

        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_request_cancel_sets_flag() {
        let store = MemoryJobStore::new();
        let job = job_for("alice");
        let id = job.id;
        store.insert(job).await.unwrap();

        let cancelled = store.request_cancel(id).await.unwrap();
        assert!(cancelled.cancel_requested);

        let fetched = store.get(id).await.unwrap().unwrap();
        assert!(fetched.cancel_requested);
    }

    #[tokio::test]
    async fn test_request_cancel_unknown_job() {
        let store = MemoryJobStore::new();
        let result = store.request_cancel(crate::utils::generate_uuid()).await;
        assert!(matches!(result, Err(ConveyorError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_request_cancel_terminal_job() {
        let store = MemoryJobStore::new();
        let mut job = job_for("alice");
        let id = job.id;
        job.mark_completed();
        store.insert(job).await.unwrap();

        let result = store.request_cancel(id).await;
        assert!(matches!(result, Err(ConveyorError::JobAlreadyTerminal(_))));
    }

    #[tokio::test]
    async fn test_list_filters_by_owner_and_status() {
        let store = MemoryJobStore::new();
        let mut done = job_for("alice");
        done.mark_completed();
        store.insert(done).await.unwrap();
        store.insert(job_for("alice")).await.unwrap();
        store.insert(job_for("bob")).await.unwrap();

        let all = store.list("alice", None, 0, 10).await.unwrap();
        assert_eq!(all.len(), 2);

        let pending = store
            .list("alice", Some(JobStatus::Pending), 0, 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);

        let paged = store.list("alice", None, 1, 10).await.unwrap();
        assert_eq!(paged.len(), 1);
    }
}
