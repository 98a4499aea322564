//! The worker pool: N identical loops pulling leased jobs into the
//! pipeline runner.
//!
//! Workers are stateless between jobs. Each loop dequeues under a
//! lease, loads the record, hands it to the shared
//! [`PipelineRunner`](crate::pipeline::PipelineRunner) and settles the
//! lease from the outcome: ack on any terminal result, nack with the
//! backoff delay on a pending retry. Infrastructure failures mid-run
//! nack with a short fixed delay and never touch the job's retry
//! budget.

#[cfg(test)]
mod integration_tests;

use crate::pipeline::{PipelineRunner, RunOutcome};
use crate::queue::{JobQueue, Lease};
use crate::store::JobStore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Tuning knobs for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent worker loops.
    pub workers: usize,
    /// How long one dequeue poll waits before coming back empty.
    pub poll_timeout: Duration,
    /// Requeue delay after an infrastructure failure, distinct from the
    /// job-level retry backoff.
    pub transport_backoff: Duration,
    /// How often a worker extends its lease while a job is running.
    pub heartbeat_interval: Duration,
    /// How far each heartbeat pushes the lease deadline out.
    pub lease_extension: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_timeout: Duration::from_secs(1),
            transport_backoff: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(60),
            lease_extension: Duration::from_secs(300),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a config with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of worker loops.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Sets the dequeue poll timeout.
    #[must_use]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the requeue delay used after infrastructure failures.
    #[must_use]
    pub fn with_transport_backoff(mut self, backoff: Duration) -> Self {
        self.transport_backoff = backoff;
        self
    }

    /// Sets the lease heartbeat cadence.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// A pool of worker loops sharing one queue, store and runner.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn JobStore>,
    runner: Arc<PipelineRunner>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates a stopped pool.
    #[must_use]
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn JobStore>,
        runner: Arc<PipelineRunner>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            queue,
            store,
            runner,
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the worker loops. Calling `start` on a running pool is a
    /// no-op.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }

        info!(workers = self.config.workers, "starting worker pool");
        for id in 0..self.config.workers {
            let worker = Worker {
                id,
                config: self.config.clone(),
                queue: self.queue.clone(),
                store: self.store.clone(),
                runner: self.runner.clone(),
                shutdown: self.shutdown.subscribe(),
            };
            handles.push(tokio::spawn(worker.run()));
        }
    }

    /// Signals shutdown and waits for all workers to finish their
    /// current job. Jobs still queued stay queued.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "worker task panicked during shutdown");
            }
        }
        info!("worker pool stopped");
    }
}

struct Worker {
    id: usize,
    config: WorkerPoolConfig,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn JobStore>,
    runner: Arc<PipelineRunner>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        debug!(worker = self.id, "worker started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                dequeued = self.queue.dequeue(self.config.poll_timeout) => {
                    match dequeued {
                        Ok(Some(lease)) => self.process(lease).await,
                        Ok(None) => {}
                        Err(e) => {
                            warn!(worker = self.id, error = %e, "dequeue failed, backing off");
                            tokio::time::sleep(self.config.transport_backoff).await;
                        }
                    }
                }
            }
        }
        debug!(worker = self.id, "worker stopped");
    }

    async fn process(&self, mut lease: Lease) {
        let job = match self.store.get(lease.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                // A lease without a record means the submission's store
                // write was lost; nothing can run, so drop the entry.
                warn!(worker = self.id, job_id = %lease.job_id, "leased job has no record, dropping");
                self.ack(&lease).await;
                return;
            }
            Err(e) => {
                warn!(worker = self.id, job_id = %lease.job_id, error = %e, "store read failed, returning job to queue");
                self.nack(&lease, self.config.transport_backoff).await;
                return;
            }
        };

        let run = self.runner.run(job);
        tokio::pin!(run);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;

        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                _ = heartbeat.tick() => {
                    match self.queue.extend(&lease, self.config.lease_extension).await {
                        Ok(renewed) => lease = renewed,
                        Err(e) => {
                            debug!(worker = self.id, job_id = %lease.job_id, error = %e, "lease extension failed");
                        }
                    }
                }
            }
        };

        match outcome {
            Ok(RunOutcome::Retry(delay)) => self.nack(&lease, delay).await,
            Ok(_) => self.ack(&lease).await,
            Err(e) => {
                warn!(worker = self.id, job_id = %lease.job_id, error = %e, "infrastructure failure mid-run, returning job to queue");
                self.nack(&lease, self.config.transport_backoff).await;
            }
        }
    }

    /// Acks the lease; a stale lease means the job was already handed to
    /// another worker, which is safe to ignore.
    async fn ack(&self, lease: &Lease) {
        if let Err(e) = self.queue.ack(lease).await {
            debug!(worker = self.id, job_id = %lease.job_id, error = %e, "ack skipped");
        }
    }

    async fn nack(&self, lease: &Lease, delay: Duration) {
        if let Err(e) = self.queue.nack(lease, delay).await {
            debug!(worker = self.id, job_id = %lease.job_id, error = %e, "nack skipped");
        }
    }
}
