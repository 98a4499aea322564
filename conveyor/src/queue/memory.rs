//! In-process job queue with delayed visibility and lease expiry.

use super::{JobQueue, Lease};
use crate::core::JobId;
use crate::errors::ConveyorError;
use crate::utils::generate_uuid;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Default lease visibility timeout.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DelayedEntry {
    due: Instant,
    job_id: JobId,
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).then_with(|| self.job_id.cmp(&other.job_id))
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy)]
struct InflightLease {
    token: Uuid,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<JobId>,
    delayed: BinaryHeap<Reverse<DelayedEntry>>,
    inflight: HashMap<JobId, InflightLease>,
}

impl QueueState {
    fn tracks(&self, job_id: JobId) -> bool {
        self.ready.contains(&job_id)
            || self.inflight.contains_key(&job_id)
            || self.delayed.iter().any(|Reverse(entry)| entry.job_id == job_id)
    }

    /// Moves due delayed entries and expired leases into the ready list.
    fn promote(&mut self, now: Instant) {
        while let Some(Reverse(entry)) = self.delayed.peek().copied() {
            if entry.due > now {
                break;
            }
            self.delayed.pop();
            self.ready.push_back(entry.job_id);
        }

        let expired: Vec<JobId> = self
            .inflight
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for job_id in expired {
            self.inflight.remove(&job_id);
            self.ready.push_back(job_id);
            debug!(%job_id, "lease expired, job returned to queue");
        }
    }

    /// The next instant at which a delayed entry or lease needs attention.
    fn next_wake(&self) -> Option<Instant> {
        let next_due = self.delayed.peek().map(|Reverse(entry)| entry.due);
        let next_expiry = self.inflight.values().map(|lease| lease.deadline).min();
        match (next_due, next_expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}

/// An in-process [`JobQueue`] with delayed visibility and lease-timeout
/// redelivery.
///
/// Exclusivity holds by construction: a job id lives in exactly one of
/// the ready list, the delayed heap or the in-flight table, and only
/// ready jobs can be dequeued.
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    lease_timeout: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_LEASE_TIMEOUT)
    }
}

impl MemoryQueue {
    /// Creates a queue with the given lease visibility timeout.
    #[must_use]
    pub fn new(lease_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            lease_timeout,
        }
    }

    /// Number of jobs currently visible to workers.
    #[must_use]
    pub fn ready_len(&self) -> usize {
        let mut state = self.state.lock();
        state.promote(Instant::now());
        state.ready.len()
    }

    /// Number of jobs currently leased out.
    #[must_use]
    pub fn inflight_len(&self) -> usize {
        self.state.lock().inflight.len()
    }

    fn take_lease(&self, state: &mut QueueState) -> Option<Lease> {
        let job_id = state.ready.pop_front()?;
        let lease = InflightLease {
            token: generate_uuid(),
            deadline: Instant::now() + self.lease_timeout,
        };
        state.inflight.insert(job_id, lease);
        Some(Lease {
            job_id,
            token: lease.token,
            deadline: lease.deadline,
        })
    }

    /// Validates the lease token and removes the in-flight entry.
    fn release(&self, lease: &Lease) -> Result<(), ConveyorError> {
        let mut state = self.state.lock();
        match state.inflight.get(&lease.job_id) {
            Some(held) if held.token == lease.token => {
                state.inflight.remove(&lease.job_id);
                Ok(())
            }
            _ => Err(ConveyorError::StaleLease { job_id: lease.job_id }),
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job_id: JobId, delay: Duration) -> Result<(), ConveyorError> {
        {
            let mut state = self.state.lock();
            if state.tracks(job_id) {
                debug!(%job_id, "enqueue ignored, job already tracked");
                return Ok(());
            }
            if delay.is_zero() {
                state.ready.push_back(job_id);
            } else {
                state.delayed.push(Reverse(DelayedEntry {
                    due: Instant::now() + delay,
                    job_id,
                }));
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, poll_timeout: Duration) -> Result<Option<Lease>, ConveyorError> {
        let poll_deadline = Instant::now() + poll_timeout;

        loop {
            let (lease, wake_at) = {
                let mut state = self.state.lock();
                state.promote(Instant::now());
                match self.take_lease(&mut state) {
                    Some(lease) => (Some(lease), None),
                    None => (None, state.next_wake()),
                }
            };

            if let Some(lease) = lease {
                return Ok(Some(lease));
            }

            let now = Instant::now();
            if now >= poll_deadline {
                return Ok(None);
            }

            let sleep_until = wake_at.map_or(poll_deadline, |w| w.min(poll_deadline));
            tokio::select! {
                () = self.notify.notified() => {}
                () = tokio::time::sleep_until(sleep_until) => {}
            }
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<(), ConveyorError> {
        self.release(lease)
    }

    async fn nack(&self, lease: &Lease, delay: Duration) -> Result<(), ConveyorError> {
        self.release(lease)?;
        {
            let mut state = self.state.lock();
            if delay.is_zero() {
                state.ready.push_back(lease.job_id);
            } else {
                state.delayed.push(Reverse(DelayedEntry {
                    due: Instant::now() + delay,
                    job_id: lease.job_id,
                }));
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn extend(&self, lease: &Lease, extra: Duration) -> Result<Lease, ConveyorError> {
        let mut state = self.state.lock();
        match state.inflight.get_mut(&lease.job_id) {
            Some(held) if held.token == lease.token => {
                held.deadline = Instant::now() + extra;
                Ok(Lease {
                    job_id: lease.job_id,
                    token: lease.token,
                    deadline: held.deadline,
                })
            }
            _ => Err(ConveyorError::StaleLease { job_id: lease.job_id }),
        }
    }
}
