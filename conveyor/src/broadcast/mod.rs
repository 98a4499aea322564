//! Per-job progress fan-out.
//!
//! Each job gets its own broadcast topic, created lazily on the first
//! subscribe or publish that needs it and torn down after the terminal
//! event. Publishing never blocks the pipeline: events go to whoever is
//! subscribed at that moment, with no replay, and a topic with no
//! subscribers drops events on the floor.

use crate::core::{JobId, ProgressEvent};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Buffered events per subscriber before the slowest one starts losing
/// the oldest.
pub const DEFAULT_TOPIC_CAPACITY: usize = 256;

/// Routes progress events to per-job subscriber topics.
#[derive(Debug)]
pub struct ProgressBroadcaster {
    topics: DashMap<JobId, broadcast::Sender<ProgressEvent>>,
    capacity: usize,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBroadcaster {
    /// Creates a broadcaster with the default per-topic buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Creates a broadcaster with a custom per-topic buffer size.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Subscribes to a job's progress events.
    ///
    /// Only events published after this call are delivered. The caller is
    /// responsible for checking the job record first; subscribing to an
    /// id with no live topic simply creates one, and the stream ends when
    /// the job publishes its terminal event.
    #[must_use]
    pub fn subscribe(&self, job_id: JobId) -> ProgressStream {
        let receiver = self
            .topics
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        ProgressStream {
            inner: Some(receiver),
        }
    }

    /// Publishes an event to the job's topic, if one exists.
    ///
    /// A terminal event tears the topic down afterwards; subscribers
    /// still drain events already buffered, then their streams end.
    pub fn publish(&self, event: ProgressEvent) {
        let job_id = event.job_id;
        let terminal = event.event_type.is_terminal();

        if let Some(sender) = self.topics.get(&job_id) {
            // Send only fails when no subscriber exists, which is fine.
            let _ = sender.send(event);
        }

        if terminal {
            self.topics.remove(&job_id);
            debug!(job_id = %job_id, "progress topic closed after terminal event");
        }
    }

    /// Drops `stream` and removes the job's topic if no other
    /// subscriber holds it, returning a stream that is already over.
    ///
    /// For subscriptions that attached after the job already finished:
    /// the topic such a subscribe lazily re-created would never be
    /// published to or torn down. A topic with other live subscribers
    /// is left alone; their terminal event is still on its way.
    #[must_use]
    pub fn retire(&self, job_id: JobId, stream: ProgressStream) -> ProgressStream {
        drop(stream);
        self.topics
            .remove_if(&job_id, |_, sender| sender.receiver_count() == 0);
        ProgressStream::terminated()
    }

    /// Number of live topics. Topics outlive their job only until the
    /// terminal event is published.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

/// A subscriber's view of one job's progress events.
///
/// Yields events until a terminal event arrives or the topic closes,
/// then returns `None` forever.
#[derive(Debug)]
pub struct ProgressStream {
    inner: Option<broadcast::Receiver<ProgressEvent>>,
}

impl ProgressStream {
    /// A stream that is already over, for subscriptions to unknown or
    /// already-terminal jobs.
    #[must_use]
    pub fn terminated() -> Self {
        Self { inner: None }
    }

    /// Waits for the next event.
    ///
    /// A subscriber that falls behind the topic buffer skips the lost
    /// events and keeps going from the oldest retained one.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        loop {
            let received = match self.inner.as_mut() {
                Some(receiver) => receiver.recv().await,
                None => return None,
            };

            match received {
                Ok(event) => {
                    if event.event_type.is_terminal() {
                        self.inner = None;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "progress subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.inner = None;
                    return None;
                }
            }
        }
    }
}
