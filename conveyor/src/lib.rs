//! # Conveyor
//!
//! An orchestration engine for long-running, multi-stage generation
//! jobs.
//!
//! Conveyor accepts job submissions, queues them durably, and drives
//! each one through a fixed sequence of stages with support for:
//!
//! - **Leased delivery**: exactly one worker drives a job at a time;
//!   crashed workers lose their lease and the job is redelivered
//! - **Per-stage checkpointing**: completed stages are never re-run,
//!   so a redelivered job resumes where the last execution stopped
//! - **Retry with backoff**: transient failures retry under a per-job
//!   budget with capped, jittered exponential delays
//! - **Shared rate limiting**: stages that call a bounded external
//!   dependency draw from one token bucket across all jobs
//! - **Progress fan-out**: per-job event streams for live observers,
//!   torn down when the job reaches a terminal state
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use conveyor::prelude::*;
//! use std::sync::Arc;
//!
//! let registry = StageRegistry::builder()
//!     .stage("fetch", Arc::new(FetchStage::new()))
//!     .stage("convert", Arc::new(ConvertStage::new()))
//!     .stage("render", Arc::new(RenderStage::new()))
//!     .build()?;
//!
//! let store = Arc::new(MemoryJobStore::new());
//! let queue = Arc::new(MemoryQueue::default());
//! let broadcaster = Arc::new(ProgressBroadcaster::new());
//! let runner = Arc::new(PipelineRunner::new(
//!     Arc::new(registry),
//!     store.clone(),
//!     broadcaster.clone(),
//!     Arc::new(RateLimiter::new(10, 2.0)),
//!     RetryPolicy::default(),
//! ));
//!
//! let pool = WorkerPool::new(WorkerPoolConfig::default(), queue.clone(), store.clone(), runner);
//! pool.start();
//!
//! let service = JobService::new(store, queue, broadcaster, 3);
//! let job_id = service.submit(JobSpec::new("owner-1", input)).await?;
//! let mut progress = service.subscribe(job_id).await?;
//! while let Some(event) = progress.next().await {
//!     println!("{}: {:.0}%", event.event_type, event.progress * 100.0);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

pub mod broadcast;
pub mod core;
pub mod errors;
pub mod limiter;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod service;
pub mod store;
pub mod utils;
pub mod worker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::broadcast::{ProgressBroadcaster, ProgressStream};
    pub use crate::core::{
        CheckpointValue, Job, JobId, JobSpec, JobStatus, ProgressEvent, ProgressEventType,
    };
    pub use crate::errors::{ConveyorError, ErrorCode};
    pub use crate::limiter::RateLimiter;
    pub use crate::pipeline::{
        FnStage, PipelineContext, PipelineRunner, RunOutcome, StageExecutor, StageFailure,
        StageRegistry,
    };
    pub use crate::queue::{JobQueue, Lease, MemoryQueue};
    pub use crate::retry::{FailureKind, RetryPolicy};
    pub use crate::service::JobService;
    pub use crate::store::{JobStore, MemoryJobStore};
    pub use crate::worker::{WorkerPool, WorkerPoolConfig};
}
