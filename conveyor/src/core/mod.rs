//! Core data model: job records, checkpoints and progress events.

mod checkpoint;
mod event;
mod job;

pub use checkpoint::CheckpointValue;
pub use event::{ProgressEvent, ProgressEventType};
pub use job::{Job, JobId, JobSpec, JobStatus};
