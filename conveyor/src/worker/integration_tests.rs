//! Full-stack scenarios: service in front, workers behind, everything
//! wired through the in-process queue, store and broadcaster.

use super::{WorkerPool, WorkerPoolConfig};
use crate::broadcast::{ProgressBroadcaster, ProgressStream};
use crate::core::{JobSpec, JobStatus, ProgressEvent, ProgressEventType};
use crate::errors::ErrorCode;
use crate::limiter::RateLimiter;
use crate::pipeline::{
    FnStage, PipelineContext, PipelineRunner, StageExecutor, StageFailure, StageRegistry,
};
use crate::queue::{JobQueue, MemoryQueue};
use crate::retry::RetryPolicy;
use crate::service::JobService;
use crate::store::{JobStore, MemoryJobStore};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Stack {
    service: JobService,
    pool: WorkerPool,
    store: Arc<MemoryJobStore>,
    queue: Arc<MemoryQueue>,
}

fn stack(registry: StageRegistry) -> Stack {
    let store = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(MemoryQueue::default());
    let broadcaster = Arc::new(ProgressBroadcaster::new());
    let runner = Arc::new(PipelineRunner::new(
        Arc::new(registry),
        store.clone(),
        broadcaster.clone(),
        Arc::new(RateLimiter::new(100, 100.0)),
        RetryPolicy::new().with_base_delay_ms(10).with_jitter(false),
    ));
    let config = WorkerPoolConfig::new()
        .with_workers(2)
        .with_poll_timeout(Duration::from_millis(20));
    let pool = WorkerPool::new(config, queue.clone(), store.clone(), runner);
    let service = JobService::new(store.clone(), queue.clone(), broadcaster, 3);
    Stack {
        service,
        pool,
        store,
        queue,
    }
}

fn ok_stage(tag: &'static str) -> Arc<dyn StageExecutor> {
    Arc::new(FnStage::new(move |_ctx| Ok(serde_json::json!({"stage": tag}))))
}

/// Collects events until the terminal one arrives.
async fn drain(stream: &mut ProgressStream) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    loop {
        let next = tokio::time::timeout(Duration::from_secs(30), stream.next())
            .await
            .expect("timed out waiting for progress event");
        match next {
            Some(event) => {
                let terminal = event.event_type.is_terminal();
                events.push(event);
                if terminal {
                    break;
                }
            }
            None => break,
        }
    }
    events
}

fn trace(events: &[ProgressEvent]) -> Vec<(ProgressEventType, Option<&str>)> {
    events
        .iter()
        .map(|e| (e.event_type, e.stage_name.as_deref()))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_retries_then_completes() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let registry = StageRegistry::builder()
        .stage("fetch", ok_stage("fetch"))
        .stage(
            "convert",
            Arc::new(FnStage::new(move |_ctx| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StageFailure::new("connection reset by peer"))
                } else {
                    Ok(serde_json::json!({"pages": 3}))
                }
            })),
        )
        .stage("render", ok_stage("render"))
        .build()
        .unwrap();
    let stack = stack(registry);

    let id = stack
        .service
        .submit(JobSpec::new("owner-1", serde_json::json!({"doc": "in.md"})))
        .await
        .unwrap();
    let mut stream = stack.service.subscribe(id).await.unwrap();
    stack.pool.start();

    let events = drain(&mut stream).await;
    stack.pool.stop().await;

    use ProgressEventType::{JobCompleted, StageCompleted, StageFailed, StageStarted};
    assert_eq!(
        trace(&events),
        vec![
            (StageStarted, Some("fetch")),
            (StageCompleted, Some("fetch")),
            (StageStarted, Some("convert")),
            (StageFailed, Some("convert")),
            // Redelivery resumes past the fetch checkpoint.
            (StageStarted, Some("convert")),
            (StageCompleted, Some("convert")),
            (StageStarted, Some("render")),
            (StageCompleted, Some("render")),
            (JobCompleted, None),
        ]
    );
    let failed = &events[3];
    assert_eq!(failed.error_code, Some(ErrorCode::StageTransient));

    let job = stack.service.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.checkpoints.len(), 3);
    assert!((job.progress - 1.0).abs() < f64::EPSILON);
    assert!(job.error_code.is_none());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_fails_without_retry() {
    let registry = StageRegistry::builder()
        .stage(
            "validate",
            Arc::new(FnStage::new(|_ctx| {
                Err(StageFailure::new("validation failed: missing title"))
            })),
        )
        .stage("render", ok_stage("render"))
        .build()
        .unwrap();
    let stack = stack(registry);

    let id = stack
        .service
        .submit(JobSpec::new("owner-1", serde_json::json!({})))
        .await
        .unwrap();
    let mut stream = stack.service.subscribe(id).await.unwrap();
    stack.pool.start();

    let events = drain(&mut stream).await;
    stack.pool.stop().await;

    use ProgressEventType::{JobFailed, StageFailed, StageStarted};
    assert_eq!(
        trace(&events),
        vec![
            (StageStarted, Some("validate")),
            (StageFailed, Some("validate")),
            (JobFailed, None),
        ]
    );

    let job = stack.service.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.error_code, Some(ErrorCode::StageValidation));
    assert!(job.error_message.as_deref().unwrap_or_default().contains("missing title"));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_terminally() {
    let registry = StageRegistry::builder()
        .stage(
            "fetch",
            Arc::new(FnStage::new(|_ctx| Err(StageFailure::new("upstream unavailable")))),
        )
        .build()
        .unwrap();
    let stack = stack(registry);

    let id = stack
        .service
        .submit(JobSpec::new("owner-1", serde_json::json!({})).with_max_retries(1))
        .await
        .unwrap();
    let mut stream = stack.service.subscribe(id).await.unwrap();
    stack.pool.start();

    let events = drain(&mut stream).await;
    stack.pool.stop().await;

    let terminal = events.last().unwrap();
    assert_eq!(terminal.event_type, ProgressEventType::JobFailed);
    assert_eq!(terminal.error_code, Some(ErrorCode::RetriesExhausted));

    let job = stack.service.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.error_code, Some(ErrorCode::RetriesExhausted));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_pickup_cancels_cleanly() {
    let registry = StageRegistry::builder()
        .stage("fetch", ok_stage("fetch"))
        .stage("render", ok_stage("render"))
        .build()
        .unwrap();
    let stack = stack(registry);

    let id = stack
        .service
        .submit(JobSpec::new("owner-1", serde_json::json!({})))
        .await
        .unwrap();
    stack.service.cancel(id).await.unwrap();
    let mut stream = stack.service.subscribe(id).await.unwrap();
    stack.pool.start();

    let events = drain(&mut stream).await;
    stack.pool.stop().await;

    assert_eq!(
        trace(&events),
        vec![(ProgressEventType::JobCancelled, None)]
    );

    let job = stack.service.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.error_code.is_none());
    assert!(job.checkpoints.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_run_lands_at_next_boundary() {
    struct SelfCancellingStage {
        store: Arc<MemoryJobStore>,
    }

    #[async_trait::async_trait]
    impl StageExecutor for SelfCancellingStage {
        async fn execute(
            &self,
            ctx: &PipelineContext,
        ) -> Result<serde_json::Value, StageFailure> {
            // A cancel request arriving while this stage runs.
            self.store
                .request_cancel(ctx.job_id)
                .await
                .map_err(|e| StageFailure::new(e.to_string()))?;
            Ok(serde_json::json!({}))
        }
    }

    let store = Arc::new(MemoryJobStore::new());
    let registry = StageRegistry::builder()
        .stage("fetch", Arc::new(SelfCancellingStage { store: store.clone() }))
        .stage("render", ok_stage("render"))
        .build()
        .unwrap();

    let queue = Arc::new(MemoryQueue::default());
    let broadcaster = Arc::new(ProgressBroadcaster::new());
    let runner = Arc::new(PipelineRunner::new(
        Arc::new(registry),
        store.clone(),
        broadcaster.clone(),
        Arc::new(RateLimiter::new(100, 100.0)),
        RetryPolicy::new().with_jitter(false),
    ));
    let pool = WorkerPool::new(
        WorkerPoolConfig::new().with_workers(1).with_poll_timeout(Duration::from_millis(20)),
        queue.clone(),
        store.clone(),
        runner,
    );
    let service = JobService::new(store.clone(), queue, broadcaster, 3);

    let id = service
        .submit(JobSpec::new("owner-1", serde_json::json!({})))
        .await
        .unwrap();
    let mut stream = service.subscribe(id).await.unwrap();
    pool.start();

    let events = drain(&mut stream).await;
    pool.stop().await;

    use ProgressEventType::{JobCancelled, StageCompleted, StageStarted};
    assert_eq!(
        trace(&events),
        vec![
            (StageStarted, Some("fetch")),
            (StageCompleted, Some("fetch")),
            (JobCancelled, None),
        ]
    );

    let job = service.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    // Work done before the boundary stays checkpointed.
    assert!(job.checkpoints.contains_key("fetch"));
}

#[tokio::test(start_paused = true)]
async fn test_lease_expiry_resumes_from_checkpoint() {
    use crate::core::{CheckpointValue, Job};
    use crate::pipeline::RunOutcome;

    let executions = Arc::new(AtomicU32::new(0));
    let counter = executions.clone();
    let registry = StageRegistry::builder()
        .stage(
            "parse",
            Arc::new(FnStage::new(move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!({}))
            })),
        )
        .stage("render", ok_stage("render"))
        .build()
        .unwrap();

    let store = Arc::new(MemoryJobStore::new());
    let queue = MemoryQueue::new(Duration::from_secs(30));
    let broadcaster = Arc::new(ProgressBroadcaster::new());
    let runner = PipelineRunner::new(
        Arc::new(registry),
        store.clone(),
        broadcaster,
        Arc::new(RateLimiter::new(100, 100.0)),
        RetryPolicy::new().with_jitter(false),
    );

    let job = Job::new(JobSpec::new("owner-1", serde_json::json!({})), 3);
    let id = job.id;
    store.insert(job).await.unwrap();
    queue.enqueue(id, Duration::ZERO).await.unwrap();

    // First worker checkpoints "parse", then dies without settling its
    // lease.
    let dead_lease = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
    let mut crashed = store.get(id).await.unwrap().unwrap();
    crashed.mark_processing();
    crashed.record_checkpoint(CheckpointValue::new("parse", serde_json::json!({})), 2);
    store.update(&crashed).await.unwrap();

    tokio::time::advance(Duration::from_secs(31)).await;

    let lease = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
    assert_eq!(lease.job_id, id);
    assert_ne!(lease.token, dead_lease.token);

    let redelivered = store.get(id).await.unwrap().unwrap();
    let outcome = runner.run(redelivered).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    queue.ack(&lease).await.unwrap();

    // The checkpointed stage never re-executed, and the dead worker's
    // lease can no longer settle the job.
    assert_eq!(executions.load(Ordering::SeqCst), 0);
    assert!(queue.ack(&dead_lease).await.is_err());

    let finished = store.get(id).await.unwrap().unwrap();
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.checkpoints.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_pool_drains_multiple_jobs() {
    let registry = StageRegistry::builder()
        .stage("fetch", ok_stage("fetch"))
        .stage("render", ok_stage("render"))
        .build()
        .unwrap();
    let stack = stack(registry);

    let mut ids = Vec::new();
    for i in 0..5 {
        let id = stack
            .service
            .submit(JobSpec::new("owner-1", serde_json::json!({"n": i})))
            .await
            .unwrap();
        ids.push(id);
    }

    let mut streams = Vec::new();
    for id in &ids {
        streams.push(stack.service.subscribe(*id).await.unwrap());
    }
    stack.pool.start();

    for stream in &mut streams {
        let events = drain(stream).await;
        assert_eq!(
            events.last().unwrap().event_type,
            ProgressEventType::JobCompleted
        );
    }
    stack.pool.stop().await;

    for id in ids {
        let job = stack.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }
    assert_eq!(stack.queue.ready_len(), 0);
    assert_eq!(stack.queue.inflight_len(), 0);
}
