//! Worker runtime integration tests
//!
//! Crash resume from checkpoints, observed retry backoff on the queue, and
//! cooperative cancellation at safe points.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use marketsync_lib::application::events::EventHub;
use marketsync_lib::domain::repositories::{CheckpointRepository, Store, SyncRunRepository};
use marketsync_lib::domain::sync_run::{OperationType, SyncCounters, SyncRun, SyncRunStatus, SyncType};
use marketsync_lib::infrastructure::config::{RetryConfig, SupervisionConfig};
use marketsync_lib::infrastructure::persistence::InMemoryStore;
use marketsync_lib::queue::{EnqueueRequest, InMemoryWorkQueue, WorkQueue, QUEUE_DATA_SYNC};
use marketsync_lib::supervision::{HealthEvent, ObservabilityPort, SupervisionHub};
use marketsync_lib::worker::context::TaskContext;
use marketsync_lib::worker::pool::{WorkerPool, WorkerPoolConfig};
use marketsync_lib::worker::registry::{TaskHandler, TaskRegistry};
use marketsync_lib::worker::retry::{RetryPolicy, TaskError};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

struct NullPort;
impl ObservabilityPort for NullPort {
    fn emit(&self, _event: &HealthEvent) {}
}

fn supervision() -> Arc<SupervisionHub> {
    Arc::new(SupervisionHub::new(
        SupervisionConfig {
            error_window_secs: 300,
            error_rate_threshold: 0.95,
            stalled_after_secs: 180,
        },
        Arc::new(NullPort),
    ))
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(RetryConfig {
        base_delay_ms: 10,
        backoff_factor: 2.0,
        max_delay_ms: 100,
        max_attempts: 5,
        jitter_frac: 0.0,
        auth_max_attempts: 2,
        auth_cooldown_ms: 10,
    })
}

fn pool(registry: TaskRegistry, queue: Arc<InMemoryWorkQueue>, store: Store, retry: RetryPolicy) -> Arc<WorkerPool> {
    Arc::new(WorkerPool::new(
        WorkerPoolConfig {
            queues: vec![QUEUE_DATA_SYNC.to_string()],
            concurrency: 1,
            lease_ttl: Duration::from_secs(30),
            soft_timeout: Duration::from_secs(10),
            hard_timeout: Duration::from_secs(12),
            idle_poll: Duration::from_millis(5),
            outage_backoff: Duration::from_millis(5),
        },
        registry,
        queue,
        store,
        Arc::new(EventHub::new()),
        supervision(),
        retry,
    ))
}

/// Synthetic paged sync: processes pages 1..=10 with a checkpoint after
/// each, crashing once mid-run to exercise resume.
struct PagedHandler {
    executions: Arc<AtomicU32>,
    resume_pages: Arc<AtomicU32>,
    crash_after_page: u32,
}

#[async_trait]
impl TaskHandler for PagedHandler {
    async fn run(&self, _args: Value, ctx: TaskContext) -> Result<Value, TaskError> {
        let execution = self.executions.fetch_add(1, Ordering::SeqCst);

        let (mut page, mut counters) = match ctx.load_checkpoint().await.map_err(TaskError::from)? {
            Some((cursor, counters)) => {
                let resumed = String::from_utf8(cursor)
                    .ok()
                    .and_then(|s| s.strip_prefix("page=").and_then(|n| n.parse::<u32>().ok()))
                    .unwrap_or(0);
                self.resume_pages.store(resumed + 1, Ordering::SeqCst);
                (resumed + 1, counters)
            }
            None => (1, SyncCounters { total: 1000, ..Default::default() }),
        };

        while page <= 10 {
            if ctx.cancel_requested().await {
                return Err(TaskError::cancelled());
            }
            // 100 items per page
            counters.record_success(100);
            ctx.save_checkpoint(format!("page={page}").as_bytes(), counters)
                .await
                .map_err(TaskError::from)?;
            ctx.report_progress(counters.progress_percent(), &format!("page {page}"), counters)
                .await;

            if execution == 0 && page == self.crash_after_page {
                // Simulated crash mid-run, after the page-7 checkpoint
                return Err(TaskError::transient("Timeout", "simulated crash"));
            }
            page += 1;
        }
        Ok(json!({"success": counters.success}))
    }
}

#[tokio::test]
async fn crash_resume_continues_from_last_checkpoint() {
    let store = InMemoryStore::new().into_store();
    let queue = Arc::new(InMemoryWorkQueue::new());
    let executions = Arc::new(AtomicU32::new(0));
    let resume_pages = Arc::new(AtomicU32::new(0));

    let mut registry = TaskRegistry::new();
    registry.register(
        "sync.products",
        Arc::new(PagedHandler {
            executions: executions.clone(),
            resume_pages: resume_pages.clone(),
            crash_after_page: 7,
        }),
    );

    let work_id = queue
        .enqueue(EnqueueRequest::new("sync.products", json!({})).on_queue(QUEUE_DATA_SYNC))
        .await
        .unwrap();

    let pool = pool(registry, queue.clone(), store.clone(), fast_retry());
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(pool.run(shutdown.clone()));

    for _ in 0..400 {
        if executions.load(Ordering::SeqCst) >= 2 && queue.depth(QUEUE_DATA_SYNC).await.unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    runner.await.unwrap().unwrap();

    assert_eq!(executions.load(Ordering::SeqCst), 2, "one crash, one resume");
    assert_eq!(resume_pages.load(Ordering::SeqCst), 8, "resumed at page 8 after page-7 checkpoint");
    assert!(queue.dead_letters().await.is_empty());

    // Final counters match an uninterrupted run: pages 1..7 counted once
    // before the crash, 8..10 after resume
    let checkpoint = store
        .checkpoints
        .load_latest(&work_id.to_string())
        .await
        .unwrap()
        .expect("final checkpoint");
    assert_eq!(checkpoint.cursor, b"page=10");
    assert_eq!(checkpoint.counters.success, 1000);
    assert_eq!(checkpoint.counters.processed, 1000);
}

/// Handler that always reports rate limiting
struct RateLimited;

#[async_trait]
impl TaskHandler for RateLimited {
    async fn run(&self, _args: Value, _ctx: TaskContext) -> Result<Value, TaskError> {
        Err(TaskError::transient("TooManyRequests", "simulated 429"))
    }
}

#[tokio::test]
async fn retry_backoff_is_visible_on_the_queue_row() {
    let store = InMemoryStore::new().into_store();
    let queue = Arc::new(InMemoryWorkQueue::new());

    let mut registry = TaskRegistry::new();
    registry.register("crawl.fetch_products", Arc::new(RateLimited));

    let work_id = queue
        .enqueue(
            EnqueueRequest::new("crawl.fetch_products", json!({"category": "X", "page": 3}))
                .on_queue(QUEUE_DATA_SYNC),
        )
        .await
        .unwrap();

    // Production-shaped policy: base 2s, factor 2, +-25% jitter
    let retry = RetryPolicy::new(RetryConfig {
        base_delay_ms: 2000,
        backoff_factor: 2.0,
        max_delay_ms: 60_000,
        max_attempts: 5,
        jitter_frac: 0.25,
        auth_max_attempts: 2,
        auth_cooldown_ms: 1000,
    });
    let pool = pool(registry, queue.clone(), store, retry);
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(pool.run(shutdown.clone()));

    // After the first failure the row is parked with not_before ~2s out
    let mut observed = None;
    for _ in 0..200 {
        if let Some(work) = queue.find(work_id).await.unwrap() {
            if work.attempt_no == 1 {
                observed = Some(work);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    runner.await.unwrap().unwrap();

    let work = observed.expect("first retry observed");
    assert_eq!(work.last_error.as_deref(), Some("TooManyRequests"));
    let delta = (work.not_before - Utc::now()).num_milliseconds();
    // 2s +-25% (minus polling slack)
    assert!(delta > 1000 && delta <= 2600, "first backoff ~2s, got {delta}ms");
}

/// Handler that loops until cancelled at a page boundary
struct CancellableHandler {
    pages_done: Arc<AtomicU32>,
}

#[async_trait]
impl TaskHandler for CancellableHandler {
    async fn run(&self, _args: Value, ctx: TaskContext) -> Result<Value, TaskError> {
        let mut counters = SyncCounters { total: 100, ..Default::default() };
        for page in 1..=100u32 {
            if ctx.cancel_requested().await {
                return Err(TaskError::cancelled());
            }
            counters.record_success(1);
            ctx.save_checkpoint(format!("page={page}").as_bytes(), counters)
                .await
                .map_err(TaskError::from)?;
            self.pages_done.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(json!({}))
    }
}

#[tokio::test]
async fn cancellation_lands_at_page_boundary_and_keeps_checkpoint() {
    let store = InMemoryStore::new().into_store();
    let queue = Arc::new(InMemoryWorkQueue::new());
    let pages_done = Arc::new(AtomicU32::new(0));

    // The run whose cancel flag the handler watches
    let run = SyncRun::new("sync.products", OperationType::Manual, SyncType::Product);
    store.sync_runs.create(&run).await.unwrap();

    let mut registry = TaskRegistry::new();
    registry.register(
        "sync.products",
        Arc::new(CancellableHandler { pages_done: pages_done.clone() }),
    );

    let work_id = queue
        .enqueue(
            EnqueueRequest::new("sync.products", json!({"run_id": run.run_id})).on_queue(QUEUE_DATA_SYNC),
        )
        .await
        .unwrap();

    let pool = pool(registry, queue.clone(), store.clone(), fast_retry());
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(pool.run(shutdown.clone()));

    // Let a few pages pass, then request cancellation (the admin surface
    // would POST /sync-records/{id}/cancel)
    for _ in 0..200 {
        if pages_done.load(Ordering::SeqCst) >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(store.sync_runs.request_cancel(&run.run_id).await.unwrap());

    // The handler observes the flag at the next boundary and stops
    for _ in 0..400 {
        let current = store.sync_runs.find(&run.run_id).await.unwrap().unwrap();
        if current.status == SyncRunStatus::Cancelled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    runner.await.unwrap().unwrap();

    let final_run = store.sync_runs.find(&run.run_id).await.unwrap().unwrap();
    assert_eq!(final_run.status, SyncRunStatus::Cancelled);
    assert!(pages_done.load(Ordering::SeqCst) < 100, "did not run to completion");

    // Work released terminally with the cancellation reason
    let dead = queue.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].1, "Cancelled");

    // Checkpoint retained for audit (the work id keys the checkpoint)
    let checkpoint = store.checkpoints.load_latest(&work_id.to_string()).await.unwrap();
    assert!(checkpoint.is_some());
    assert!(checkpoint.unwrap().checksum_valid());
}
