//! Worker pool
//!
//! Each worker is a long-running loop: lease work from the bound queues,
//! resolve the handler, run it under a `TaskContext` with soft/hard
//! timeouts and a lease heartbeat, then ack or classify-and-retry.
//! Shutdown is draining: workers stop leasing, finish in-flight tasks and
//! exit.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::TaskContext;
use super::registry::TaskRegistry;
use super::retry::{ErrorClass, RetryDecision, RetryPolicy, TaskError};
use crate::application::events::{EventChannel, EventHub, EventPayload};
use crate::domain::repositories::{Store, SyncRunRepository};
use crate::domain::sync_run::SyncRunStatus;
use crate::infrastructure::config::WorkerConfig;
use crate::queue::{LeasedWork, QueueError, WorkQueue};
use crate::supervision::SupervisionHub;

/// Pool configuration: queue binding plus the worker timing knobs
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub queues: Vec<String>,
    pub concurrency: usize,
    pub lease_ttl: Duration,
    pub soft_timeout: Duration,
    pub hard_timeout: Duration,
    pub idle_poll: Duration,
    pub outage_backoff: Duration,
}

impl WorkerPoolConfig {
    pub fn from_worker_config(config: &WorkerConfig, queues: Vec<String>) -> Self {
        let soft = Duration::from_secs(config.soft_timeout_secs);
        let hard = Duration::from_secs(config.hard_timeout_secs).max(soft);
        Self {
            queues,
            concurrency: config.concurrency.max(1),
            // Lease must outlive the soft timeout with a safety margin
            lease_ttl: Duration::from_secs(config.lease_ttl_secs).max(soft + Duration::from_secs(10)),
            soft_timeout: soft,
            hard_timeout: hard,
            idle_poll: Duration::from_millis(config.idle_poll_ms),
            outage_backoff: Duration::from_secs(5),
        }
    }
}

/// The worker pool (C11)
pub struct WorkerPool {
    config: WorkerPoolConfig,
    registry: TaskRegistry,
    queue: Arc<dyn WorkQueue>,
    store: Store,
    events: Arc<EventHub>,
    supervision: Arc<SupervisionHub>,
    retry_policy: RetryPolicy,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        registry: TaskRegistry,
        queue: Arc<dyn WorkQueue>,
        store: Store,
        events: Arc<EventHub>,
        supervision: Arc<SupervisionHub>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            config,
            registry,
            queue,
            store,
            events,
            supervision,
            retry_policy,
        }
    }

    /// Run until `shutdown` fires. Draining: in-flight tasks finish.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Worker pool starting: {} workers on queues {:?}",
            self.config.concurrency, self.config.queues
        );

        let mut workers = JoinSet::new();
        for index in 0..self.config.concurrency {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            let worker_id = format!("worker-{index}");
            workers.spawn(async move { pool.worker_loop(worker_id, shutdown).await });
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Worker exited abnormally: {e}");
            }
        }
        info!("Worker pool stopped");
        Ok(())
    }

    async fn worker_loop(&self, worker_id: String, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                debug!("{worker_id} draining: shutdown requested");
                break;
            }
            self.supervision.record_heartbeat(&worker_id, None).await;

            match self
                .queue
                .lease(&self.config.queues, &worker_id, self.config.lease_ttl)
                .await
            {
                Ok(Some(leased)) => {
                    self.process(&worker_id, leased, &shutdown).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.idle_poll) => {}
                        _ = shutdown.cancelled() => {}
                    }
                }
                Err(QueueError::Unavailable(detail)) => {
                    self.supervision.record_store_outage(&detail).await;
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.outage_backoff) => {}
                        _ = shutdown.cancelled() => {}
                    }
                }
                Err(other) => {
                    warn!("{worker_id}: unexpected lease error: {other}");
                    tokio::time::sleep(self.config.idle_poll).await;
                }
            }
        }
    }

    async fn process(&self, worker_id: &str, leased: LeasedWork, shutdown: &CancellationToken) {
        let work = leased.work.clone();
        let task_name = work.task_name.clone();
        self.supervision
            .record_heartbeat(worker_id, Some(task_name.clone()))
            .await;

        let Some(handler) = self.registry.get(&task_name) else {
            warn!("No handler registered for task '{task_name}', dead-lettering {}", work.work_id);
            self.queue
                .fail(work.work_id, leased.lease_token, "UnknownTask")
                .await
                .ok();
            return;
        };

        let run_id = work
            .args
            .get("run_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        // A re-issued run passes the prior task_id to resume from its
        // retained checkpoints; otherwise the work id is the task identity
        let task_id = work
            .args
            .get("task_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| work.work_id.to_string());
        let cancel = shutdown.child_token();
        let ctx = TaskContext::new(
            task_id,
            run_id.clone(),
            work.work_id,
            leased.lease_token,
            self.config.lease_ttl,
            self.queue.clone(),
            self.store.checkpoints.clone(),
            self.store.sync_runs.clone(),
            self.events.clone(),
            cancel.clone(),
        );

        self.bind_run(&run_id, &work.work_id.to_string()).await;

        // Heartbeat at lease_ttl / 3; losing the lease cancels the task
        let heartbeat_ctx = ctx.clone();
        let heartbeat_cancel = cancel.clone();
        let heartbeat_interval = self.config.lease_ttl / 3;
        let supervision = self.supervision.clone();
        let heartbeat_worker = worker_id.to_string();
        let heartbeat_task_name = task_name.clone();
        let heartbeat = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(heartbeat_interval) => {
                        supervision
                            .record_heartbeat(&heartbeat_worker, Some(heartbeat_task_name.clone()))
                            .await;
                        if let Err(e) = heartbeat_ctx.heartbeat().await {
                            warn!("Lease heartbeat failed, cancelling task: {e:#}");
                            heartbeat_cancel.cancel();
                            break;
                        }
                    }
                    _ = heartbeat_cancel.cancelled() => break,
                }
            }
        });

        let soft = handler.soft_timeout().unwrap_or(self.config.soft_timeout);
        let hard = handler.hard_timeout().unwrap_or(self.config.hard_timeout).max(soft);
        let args = work.args.clone();
        let handler_ctx = ctx.clone();
        let mut handle = tokio::spawn(async move { handler.run(args, handler_ctx).await });

        let outcome: Result<Value, TaskError> = tokio::select! {
            joined = &mut handle => flatten_join(joined),
            _ = tokio::time::sleep(soft) => {
                warn!("Task {task_name} hit soft timeout ({soft:?}), cancelling");
                cancel.cancel();
                tokio::select! {
                    joined = &mut handle => flatten_join(joined),
                    _ = tokio::time::sleep(hard.saturating_sub(soft)) => {
                        error!("Task {task_name} hit hard timeout ({hard:?}), aborting");
                        handle.abort();
                        Err(TaskError::transient("HardTimeout", format!("exceeded {hard:?}")))
                    }
                }
            }
        };

        heartbeat.abort();
        self.settle(&work, leased.lease_token, outcome).await;
    }

    /// First lease of a run's driver task moves the run pending -> running
    async fn bind_run(&self, run_id: &Option<String>, task_id: &str) {
        let Some(run_id) = run_id else { return };
        match self.store.sync_runs.find(run_id).await {
            Ok(Some(mut run)) => {
                if run.status == SyncRunStatus::Pending {
                    run.task_id = Some(task_id.to_string());
                    if run.transition(SyncRunStatus::Running).is_ok() {
                        self.store.sync_runs.update(&run).await.ok();
                    }
                } else if run.task_id.as_deref() != Some(task_id) {
                    run.task_id = Some(task_id.to_string());
                    self.store.sync_runs.update(&run).await.ok();
                }
            }
            Ok(None) => warn!("Work references unknown sync run {run_id}"),
            Err(e) => warn!("Run lookup failed for {run_id}: {e:#}"),
        }
    }

    async fn settle(
        &self,
        work: &crate::queue::QueuedWork,
        lease_token: uuid::Uuid,
        outcome: Result<Value, TaskError>,
    ) {
        match outcome {
            Ok(_) => {
                match self.queue.ack(work.work_id, lease_token).await {
                    Ok(()) => {
                        self.supervision.record_outcome(&work.task_name, false).await;
                    }
                    Err(QueueError::StaleLease { .. }) => {
                        // Lease expired mid-run and another worker owns the
                        // item now; at-least-once semantics cover us
                        warn!("Ack rejected for {}: lease expired during execution", work.work_id);
                    }
                    Err(e) => warn!("Ack failed for {}: {e}", work.work_id),
                }
            }
            Err(task_error) => {
                self.supervision.record_outcome(&work.task_name, true).await;

                if task_error.class == ErrorClass::Cancelled {
                    debug!("Task {} cancelled, releasing lease terminally", work.work_id);
                    self.queue
                        .fail(work.work_id, lease_token, &task_error.code)
                        .await
                        .ok();
                    self.fail_attached_run(&work, &task_error).await;
                    return;
                }

                match self.retry_policy.decide(task_error.class, work.attempt_no) {
                    RetryDecision::Retry(delay) => {
                        debug!(
                            "Task {} attempt {} failed ({}), retrying in {:?}",
                            work.work_id, work.attempt_no, task_error.code, delay
                        );
                        if let Err(e) = self
                            .queue
                            .nack(work.work_id, lease_token, &task_error.code, delay)
                            .await
                        {
                            warn!("Nack failed for {}: {e}", work.work_id);
                        }
                    }
                    RetryDecision::Terminal { manual } => {
                        // The digest counts terminal outcomes, not attempts
                        self.record_run_error(work, &task_error).await;
                        let reason = if manual {
                            format!("{} (manual intervention required)", task_error.code)
                        } else {
                            task_error.code.clone()
                        };
                        warn!("Task {} terminal after {} attempts: {}", work.work_id, work.attempt_no + 1, reason);
                        self.queue.fail(work.work_id, lease_token, &reason).await.ok();
                        self.fail_attached_run(work, &task_error).await;
                    }
                }
            }
        }
    }

    async fn record_run_error(&self, work: &crate::queue::QueuedWork, task_error: &TaskError) {
        let Some(run_id) = work.args.get("run_id").and_then(Value::as_str) else {
            return;
        };
        if let Ok(Some(mut run)) = self.store.sync_runs.find(run_id).await {
            run.record_error_code(&task_error.code);
            self.store.sync_runs.update(&run).await.ok();
        }
    }

    /// Terminal work failure takes its driver run to a terminal state
    async fn fail_attached_run(&self, work: &crate::queue::QueuedWork, task_error: &TaskError) {
        let Some(run_id) = work.args.get("run_id").and_then(Value::as_str) else {
            return;
        };
        let Ok(Some(run)) = self.store.sync_runs.find(run_id).await else {
            return;
        };
        if run.status.is_terminal() {
            return;
        }
        let target = if task_error.class == ErrorClass::Cancelled {
            SyncRunStatus::Cancelled
        } else {
            SyncRunStatus::Failed
        };
        if self.store.sync_runs.set_status(run_id, target).await.is_ok() {
            let channel = if target == SyncRunStatus::Cancelled {
                EventChannel::SyncProgress
            } else {
                EventChannel::SyncFailed
            };
            self.events.publish(
                channel,
                run_id,
                EventPayload::Failed {
                    error_code: task_error.code.clone(),
                    message: task_error.message.clone(),
                    counters: run.counters,
                },
            );
        }
    }
}

fn flatten_join(joined: Result<Result<Value, TaskError>, tokio::task::JoinError>) -> Result<Value, TaskError> {
    match joined {
        Ok(result) => result,
        Err(join_error) if join_error.is_cancelled() => Err(TaskError::cancelled()),
        Err(join_error) => Err(TaskError::transient("Panic", join_error.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::RetryConfig;
    use crate::infrastructure::persistence::memory::InMemoryStore;
    use crate::queue::{EnqueueRequest, InMemoryWorkQueue, Priority};
    use crate::supervision::{HealthEvent, ObservabilityPort};
    use crate::worker::registry::TaskHandler;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NullPort;
    impl ObservabilityPort for NullPort {
        fn emit(&self, _event: &HealthEvent) {}
    }

    struct FlakyHandler {
        calls: Arc<AtomicU32>,
        fail_first: u32,
    }

    #[async_trait]
    impl TaskHandler for FlakyHandler {
        async fn run(&self, _args: Value, _ctx: TaskContext) -> Result<Value, TaskError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(TaskError::transient("Timeout", "simulated"))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    struct PermanentFailure;

    #[async_trait]
    impl TaskHandler for PermanentFailure {
        async fn run(&self, _args: Value, _ctx: TaskContext) -> Result<Value, TaskError> {
            Err(TaskError::permanent("Malformed", "simulated"))
        }
    }

    fn pool_with(registry: TaskRegistry, queue: Arc<InMemoryWorkQueue>) -> Arc<WorkerPool> {
        let store = InMemoryStore::new().into_store();
        let events = Arc::new(EventHub::new());
        let supervision = Arc::new(SupervisionHub::new(
            crate::infrastructure::config::SupervisionConfig {
                error_window_secs: 300,
                error_rate_threshold: 0.9,
                stalled_after_secs: 180,
            },
            Arc::new(NullPort),
        ));
        let retry = RetryPolicy::new(RetryConfig {
            base_delay_ms: 10,
            backoff_factor: 2.0,
            max_delay_ms: 50,
            max_attempts: 5,
            jitter_frac: 0.0,
            auth_max_attempts: 2,
            auth_cooldown_ms: 10,
        });
        Arc::new(WorkerPool::new(
            WorkerPoolConfig {
                queues: vec!["default".to_string()],
                concurrency: 1,
                lease_ttl: Duration::from_secs(30),
                soft_timeout: Duration::from_secs(5),
                hard_timeout: Duration::from_secs(6),
                idle_poll: Duration::from_millis(5),
                outage_backoff: Duration::from_millis(5),
            },
            registry,
            queue,
            store,
            events,
            supervision,
            retry,
        ))
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = TaskRegistry::new();
        registry.register(
            "crawl.fetch_products",
            Arc::new(FlakyHandler { calls: calls.clone(), fail_first: 2 }),
        );

        let queue = Arc::new(InMemoryWorkQueue::new());
        queue
            .enqueue(
                EnqueueRequest::new("crawl.fetch_products", json!({"page": 3}))
                    .with_priority(Priority::Normal),
            )
            .await
            .unwrap();

        let pool = pool_with(registry, queue.clone());
        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(pool.run(shutdown.clone()));

        // Two failures (10ms, 20ms backoff) then success
        for _ in 0..200 {
            if calls.load(Ordering::SeqCst) >= 3 && queue.depth("default").await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        runner.await.unwrap().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(queue.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_without_retry() {
        let mut registry = TaskRegistry::new();
        registry.register("sync.validate", Arc::new(PermanentFailure));

        let queue = Arc::new(InMemoryWorkQueue::new());
        queue
            .enqueue(EnqueueRequest::new("sync.validate", json!({})))
            .await
            .unwrap();

        let pool = pool_with(registry, queue.clone());
        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(pool.run(shutdown.clone()));

        for _ in 0..200 {
            if !queue.dead_letters().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        runner.await.unwrap().unwrap();

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].1, "Malformed");
        assert_eq!(dead[0].0.attempt_no, 0, "no retry before dead-lettering");
    }

    #[tokio::test]
    async fn unknown_task_is_dead_lettered() {
        let registry = TaskRegistry::new();
        let queue = Arc::new(InMemoryWorkQueue::new());
        queue
            .enqueue(EnqueueRequest::new("no.such_task", json!({})))
            .await
            .unwrap();

        let pool = pool_with(registry, queue.clone());
        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(pool.run(shutdown.clone()));

        for _ in 0..200 {
            if !queue.dead_letters().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        runner.await.unwrap().unwrap();

        assert_eq!(queue.dead_letters().await[0].1, "UnknownTask");
    }
}
