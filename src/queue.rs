//! Durable work queue (at-least-once, priority-partitioned)
//!
//! Work items live in named queues and are dispatched strictly by priority,
//! then by earliest eligibility, then insertion order. Workers claim items
//! through time-bounded leases; an item whose lease expires becomes leasable
//! again, so task execution must be idempotent. `ack`/`nack` with a stale
//! token are rejected - an item is never owned by two workers at once at the
//! queue level.

pub mod memory;
pub mod watermark;
pub mod work;

pub use memory::InMemoryWorkQueue;
pub use watermark::WatermarkGate;
pub use work::{LeasedWork, Priority, QueuedWork, WorkId};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Standard queue names. A worker pool may bind to any non-empty subset.
pub const QUEUE_DEFAULT: &str = "default";
pub const QUEUE_CRAWLER: &str = "crawler";
pub const QUEUE_IMAGE: &str = "image";
pub const QUEUE_DATA_SYNC: &str = "data_sync";
pub const QUEUE_BATCH: &str = "batch";

/// All standard queues in dispatch order
pub fn standard_queues() -> Vec<String> {
    [QUEUE_DEFAULT, QUEUE_CRAWLER, QUEUE_IMAGE, QUEUE_DATA_SYNC, QUEUE_BATCH]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Queue operation failures
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The lease token does not match the live lease for the work item
    #[error("stale lease for work item {work_id}")]
    StaleLease { work_id: WorkId },

    #[error("work item {work_id} not found")]
    NotFound { work_id: WorkId },

    #[error("queue backend unavailable: {0}")]
    Unavailable(String),

    #[error("work args serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Parameters for a new work item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub task_name: String,
    pub args: serde_json::Value,
    pub queue: String,
    pub priority: Priority,
    /// Earliest eligibility; `None` means immediately
    pub not_before: Option<DateTime<Utc>>,
}

impl EnqueueRequest {
    pub fn new(task_name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            task_name: task_name.into(),
            args,
            queue: QUEUE_DEFAULT.to_string(),
            priority: Priority::Normal,
            not_before: None,
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn delayed_until(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }
}

/// Depth of one (queue, priority) partition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDepth {
    pub queue: String,
    pub priority: Priority,
    pub ready: u64,
    pub leased: u64,
}

/// The queue port. Implementations: sqlite (production) and in-memory
/// (tests, single-process runs).
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Store a new work item, returning its id
    async fn enqueue(&self, request: EnqueueRequest) -> Result<WorkId, QueueError>;

    /// Claim the next eligible item from the given queues. Returns `None`
    /// when every queue in the subset is drained.
    async fn lease(
        &self,
        queues: &[String],
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<LeasedWork>, QueueError>;

    /// Push the lease deadline out; heartbeats call this at <= ttl/3
    async fn extend(&self, work_id: WorkId, lease_token: Uuid, lease_ttl: Duration) -> Result<(), QueueError>;

    /// Complete and remove the work item
    async fn ack(&self, work_id: WorkId, lease_token: Uuid) -> Result<(), QueueError>;

    /// Re-queue for retry with `not_before = now + delay` and
    /// `attempt_no + 1`
    async fn nack(
        &self,
        work_id: WorkId,
        lease_token: Uuid,
        reason: &str,
        delay: Duration,
    ) -> Result<(), QueueError>;

    /// Terminal failure: remove from the queue and park in the dead-letter
    /// store with the final reason
    async fn fail(&self, work_id: WorkId, lease_token: Uuid, reason: &str) -> Result<(), QueueError>;

    /// Ready (unleased, eligible-now) items in a queue
    async fn depth(&self, queue: &str) -> Result<u64, QueueError>;

    /// Depth broken down by (queue, priority)
    async fn depths(&self) -> Result<Vec<QueueDepth>, QueueError>;

    /// Look up a work item (ready or leased) by id
    async fn find(&self, work_id: WorkId) -> Result<Option<QueuedWork>, QueueError>;
}
