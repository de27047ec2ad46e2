//! Task execution context
//!
//! Everything a handler may touch during execution: coalesced progress
//! reporting, durable checkpoints, cooperative cancellation and lease
//! heartbeats. The cursor inside a checkpoint is opaque bytes owned by the
//! handler; on resume the handler receives the last durable cursor and is
//! responsible for idempotent re-processing of the delta.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::events::{EventChannel, EventHub, EventPayload};
use crate::domain::repositories::{Checkpoint, CheckpointRepository, SyncRunRepository};
use crate::domain::sync_run::SyncCounters;
use crate::queue::{WorkId, WorkQueue};

/// Minimum interval between emitted progress events (coalescing)
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

struct ProgressState {
    last_emit: Option<std::time::Instant>,
}

/// Handler-facing execution context. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct TaskContext {
    /// Stable task identity: checkpoints and progress key off this
    pub task_id: String,
    /// Sync run driven by this task, when one exists
    pub run_id: Option<String>,
    work_id: WorkId,
    lease_token: Uuid,
    lease_ttl: Duration,
    queue: Arc<dyn WorkQueue>,
    checkpoints: Arc<dyn CheckpointRepository>,
    sync_runs: Arc<dyn SyncRunRepository>,
    events: Arc<EventHub>,
    cancel: CancellationToken,
    next_checkpoint_seq: Arc<AtomicU32>,
    progress: Arc<Mutex<ProgressState>>,
}

impl TaskContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: impl Into<String>,
        run_id: Option<String>,
        work_id: WorkId,
        lease_token: Uuid,
        lease_ttl: Duration,
        queue: Arc<dyn WorkQueue>,
        checkpoints: Arc<dyn CheckpointRepository>,
        sync_runs: Arc<dyn SyncRunRepository>,
        events: Arc<EventHub>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            run_id,
            work_id,
            lease_token,
            lease_ttl,
            queue,
            checkpoints,
            sync_runs,
            events,
            cancel,
            next_checkpoint_seq: Arc::new(AtomicU32::new(0)),
            progress: Arc::new(Mutex::new(ProgressState { last_emit: None })),
        }
    }

    /// Best-effort, coalesced progress report (at most ~1 Hz). Terminal
    /// reports (100%) always go out.
    pub async fn report_progress(&self, percent: u8, message: &str, counters: SyncCounters) {
        let mut state = self.progress.lock().await;
        let now = std::time::Instant::now();
        let due = state
            .last_emit
            .map_or(true, |last| now.duration_since(last) >= PROGRESS_INTERVAL);
        if !due && percent < 100 {
            return;
        }
        state.last_emit = Some(now);
        drop(state);

        self.events.publish(
            EventChannel::SyncProgress,
            &self.task_id,
            EventPayload::Progress {
                percent: percent.min(100),
                message: message.to_string(),
                counters,
            },
        );
    }

    /// Durable checkpoint write; returns only after the store confirms.
    pub async fn save_checkpoint(&self, cursor: &[u8], counters: SyncCounters) -> Result<()> {
        let sequence_no = self.next_checkpoint_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let checkpoint = Checkpoint::new(self.task_id.clone(), sequence_no, cursor.to_vec(), counters);
        self.checkpoints
            .save(&checkpoint)
            .await
            .with_context(|| format!("saving checkpoint {sequence_no} for {}", self.task_id))?;
        debug!("Checkpoint {sequence_no} saved for {}", self.task_id);
        Ok(())
    }

    /// Last durable cursor and counters, if any. A corrupt checkpoint
    /// surfaces a warning and restarts the task from the beginning.
    pub async fn load_checkpoint(&self) -> Result<Option<(Vec<u8>, SyncCounters)>> {
        match self.checkpoints.load_latest(&self.task_id).await? {
            Some(checkpoint) => {
                if !checkpoint.checksum_valid() {
                    warn!(
                        "Checkpoint {} for {} failed checksum validation, restarting from scratch",
                        checkpoint.sequence_no, self.task_id
                    );
                    return Ok(None);
                }
                self.next_checkpoint_seq.store(checkpoint.sequence_no, Ordering::SeqCst);
                Ok(Some((checkpoint.cursor.clone(), checkpoint.counters)))
            }
            None => Ok(None),
        }
    }

    /// Cooperative cancellation, checked at safe points. True when either
    /// the runtime cancelled the task (shutdown, soft timeout) or a cancel
    /// request landed on the attached sync run.
    pub async fn cancel_requested(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        if let Some(run_id) = &self.run_id {
            return self.sync_runs.is_cancel_requested(run_id).await.unwrap_or(false);
        }
        false
    }

    /// Extend the queue lease. Handlers and the pool's heartbeat loop call
    /// this at <= lease_ttl / 3.
    pub async fn heartbeat(&self) -> Result<()> {
        self.queue
            .extend(self.work_id, self.lease_token, self.lease_ttl)
            .await
            .context("extending lease")
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn work_id(&self) -> WorkId {
        self.work_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::memory::InMemoryStore;
    use crate::queue::{EnqueueRequest, InMemoryWorkQueue};
    use std::sync::Arc;

    async fn context_for_test() -> (TaskContext, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        queue
            .enqueue(EnqueueRequest::new("sync.products", serde_json::Value::Null))
            .await
            .unwrap();
        let leased = queue
            .lease(&["default".to_string()], "w-1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let ctx = TaskContext::new(
            "task-1",
            None,
            leased.work.work_id,
            leased.lease_token,
            Duration::from_secs(30),
            queue,
            store.clone(),
            store.clone(),
            Arc::new(EventHub::new()),
            CancellationToken::new(),
        );
        (ctx, store)
    }

    #[tokio::test]
    async fn checkpoint_roundtrip_with_dense_sequences() {
        let (ctx, _store) = context_for_test().await;
        let counters = SyncCounters { total: 10, processed: 7, success: 7, ..Default::default() };

        ctx.save_checkpoint(b"page=7", counters).await.unwrap();
        ctx.save_checkpoint(b"page=8", counters).await.unwrap();

        let (cursor, restored) = ctx.load_checkpoint().await.unwrap().unwrap();
        assert_eq!(cursor, b"page=8");
        assert_eq!(restored, counters);

        // Sequence continues after a load
        ctx.save_checkpoint(b"page=9", counters).await.unwrap();
        let (cursor, _) = ctx.load_checkpoint().await.unwrap().unwrap();
        assert_eq!(cursor, b"page=9");
    }

    #[tokio::test]
    async fn resume_initializes_sequence_from_store() {
        let (first, store) = context_for_test().await;
        let counters = SyncCounters::default();
        first.save_checkpoint(b"page=1", counters).await.unwrap();
        first.save_checkpoint(b"page=2", counters).await.unwrap();

        // A replacement worker builds a fresh context for the same task
        let queue = Arc::new(InMemoryWorkQueue::new());
        queue
            .enqueue(EnqueueRequest::new("sync.products", serde_json::Value::Null))
            .await
            .unwrap();
        let leased = queue
            .lease(&["default".to_string()], "w-2", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let second = TaskContext::new(
            "task-1",
            None,
            leased.work.work_id,
            leased.lease_token,
            Duration::from_secs(30),
            queue,
            store.clone(),
            store,
            Arc::new(EventHub::new()),
            CancellationToken::new(),
        );

        let (cursor, _) = second.load_checkpoint().await.unwrap().unwrap();
        assert_eq!(cursor, b"page=2");
        second.save_checkpoint(b"page=3", counters).await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_extends_live_lease() {
        let (ctx, _) = context_for_test().await;
        ctx.heartbeat().await.unwrap();
    }
}
