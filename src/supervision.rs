//! Supervision & progress aggregation (C13)
//!
//! Collects worker heartbeats, queue depths, run counters and error-rate
//! windows, derives health, and emits threshold-crossing events through the
//! observability port. Thresholds come from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::application::events::{EventChannel, EventHub, EventPayload};
use crate::domain::repositories::SyncRunRepository;
use crate::infrastructure::config::SupervisionConfig;
use crate::queue::{QueueDepth, WorkQueue};

/// Observability port: supervision pushes threshold events through this
pub trait ObservabilityPort: Send + Sync {
    fn emit(&self, event: &HealthEvent);
}

/// Default port implementation: structured log plus a `system_status`
/// event on the hub
pub struct EventHubObservability {
    hub: Arc<EventHub>,
}

impl EventHubObservability {
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self { hub }
    }
}

impl ObservabilityPort for EventHubObservability {
    fn emit(&self, event: &HealthEvent) {
        warn!("Supervision event: {} ({})", event.kind, event.detail);
        self.hub.publish(
            EventChannel::SystemStatus,
            "supervision",
            EventPayload::SystemStatus {
                healthy: false,
                detail: format!("{}: {}", event.kind, event.detail),
            },
        );
    }
}

/// A threshold crossing surfaced to the observability port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvent {
    pub kind: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub current_task: Option<String>,
}

/// Point-in-time supervision summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisionSnapshot {
    pub active_workers: usize,
    pub stalled_workers: usize,
    pub queue_depths: Vec<QueueDepth>,
    pub active_runs: usize,
    /// Completed task count per task name since process start
    pub throughput: HashMap<String, u64>,
    /// Failures within the rolling error window, per task name
    pub recent_errors: HashMap<String, u64>,
    pub taken_at: DateTime<Utc>,
}

struct WindowEntry {
    at: DateTime<Utc>,
    task_name: String,
    failed: bool,
}

struct Inner {
    workers: HashMap<String, WorkerStatus>,
    throughput: HashMap<String, u64>,
    window: Vec<WindowEntry>,
}

/// The supervision hub. One per process; workers feed it, the CLI `status`
/// command and the observability port read from it.
pub struct SupervisionHub {
    inner: Mutex<Inner>,
    config: SupervisionConfig,
    port: Arc<dyn ObservabilityPort>,
}

impl SupervisionHub {
    pub fn new(config: SupervisionConfig, port: Arc<dyn ObservabilityPort>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                workers: HashMap::new(),
                throughput: HashMap::new(),
                window: Vec::new(),
            }),
            config,
            port,
        }
    }

    pub async fn record_heartbeat(&self, worker_id: &str, current_task: Option<String>) {
        let mut inner = self.inner.lock().await;
        inner.workers.insert(
            worker_id.to_string(),
            WorkerStatus {
                worker_id: worker_id.to_string(),
                last_heartbeat: Utc::now(),
                current_task,
            },
        );
    }

    pub async fn record_outcome(&self, task_name: &str, failed: bool) {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        if !failed {
            *inner.throughput.entry(task_name.to_string()).or_insert(0) += 1;
        }
        inner.window.push(WindowEntry {
            at: now,
            task_name: task_name.to_string(),
            failed,
        });

        let cutoff = now - Duration::seconds(self.config.error_window_secs as i64);
        inner.window.retain(|entry| entry.at >= cutoff);

        let total = inner.window.len();
        let failures = inner.window.iter().filter(|e| e.failed).count();
        if total >= 10 && (failures as f64 / total as f64) > self.config.error_rate_threshold {
            self.port.emit(&HealthEvent {
                kind: "error_rate".to_string(),
                detail: format!("{failures}/{total} tasks failed within the window"),
                at: now,
            });
            // Reset so the event fires once per sustained burst
            inner.window.clear();
        }
    }

    pub async fn record_queue_pause(&self, queue: &str, depth: u64) {
        self.port.emit(&HealthEvent {
            kind: "queue_backpressure".to_string(),
            detail: format!("queue '{queue}' depth {depth} above high-water"),
            at: Utc::now(),
        });
    }

    pub async fn record_store_outage(&self, detail: &str) {
        self.port.emit(&HealthEvent {
            kind: "store_unavailable".to_string(),
            detail: detail.to_string(),
            at: Utc::now(),
        });
    }

    /// Aggregate the current picture from worker state, queue depths and
    /// active runs
    pub async fn snapshot(
        &self,
        queue: &dyn WorkQueue,
        sync_runs: &dyn SyncRunRepository,
    ) -> SupervisionSnapshot {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        let stalled_cutoff = now - Duration::seconds(self.config.stalled_after_secs);

        let active_workers = inner
            .workers
            .values()
            .filter(|w| w.last_heartbeat >= stalled_cutoff)
            .count();
        let stalled_workers = inner
            .workers
            .values()
            .filter(|w| w.last_heartbeat < stalled_cutoff && w.current_task.is_some())
            .count();

        let mut recent_errors: HashMap<String, u64> = HashMap::new();
        for entry in inner.window.iter().filter(|e| e.failed) {
            *recent_errors.entry(entry.task_name.clone()).or_insert(0) += 1;
        }

        SupervisionSnapshot {
            active_workers,
            stalled_workers,
            queue_depths: queue.depths().await.unwrap_or_default(),
            active_runs: sync_runs.list_active().await.map_or(0, |runs| runs.len()),
            throughput: inner.throughput.clone(),
            recent_errors,
            taken_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPort(AtomicUsize);

    impl ObservabilityPort for CountingPort {
        fn emit(&self, _event: &HealthEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn hub_with_port() -> (Arc<SupervisionHub>, Arc<CountingPort>) {
        let port = Arc::new(CountingPort(AtomicUsize::new(0)));
        let config = SupervisionConfig {
            error_window_secs: 300,
            error_rate_threshold: 0.5,
            stalled_after_secs: 180,
        };
        (Arc::new(SupervisionHub::new(config, port.clone())), port)
    }

    #[tokio::test]
    async fn error_rate_threshold_emits_once_per_burst() {
        let (hub, port) = hub_with_port();

        // 6 failures / 10 outcomes = 60% > 50%
        for i in 0..10 {
            hub.record_outcome("sync.products", i < 6).await;
        }
        assert_eq!(port.0.load(Ordering::SeqCst), 1);

        // Window was reset; a few more successes alone do not re-fire
        hub.record_outcome("sync.products", false).await;
        assert_eq!(port.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn snapshot_counts_workers() {
        let (hub, _) = hub_with_port();
        hub.record_heartbeat("w-1", Some("sync.products".to_string())).await;
        hub.record_heartbeat("w-2", None).await;

        let queue = crate::queue::InMemoryWorkQueue::new();
        let store = crate::infrastructure::persistence::memory::InMemoryStore::new();
        let snapshot = hub.snapshot(&queue, &store).await;

        assert_eq!(snapshot.active_workers, 2);
        assert_eq!(snapshot.stalled_workers, 0);
    }
}
