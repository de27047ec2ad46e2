//! Trigger scheduling (C10)
//!
//! Evaluates interval, cron and single-shot schedule entries and enqueues
//! the resulting work. At most one scheduler instance emits fires at a
//! time, enforced through a named leader lease in the persistence port;
//! non-leaders keep retrying acquisition. Fires missed during downtime are
//! coalesced into a single fire per entry.

pub mod cron;

pub use cron::{CronExpr, CronParseError};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::repositories::{LeaderLeaseRepository, ScheduleStateRepository};
use crate::queue::{EnqueueRequest, Priority, WatermarkGate, WorkQueue};

/// Lease name for the scheduler singleton
pub const SCHEDULER_LEASE: &str = "scheduler";

/// When an entry fires next
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScheduleKind {
    /// Fire every `period`, with up to `jitter` of randomization
    /// (`jitter <= period / 4`, clamped at construction)
    Interval {
        #[serde(with = "duration_secs")]
        period: Duration,
        #[serde(with = "duration_secs")]
        jitter: Duration,
    },
    /// Standard 5-field cron, evaluated at the given UTC offset
    Cron { expr: CronExpr, offset_secs: i32 },
    /// Single shot at a fixed instant
    Delayed { at: DateTime<Utc> },
}

mod duration_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl ScheduleKind {
    pub fn interval(period: Duration, jitter: Duration) -> Self {
        let max_jitter = period / 4;
        let jitter = if jitter > max_jitter {
            warn!(
                "Schedule jitter {:?} exceeds period/4, clamping to {:?}",
                jitter, max_jitter
            );
            max_jitter
        } else {
            jitter
        };
        Self::Interval { period, jitter }
    }

    pub fn cron(expr: &str, offset_secs: i32) -> Result<Self, CronParseError> {
        Ok(Self::Cron {
            expr: CronExpr::parse(expr)?,
            offset_secs,
        })
    }
}

/// A named schedule entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    pub kind: ScheduleKind,
    pub task_name: String,
    pub args: serde_json::Value,
    pub queue: String,
    pub priority: Priority,
    pub enabled: bool,
}

impl ScheduleEntry {
    pub fn new(name: impl Into<String>, kind: ScheduleKind, task_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            task_name: task_name.into(),
            args: serde_json::Value::Null,
            queue: crate::queue::QUEUE_DEFAULT.to_string(),
            priority: Priority::Normal,
            enabled: true,
        }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub lease_ttl_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            lease_ttl_secs: 30,
        }
    }
}

/// The trigger scheduler. Construct once per process and `run` it; only
/// the instance holding the leader lease emits fires.
pub struct Scheduler {
    entries: Vec<ScheduleEntry>,
    queue: Arc<dyn WorkQueue>,
    leases: Arc<dyn LeaderLeaseRepository>,
    schedule_state: Arc<dyn ScheduleStateRepository>,
    gates: Vec<Arc<WatermarkGate>>,
    holder_id: String,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        leases: Arc<dyn LeaderLeaseRepository>,
        schedule_state: Arc<dyn ScheduleStateRepository>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            entries: Vec::new(),
            queue,
            leases,
            schedule_state,
            gates: Vec::new(),
            holder_id: format!("scheduler-{}", uuid::Uuid::new_v4()),
            config,
        }
    }

    pub fn register(&mut self, entry: ScheduleEntry) {
        info!("Registered schedule '{}' -> task '{}'", entry.name, entry.task_name);
        self.entries.push(entry);
    }

    pub fn with_backpressure(&mut self, gate: Arc<WatermarkGate>) {
        self.gates.push(gate);
    }

    /// Run until cancelled. Keeps retrying leadership; ticks only as leader.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Scheduler loop starting (holder {})", self.holder_id);
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self
                .leases
                .try_acquire(SCHEDULER_LEASE, &self.holder_id, self.config.lease_ttl_secs)
                .await
            {
                Ok(Some(_token)) => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        warn!("Scheduler tick failed: {e:#}");
                    }
                }
                Ok(None) => {
                    debug!("Scheduler lease held elsewhere, standing by");
                }
                Err(e) => {
                    warn!("Leader lease acquisition failed: {e:#}");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        self.leases.release(SCHEDULER_LEASE, &self.holder_id).await.ok();
        info!("Scheduler loop stopped");
        Ok(())
    }

    /// Evaluate every entry once against `now` and fire the due ones.
    /// Exposed for tests; `run` calls this on each leader tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<u32> {
        let mut fired = 0;
        for entry in &self.entries {
            if !entry.enabled {
                continue;
            }
            let last_fire = self
                .schedule_state
                .last_fire(&entry.name)
                .await
                .with_context(|| format!("reading schedule state for '{}'", entry.name))?;

            if self.is_due(entry, last_fire, now).await? {
                if self.paused_by_backpressure(&entry.queue).await {
                    warn!(
                        "Schedule '{}' due but queue '{}' is above high-water, holding fire",
                        entry.name, entry.queue
                    );
                    continue;
                }
                self.fire(entry, now).await?;
                fired += 1;
            }
        }
        Ok(fired)
    }

    async fn is_due(
        &self,
        entry: &ScheduleEntry,
        last_fire: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let due = match &entry.kind {
            ScheduleKind::Interval { period, jitter } => {
                match last_fire {
                    Some(last) => {
                        let period = chrono::Duration::from_std(*period).unwrap_or(chrono::Duration::zero());
                        let jitter_ms = jitter.as_millis() as i64;
                        let offset_ms = if jitter_ms > 0 {
                            fastrand::i64(-jitter_ms..=jitter_ms)
                        } else {
                            0
                        };
                        now >= last + period + chrono::Duration::milliseconds(offset_ms)
                    }
                    // First evaluation sets the baseline; fire after one period
                    None => {
                        self.schedule_state.record_fire(&entry.name, now).await?;
                        false
                    }
                }
            }
            ScheduleKind::Cron { expr, offset_secs } => {
                let offset = FixedOffset::east_opt(*offset_secs)
                    .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset"));
                // Evaluate from the later of last fire and a bounded lookback
                // so that downtime across N occurrences coalesces into one.
                let reference = last_fire.unwrap_or(now - chrono::Duration::days(1));
                match expr.next_after(reference.with_timezone(&offset)) {
                    Some(next) => next.with_timezone(&Utc) <= now,
                    None => false,
                }
            }
            ScheduleKind::Delayed { at } => last_fire.is_none() && *at <= now,
        };
        Ok(due)
    }

    async fn fire(&self, entry: &ScheduleEntry, now: DateTime<Utc>) -> Result<()> {
        let request = EnqueueRequest::new(entry.task_name.clone(), entry.args.clone())
            .on_queue(entry.queue.clone())
            .with_priority(entry.priority);

        let work_id = self
            .queue
            .enqueue(request)
            .await
            .with_context(|| format!("enqueueing fire of schedule '{}'", entry.name))?;
        // Recording `now` (not the nominal occurrence) collapses every
        // occurrence missed during downtime into this single fire.
        self.schedule_state.record_fire(&entry.name, now).await?;

        info!(
            "Schedule '{}' fired -> {} on '{}' as {}",
            entry.name, entry.task_name, entry.queue, work_id
        );
        Ok(())
    }

    async fn paused_by_backpressure(&self, queue: &str) -> bool {
        for gate in &self.gates {
            if gate.queue() == queue {
                let depth = self.queue.depth(queue).await.unwrap_or(0);
                if gate.observe(depth) {
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::memory::InMemoryStore;
    use crate::queue::{InMemoryWorkQueue, QUEUE_DATA_SYNC};
    use serde_json::json;

    fn scheduler_with(entries: Vec<ScheduleEntry>) -> (Scheduler, Arc<InMemoryWorkQueue>) {
        let queue = Arc::new(InMemoryWorkQueue::new());
        let store = InMemoryStore::new().into_store();
        let mut scheduler = Scheduler::new(
            queue.clone(),
            store.leases.clone(),
            store.schedule_state.clone(),
            SchedulerConfig::default(),
        );
        for entry in entries {
            scheduler.register(entry);
        }
        (scheduler, queue)
    }

    #[tokio::test]
    async fn cron_downtime_coalesces_to_single_fire() {
        let entry = ScheduleEntry::new(
            "sync_products_daily",
            ScheduleKind::cron("0 2 * * *", 0).unwrap(),
            "sync.products",
        )
        .on_queue(QUEUE_DATA_SYNC)
        .with_args(json!({"operation": "scheduled"}));

        let (scheduler, queue) = scheduler_with(vec![entry]);

        // Last fire two days ago; scheduler was down across yesterday's
        // and today's occurrences. Fixed instant keeps the test hermetic.
        let now = chrono::TimeZone::with_ymd_and_hms(&Utc, 2026, 6, 1, 12, 0, 0).unwrap();
        scheduler
            .schedule_state
            .record_fire("sync_products_daily", now - chrono::Duration::days(2))
            .await
            .unwrap();

        let fired = scheduler.tick(now).await.unwrap();
        assert_eq!(fired, 1, "missed occurrences coalesce to one fire");
        assert_eq!(queue.depth(QUEUE_DATA_SYNC).await.unwrap(), 1);

        // Immediately after, nothing further is due
        let fired = scheduler.tick(now + chrono::Duration::minutes(1)).await.unwrap();
        assert_eq!(fired, 0);
    }

    #[tokio::test]
    async fn interval_fires_after_period() {
        let entry = ScheduleEntry::new(
            "heartbeat",
            ScheduleKind::interval(Duration::from_secs(600), Duration::ZERO),
            "sync.validate",
        );
        let (scheduler, queue) = scheduler_with(vec![entry]);

        let now = Utc::now();
        // First tick records the baseline, no fire
        assert_eq!(scheduler.tick(now).await.unwrap(), 0);
        // Within the period: still nothing
        assert_eq!(scheduler.tick(now + chrono::Duration::seconds(300)).await.unwrap(), 0);
        // One period later: fires
        assert_eq!(scheduler.tick(now + chrono::Duration::seconds(601)).await.unwrap(), 1);
        assert_eq!(queue.depth("default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delayed_is_single_shot() {
        let now = Utc::now();
        let entry = ScheduleEntry::new(
            "one-off",
            ScheduleKind::Delayed { at: now - chrono::Duration::seconds(5) },
            "batch.export",
        );
        let (scheduler, queue) = scheduler_with(vec![entry]);

        assert_eq!(scheduler.tick(now).await.unwrap(), 1);
        assert_eq!(scheduler.tick(now + chrono::Duration::seconds(10)).await.unwrap(), 0);
        assert_eq!(queue.depth("default").await.unwrap(), 1);
    }

    #[test]
    fn jitter_clamped_to_quarter_period() {
        let kind = ScheduleKind::interval(Duration::from_secs(100), Duration::from_secs(60));
        match kind {
            ScheduleKind::Interval { jitter, .. } => assert_eq!(jitter, Duration::from_secs(25)),
            _ => unreachable!(),
        }
    }
}
