//! Sync run state management
//!
//! A `SyncRun` is one operator-visible execution of a data-sync pipeline
//! over a source filter. Runs move through a strict state machine
//! (pending → running → {completed, failed, cancelled}); retry never
//! reverses a terminal state, it creates a new run referencing the prior.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How the run was initiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Full,
    Incremental,
    Manual,
    Scheduled,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
        }
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            "manual" => Ok(Self::Manual),
            "scheduled" => Ok(Self::Scheduled),
            other => Err(format!("unknown operation type: {other}")),
        }
    }
}

/// Which entity family the run synchronizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Product,
    Supplier,
    Image,
    All,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Product => "product",
            Self::Supplier => "supplier",
            Self::Image => "image",
            Self::All => "all",
        }
    }
}

impl FromStr for SyncType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "product" => Ok(Self::Product),
            "supplier" => Ok(Self::Supplier),
            "image" => Ok(Self::Image),
            "all" => Ok(Self::All),
            other => Err(format!("unknown sync type: {other}")),
        }
    }
}

/// Run state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal transition. Reverse transitions
    /// and transitions out of a terminal state are rejected.
    pub fn can_transition_to(&self, next: SyncRunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, SyncRunStatus::Running)
                | (Self::Pending, SyncRunStatus::Cancelled)
                | (Self::Running, SyncRunStatus::Completed)
                | (Self::Running, SyncRunStatus::Failed)
                | (Self::Running, SyncRunStatus::Cancelled)
        )
    }
}

impl FromStr for SyncRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Item counters for a run. `processed` is always the sum of the three
/// outcome counters; callers go through the record_* methods to keep it so.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounters {
    pub total: u64,
    pub processed: u64,
    pub success: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl SyncCounters {
    pub fn record_success(&mut self, n: u64) {
        self.success += n;
        self.processed += n;
    }

    pub fn record_failure(&mut self, n: u64) {
        self.failed += n;
        self.processed += n;
    }

    pub fn record_skipped(&mut self, n: u64) {
        self.skipped += n;
        self.processed += n;
    }

    pub fn merge(&mut self, other: &SyncCounters) {
        self.total = self.total.max(other.total);
        self.success += other.success;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.processed += other.processed;
    }

    /// Failure ratio over processed items, 0.0 when nothing processed yet
    pub fn failure_ratio(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.failed as f64 / self.processed as f64
        }
    }

    pub fn progress_percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let pct = (self.processed as f64 / self.total as f64) * 100.0;
        pct.min(100.0) as u8
    }
}

/// One operator-visible execution of a sync pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub run_id: String,
    /// Queue work id of the driver task, once leased
    pub task_id: Option<String>,
    pub task_name: String,
    pub operation_type: OperationType,
    pub sync_type: SyncType,
    pub status: SyncRunStatus,
    /// Progress in percent [0..100]
    pub progress: u8,
    pub counters: SyncCounters,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Top error codes with occurrence counts
    pub error_digest: HashMap<String, u64>,
    /// Source filter and worker configuration captured at creation time
    pub config_snapshot: serde_json::Value,
    pub recommendations: Vec<String>,
    pub cancel_requested: bool,
    /// Run this one retries, if any
    pub retry_of: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SyncRun {
    pub fn new(task_name: impl Into<String>, operation_type: OperationType, sync_type: SyncType) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            task_id: None,
            task_name: task_name.into(),
            operation_type,
            sync_type,
            status: SyncRunStatus::Pending,
            progress: 0,
            counters: SyncCounters::default(),
            started_at: None,
            finished_at: None,
            error_digest: HashMap::new(),
            config_snapshot: serde_json::Value::Null,
            recommendations: Vec::new(),
            cancel_requested: false,
            retry_of: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config_snapshot = config;
        self
    }

    /// Apply a state transition, enforcing the FSM. Terminal transitions
    /// stamp `finished_at`; entering `Running` stamps `started_at`.
    pub fn transition(&mut self, next: SyncRunStatus) -> Result<(), IllegalTransition> {
        if !self.status.can_transition_to(next) {
            return Err(IllegalTransition { from: self.status, to: next });
        }
        match next {
            SyncRunStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn record_error_code(&mut self, code: &str) {
        *self.error_digest.entry(code.to_string()).or_insert(0) += 1;
    }

    /// Duration between start and finish, if both are known
    pub fn duration_secs(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }

    /// Build the follow-up run for a retry request
    pub fn retry_run(&self) -> SyncRun {
        let mut next = SyncRun::new(self.task_name.clone(), self.operation_type, self.sync_type);
        next.config_snapshot = self.config_snapshot.clone();
        next.retry_of = Some(self.run_id.clone());
        next
    }
}

/// Rejected state transition on a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal sync run transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: SyncRunStatus,
    pub to: SyncRunStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_stay_consistent() {
        let mut counters = SyncCounters { total: 10, ..Default::default() };
        counters.record_success(7);
        counters.record_failure(2);
        counters.record_skipped(1);

        assert_eq!(counters.processed, counters.success + counters.failed + counters.skipped);
        assert_eq!(counters.progress_percent(), 100);
    }

    #[test]
    fn fsm_rejects_reverse_transitions() {
        let mut run = SyncRun::new("sync.products", OperationType::Manual, SyncType::Product);
        run.transition(SyncRunStatus::Running).unwrap();
        run.transition(SyncRunStatus::Completed).unwrap();

        assert!(run.transition(SyncRunStatus::Running).is_err());
        assert!(run.transition(SyncRunStatus::Pending).is_err());
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn pending_can_be_cancelled_directly() {
        let mut run = SyncRun::new("sync.products", OperationType::Manual, SyncType::Product);
        run.transition(SyncRunStatus::Cancelled).unwrap();
        assert!(run.status.is_terminal());
    }

    #[test]
    fn retry_references_prior_run() {
        let mut run = SyncRun::new("sync.products", OperationType::Manual, SyncType::Product);
        run.transition(SyncRunStatus::Running).unwrap();
        run.transition(SyncRunStatus::Failed).unwrap();

        let retry = run.retry_run();
        assert_eq!(retry.retry_of.as_deref(), Some(run.run_id.as_str()));
        assert_eq!(retry.status, SyncRunStatus::Pending);
    }
}
