//! Work item types for the durable queue

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for queued work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(Uuid);

impl WorkId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn inner(&self) -> Uuid {
        self.0
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Dispatch priority. Within a queue, strictly higher priority wins; ties
/// break by earliest eligibility, then insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Numeric level stored in the queue table
    pub fn level(&self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Normal => 5,
            Self::High => 8,
            Self::Urgent => 10,
        }
    }

    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            0 => Some(Self::Low),
            5 => Some(Self::Normal),
            8 => Some(Self::High),
            10 => Some(Self::Urgent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Live lease over a work item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkLease {
    pub token: Uuid,
    pub worker_id: String,
    pub deadline: DateTime<Utc>,
}

impl WorkLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline <= now
    }
}

/// A work item in the durable queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedWork {
    pub work_id: WorkId,
    pub task_name: String,
    pub args: serde_json::Value,
    pub queue: String,
    pub priority: Priority,
    /// Monotonic attempt counter, bumped on every nack
    pub attempt_no: u32,
    pub not_before: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub lease: Option<WorkLease>,
    pub last_error: Option<String>,
}

impl QueuedWork {
    /// Eligible for leasing: no live lease and past `not_before`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && self.lease.as_ref().map_or(true, |l| l.is_expired(now))
    }
}

/// A work item together with the lease the worker holds over it
#[derive(Debug, Clone)]
pub struct LeasedWork {
    pub work: QueuedWork,
    pub lease_token: Uuid,
    pub lease_deadline: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_levels_match_spec() {
        assert_eq!(Priority::Low.level(), 0);
        assert_eq!(Priority::Normal.level(), 5);
        assert_eq!(Priority::High.level(), 8);
        assert_eq!(Priority::Urgent.level(), 10);
        assert!(Priority::Urgent > Priority::High);
        assert_eq!(Priority::from_level(8), Some(Priority::High));
        assert_eq!(Priority::from_level(3), None);
    }

    #[test]
    fn readiness_accounts_for_lease_expiry() {
        let now = Utc::now();
        let mut work = QueuedWork {
            work_id: WorkId::new(),
            task_name: "sync.products".to_string(),
            args: serde_json::Value::Null,
            queue: "data_sync".to_string(),
            priority: Priority::Normal,
            attempt_no: 0,
            not_before: now - chrono::Duration::seconds(1),
            enqueued_at: now,
            lease: None,
            last_error: None,
        };
        assert!(work.is_ready(now));

        work.lease = Some(WorkLease {
            token: Uuid::new_v4(),
            worker_id: "w-1".to_string(),
            deadline: now + chrono::Duration::seconds(30),
        });
        assert!(!work.is_ready(now));

        work.lease.as_mut().unwrap().deadline = now - chrono::Duration::seconds(1);
        assert!(work.is_ready(now));
    }
}
