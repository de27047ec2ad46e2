//! Event types for real-time progress reporting
//!
//! The event hub fans these out to subscribers (push surface, supervision).
//! Every event carries a monotonic per-task sequence number so clients can
//! reconnect and replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::sync_run::SyncCounters;

/// Subscription channels of the push surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventChannel {
    SyncProgress,
    SyncCompleted,
    SyncFailed,
    NewProduct,
    ProductUpdated,
    SystemStatus,
}

impl EventChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SyncProgress => "sync_progress",
            Self::SyncCompleted => "sync_completed",
            Self::SyncFailed => "sync_failed",
            Self::NewProduct => "new_product",
            Self::ProductUpdated => "product_updated",
            Self::SystemStatus => "system_status",
        }
    }
}

/// One event on the push surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub channel: EventChannel,
    /// Task or run the event belongs to; empty for system-wide events
    pub task_id: String,
    /// Monotonic per-task sequence, assigned by the hub
    pub sequence: u64,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

/// Channel-specific payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Progress {
        percent: u8,
        message: String,
        counters: SyncCounters,
    },
    Completed {
        counters: SyncCounters,
        duration_secs: i64,
    },
    Failed {
        error_code: String,
        message: String,
        counters: SyncCounters,
    },
    EntityChanged {
        entity_ids: Vec<String>,
        version_no: Option<u32>,
    },
    SystemStatus {
        healthy: bool,
        detail: String,
    },
}
