//! Persistence port
//!
//! Trait definitions for every capability the core needs from the backing
//! store: entity upserts, version history, checkpoints, sync runs and the
//! scheduler leader lease. One concrete implementation backs production
//! (sqlite) and one backs tests (in-memory); both live in
//! `infrastructure::persistence`.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entities::{Product, ProductImage, Supplier, SyncStatus};
use crate::domain::sync_run::{SyncCounters, SyncRun, SyncRunStatus};
use crate::domain::version::{canonical_bytes, checksum_hex, EntityType, VersionRecord};

/// Outcome of an upsert, used by the coordinator for counters and events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// Row already matched the incoming canonical form
    Unchanged,
}

/// Filter for product listings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductFilter {
    pub text: Option<String>,
    pub category_id: Option<String>,
    pub supplier_source_id: Option<String>,
    pub status: Option<String>,
    pub sync_status: Option<String>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub rating_min: Option<f64>,
    pub include_deleted: bool,
    pub limit: i64,
    pub offset: i64,
}

#[async_trait]
pub trait ProductRepository: Send + Sync {
    async fn upsert(&self, product: &Product) -> Result<UpsertOutcome>;
    async fn find_by_source_id(&self, source_id: &str) -> Result<Option<Product>>;
    async fn list(&self, filter: &ProductFilter) -> Result<Vec<Product>>;
    async fn count(&self, filter: &ProductFilter) -> Result<i64>;
    async fn soft_delete(&self, source_id: &str) -> Result<bool>;
    async fn restore(&self, source_id: &str) -> Result<bool>;
    async fn set_sync_status(&self, source_id: &str, status: SyncStatus) -> Result<()>;
    /// Bump `last_sync_time` without touching `updated_at`
    async fn touch_last_sync(&self, source_id: &str, at: DateTime<Utc>) -> Result<()>;
    async fn set_canonical_of(&self, source_id: &str, master: Option<&str>) -> Result<()>;
}

#[async_trait]
pub trait SupplierRepository: Send + Sync {
    async fn upsert(&self, supplier: &Supplier) -> Result<UpsertOutcome>;
    async fn find_by_source_id(&self, source_id: &str) -> Result<Option<Supplier>>;
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Supplier>>;
    async fn soft_delete(&self, source_id: &str) -> Result<bool>;
    async fn restore(&self, source_id: &str) -> Result<bool>;
    /// Recompute the derived product counter for one supplier
    async fn refresh_product_count(&self, source_id: &str) -> Result<u32>;
    async fn set_canonical_of(&self, source_id: &str, master: Option<&str>) -> Result<()>;
}

#[async_trait]
pub trait ImageRepository: Send + Sync {
    /// Replace the image set of a product with the given rows, keyed by
    /// `(kind, order_index)`
    async fn replace_for_product(&self, product_source_id: &str, images: &[ProductImage]) -> Result<()>;
    async fn find_for_product(&self, product_source_id: &str) -> Result<Vec<ProductImage>>;
    async fn update(&self, image: &ProductImage) -> Result<()>;
    /// Object keys no longer referenced by any product image row
    async fn orphaned_object_keys(&self, known_keys: &[String]) -> Result<Vec<String>>;
}

#[async_trait]
pub trait VersionRepository: Send + Sync {
    /// Append a version row; `version_no` must be exactly latest + 1
    async fn append(&self, record: &VersionRecord) -> Result<()>;
    async fn latest(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<VersionRecord>>;
    async fn history(&self, entity_type: EntityType, entity_id: &str, limit: i64) -> Result<Vec<VersionRecord>>;
    /// Remove versions beyond `keep_count` per entity that are older than
    /// `older_than`; returns the number pruned
    async fn prune(&self, keep_count: u32, older_than: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait SyncRunRepository: Send + Sync {
    async fn create(&self, run: &SyncRun) -> Result<()>;
    async fn update(&self, run: &SyncRun) -> Result<()>;
    async fn find(&self, run_id: &str) -> Result<Option<SyncRun>>;
    async fn find_by_task(&self, task_id: &str) -> Result<Option<SyncRun>>;
    async fn list_active(&self) -> Result<Vec<SyncRun>>;
    async fn request_cancel(&self, run_id: &str) -> Result<bool>;
    async fn is_cancel_requested(&self, run_id: &str) -> Result<bool>;
    async fn set_status(&self, run_id: &str, status: SyncRunStatus) -> Result<()>;
}

/// Durable cursor plus counters permitting a task to resume after a crash.
/// Sequence numbers are dense per task; the checksum is validated on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: String,
    pub sequence_no: u32,
    pub created_at: DateTime<Utc>,
    /// Opaque cursor owned by the task handler
    pub cursor: Vec<u8>,
    pub counters: SyncCounters,
    pub checksum: String,
}

impl Checkpoint {
    pub fn new(task_id: impl Into<String>, sequence_no: u32, cursor: Vec<u8>, counters: SyncCounters) -> Self {
        let task_id = task_id.into();
        let checksum = Self::compute_checksum(&task_id, sequence_no, &cursor, &counters);
        Self {
            task_id,
            sequence_no,
            created_at: Utc::now(),
            cursor,
            counters,
            checksum,
        }
    }

    fn compute_checksum(task_id: &str, sequence_no: u32, cursor: &[u8], counters: &SyncCounters) -> String {
        let mut bytes = Vec::with_capacity(cursor.len() + 64);
        bytes.extend_from_slice(task_id.as_bytes());
        bytes.extend_from_slice(&sequence_no.to_be_bytes());
        bytes.extend_from_slice(cursor);
        bytes.extend_from_slice(&canonical_bytes(&serde_json::to_value(counters).unwrap_or_default()));
        checksum_hex(&bytes)
    }

    pub fn checksum_valid(&self) -> bool {
        Self::compute_checksum(&self.task_id, self.sequence_no, &self.cursor, &self.counters) == self.checksum
    }
}

#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
    async fn load_latest(&self, task_id: &str) -> Result<Option<Checkpoint>>;
    async fn delete_for_task(&self, task_id: &str) -> Result<()>;
    /// Drop checkpoints past the audit retention window
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Named lease row for leader election (scheduler singleton)
#[async_trait]
pub trait LeaderLeaseRepository: Send + Sync {
    /// Try to acquire or renew the named lease for `holder`. Returns the
    /// fencing token when this holder owns the lease after the call.
    async fn try_acquire(&self, name: &str, holder: &str, ttl_secs: i64) -> Result<Option<u64>>;
    async fn release(&self, name: &str, holder: &str) -> Result<()>;
    async fn current_holder(&self, name: &str) -> Result<Option<String>>;
}

/// Persisted schedule entry state (last fire bookkeeping for coalescing)
#[async_trait]
pub trait ScheduleStateRepository: Send + Sync {
    async fn last_fire(&self, name: &str) -> Result<Option<DateTime<Utc>>>;
    async fn record_fire(&self, name: &str, at: DateTime<Utc>) -> Result<()>;
}

/// The full capability bundle handed to components that need the store.
/// Concrete stores implement every trait; this keeps wiring to one value.
#[derive(Clone)]
pub struct Store {
    pub products: Arc<dyn ProductRepository>,
    pub suppliers: Arc<dyn SupplierRepository>,
    pub images: Arc<dyn ImageRepository>,
    pub versions: Arc<dyn VersionRepository>,
    pub sync_runs: Arc<dyn SyncRunRepository>,
    pub checkpoints: Arc<dyn CheckpointRepository>,
    pub leases: Arc<dyn LeaderLeaseRepository>,
    pub schedule_state: Arc<dyn ScheduleStateRepository>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_checksum_detects_corruption() {
        let counters = SyncCounters { total: 10, processed: 7, success: 7, ..Default::default() };
        let mut checkpoint = Checkpoint::new("task-1", 3, b"page=7".to_vec(), counters);
        assert!(checkpoint.checksum_valid());

        checkpoint.cursor = b"page=9".to_vec();
        assert!(!checkpoint.checksum_valid());
    }
}
