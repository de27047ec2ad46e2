//! In-memory store
//!
//! Implements every persistence port over locked hash maps. State lives as
//! long as the process; the integration tests and single-process demo runs
//! use this store.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::entities::{Product, ProductImage, Supplier, SyncStatus};
use crate::domain::repositories::{
    Checkpoint, CheckpointRepository, ImageRepository, LeaderLeaseRepository, ProductFilter,
    ProductRepository, ScheduleStateRepository, Store, SupplierRepository, SyncRunRepository,
    UpsertOutcome, VersionRepository,
};
use crate::domain::sync_run::{SyncRun, SyncRunStatus};
use crate::domain::version::{EntityType, VersionRecord};

#[derive(Default)]
struct LeaseRow {
    holder: String,
    expires_at: DateTime<Utc>,
    fencing_token: u64,
}

#[derive(Default)]
struct State {
    products: HashMap<String, Product>,
    suppliers: HashMap<String, Supplier>,
    images: HashMap<String, Vec<ProductImage>>,
    versions: HashMap<(EntityType, String), Vec<VersionRecord>>,
    sync_runs: HashMap<String, SyncRun>,
    checkpoints: HashMap<String, Vec<Checkpoint>>,
    leases: HashMap<String, LeaseRow>,
    schedule_fires: HashMap<String, DateTime<Utc>>,
}

/// Process-local implementation of the persistence port
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle this store into the capability set the components consume
    pub fn into_store(self) -> Store {
        let shared = Arc::new(self);
        Store {
            products: shared.clone(),
            suppliers: shared.clone(),
            images: shared.clone(),
            versions: shared.clone(),
            sync_runs: shared.clone(),
            checkpoints: shared.clone(),
            leases: shared.clone(),
            schedule_state: shared,
        }
    }
}

fn matches_filter(product: &Product, filter: &ProductFilter) -> bool {
    if !filter.include_deleted && product.is_deleted() {
        return false;
    }
    if let Some(text) = &filter.text {
        let needle = text.to_lowercase();
        let haystack = format!(
            "{} {} {}",
            product.title.to_lowercase(),
            product.subtitle.as_deref().unwrap_or("").to_lowercase(),
            product.description.as_deref().unwrap_or("").to_lowercase()
        );
        if !haystack.contains(&needle) {
            return false;
        }
    }
    if let Some(category) = &filter.category_id {
        if product.category_id.as_deref() != Some(category.as_str()) {
            return false;
        }
    }
    if let Some(supplier) = &filter.supplier_source_id {
        if product.supplier_source_id.as_deref() != Some(supplier.as_str()) {
            return false;
        }
    }
    if let Some(status) = &filter.status {
        if product.status.as_str() != status {
            return false;
        }
    }
    if let Some(sync_status) = &filter.sync_status {
        if product.sync_status.as_str() != sync_status {
            return false;
        }
    }
    if let Some(min) = filter.price_min {
        if product.price_max.map_or(true, |p| p < min) {
            return false;
        }
    }
    if let Some(max) = filter.price_max {
        if product.price_min.map_or(true, |p| p > max) {
            return false;
        }
    }
    if let Some(rating_min) = filter.rating_min {
        if product.rating.map_or(true, |r| r < rating_min) {
            return false;
        }
    }
    true
}

#[async_trait]
impl ProductRepository for InMemoryStore {
    async fn upsert(&self, product: &Product) -> Result<UpsertOutcome> {
        let mut state = self.state.write().await;
        match state.products.get(&product.source_id) {
            Some(existing) => {
                if existing.canonical_snapshot() == product.canonical_snapshot() {
                    return Ok(UpsertOutcome::Unchanged);
                }
                let mut updated = product.clone();
                updated.created_at = existing.created_at;
                updated.updated_at = Utc::now();
                state.products.insert(product.source_id.clone(), updated);
                Ok(UpsertOutcome::Updated)
            }
            None => {
                state.products.insert(product.source_id.clone(), product.clone());
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn find_by_source_id(&self, source_id: &str) -> Result<Option<Product>> {
        Ok(self.state.read().await.products.get(source_id).cloned())
    }

    async fn list(&self, filter: &ProductFilter) -> Result<Vec<Product>> {
        let state = self.state.read().await;
        let mut products: Vec<Product> = state
            .products
            .values()
            .filter(|p| matches_filter(p, filter))
            .cloned()
            .collect();
        products.sort_by(|a, b| a.source_id.cmp(&b.source_id));

        let offset = filter.offset.max(0) as usize;
        let limit = if filter.limit <= 0 { usize::MAX } else { filter.limit as usize };
        Ok(products.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&self, filter: &ProductFilter) -> Result<i64> {
        let state = self.state.read().await;
        Ok(state.products.values().filter(|p| matches_filter(p, filter)).count() as i64)
    }

    async fn soft_delete(&self, source_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.products.get_mut(source_id) {
            Some(product) if !product.is_deleted() => {
                product.deleted_at = Some(Utc::now());
                product.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn restore(&self, source_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.products.get_mut(source_id) {
            Some(product) if product.is_deleted() => {
                product.deleted_at = None;
                product.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_sync_status(&self, source_id: &str, status: SyncStatus) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(product) = state.products.get_mut(source_id) {
            product.sync_status = status;
        }
        Ok(())
    }

    async fn touch_last_sync(&self, source_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(product) = state.products.get_mut(source_id) {
            product.last_sync_time = Some(at);
        }
        Ok(())
    }

    async fn set_canonical_of(&self, source_id: &str, master: Option<&str>) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(product) = state.products.get_mut(source_id) {
            product.canonical_of = master.map(|m| m.to_string());
            product.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl SupplierRepository for InMemoryStore {
    async fn upsert(&self, supplier: &Supplier) -> Result<UpsertOutcome> {
        let mut state = self.state.write().await;
        match state.suppliers.get(&supplier.source_id) {
            Some(existing) => {
                if existing.canonical_snapshot() == supplier.canonical_snapshot() {
                    return Ok(UpsertOutcome::Unchanged);
                }
                let mut updated = supplier.clone();
                updated.created_at = existing.created_at;
                updated.updated_at = Utc::now();
                // product_count is derived, never authored by callers
                updated.product_count = existing.product_count;
                state.suppliers.insert(supplier.source_id.clone(), updated);
                Ok(UpsertOutcome::Updated)
            }
            None => {
                let mut created = supplier.clone();
                created.product_count = 0;
                state.suppliers.insert(supplier.source_id.clone(), created);
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn find_by_source_id(&self, source_id: &str) -> Result<Option<Supplier>> {
        Ok(self.state.read().await.suppliers.get(source_id).cloned())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Supplier>> {
        let state = self.state.read().await;
        let mut suppliers: Vec<Supplier> = state.suppliers.values().cloned().collect();
        suppliers.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        let limit = if limit <= 0 { usize::MAX } else { limit as usize };
        Ok(suppliers.into_iter().skip(offset.max(0) as usize).take(limit).collect())
    }

    async fn soft_delete(&self, source_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.suppliers.get_mut(source_id) {
            Some(supplier) if !supplier.is_deleted() => {
                supplier.deleted_at = Some(Utc::now());
                supplier.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn restore(&self, source_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.suppliers.get_mut(source_id) {
            Some(supplier) if supplier.is_deleted() => {
                supplier.deleted_at = None;
                supplier.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn refresh_product_count(&self, source_id: &str) -> Result<u32> {
        let mut state = self.state.write().await;
        let count = state
            .products
            .values()
            .filter(|p| p.supplier_source_id.as_deref() == Some(source_id) && !p.is_deleted())
            .count() as u32;
        if let Some(supplier) = state.suppliers.get_mut(source_id) {
            supplier.product_count = count;
        }
        Ok(count)
    }

    async fn set_canonical_of(&self, source_id: &str, master: Option<&str>) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(supplier) = state.suppliers.get_mut(source_id) {
            supplier.canonical_of = master.map(|m| m.to_string());
            supplier.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl ImageRepository for InMemoryStore {
    async fn replace_for_product(&self, product_source_id: &str, images: &[ProductImage]) -> Result<()> {
        let main_count = images.iter().filter(|i| i.kind == crate::domain::entities::ImageKind::Main).count();
        if main_count > 1 {
            bail!("product {product_source_id} would have {main_count} main images");
        }
        let mut state = self.state.write().await;
        state.images.insert(product_source_id.to_string(), images.to_vec());
        Ok(())
    }

    async fn find_for_product(&self, product_source_id: &str) -> Result<Vec<ProductImage>> {
        Ok(self
            .state
            .read()
            .await
            .images
            .get(product_source_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update(&self, image: &ProductImage) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(images) = state.images.get_mut(&image.product_source_id) {
            for slot in images.iter_mut() {
                if slot.kind == image.kind && slot.order_index == image.order_index {
                    *slot = image.clone();
                    return Ok(());
                }
            }
        }
        bail!(
            "image ({}, {:?}, {}) not found",
            image.product_source_id,
            image.kind,
            image.order_index
        )
    }

    async fn orphaned_object_keys(&self, known_keys: &[String]) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let referenced: std::collections::HashSet<&str> = state
            .images
            .values()
            .flatten()
            .filter_map(|i| i.object_key.as_deref())
            .collect();
        Ok(known_keys
            .iter()
            .filter(|key| !referenced.contains(key.as_str()))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl VersionRepository for InMemoryStore {
    async fn append(&self, record: &VersionRecord) -> Result<()> {
        let mut state = self.state.write().await;
        let key = (record.entity_type, record.entity_id.clone());
        let versions = state.versions.entry(key).or_default();

        let expected = versions.last().map_or(1, |v| v.version_no + 1);
        if record.version_no != expected {
            bail!(
                "version gap for {}:{} (expected {}, got {})",
                record.entity_type.as_str(),
                record.entity_id,
                expected,
                record.version_no
            );
        }
        versions.push(record.clone());
        Ok(())
    }

    async fn latest(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<VersionRecord>> {
        let state = self.state.read().await;
        Ok(state
            .versions
            .get(&(entity_type, entity_id.to_string()))
            .and_then(|v| v.last().cloned()))
    }

    async fn history(&self, entity_type: EntityType, entity_id: &str, limit: i64) -> Result<Vec<VersionRecord>> {
        let state = self.state.read().await;
        let versions = state
            .versions
            .get(&(entity_type, entity_id.to_string()))
            .cloned()
            .unwrap_or_default();
        let limit = if limit <= 0 { usize::MAX } else { limit as usize };
        Ok(versions.into_iter().rev().take(limit).collect())
    }

    async fn prune(&self, keep_count: u32, older_than: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut pruned = 0u64;
        for versions in state.versions.values_mut() {
            while versions.len() > keep_count as usize
                && versions.first().map_or(false, |v| v.created_at < older_than)
            {
                versions.remove(0);
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

#[async_trait]
impl SyncRunRepository for InMemoryStore {
    async fn create(&self, run: &SyncRun) -> Result<()> {
        let mut state = self.state.write().await;
        state.sync_runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn update(&self, run: &SyncRun) -> Result<()> {
        let mut state = self.state.write().await;
        // Cancellation flags survive concurrent run snapshots being written back
        let cancel_requested = state
            .sync_runs
            .get(&run.run_id)
            .map_or(false, |existing| existing.cancel_requested);
        let mut updated = run.clone();
        updated.cancel_requested = updated.cancel_requested || cancel_requested;
        state.sync_runs.insert(run.run_id.clone(), updated);
        Ok(())
    }

    async fn find(&self, run_id: &str) -> Result<Option<SyncRun>> {
        Ok(self.state.read().await.sync_runs.get(run_id).cloned())
    }

    async fn find_by_task(&self, task_id: &str) -> Result<Option<SyncRun>> {
        let state = self.state.read().await;
        Ok(state
            .sync_runs
            .values()
            .find(|run| run.task_id.as_deref() == Some(task_id))
            .cloned())
    }

    async fn list_active(&self) -> Result<Vec<SyncRun>> {
        let state = self.state.read().await;
        Ok(state
            .sync_runs
            .values()
            .filter(|run| !run.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn request_cancel(&self, run_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.sync_runs.get_mut(run_id) {
            Some(run) if !run.status.is_terminal() => {
                run.cancel_requested = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_cancel_requested(&self, run_id: &str) -> Result<bool> {
        Ok(self
            .state
            .read()
            .await
            .sync_runs
            .get(run_id)
            .map_or(false, |run| run.cancel_requested))
    }

    async fn set_status(&self, run_id: &str, status: SyncRunStatus) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(run) = state.sync_runs.get_mut(run_id) {
            run.transition(status)?;
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointRepository for InMemoryStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut state = self.state.write().await;
        let checkpoints = state.checkpoints.entry(checkpoint.task_id.clone()).or_default();
        let expected = checkpoints.last().map_or(1, |c| c.sequence_no + 1);
        if checkpoint.sequence_no != expected {
            bail!(
                "checkpoint sequence gap for {} (expected {}, got {})",
                checkpoint.task_id,
                expected,
                checkpoint.sequence_no
            );
        }
        checkpoints.push(checkpoint.clone());
        Ok(())
    }

    async fn load_latest(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .state
            .read()
            .await
            .checkpoints
            .get(task_id)
            .and_then(|c| c.last().cloned()))
    }

    async fn delete_for_task(&self, task_id: &str) -> Result<()> {
        self.state.write().await.checkpoints.remove(task_id);
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut removed = 0u64;
        state.checkpoints.retain(|_, checkpoints| {
            let keep = checkpoints.last().map_or(false, |c| c.created_at >= cutoff);
            if !keep {
                removed += checkpoints.len() as u64;
            }
            keep
        });
        Ok(removed)
    }
}

#[async_trait]
impl LeaderLeaseRepository for InMemoryStore {
    async fn try_acquire(&self, name: &str, holder: &str, ttl_secs: i64) -> Result<Option<u64>> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let row = state.leases.entry(name.to_string()).or_default();

        if row.holder.is_empty() || row.holder == holder || row.expires_at <= now {
            if row.holder != holder {
                row.fencing_token += 1;
            }
            row.holder = holder.to_string();
            row.expires_at = now + chrono::Duration::seconds(ttl_secs);
            Ok(Some(row.fencing_token))
        } else {
            Ok(None)
        }
    }

    async fn release(&self, name: &str, holder: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(row) = state.leases.get_mut(name) {
            if row.holder == holder {
                row.holder.clear();
                row.expires_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn current_holder(&self, name: &str) -> Result<Option<String>> {
        let state = self.state.read().await;
        Ok(state.leases.get(name).and_then(|row| {
            (!row.holder.is_empty() && row.expires_at > Utc::now()).then(|| row.holder.clone())
        }))
    }
}

#[async_trait]
impl ScheduleStateRepository for InMemoryStore {
    async fn last_fire(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state.read().await.schedule_fires.get(name).copied())
    }

    async fn record_fire(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        self.state.write().await.schedule_fires.insert(name.to_string(), at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::version::{canonical_bytes, checksum_hex, ChangeKind};

    #[tokio::test]
    async fn product_upsert_outcomes() {
        let store = InMemoryStore::new();
        let mut product = Product::new("p-1", "红苹果 500g");

        assert_eq!(ProductRepository::upsert(&store, &product).await.unwrap(), UpsertOutcome::Created);
        assert_eq!(ProductRepository::upsert(&store, &product).await.unwrap(), UpsertOutcome::Unchanged);

        product.sales_count = 10;
        assert_eq!(ProductRepository::upsert(&store, &product).await.unwrap(), UpsertOutcome::Updated);
    }

    #[tokio::test]
    async fn version_numbers_must_be_dense() {
        let store = InMemoryStore::new();
        let snapshot = serde_json::json!({"title": "x"});
        let record = |no: u32| VersionRecord {
            entity_type: EntityType::Product,
            entity_id: "p-1".to_string(),
            version_no: no,
            change_kind: ChangeKind::Update,
            author: "system".to_string(),
            created_at: Utc::now(),
            checksum: checksum_hex(&canonical_bytes(&snapshot)),
            snapshot: snapshot.clone(),
            diff: Vec::new(),
        };

        store.append(&record(1)).await.unwrap();
        assert!(store.append(&record(3)).await.is_err());
        store.append(&record(2)).await.unwrap();
    }

    #[tokio::test]
    async fn leader_lease_excludes_second_holder() {
        let store = InMemoryStore::new();
        assert!(store.try_acquire("scheduler", "a", 60).await.unwrap().is_some());
        assert!(store.try_acquire("scheduler", "b", 60).await.unwrap().is_none());
        // Renewal by the owner works
        assert!(store.try_acquire("scheduler", "a", 60).await.unwrap().is_some());

        store.release("scheduler", "a").await.unwrap();
        assert!(store.try_acquire("scheduler", "b", 60).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn product_count_is_derived() {
        let store = InMemoryStore::new();
        let mut supplier = Supplier::new("s-1", "烟台果业");
        supplier.product_count = 42; // authored value must be ignored
        SupplierRepository::upsert(&store, &supplier).await.unwrap();

        let mut product = Product::new("p-1", "苹果");
        product.supplier_source_id = Some("s-1".to_string());
        ProductRepository::upsert(&store, &product).await.unwrap();

        assert_eq!(store.refresh_product_count("s-1").await.unwrap(), 1);
        let stored = SupplierRepository::find_by_source_id(&store, "s-1").await.unwrap().unwrap();
        assert_eq!(stored.product_count, 1);
    }
}
