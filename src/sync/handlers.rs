//! Registered task handlers
//!
//! Every symbolic task name the workers can execute, registered through
//! `register_all`. Handlers are idempotent under at-least-once delivery:
//! upserts key on source_id, image stores are content-addressed, and page
//! cursors live in checkpoints.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use image::imageops::FilterType;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::coordinator::SyncCoordinator;
use super::source::SourceFilter;
use crate::data_processing::validator::has_blocking;
use crate::domain::entities::{ImageKind, ImageStatus, ProductStatus, SyncStatus};
use crate::domain::repositories::{
    CheckpointRepository, ImageRepository, ProductFilter, ProductRepository, SupplierRepository,
    SyncRunRepository, VersionRepository,
};
use crate::domain::sync_run::{OperationType, SyncRun, SyncType};
use crate::domain::version::{ChangeKind, EntityType};
use crate::infrastructure::extraction::RawProduct;
use crate::infrastructure::http_client::FetchRequest;
use crate::infrastructure::image_storage::{extension_for, ImageStorage};
use crate::queue::{EnqueueRequest, Priority, WorkQueue, QUEUE_CRAWLER, QUEUE_DATA_SYNC, QUEUE_IMAGE};
use crate::worker::context::TaskContext;
use crate::worker::registry::{TaskHandler, TaskRegistry};
use crate::worker::retry::TaskError;

/// Shared dependencies for every handler
pub struct HandlerDeps {
    pub coordinator: Arc<SyncCoordinator>,
    pub storage: ImageStorage,
    pub checkpoint_retention_days: i64,
    pub version_keep_count: u32,
    pub version_retention_days: i64,
    pub export_dir: std::path::PathBuf,
}

/// Register all task handlers into the registry
pub fn register_all(registry: &mut TaskRegistry, deps: Arc<HandlerDeps>) {
    registry.register("crawl.fetch_products", Arc::new(FetchProducts { deps: deps.clone() }));
    registry.register("crawl.fetch_product_details", Arc::new(FetchProductDetails { deps: deps.clone() }));
    registry.register("crawl.fetch_suppliers", Arc::new(FetchSuppliers { deps: deps.clone() }));
    registry.register("crawl.sync_category", Arc::new(SyncCategory { deps: deps.clone() }));
    registry.register("image.download", Arc::new(ImageDownload { deps: deps.clone() }));
    registry.register("image.resize", Arc::new(ImageResize { deps: deps.clone() }));
    registry.register("image.optimize", Arc::new(ImageOptimize { deps: deps.clone() }));
    registry.register("image.thumbnail", Arc::new(ImageThumbnail { deps: deps.clone() }));
    registry.register("sync.products", Arc::new(SyncProducts { deps: deps.clone() }));
    registry.register("sync.suppliers", Arc::new(SyncSuppliers { deps: deps.clone() }));
    registry.register("sync.validate", Arc::new(SyncValidate { deps: deps.clone() }));
    registry.register("sync.cleanup_duplicates", Arc::new(CleanupDuplicates { deps: deps.clone() }));
    registry.register("batch.import", Arc::new(BatchImport { deps: deps.clone() }));
    registry.register("batch.export", Arc::new(BatchExport { deps: deps.clone() }));
    registry.register("batch.update", Arc::new(BatchUpdate { deps: deps.clone() }));
    registry.register("batch.delete", Arc::new(BatchDelete { deps }));
}

fn arg_str(args: &Value, key: &str) -> Result<String, TaskError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TaskError::permanent("BadRequest", format!("missing string arg '{key}'")))
}

fn arg_str_opt(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(str::to_string)
}

fn arg_u64(args: &Value, key: &str, default: u64) -> u64 {
    args.get(key).and_then(Value::as_u64).unwrap_or(default)
}

fn filter_from_args(args: &Value) -> SourceFilter {
    SourceFilter {
        category: arg_str_opt(args, "category"),
        keyword: arg_str_opt(args, "keyword"),
        date_from: arg_str_opt(args, "date_from"),
        date_to: arg_str_opt(args, "date_to"),
        limit: arg_u64(args, "limit", 0),
    }
}

// ---------------------------------------------------------------
// crawl.*
// ---------------------------------------------------------------

/// Fetch one listing page and fan out per-product detail work
struct FetchProducts {
    deps: Arc<HandlerDeps>,
}

#[async_trait]
impl TaskHandler for FetchProducts {
    async fn run(&self, args: Value, ctx: TaskContext) -> Result<Value, TaskError> {
        let coordinator = &self.deps.coordinator;
        let filter = filter_from_args(&args);
        let page = arg_u64(&args, "page", 1) as u32;

        let url = coordinator.source.list_url(&filter, page);
        let response = coordinator
            .fetcher
            .fetch(FetchRequest::get(&url), &ctx.cancellation_token())
            .await?;
        let list = coordinator
            .extractor
            .extract_list_page(&response.text, &url)
            .map_err(|e| TaskError::permanent("Malformed", e.to_string()))?;

        for entry in &list.entries {
            coordinator
                .queue
                .enqueue(
                    EnqueueRequest::new("crawl.fetch_product_details", json!({"url": entry.url}))
                        .on_queue(QUEUE_CRAWLER)
                        .with_priority(Priority::Normal),
                )
                .await
                .map_err(|e| TaskError::transient("QueueUnavailable", e.to_string()))?;
        }

        // Follow pagination when asked, bounded by max_pages
        let max_pages = arg_u64(&args, "max_pages", 1) as u32;
        if list.next_page_url.is_some() && page < max_pages {
            let mut next_args = args.clone();
            next_args["page"] = json!(page + 1);
            coordinator
                .queue
                .enqueue(
                    EnqueueRequest::new("crawl.fetch_products", next_args)
                        .on_queue(QUEUE_CRAWLER)
                        .with_priority(Priority::Normal),
                )
                .await
                .map_err(|e| TaskError::transient("QueueUnavailable", e.to_string()))?;
        }

        Ok(json!({"page": page, "entries": list.entries.len()}))
    }
}

/// Fetch and persist a single product detail page
struct FetchProductDetails {
    deps: Arc<HandlerDeps>,
}

#[async_trait]
impl TaskHandler for FetchProductDetails {
    async fn run(&self, args: Value, ctx: TaskContext) -> Result<Value, TaskError> {
        let coordinator = &self.deps.coordinator;
        let url = arg_str(&args, "url")?;

        let response = coordinator
            .fetcher
            .fetch(FetchRequest::get(&url), &ctx.cancellation_token())
            .await?;
        let raw: RawProduct = coordinator
            .extractor
            .extract_detail_page(&response.text, &url)
            .map_err(|e| TaskError::permanent("Malformed", e.to_string()))?;

        let mut counters = Default::default();
        coordinator
            .persist_product_batch(&ctx, vec![raw], &mut counters)
            .await?;
        Ok(json!({"url": url, "persisted": true}))
    }
}

/// Refresh one or more supplier profiles
struct FetchSuppliers {
    deps: Arc<HandlerDeps>,
}

#[async_trait]
impl TaskHandler for FetchSuppliers {
    async fn run(&self, args: Value, ctx: TaskContext) -> Result<Value, TaskError> {
        let coordinator = &self.deps.coordinator;
        let ids: Vec<String> = args
            .get("supplier_ids")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if ids.is_empty() {
            return Err(TaskError::permanent("BadRequest", "supplier_ids missing or empty"));
        }

        let mut synced = 0u64;
        for supplier_id in ids {
            if ctx.cancel_requested().await {
                return Err(TaskError::cancelled());
            }
            coordinator
                .sync_one_supplier(&ctx.cancellation_token(), &supplier_id)
                .await?;
            synced += 1;
        }
        Ok(json!({"synced": synced}))
    }
}

/// Create a sync run for a category and enqueue its driver task
struct SyncCategory {
    deps: Arc<HandlerDeps>,
}

#[async_trait]
impl TaskHandler for SyncCategory {
    async fn run(&self, args: Value, _ctx: TaskContext) -> Result<Value, TaskError> {
        let coordinator = &self.deps.coordinator;
        let category = arg_str(&args, "category")?;

        let run = SyncRun::new("sync.products", OperationType::Scheduled, SyncType::Product)
            .with_config(json!({"category": category}));
        coordinator
            .store
            .sync_runs
            .create(&run)
            .await
            .map_err(TaskError::from)?;

        let work_id = coordinator
            .queue
            .enqueue(
                EnqueueRequest::new(
                    "sync.products",
                    json!({"run_id": run.run_id, "category": category}),
                )
                .on_queue(QUEUE_DATA_SYNC)
                .with_priority(Priority::Normal),
            )
            .await
            .map_err(|e| TaskError::transient("QueueUnavailable", e.to_string()))?;

        Ok(json!({"run_id": run.run_id, "work_id": work_id.to_string()}))
    }
}

// ---------------------------------------------------------------
// image.*
// ---------------------------------------------------------------

fn load_image(bytes: &[u8]) -> Result<image::DynamicImage, TaskError> {
    image::load_from_memory(bytes)
        .map_err(|e| TaskError::permanent("Malformed", format!("image decode failed: {e}")))
}

fn encode_jpeg(img: &image::DynamicImage) -> Result<Vec<u8>, TaskError> {
    let mut buffer = Cursor::new(Vec::new());
    img.write_to(&mut buffer, image::ImageFormat::Jpeg)
        .map_err(|e| TaskError::permanent("Malformed", format!("image encode failed: {e}")))?;
    Ok(buffer.into_inner())
}

/// Download an image into the content-addressed store and record its
/// dimensions on the ProductImage row
struct ImageDownload {
    deps: Arc<HandlerDeps>,
}

#[async_trait]
impl TaskHandler for ImageDownload {
    async fn run(&self, args: Value, ctx: TaskContext) -> Result<Value, TaskError> {
        let coordinator = &self.deps.coordinator;
        let product_source_id = arg_str(&args, "product_source_id")?;
        let url = arg_str(&args, "url")?;
        let kind: ImageKind = arg_str(&args, "kind")?
            .parse()
            .map_err(|e: String| TaskError::permanent("BadRequest", e))?;
        let order_index = arg_u64(&args, "order_index", 0) as u32;

        let images = coordinator
            .store
            .images
            .find_for_product(&product_source_id)
            .await
            .map_err(TaskError::from)?;
        let Some(mut row) = images
            .into_iter()
            .find(|i| i.kind == kind && i.order_index == order_index)
        else {
            // Row superseded by a newer sync; nothing to do
            return Ok(json!({"skipped": "image row gone"}));
        };
        if row.status == ImageStatus::Completed && row.object_key.is_some() {
            return Ok(json!({"skipped": "already downloaded"}));
        }

        row.status = ImageStatus::Downloading;
        coordinator.store.images.update(&row).await.map_err(TaskError::from)?;

        // Images are page resources, not crawl targets; skip the robots gate
        let request = FetchRequest::get(&url).ignore_robots();
        let response = match coordinator
            .fetcher
            .fetch(request, &ctx.cancellation_token())
            .await
        {
            Ok(response) => response,
            Err(error) => {
                row.status = ImageStatus::Failed;
                coordinator.store.images.update(&row).await.ok();
                return Err(error.into());
            }
        };

        let extension = extension_for(&url, response.content_type.as_deref());
        let object_key = self
            .deps
            .storage
            .store(&response.body, extension)
            .await
            .map_err(TaskError::from)?;

        let dimensions = load_image(&response.body)
            .ok()
            .map(|img| (img.width(), img.height()));

        row.object_key = Some(object_key.clone());
        row.file_size = Some(response.body.len() as u64);
        if let Some((width, height)) = dimensions {
            row.width = Some(width);
            row.height = Some(height);
        }
        row.status = ImageStatus::Completed;
        coordinator.store.images.update(&row).await.map_err(TaskError::from)?;

        // Main images get a thumbnail variant
        if kind == ImageKind::Main {
            coordinator
                .queue
                .enqueue(
                    EnqueueRequest::new(
                        "image.thumbnail",
                        json!({"product_source_id": product_source_id, "object_key": object_key, "size": 256}),
                    )
                    .on_queue(QUEUE_IMAGE)
                    .with_priority(Priority::Low),
                )
                .await
                .ok();
        }

        Ok(json!({"object_key": object_key}))
    }
}

/// Resize an object to fit within `max_dim`, storing a new object
struct ImageResize {
    deps: Arc<HandlerDeps>,
}

#[async_trait]
impl TaskHandler for ImageResize {
    async fn run(&self, args: Value, _ctx: TaskContext) -> Result<Value, TaskError> {
        let object_key = arg_str(&args, "object_key")?;
        let max_dim = arg_u64(&args, "max_dim", 1280) as u32;

        let bytes = self.deps.storage.read(&object_key).await.map_err(TaskError::from)?;
        let img = load_image(&bytes)?;
        let resized = img.resize(max_dim, max_dim, FilterType::Lanczos3);
        let encoded = encode_jpeg(&resized)?;
        let new_key = self.deps.storage.store(&encoded, "jpg").await.map_err(TaskError::from)?;

        Ok(json!({
            "object_key": new_key,
            "width": resized.width(),
            "height": resized.height(),
        }))
    }
}

/// Re-encode an object as JPEG to shrink oversized originals
struct ImageOptimize {
    deps: Arc<HandlerDeps>,
}

#[async_trait]
impl TaskHandler for ImageOptimize {
    async fn run(&self, args: Value, _ctx: TaskContext) -> Result<Value, TaskError> {
        let object_key = arg_str(&args, "object_key")?;
        let bytes = self.deps.storage.read(&object_key).await.map_err(TaskError::from)?;
        let img = load_image(&bytes)?;
        let encoded = encode_jpeg(&img)?;

        if encoded.len() >= bytes.len() {
            return Ok(json!({"object_key": object_key, "unchanged": true}));
        }
        let new_key = self.deps.storage.store(&encoded, "jpg").await.map_err(TaskError::from)?;
        Ok(json!({
            "object_key": new_key,
            "saved_bytes": bytes.len() - encoded.len(),
        }))
    }
}

/// Produce a thumbnail variant and record it as a thumbnail image row
struct ImageThumbnail {
    deps: Arc<HandlerDeps>,
}

#[async_trait]
impl TaskHandler for ImageThumbnail {
    async fn run(&self, args: Value, _ctx: TaskContext) -> Result<Value, TaskError> {
        let coordinator = &self.deps.coordinator;
        let object_key = arg_str(&args, "object_key")?;
        let size = arg_u64(&args, "size", 256) as u32;

        let bytes = self.deps.storage.read(&object_key).await.map_err(TaskError::from)?;
        let img = load_image(&bytes)?;
        let thumb = img.thumbnail(size, size);
        let encoded = encode_jpeg(&thumb)?;
        let thumb_key = self.deps.storage.store(&encoded, "jpg").await.map_err(TaskError::from)?;

        if let Some(product_source_id) = arg_str_opt(&args, "product_source_id") {
            let mut images = coordinator
                .store
                .images
                .find_for_product(&product_source_id)
                .await
                .map_err(TaskError::from)?;
            let next_index = images
                .iter()
                .filter(|i| i.kind == ImageKind::Thumbnail)
                .map(|i| i.order_index + 1)
                .max()
                .unwrap_or(0);
            let already = images
                .iter()
                .any(|i| i.kind == ImageKind::Thumbnail && i.object_key.as_deref() == Some(thumb_key.as_str()));
            if !already {
                let mut row = crate::domain::entities::ProductImage::new(
                    &product_source_id,
                    format!("object:{thumb_key}"),
                    ImageKind::Thumbnail,
                    next_index,
                );
                row.object_key = Some(thumb_key.clone());
                row.file_size = Some(encoded.len() as u64);
                row.width = Some(thumb.width());
                row.height = Some(thumb.height());
                row.status = ImageStatus::Completed;
                images.push(row);
                coordinator
                    .store
                    .images
                    .replace_for_product(&product_source_id, &images)
                    .await
                    .map_err(TaskError::from)?;
            }
        }

        Ok(json!({"object_key": thumb_key, "width": thumb.width(), "height": thumb.height()}))
    }
}

// ---------------------------------------------------------------
// sync.*
// ---------------------------------------------------------------

/// Driver for a product sync run
struct SyncProducts {
    deps: Arc<HandlerDeps>,
}

#[async_trait]
impl TaskHandler for SyncProducts {
    async fn run(&self, args: Value, ctx: TaskContext) -> Result<Value, TaskError> {
        let filter = filter_from_args(&args);
        self.deps.coordinator.run_product_sync(&ctx, filter).await
    }
}

/// Driver for a supplier sync run
struct SyncSuppliers {
    deps: Arc<HandlerDeps>,
}

#[async_trait]
impl TaskHandler for SyncSuppliers {
    async fn run(&self, args: Value, ctx: TaskContext) -> Result<Value, TaskError> {
        let requested: Vec<String> = args
            .get("supplier_ids")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        self.deps.coordinator.run_supplier_sync(&ctx, requested).await
    }
}

/// Re-validate stored products, flagging records that no longer pass
struct SyncValidate {
    deps: Arc<HandlerDeps>,
}

#[async_trait]
impl TaskHandler for SyncValidate {
    async fn run(&self, _args: Value, ctx: TaskContext) -> Result<Value, TaskError> {
        let coordinator = &self.deps.coordinator;
        let products = coordinator
            .store
            .products
            .list(&ProductFilter { limit: 0, ..Default::default() })
            .await
            .map_err(TaskError::from)?;

        let mut valid = 0u64;
        let mut invalid = 0u64;
        for product in &products {
            if ctx.cancel_requested().await {
                return Err(TaskError::cancelled());
            }
            let supplier_exists = match &product.supplier_source_id {
                Some(supplier_id) => Some(
                    coordinator
                        .store
                        .suppliers
                        .find_by_source_id(supplier_id)
                        .await
                        .map_err(TaskError::from)?
                        .map_or(false, |s| !s.is_deleted()),
                ),
                None => None,
            };
            let diagnostics = coordinator
                .pipeline
                .validator
                .validate_product(product, supplier_exists);
            if has_blocking(&diagnostics) {
                invalid += 1;
                coordinator
                    .store
                    .products
                    .set_sync_status(&product.source_id, SyncStatus::Failed)
                    .await
                    .map_err(TaskError::from)?;
            } else {
                valid += 1;
            }
        }

        info!("Validation sweep: {valid} valid, {invalid} invalid of {}", products.len());
        Ok(json!({"total": products.len(), "valid": valid, "invalid": invalid}))
    }
}

/// Dedup sweep over the whole store plus retention housekeeping
/// (old checkpoints, pruned versions, orphaned image objects)
struct CleanupDuplicates {
    deps: Arc<HandlerDeps>,
}

#[async_trait]
impl TaskHandler for CleanupDuplicates {
    async fn run(&self, _args: Value, ctx: TaskContext) -> Result<Value, TaskError> {
        let coordinator = &self.deps.coordinator;
        let products = coordinator
            .store
            .products
            .list(&ProductFilter { limit: 0, ..Default::default() })
            .await
            .map_err(TaskError::from)?;

        let mut verified = std::collections::HashSet::new();
        for supplier in coordinator
            .store
            .suppliers
            .list(0, 0)
            .await
            .map_err(TaskError::from)?
        {
            if supplier.verified && !supplier.is_deleted() {
                verified.insert(supplier.source_id);
            }
        }

        let groups = coordinator.pipeline.deduper.group_products(&products, &verified);
        let mut pointers = 0u64;
        for group in &groups {
            if ctx.cancel_requested().await {
                return Err(TaskError::cancelled());
            }
            for duplicate in group.duplicates() {
                coordinator
                    .store
                    .products
                    .set_canonical_of(duplicate, Some(&group.master))
                    .await
                    .map_err(TaskError::from)?;
                if let Some(stored) = coordinator
                    .store
                    .products
                    .find_by_source_id(duplicate)
                    .await
                    .map_err(TaskError::from)?
                {
                    coordinator
                        .versioner
                        .record(
                            coordinator.store.versions.as_ref(),
                            EntityType::Product,
                            duplicate,
                            stored.canonical_snapshot(),
                            ChangeKind::Update,
                        )
                        .await
                        .map_err(TaskError::from)?;
                }
                pointers += 1;
            }
        }

        // Retention housekeeping rides along with the dedup sweep
        let checkpoint_cutoff = Utc::now() - Duration::days(self.deps.checkpoint_retention_days);
        let checkpoints_removed = coordinator
            .store
            .checkpoints
            .delete_older_than(checkpoint_cutoff)
            .await
            .map_err(TaskError::from)?;

        let version_cutoff = Utc::now() - Duration::days(self.deps.version_retention_days);
        let versions_pruned = coordinator
            .store
            .versions
            .prune(self.deps.version_keep_count, version_cutoff)
            .await
            .map_err(TaskError::from)?;

        let known_keys = self.deps.storage.list_keys().await.map_err(TaskError::from)?;
        let orphans = coordinator
            .store
            .images
            .orphaned_object_keys(&known_keys)
            .await
            .map_err(TaskError::from)?;
        let swept = self.deps.storage.sweep(&orphans).await.map_err(TaskError::from)?;

        Ok(json!({
            "groups": groups.len(),
            "canonical_pointers": pointers,
            "checkpoints_removed": checkpoints_removed,
            "versions_pruned": versions_pruned,
            "images_swept": swept,
        }))
    }
}

// ---------------------------------------------------------------
// batch.*
// ---------------------------------------------------------------

/// Import externally authored records. Source status labels map through
/// the canonical vocabulary; unknown labels become inactive and
/// sync_status always resets to pending for re-evaluation.
struct BatchImport {
    deps: Arc<HandlerDeps>,
}

#[async_trait]
impl TaskHandler for BatchImport {
    async fn run(&self, args: Value, ctx: TaskContext) -> Result<Value, TaskError> {
        let coordinator = &self.deps.coordinator;
        let records = args
            .get("records")
            .and_then(Value::as_array)
            .ok_or_else(|| TaskError::permanent("BadRequest", "records array missing"))?;

        let mut imported = 0u64;
        let mut rejected = 0u64;
        for record in records {
            if ctx.cancel_requested().await {
                return Err(TaskError::cancelled());
            }
            let Some(source_id) = record.get("source_id").and_then(Value::as_str) else {
                rejected += 1;
                continue;
            };
            let Some(title) = record.get("title").and_then(Value::as_str) else {
                rejected += 1;
                continue;
            };

            let mut product = crate::domain::entities::Product::new(source_id, title);
            if let Some(status) = record.get("status").and_then(Value::as_str) {
                product.status = ProductStatus::from_source_label(status);
            }
            product.sync_status = SyncStatus::Pending;
            product.price_min = record.get("price_min").and_then(Value::as_f64);
            product.price_max = record.get("price_max").and_then(Value::as_f64);
            product.supplier_source_id = record
                .get("supplier_source_id")
                .and_then(Value::as_str)
                .map(str::to_string);

            let product = coordinator.pipeline.cleaner.normalize_product(product);
            let diagnostics = coordinator.pipeline.validator.validate_product(&product, None);
            if has_blocking(&diagnostics) {
                rejected += 1;
                continue;
            }

            let existed = coordinator
                .store
                .products
                .find_by_source_id(&product.source_id)
                .await
                .map_err(TaskError::from)?
                .is_some();
            let outcome = coordinator.store.products.upsert(&product).await.map_err(TaskError::from)?;
            // Imported rows always re-enter the sync pipeline
            coordinator
                .store
                .products
                .set_sync_status(&product.source_id, SyncStatus::Pending)
                .await
                .map_err(TaskError::from)?;
            if outcome != crate::domain::repositories::UpsertOutcome::Unchanged {
                let change_kind = if existed { ChangeKind::Update } else { ChangeKind::Create };
                coordinator
                    .versioner
                    .record(
                        coordinator.store.versions.as_ref(),
                        EntityType::Product,
                        &product.source_id,
                        product.canonical_snapshot(),
                        change_kind,
                    )
                    .await
                    .map_err(TaskError::from)?;
            }
            imported += 1;
        }

        Ok(json!({"imported": imported, "rejected": rejected}))
    }
}

/// Export the filtered product view as JSON lines
struct BatchExport {
    deps: Arc<HandlerDeps>,
}

#[async_trait]
impl TaskHandler for BatchExport {
    async fn run(&self, args: Value, _ctx: TaskContext) -> Result<Value, TaskError> {
        let coordinator = &self.deps.coordinator;
        let file_name = arg_str_opt(&args, "file").unwrap_or_else(|| "products-export.jsonl".to_string());
        let path = self.deps.export_dir.join(&file_name);

        let filter = ProductFilter {
            category_id: arg_str_opt(&args, "category_id"),
            status: arg_str_opt(&args, "status"),
            limit: 0,
            ..Default::default()
        };
        let products = coordinator.store.products.list(&filter).await.map_err(TaskError::from)?;

        let mut lines = String::new();
        for product in &products {
            lines.push_str(
                &serde_json::to_string(product)
                    .map_err(|e| TaskError::permanent("Malformed", e.to_string()))?,
            );
            lines.push('\n');
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| TaskError::transient("Io", e.to_string()))?;
        }
        tokio::fs::write(&path, lines)
            .await
            .map_err(|e| TaskError::transient("Io", e.to_string()))?;

        info!("Exported {} products to {}", products.len(), path.display());
        Ok(json!({"exported": products.len(), "path": path.display().to_string()}))
    }
}

/// Bulk field update across a set of products, versioned per record
struct BatchUpdate {
    deps: Arc<HandlerDeps>,
}

#[async_trait]
impl TaskHandler for BatchUpdate {
    async fn run(&self, args: Value, ctx: TaskContext) -> Result<Value, TaskError> {
        let coordinator = &self.deps.coordinator;
        let source_ids: Vec<String> = args
            .get("source_ids")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let set = args
            .get("set")
            .and_then(Value::as_object)
            .ok_or_else(|| TaskError::permanent("BadRequest", "set object missing"))?;

        let mut updated = 0u64;
        for source_id in source_ids {
            if ctx.cancel_requested().await {
                return Err(TaskError::cancelled());
            }
            let Some(mut product) = coordinator
                .store
                .products
                .find_by_source_id(&source_id)
                .await
                .map_err(TaskError::from)?
            else {
                continue;
            };

            if let Some(status) = set.get("status").and_then(Value::as_str) {
                product.status = status
                    .parse()
                    .map_err(|e: String| TaskError::permanent("BadRequest", e))?;
            }
            if let Some(category_id) = set.get("category_id").and_then(Value::as_str) {
                product.category_id = Some(category_id.to_string());
            }
            if let Some(category_name) = set.get("category_name").and_then(Value::as_str) {
                product.category_name = Some(category_name.to_string());
            }

            let outcome = coordinator.store.products.upsert(&product).await.map_err(TaskError::from)?;
            if outcome != crate::domain::repositories::UpsertOutcome::Unchanged {
                coordinator
                    .versioner
                    .record(
                        coordinator.store.versions.as_ref(),
                        EntityType::Product,
                        &source_id,
                        product.canonical_snapshot(),
                        ChangeKind::Update,
                    )
                    .await
                    .map_err(TaskError::from)?;
                updated += 1;
            }
        }

        Ok(json!({"updated": updated}))
    }
}

/// Soft-delete (or restore) a set of products, writing delete/restore
/// version rows
struct BatchDelete {
    deps: Arc<HandlerDeps>,
}

#[async_trait]
impl TaskHandler for BatchDelete {
    async fn run(&self, args: Value, ctx: TaskContext) -> Result<Value, TaskError> {
        let coordinator = &self.deps.coordinator;
        let source_ids: Vec<String> = args
            .get("source_ids")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let restore = args.get("restore").and_then(Value::as_bool).unwrap_or(false);

        let mut affected = 0u64;
        for source_id in source_ids {
            if ctx.cancel_requested().await {
                return Err(TaskError::cancelled());
            }
            let changed = if restore {
                coordinator.store.products.restore(&source_id).await.map_err(TaskError::from)?
            } else {
                coordinator.store.products.soft_delete(&source_id).await.map_err(TaskError::from)?
            };
            if !changed {
                continue;
            }

            if let Some(stored) = coordinator
                .store
                .products
                .find_by_source_id(&source_id)
                .await
                .map_err(TaskError::from)?
            {
                let change_kind = if restore { ChangeKind::Restore } else { ChangeKind::Delete };
                coordinator
                    .versioner
                    .record(
                        coordinator.store.versions.as_ref(),
                        EntityType::Product,
                        &source_id,
                        stored.canonical_snapshot(),
                        change_kind,
                    )
                    .await
                    .map_err(TaskError::from)?;
                if let Some(supplier_id) = &stored.supplier_source_id {
                    coordinator.store.suppliers.refresh_product_count(supplier_id).await.ok();
                }
            }
            affected += 1;
        }

        if affected > 0 {
            warn!("Batch {} of {affected} products", if restore { "restore" } else { "delete" });
        }
        Ok(json!({"affected": affected, "restore": restore}))
    }
}
