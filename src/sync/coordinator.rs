//! Sync coordinator (C12)
//!
//! Composes fetcher, extractor and the data-quality pipeline into the
//! page-wise synchronization of products and suppliers. Per page: fetch ->
//! extract -> clean -> validate -> dedup -> version -> upsert, then fan
//! out image downloads, save a checkpoint and report progress. Errored
//! records land in the rejected bucket and never fail the run on their
//! own; a failure ratio above 50% does.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::application::events::{EventChannel, EventHub, EventPayload};
use crate::data_processing::pipeline::{AcceptedProduct, ProcessingPipeline};
use crate::data_processing::versioner::Versioner;
use crate::domain::entities::{ImageKind, ImageStatus, Product, ProductImage, SyncStatus};
use crate::domain::repositories::{
    ImageRepository, ProductRepository, Store, SupplierRepository, SyncRunRepository, UpsertOutcome,
};
use crate::domain::sync_run::{SyncCounters, SyncRunStatus};
use crate::domain::version::{ChangeKind, EntityType};
use crate::infrastructure::extraction::{ExtractionError, Extractor, RawProduct};
use crate::infrastructure::http_client::{FetchError, FetchRequest, Fetcher};
use crate::queue::watermark::BackpressureGates;
use crate::queue::{EnqueueRequest, Priority, WorkQueue, QUEUE_IMAGE};
use crate::sync::source::{decode_cursor, encode_cursor, SourceConfig, SourceFilter};
use crate::worker::context::TaskContext;
use crate::worker::retry::TaskError;

/// Failure ratio beyond which a run transitions to failed
const FAILURE_RATIO_LIMIT: f64 = 0.5;

/// Shared composition of C3-C8 plus the store and queue
pub struct SyncCoordinator {
    pub fetcher: Arc<Fetcher>,
    pub extractor: Arc<Extractor>,
    pub pipeline: ProcessingPipeline,
    pub versioner: Versioner,
    pub store: Store,
    pub queue: Arc<dyn WorkQueue>,
    pub events: Arc<EventHub>,
    pub gates: BackpressureGates,
    pub source: SourceConfig,
    /// Bounded internal concurrency for per-page detail fetches
    pub handler_parallelism: usize,
    /// Per-source_id upsert serialization
    upsert_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fetcher: Arc<Fetcher>,
        extractor: Arc<Extractor>,
        pipeline: ProcessingPipeline,
        versioner: Versioner,
        store: Store,
        queue: Arc<dyn WorkQueue>,
        events: Arc<EventHub>,
        gates: BackpressureGates,
        source: SourceConfig,
        handler_parallelism: usize,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            pipeline,
            versioner,
            store,
            queue,
            events,
            gates,
            source,
            handler_parallelism: handler_parallelism.max(1),
            upsert_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, source_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.upsert_locks.lock().await;
        locks
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Driver for `sync.products`: paged synchronization of the filtered
    /// product view, resuming from the last durable checkpoint.
    pub async fn run_product_sync(
        &self,
        ctx: &TaskContext,
        filter: SourceFilter,
    ) -> Result<serde_json::Value, TaskError> {
        let mut counters = SyncCounters::default();
        let mut recommendations: Vec<String> = Vec::new();
        let mut page = 1u32;

        if let Some((cursor, saved)) = ctx.load_checkpoint().await.map_err(TaskError::from)? {
            page = decode_cursor(&cursor) + 1;
            counters = saved;
            info!("Resuming product sync at page {page} ({} processed)", counters.processed);
        }

        loop {
            // Safe point: observe cancellation between pages
            if ctx.cancel_requested().await {
                self.finish_run(ctx, SyncRunStatus::Cancelled, &counters, Vec::new()).await;
                return Err(TaskError::cancelled());
            }
            if filter.limit > 0 && counters.processed >= filter.limit {
                break;
            }

            let url = self.source.list_url(&filter, page);
            debug!("Fetching list page {page}: {url}");
            let response = self
                .fetcher
                .fetch(FetchRequest::get(&url), &ctx.cancellation_token())
                .await?;

            let list = match self.extractor.extract_list_page(&response.text, &url) {
                Ok(list) => list,
                Err(ExtractionError::LayoutMismatch { kind, fingerprint }) => {
                    self.add_recommendation(
                        ctx,
                        format!("extractor rule outdated for {} (fingerprint {fingerprint})", kind.as_str()),
                    )
                    .await;
                    return Err(TaskError::permanent(
                        "Malformed",
                        format!("no rule-set matched {} layout {fingerprint}", kind.as_str()),
                    ));
                }
                Err(other) => return Err(TaskError::permanent("Malformed", other.to_string())),
            };

            if list.entries.is_empty() {
                debug!("Page {page} empty, treating as end of stream");
                break;
            }
            counters.total = counters.total.max(counters.processed + list.entries.len() as u64);

            // Per-page parallel detail fetches within the handler budget
            let cancel = ctx.cancellation_token();
            let detail_results: Vec<Result<RawProduct, FetchError>> = stream::iter(list.entries.iter().cloned())
                .map(|entry| {
                    let cancel = cancel.clone();
                    async move {
                        let response = self
                            .fetcher
                            .fetch(FetchRequest::get(&entry.url), &cancel)
                            .await?;
                        self.extractor
                            .extract_detail_page(&response.text, &entry.url)
                            .map_err(|e| FetchError::Malformed(e.to_string()))
                    }
                })
                .buffer_unordered(self.handler_parallelism)
                .collect()
                .await;

            let mut raw_products = Vec::new();
            let mut page_fetch_failures = 0u64;
            for result in detail_results {
                match result {
                    Ok(raw) => raw_products.push(raw),
                    Err(FetchError::Cancelled) => {
                        self.finish_run(ctx, SyncRunStatus::Cancelled, &counters, Vec::new()).await;
                        return Err(TaskError::cancelled());
                    }
                    Err(error) => {
                        // One bad record does not fail the page
                        warn!("Detail fetch failed: {error}");
                        self.record_error(ctx, error.code()).await;
                        page_fetch_failures += 1;
                    }
                }
            }
            counters.record_failure(page_fetch_failures);

            let page_notes = self.persist_product_batch(ctx, raw_products, &mut counters).await?;
            for note in page_notes {
                if !recommendations.contains(&note) {
                    recommendations.push(note);
                }
            }

            // Checkpoint covers everything up to and including this page
            ctx.save_checkpoint(&encode_cursor(page), counters)
                .await
                .map_err(TaskError::from)?;
            ctx.report_progress(
                counters.progress_percent(),
                &format!("page {page} done"),
                counters,
            )
            .await;
            self.update_run_counters(ctx, &counters).await;

            if counters.failure_ratio() > FAILURE_RATIO_LIMIT && counters.processed >= 10 {
                self.finish_run(ctx, SyncRunStatus::Failed, &counters, recommendations).await;
                return Err(TaskError::permanent(
                    "FailureRatio",
                    format!("failure ratio {:.2} exceeds limit", counters.failure_ratio()),
                ));
            }

            if list.next_page_url.is_none() {
                break;
            }
            page += 1;
        }

        counters.total = counters.processed;
        self.finish_run(ctx, SyncRunStatus::Completed, &counters, recommendations).await;
        ctx.report_progress(100, "sync complete", counters).await;

        Ok(json!({
            "processed": counters.processed,
            "success": counters.success,
            "failed": counters.failed,
            "skipped": counters.skipped,
        }))
    }

    /// Clean/validate/dedup/version/upsert one page worth of raw products.
    /// Returns recommendations gathered from the quality report.
    pub async fn persist_product_batch(
        &self,
        ctx: &TaskContext,
        raw_products: Vec<RawProduct>,
        counters: &mut SyncCounters,
    ) -> Result<Vec<String>, TaskError> {
        let (known_suppliers, verified_suppliers) = self.supplier_sets(&raw_products).await;
        let outcome = self
            .pipeline
            .process_products(raw_products, &known_suppliers, &verified_suppliers);

        for rejected in &outcome.rejected {
            debug!("Rejected record {}: {} diagnostics", rejected.source_id, rejected.diagnostics.len());
            self.record_error(ctx, "ValidationError").await;
        }
        counters.record_failure(outcome.rejected.len() as u64);

        for accepted in &outcome.accepted {
            match self.upsert_product(accepted).await {
                Ok(UpsertOutcome::Unchanged) => counters.record_skipped(1),
                Ok(_) => counters.record_success(1),
                Err(e) => {
                    warn!("Upsert failed for {}: {e:#}", accepted.product.source_id);
                    self.record_error(ctx, "StoreError").await;
                    counters.record_failure(1);
                }
            }
        }

        // Dedup back-pointers, written through the versioner
        for group in &outcome.groups {
            for duplicate in group.duplicates() {
                if let Err(e) = self.write_canonical_of(duplicate, &group.master).await {
                    warn!("canonical_of write failed for {duplicate}: {e:#}");
                }
            }
        }

        Ok(outcome.report.recommendations())
    }

    /// Serialized (per source_id) upsert with version bookkeeping and
    /// image fan-out
    async fn upsert_product(&self, accepted: &AcceptedProduct) -> anyhow::Result<UpsertOutcome> {
        let product = &accepted.product;
        let lock = self.lock_for(&product.source_id).await;
        let _guard = lock.lock().await;

        let existed = self
            .store
            .products
            .find_by_source_id(&product.source_id)
            .await?
            .is_some();

        let outcome = self.store.products.upsert(product).await?;
        let now = chrono::Utc::now();
        self.store.products.touch_last_sync(&product.source_id, now).await?;
        self.store
            .products
            .set_sync_status(&product.source_id, SyncStatus::Completed)
            .await?;

        match outcome {
            UpsertOutcome::Unchanged => {}
            UpsertOutcome::Created | UpsertOutcome::Updated => {
                let stored = self
                    .store
                    .products
                    .find_by_source_id(&product.source_id)
                    .await?
                    .unwrap_or_else(|| product.clone());
                let change_kind = if existed { ChangeKind::Update } else { ChangeKind::Create };
                self.versioner
                    .record(
                        self.store.versions.as_ref(),
                        EntityType::Product,
                        &product.source_id,
                        stored.canonical_snapshot(),
                        change_kind,
                    )
                    .await?;

                if let Some(supplier_id) = &product.supplier_source_id {
                    self.store.suppliers.refresh_product_count(supplier_id).await.ok();
                }

                self.fan_out_images(&stored).await?;

                let channel = if existed {
                    EventChannel::ProductUpdated
                } else {
                    EventChannel::NewProduct
                };
                self.events.publish(
                    channel,
                    &product.source_id,
                    EventPayload::EntityChanged {
                        entity_ids: vec![product.source_id.clone()],
                        version_no: None,
                    },
                );
            }
        }
        Ok(outcome)
    }

    /// Replace the product's image rows and enqueue downloads for images
    /// that have no stored object yet. NORMAL priority into `image`.
    async fn fan_out_images(&self, product: &Product) -> anyhow::Result<()> {
        let previous = self.store.images.find_for_product(&product.source_id).await?;
        let downloaded: HashMap<&str, &ProductImage> = previous
            .iter()
            .filter(|i| i.object_key.is_some())
            .map(|i| (i.url.as_str(), i))
            .collect();

        let mut images = Vec::new();
        if let Some(main_url) = &product.main_image_url {
            images.push(ProductImage::new(&product.source_id, main_url, ImageKind::Main, 0));
        }
        for (index, url) in product.detail_images.iter().enumerate() {
            if Some(url) == product.main_image_url.as_ref() {
                continue;
            }
            images.push(ProductImage::new(&product.source_id, url, ImageKind::Detail, index as u32));
        }

        // Carry over completed downloads for unchanged URLs
        let mut pending = Vec::new();
        for image in &mut images {
            if let Some(done) = downloaded.get(image.url.as_str()) {
                image.status = ImageStatus::Completed;
                image.object_key = done.object_key.clone();
                image.file_size = done.file_size;
                image.width = done.width;
                image.height = done.height;
            } else {
                pending.push((image.kind, image.order_index, image.url.clone()));
            }
        }
        self.store.images.replace_for_product(&product.source_id, &images).await?;

        if pending.is_empty() {
            return Ok(());
        }
        self.wait_for_queue_capacity(QUEUE_IMAGE).await;
        for (kind, order_index, url) in pending {
            self.queue
                .enqueue(
                    EnqueueRequest::new(
                        "image.download",
                        json!({
                            "product_source_id": product.source_id,
                            "kind": kind.as_str(),
                            "order_index": order_index,
                            "url": url,
                        }),
                    )
                    .on_queue(QUEUE_IMAGE)
                    .with_priority(Priority::Normal),
                )
                .await
                .map_err(|e| anyhow::anyhow!("image enqueue failed: {e}"))?;
        }
        Ok(())
    }

    /// Producer-side backpressure: hold while the queue sits above its
    /// high-water mark
    async fn wait_for_queue_capacity(&self, queue: &str) {
        loop {
            let depth = self.queue.depth(queue).await.unwrap_or(0);
            if !self.gates.observe(queue, depth) {
                return;
            }
            debug!("Queue '{queue}' above high-water ({depth}), producer pausing");
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn write_canonical_of(&self, duplicate: &str, master: &str) -> anyhow::Result<()> {
        let lock = self.lock_for(duplicate).await;
        let _guard = lock.lock().await;

        self.store.products.set_canonical_of(duplicate, Some(master)).await?;
        if let Some(stored) = self.store.products.find_by_source_id(duplicate).await? {
            self.versioner
                .record(
                    self.store.versions.as_ref(),
                    EntityType::Product,
                    duplicate,
                    stored.canonical_snapshot(),
                    ChangeKind::Update,
                )
                .await?;
        }
        Ok(())
    }

    /// Referential and verification context for a batch: which referenced
    /// suppliers exist, and which of those are verified
    async fn supplier_sets(&self, raw_products: &[RawProduct]) -> (HashSet<String>, HashSet<String>) {
        let mut known = HashSet::new();
        let mut verified = HashSet::new();
        let referenced: HashSet<&String> = raw_products
            .iter()
            .filter_map(|raw| raw.supplier_source_id.as_ref())
            .collect();

        for supplier_id in referenced {
            if let Ok(Some(supplier)) = self.store.suppliers.find_by_source_id(supplier_id).await {
                if !supplier.is_deleted() {
                    known.insert(supplier_id.clone());
                    if supplier.verified {
                        verified.insert(supplier_id.clone());
                    }
                }
            }
        }
        (known, verified)
    }

    async fn record_error(&self, ctx: &TaskContext, code: &str) {
        let Some(run_id) = &ctx.run_id else { return };
        if let Ok(Some(mut run)) = self.store.sync_runs.find(run_id).await {
            run.record_error_code(code);
            self.store.sync_runs.update(&run).await.ok();
        }
    }

    async fn add_recommendation(&self, ctx: &TaskContext, note: String) {
        let Some(run_id) = &ctx.run_id else { return };
        if let Ok(Some(mut run)) = self.store.sync_runs.find(run_id).await {
            if !run.recommendations.contains(&note) {
                run.recommendations.push(note);
                self.store.sync_runs.update(&run).await.ok();
            }
        }
    }

    async fn update_run_counters(&self, ctx: &TaskContext, counters: &SyncCounters) {
        let Some(run_id) = &ctx.run_id else { return };
        if let Ok(Some(mut run)) = self.store.sync_runs.find(run_id).await {
            run.counters = *counters;
            run.progress = counters.progress_percent();
            self.store.sync_runs.update(&run).await.ok();
        }
    }

    /// Take the attached run to its terminal state and publish the
    /// completion event
    async fn finish_run(
        &self,
        ctx: &TaskContext,
        status: SyncRunStatus,
        counters: &SyncCounters,
        recommendations: Vec<String>,
    ) {
        let Some(run_id) = &ctx.run_id else { return };
        let Ok(Some(mut run)) = self.store.sync_runs.find(run_id).await else {
            return;
        };
        if run.status.is_terminal() {
            return;
        }

        run.counters = *counters;
        run.progress = if status == SyncRunStatus::Completed {
            100
        } else {
            counters.progress_percent()
        };
        for note in recommendations {
            if !run.recommendations.contains(&note) {
                run.recommendations.push(note);
            }
        }
        if run.transition(status).is_ok() {
            self.store.sync_runs.update(&run).await.ok();
        }

        let (channel, payload) = match status {
            SyncRunStatus::Completed => (
                EventChannel::SyncCompleted,
                EventPayload::Completed {
                    counters: *counters,
                    duration_secs: run.duration_secs().unwrap_or(0),
                },
            ),
            SyncRunStatus::Failed => (
                EventChannel::SyncFailed,
                EventPayload::Failed {
                    error_code: "FailureRatio".to_string(),
                    message: "run failed".to_string(),
                    counters: *counters,
                },
            ),
            _ => (
                EventChannel::SyncProgress,
                EventPayload::Progress {
                    percent: run.progress,
                    message: "cancelled".to_string(),
                    counters: *counters,
                },
            ),
        };
        self.events.publish(channel, run_id, payload);
    }

    /// Driver for `sync.suppliers`: refresh every supplier referenced by
    /// stored products (plus explicitly requested ids).
    pub async fn run_supplier_sync(
        &self,
        ctx: &TaskContext,
        requested: Vec<String>,
    ) -> Result<serde_json::Value, TaskError> {
        let mut counters = SyncCounters::default();

        let mut targets: Vec<String> = requested;
        if targets.is_empty() {
            let filter = crate::domain::repositories::ProductFilter {
                limit: 0,
                ..Default::default()
            };
            let products = self.store.products.list(&filter).await.map_err(TaskError::from)?;
            let mut seen = HashSet::new();
            for product in products {
                if let Some(supplier_id) = product.supplier_source_id {
                    if seen.insert(supplier_id.clone()) {
                        targets.push(supplier_id);
                    }
                }
            }
        }
        counters.total = targets.len() as u64;

        for supplier_id in targets {
            if ctx.cancel_requested().await {
                self.finish_run(ctx, SyncRunStatus::Cancelled, &counters, Vec::new()).await;
                return Err(TaskError::cancelled());
            }

            match self.sync_one_supplier(&ctx.cancellation_token(), &supplier_id).await {
                Ok(UpsertOutcome::Unchanged) => counters.record_skipped(1),
                Ok(_) => counters.record_success(1),
                Err(TaskError { class: crate::worker::retry::ErrorClass::Cancelled, .. }) => {
                    self.finish_run(ctx, SyncRunStatus::Cancelled, &counters, Vec::new()).await;
                    return Err(TaskError::cancelled());
                }
                Err(error) => {
                    warn!("Supplier {supplier_id} sync failed: {error}");
                    self.record_error(ctx, &error.code).await;
                    counters.record_failure(1);
                }
            }
            ctx.report_progress(counters.progress_percent(), "suppliers", counters).await;
        }

        self.finish_run(ctx, SyncRunStatus::Completed, &counters, Vec::new()).await;
        Ok(json!({"processed": counters.processed, "success": counters.success}))
    }

    /// Fetch, extract, clean, validate and upsert a single supplier
    pub async fn sync_one_supplier(
        &self,
        cancel: &tokio_util::sync::CancellationToken,
        supplier_source_id: &str,
    ) -> Result<UpsertOutcome, TaskError> {
        let url = self.source.supplier_url(supplier_source_id);
        let response = self.fetcher.fetch(FetchRequest::get(&url), cancel).await?;

        let raw = self
            .extractor
            .extract_supplier_page(&response.text, &url)
            .map_err(|e| TaskError::permanent("Malformed", e.to_string()))?;

        let supplier = self.pipeline.cleaner.clean_supplier(&raw);
        let diagnostics = self.pipeline.validator.validate_supplier(&supplier);
        if crate::data_processing::validator::has_blocking(&diagnostics) {
            return Err(TaskError::permanent("ValidationError", format!("supplier {supplier_source_id} invalid")));
        }

        let lock = self.lock_for(supplier_source_id).await;
        let _guard = lock.lock().await;

        let existed = self
            .store
            .suppliers
            .find_by_source_id(supplier_source_id)
            .await
            .map_err(TaskError::from)?
            .is_some();
        let outcome = self.store.suppliers.upsert(&supplier).await.map_err(TaskError::from)?;

        if outcome != UpsertOutcome::Unchanged {
            let stored = self
                .store
                .suppliers
                .find_by_source_id(supplier_source_id)
                .await
                .map_err(TaskError::from)?
                .unwrap_or(supplier);
            let change_kind = if existed { ChangeKind::Update } else { ChangeKind::Create };
            self.versioner
                .record(
                    self.store.versions.as_ref(),
                    EntityType::Supplier,
                    supplier_source_id,
                    stored.canonical_snapshot(),
                    change_kind,
                )
                .await
                .map_err(TaskError::from)?;
        }
        Ok(outcome)
    }
}
