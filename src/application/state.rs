//! Process wiring
//!
//! Builds every process-scoped value once at startup (store, queue,
//! identity pool, fetcher, extractor, pipeline, coordinator, registry,
//! supervision) and hands them around explicitly. Lifecycle is
//! init -> run -> shutdown, with draining on shutdown handled by the
//! cancellation tokens the run loops hold.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::application::events::EventHub;
use crate::data_processing::cleaner::Cleaner;
use crate::data_processing::deduper::{DedupConfig, Deduper};
use crate::data_processing::pipeline::ProcessingPipeline;
use crate::data_processing::validator::Validator;
use crate::data_processing::versioner::Versioner;
use crate::domain::repositories::Store;
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::extraction::Extractor;
use crate::infrastructure::http_client::Fetcher;
use crate::infrastructure::identity_pool::IdentityPool;
use crate::infrastructure::image_storage::ImageStorage;
use crate::infrastructure::persistence::SqliteStore;
use crate::queue::watermark::BackpressureGates;
use crate::queue::{WorkQueue, QUEUE_DATA_SYNC};
use crate::scheduler::{Scheduler, SchedulerConfig, ScheduleEntry, ScheduleKind};
use crate::supervision::{EventHubObservability, SupervisionHub};
use crate::sync::coordinator::SyncCoordinator;
use crate::sync::handlers::{register_all, HandlerDeps};
use crate::sync::source::SourceConfig;
use crate::worker::pool::{WorkerPool, WorkerPoolConfig};
use crate::worker::registry::TaskRegistry;
use crate::worker::retry::RetryPolicy;

/// Everything a process needs, constructed once at startup
pub struct AppContext {
    pub config: AppConfig,
    pub store: Store,
    pub queue: Arc<dyn WorkQueue>,
    pub events: Arc<EventHub>,
    pub supervision: Arc<SupervisionHub>,
    pub coordinator: Arc<SyncCoordinator>,
    pub registry: TaskRegistry,
    pub storage: ImageStorage,
}

impl AppContext {
    /// Open the store, initialize the schema and wire every component
    pub async fn init(config: AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.storage.data_dir)
            .await
            .with_context(|| format!("creating data dir {}", config.storage.data_dir.display()))?;

        let sqlite = SqliteStore::connect(&config.database.db_url, config.database.max_connections)
            .await
            .context("opening authoritative store")?;
        sqlite.init_schema().await?;

        // Queue rows live in the same store unless the operator split them
        let queue: Arc<dyn WorkQueue> = if config.database.effective_queue_url() == config.database.db_url {
            Arc::new(sqlite.clone())
        } else {
            let queue_store =
                SqliteStore::connect(config.database.effective_queue_url(), config.database.max_connections)
                    .await
                    .context("opening queue store")?;
            queue_store.init_schema().await?;
            Arc::new(queue_store)
        };
        let store = sqlite.into_store();

        let events = Arc::new(EventHub::new());
        let supervision = Arc::new(SupervisionHub::new(
            config.supervision.clone(),
            Arc::new(EventHubObservability::new(events.clone())),
        ));

        let pool = Arc::new(IdentityPool::new(&config.identity, &config.fetcher)?);
        let fetcher = Arc::new(Fetcher::new(pool, config.fetcher.clone()));
        let extractor = Arc::new(Extractor::with_defaults());
        let pipeline = ProcessingPipeline::new(
            Cleaner::new(),
            Validator::default(),
            Deduper::new(DedupConfig::default()),
        );
        let gates = BackpressureGates::new(&config.queue.watermarks);
        let storage = ImageStorage::new(&config.storage.image_dir);

        let coordinator = Arc::new(SyncCoordinator::new(
            fetcher,
            extractor,
            pipeline,
            Versioner::default(),
            store.clone(),
            queue.clone(),
            events.clone(),
            gates,
            SourceConfig::default(),
            config.worker.handler_parallelism,
        ));

        let mut registry = TaskRegistry::new();
        register_all(
            &mut registry,
            Arc::new(HandlerDeps {
                coordinator: coordinator.clone(),
                storage: storage.clone(),
                checkpoint_retention_days: config.queue.checkpoint_retention_days,
                version_keep_count: 10,
                version_retention_days: 30,
                export_dir: config.storage.data_dir.join("exports"),
            }),
        );

        info!("Application context initialized ({} task handlers)", registry.names().len());
        Ok(Self {
            config,
            store,
            queue,
            events,
            supervision,
            coordinator,
            registry,
            storage,
        })
    }

    /// Worker pool bound to the given queues (all standard queues when
    /// empty)
    pub fn worker_pool(&self, queues: Vec<String>) -> Arc<WorkerPool> {
        let queues = if queues.is_empty() {
            crate::queue::standard_queues()
        } else {
            queues
        };
        Arc::new(WorkerPool::new(
            WorkerPoolConfig::from_worker_config(&self.config.worker, queues),
            self.registry.clone(),
            self.queue.clone(),
            self.store.clone(),
            self.events.clone(),
            self.supervision.clone(),
            RetryPolicy::new(self.config.worker.retry.clone()),
        ))
    }

    /// Scheduler with the standing schedule set
    pub fn scheduler(&self) -> Scheduler {
        let mut scheduler = Scheduler::new(
            self.queue.clone(),
            self.store.leases.clone(),
            self.store.schedule_state.clone(),
            SchedulerConfig::default(),
        );

        // Daily full product sync at 02:00 UTC
        if let Ok(kind) = ScheduleKind::cron("0 2 * * *", 0) {
            scheduler.register(
                ScheduleEntry::new("sync_products_daily", kind, "crawl.sync_category")
                    .with_args(serde_json::json!({"category": "all"}))
                    .on_queue(QUEUE_DATA_SYNC),
            );
        }
        // Supplier refresh every 6 hours
        scheduler.register(
            ScheduleEntry::new(
                "sync_suppliers_6h",
                ScheduleKind::interval(Duration::from_secs(6 * 3600), Duration::from_secs(600)),
                "sync.suppliers",
            )
            .on_queue(QUEUE_DATA_SYNC),
        );
        // Nightly dedup + retention housekeeping
        if let Ok(kind) = ScheduleKind::cron("30 3 * * *", 0) {
            scheduler.register(
                ScheduleEntry::new("cleanup_nightly", kind, "sync.cleanup_duplicates")
                    .on_queue(crate::queue::QUEUE_BATCH),
            );
        }
        scheduler
    }
}
