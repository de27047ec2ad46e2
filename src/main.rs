//! MarketSync command line interface
//!
//! `init` creates the schema and default config, `run` kicks off a sync,
//! `status` prints the supervision summary, `worker` and `scheduler` run
//! the long-lived processes. Exit codes: 0 success, 2 usage, 3
//! configuration, 4 runtime error, 130 interrupted.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use marketsync_lib::application::state::AppContext;
use marketsync_lib::domain::repositories::{ProductFilter, ProductRepository, SyncRunRepository};
use marketsync_lib::domain::sync_run::{OperationType, SyncRun, SyncType};
use marketsync_lib::infrastructure::config::AppConfig;
use marketsync_lib::infrastructure::logging::init_logging;
use marketsync_lib::queue::{EnqueueRequest, Priority, WorkQueue, QUEUE_DATA_SYNC};

const EXIT_CONFIG: u8 = 3;
const EXIT_RUNTIME: u8 = 4;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "marketsync", version, about = "B2B marketplace synchronization engine")]
struct Cli {
    /// Config file path (defaults to <DATA_DIR>/config.json)
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the schema and a default configuration file
    Init,
    /// Kick off a product sync and process it to completion
    Run {
        #[arg(long)]
        category: Option<String>,
        /// Cap on processed records
        #[arg(long, default_value_t = 0)]
        limit: u64,
    },
    /// Print the supervision summary
    Status,
    /// Run a worker process bound to a queue subset
    Worker {
        /// Comma-separated queue names (default: all standard queues)
        #[arg(long, value_delimiter = ',')]
        queues: Vec<String>,
    },
    /// Run the trigger scheduler
    Scheduler,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::from(EXIT_RUNTIME);
        }
    };

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> ExitCode {
    let config_path = cli.config.unwrap_or_else(AppConfig::default_path);
    let config = match AppConfig::load(&config_path).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Err(e) = init_logging(&config.logging, &config.storage.data_dir) {
        eprintln!("logging setup failed: {e:#}");
        return ExitCode::from(EXIT_CONFIG);
    }

    let context = match AppContext::init(config).await {
        Ok(context) => context,
        Err(e) => {
            error!("startup failed: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, draining");
            signal_token.cancel();
        }
    });

    let result = match cli.command {
        Command::Init => {
            info!("Schema and default configuration ready");
            Ok(false)
        }
        Command::Run { category, limit } => run_sync(&context, category, limit, &shutdown).await,
        Command::Status => print_status(&context).await,
        Command::Worker { queues } => {
            let pool = context.worker_pool(queues);
            pool.run(shutdown.clone()).await.map(|_| shutdown.is_cancelled())
        }
        Command::Scheduler => {
            let scheduler = context.scheduler();
            scheduler.run(shutdown.clone()).await.map(|_| shutdown.is_cancelled())
        }
    };

    match result {
        Ok(true) => ExitCode::from(EXIT_INTERRUPTED),
        Ok(false) => ExitCode::SUCCESS,
        Err(e) => {
            error!("command failed: {e:#}");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

/// Create a manual sync run, enqueue its driver and process queues until
/// the run finishes (or the operator interrupts)
async fn run_sync(
    context: &AppContext,
    category: Option<String>,
    limit: u64,
    shutdown: &CancellationToken,
) -> anyhow::Result<bool> {
    let mut run = SyncRun::new("sync.products", OperationType::Manual, SyncType::Product);
    run.config_snapshot = serde_json::json!({"category": category, "limit": limit});
    context.store.sync_runs.create(&run).await?;

    let mut args = serde_json::json!({"run_id": run.run_id, "limit": limit});
    if let Some(category) = &category {
        args["category"] = serde_json::Value::String(category.clone());
    }
    let work_id = context
        .queue
        .enqueue(
            EnqueueRequest::new("sync.products", args)
                .on_queue(QUEUE_DATA_SYNC)
                .with_priority(Priority::High),
        )
        .await
        .map_err(|e| anyhow::anyhow!("enqueue failed: {e}"))?;
    info!("Sync run {} enqueued as {}", run.run_id, work_id);

    let pool = context.worker_pool(Vec::new());
    let pool_shutdown = shutdown.child_token();
    let pool_task = tokio::spawn(pool.run(pool_shutdown.clone()));

    // Watch the run; stop the pool once it reaches a terminal state
    let interrupted = loop {
        if shutdown.is_cancelled() {
            break true;
        }
        match context.store.sync_runs.find(&run.run_id).await? {
            Some(current) if current.status.is_terminal() => {
                info!(
                    "Run {} finished: {:?} ({} processed, {} success, {} failed, {} skipped)",
                    current.run_id,
                    current.status,
                    current.counters.processed,
                    current.counters.success,
                    current.counters.failed,
                    current.counters.skipped
                );
                break false;
            }
            _ => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    };

    pool_shutdown.cancel();
    pool_task.await??;
    Ok(interrupted)
}

async fn print_status(context: &AppContext) -> anyhow::Result<bool> {
    let snapshot = context
        .supervision
        .snapshot(context.queue.as_ref(), context.store.sync_runs.as_ref())
        .await;

    println!("workers   : {} active, {} stalled", snapshot.active_workers, snapshot.stalled_workers);
    println!("sync runs : {} active", snapshot.active_runs);
    if snapshot.queue_depths.is_empty() {
        println!("queues    : all drained");
    } else {
        for depth in &snapshot.queue_depths {
            println!(
                "queue {} [{}]: {} ready, {} leased",
                depth.queue,
                depth.priority.as_str(),
                depth.ready,
                depth.leased
            );
        }
    }

    let product_count = context
        .store
        .products
        .count(&ProductFilter { limit: 0, ..Default::default() })
        .await?;
    println!("products  : {product_count}");

    for run in context.store.sync_runs.list_active().await? {
        println!(
            "run {} {} {}% ({}/{})",
            run.run_id,
            run.status.as_str(),
            run.progress,
            run.counters.processed,
            run.counters.total
        );
    }
    Ok(false)
}
