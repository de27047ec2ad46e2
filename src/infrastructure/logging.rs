//! Logging system configuration and initialization
//!
//! Console output plus an optional rolling file appender under the data
//! directory. The level comes from the `LOG_LEVEL` environment variable or
//! the logging config section; `RUST_LOG` wins when set so operators can
//! target individual modules.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use once_cell::sync::Lazy;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::infrastructure::config::LoggingConfig;

// Keeps the non-blocking file writers alive for the process lifetime
static LOG_GUARDS: Lazy<Mutex<Vec<WorkerGuard>>> = Lazy::new(|| Mutex::new(Vec::new()));

fn level_filter(config: &LoggingConfig) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = match config.level.to_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARNING" | "WARN" => "warn",
        "ERROR" => "error",
        _ => "info",
    };
    EnvFilter::new(format!("marketsync_lib={level},marketsync={level},warn"))
}

/// Initialize the tracing subscriber. Call once at startup.
pub fn init_logging(config: &LoggingConfig, data_dir: &Path) -> Result<()> {
    let filter = level_filter(config);
    let console_layer = tracing_subscriber::fmt::layer().with_target(true);

    if config.file_enabled {
        let log_dir = data_dir.join("logs");
        std::fs::create_dir_all(&log_dir)?;
        let appender = tracing_appender::rolling::daily(&log_dir, "marketsync.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        LOG_GUARDS.lock().expect("log guard mutex").push(guard);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false);
        if config.json_format {
            tracing_subscriber::registry()
                .with(filter)
                .with(console_layer)
                .with(file_layer.json())
                .try_init()
                .ok();
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(console_layer)
                .with(file_layer)
                .try_init()
                .ok();
        }
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .try_init()
            .ok();
    }

    Ok(())
}
