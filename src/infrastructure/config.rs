//! Configuration infrastructure
//!
//! Layered application configuration: defaults, an optional JSON config
//! file under the data directory, and environment variable overrides
//! (highest precedence). The recognized environment variables are the
//! operational set: `DB_URL`, `QUEUE_URL`, `LOG_LEVEL`,
//! `CONCURRENT_REQUESTS`, `DOWNLOAD_DELAY_MS`, `ROBOTS_RESPECT`,
//! `DATA_DIR`, `IMAGE_DIR`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::queue::watermark::Watermarks;

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub fetcher: FetcherConfig,
    pub identity: IdentityConfig,
    pub worker: WorkerConfig,
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    pub supervision: SupervisionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Authoritative relational store
    pub db_url: String,
    /// Queue store; defaults to `db_url` (one authoritative store)
    pub queue_url: Option<String>,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn effective_queue_url(&self) -> &str {
        self.queue_url.as_deref().unwrap_or(&self.db_url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// DEBUG, INFO, WARNING or ERROR
    pub level: String,
    pub file_enabled: bool,
    pub json_format: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Minimum delay between requests to one host, before jitter
    pub download_delay_ms: u64,
    /// Jitter fraction applied over the minimum delay (0.2 = +-20%)
    pub delay_jitter_frac: f64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub total_timeout_secs: u64,
    pub respect_robots_txt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub user_agents: Vec<String>,
    pub proxies: Vec<String>,
    /// Per-host request ceiling
    pub per_host_qps: u32,
    pub per_host_burst: u32,
    /// Bound on waiting for an identity before NoIdentityAvailable
    pub acquire_timeout_secs: u64,
    pub cooldown_base_secs: u64,
    pub cooldown_cap_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Parallel task slots per worker process
    pub concurrency: usize,
    /// Bounded internal concurrency budget per handler (e.g. parallel
    /// image downloads within one page)
    pub handler_parallelism: usize,
    pub lease_ttl_secs: u64,
    pub soft_timeout_secs: u64,
    pub hard_timeout_secs: u64,
    /// Idle backoff when every bound queue is drained
    pub idle_poll_ms: u64,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    /// Jitter fraction on retry delays (0.25 = +-25%)
    pub jitter_frac: f64,
    /// Attempts allowed for auth-shaped failures before going manual
    pub auth_max_attempts: u32,
    pub auth_cooldown_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub watermarks: HashMap<String, Watermarks>,
    /// Checkpoint audit retention after cancellation
    pub checkpoint_retention_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub image_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisionConfig {
    /// Error-rate window length
    pub error_window_secs: u64,
    /// Error ratio that triggers an observability event
    pub error_rate_threshold: f64,
    /// Stalled threshold: leased without heartbeat for this long
    pub stalled_after_secs: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut watermarks = HashMap::new();
        for queue in crate::queue::standard_queues() {
            watermarks.insert(queue, Watermarks::default());
        }

        Self {
            database: DatabaseConfig {
                db_url: "sqlite://data/marketsync.db".to_string(),
                queue_url: None,
                max_connections: 5,
            },
            logging: LoggingConfig {
                level: "INFO".to_string(),
                file_enabled: true,
                json_format: false,
            },
            fetcher: FetcherConfig {
                download_delay_ms: 1000,
                delay_jitter_frac: 0.2,
                connect_timeout_secs: 10,
                read_timeout_secs: 20,
                total_timeout_secs: 30,
                respect_robots_txt: true,
            },
            identity: IdentityConfig {
                user_agents: default_user_agents(),
                proxies: Vec::new(),
                per_host_qps: 2,
                per_host_burst: 4,
                acquire_timeout_secs: 30,
                cooldown_base_secs: 30,
                cooldown_cap_secs: 1800,
            },
            worker: WorkerConfig {
                concurrency: 4,
                handler_parallelism: 4,
                lease_ttl_secs: 120,
                soft_timeout_secs: 90,
                hard_timeout_secs: 110,
                idle_poll_ms: 500,
                retry: RetryConfig {
                    base_delay_ms: 2000,
                    backoff_factor: 2.0,
                    max_delay_ms: 60_000,
                    max_attempts: 5,
                    jitter_frac: 0.25,
                    auth_max_attempts: 2,
                    auth_cooldown_ms: 300_000,
                },
            },
            queue: QueueConfig {
                watermarks,
                checkpoint_retention_days: 7,
            },
            storage: StorageConfig {
                data_dir: PathBuf::from("data"),
                image_dir: PathBuf::from("data/images"),
            },
            supervision: SupervisionConfig {
                error_window_secs: 300,
                error_rate_threshold: 0.5,
                stalled_after_secs: 180,
            },
        }
    }
}

fn default_user_agents() -> Vec<String> {
    [
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl AppConfig {
    /// Load the config file if present, otherwise write defaults, then
    /// apply environment overrides.
    pub async fn load(config_path: &Path) -> Result<Self> {
        let mut config = if config_path.exists() {
            let raw = fs::read_to_string(config_path)
                .await
                .with_context(|| format!("reading config file {}", config_path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing config file {}", config_path.display()))?
        } else {
            let config = Self::default();
            if let Some(parent) = config_path.parent() {
                fs::create_dir_all(parent).await.ok();
            }
            let serialized = serde_json::to_string_pretty(&config)?;
            fs::write(config_path, serialized)
                .await
                .with_context(|| format!("writing default config to {}", config_path.display()))?;
            info!("Wrote default configuration to {}", config_path.display());
            config
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables win over the config file
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("DB_URL") {
            self.database.db_url = value;
        }
        if let Ok(value) = std::env::var("QUEUE_URL") {
            self.database.queue_url = Some(value);
        }
        if let Ok(value) = std::env::var("LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Ok(value) = std::env::var("CONCURRENT_REQUESTS") {
            match value.parse::<usize>() {
                Ok(parsed) if parsed > 0 => self.worker.concurrency = parsed,
                _ => warn!("Ignoring invalid CONCURRENT_REQUESTS value: {value}"),
            }
        }
        if let Ok(value) = std::env::var("DOWNLOAD_DELAY_MS") {
            match value.parse::<u64>() {
                Ok(parsed) => self.fetcher.download_delay_ms = parsed,
                Err(_) => warn!("Ignoring invalid DOWNLOAD_DELAY_MS value: {value}"),
            }
        }
        if let Ok(value) = std::env::var("ROBOTS_RESPECT") {
            match value.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.fetcher.respect_robots_txt = true,
                "0" | "false" | "no" => self.fetcher.respect_robots_txt = false,
                _ => warn!("Ignoring invalid ROBOTS_RESPECT value: {value}"),
            }
        }
        if let Ok(value) = std::env::var("DATA_DIR") {
            self.storage.data_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("IMAGE_DIR") {
            self.storage.image_dir = PathBuf::from(value);
        }
    }

    /// Default config file location under the data directory
    pub fn default_path() -> PathBuf {
        let data_dir = std::env::var("DATA_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("data"));
        data_dir.join("config.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_url_falls_back_to_db_url() {
        let config = AppConfig::default();
        assert_eq!(config.database.effective_queue_url(), config.database.db_url);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = AppConfig::default();
        std::env::set_var("DOWNLOAD_DELAY_MS", "2500");
        std::env::set_var("ROBOTS_RESPECT", "false");
        config.apply_env_overrides();
        std::env::remove_var("DOWNLOAD_DELAY_MS");
        std::env::remove_var("ROBOTS_RESPECT");

        assert_eq!(config.fetcher.download_delay_ms, 2500);
        assert!(!config.fetcher.respect_robots_txt);
    }
}
