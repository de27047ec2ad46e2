//! Identity & rate pool
//!
//! Hands out (user-agent, proxy, cookie jar) identities for outbound
//! requests and enforces the per-host QPS ceiling through token buckets.
//! Identities that draw blocks, captchas or rate-limit responses cool down
//! exponentially before re-entering rotation. Waiters are served FIFO-fair
//! per host; waiting is bounded and ends in `NoIdentityAvailable`.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use tracing::{debug, warn};

use crate::infrastructure::config::{FetcherConfig, IdentityConfig};

/// Outcome of a request made under an identity, reported on release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Success,
    NotFound,
    TooManyRequests,
    Blocked,
    Captcha,
    ServerError,
    NetworkError,
}

impl FetchOutcome {
    /// Whether the outcome puts the identity into cooldown
    pub fn penalizes(&self) -> bool {
        matches!(
            self,
            Self::TooManyRequests | Self::Blocked | Self::Captcha | Self::ServerError
        )
    }
}

/// Pool failures
#[derive(Debug, thiserror::Error)]
pub enum IdentityPoolError {
    #[error("no identity available for host '{host}' within {waited_secs}s")]
    NoIdentityAvailable { host: String, waited_secs: u64 },

    #[error("identity pool construction failed: {0}")]
    Build(String),
}

/// A leased identity. The client carries the identity's cookie jar, so
/// cookie reuse within an identity is automatic.
#[derive(Clone, Debug)]
pub struct IdentityLease {
    pub identity_id: usize,
    pub user_agent: String,
    pub proxy: Option<String>,
    pub client: reqwest::Client,
}

struct IdentityState {
    user_agent: String,
    proxy: Option<String>,
    client: reqwest::Client,
    cooldown_until: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

impl IdentityState {
    fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map_or(true, |until| until <= now)
    }
}

struct HostGate {
    /// FIFO turnstile: tokio mutexes queue waiters fairly
    turnstile: tokio::sync::Mutex<()>,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

/// Shared identity pool, one per process
pub struct IdentityPool {
    states: tokio::sync::Mutex<Vec<IdentityState>>,
    rotation: AtomicUsize,
    host_gates: tokio::sync::Mutex<HashMap<String, Arc<HostGate>>>,
    per_host_qps: u32,
    per_host_burst: u32,
    acquire_timeout: Duration,
    cooldown_base: Duration,
    cooldown_cap: Duration,
}

impl IdentityPool {
    pub fn new(identity: &IdentityConfig, fetcher: &FetcherConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(!identity.user_agents.is_empty(), "identity pool needs at least one user agent");

        let mut states = Vec::new();
        // Cross user agents with proxies; with no proxies each UA is a
        // direct identity.
        let proxies: Vec<Option<String>> = if identity.proxies.is_empty() {
            vec![None]
        } else {
            identity.proxies.iter().cloned().map(Some).collect()
        };

        for user_agent in &identity.user_agents {
            for proxy in &proxies {
                let mut builder = reqwest::Client::builder()
                    .user_agent(user_agent.clone())
                    .cookie_store(true)
                    .gzip(true)
                    .connect_timeout(Duration::from_secs(fetcher.connect_timeout_secs))
                    .timeout(Duration::from_secs(fetcher.total_timeout_secs))
                    .redirect(reqwest::redirect::Policy::limited(10));
                if let Some(proxy_url) = proxy {
                    builder = builder.proxy(
                        reqwest::Proxy::all(proxy_url)
                            .with_context(|| format!("invalid proxy url {proxy_url}"))?,
                    );
                }
                states.push(IdentityState {
                    user_agent: user_agent.clone(),
                    proxy: proxy.clone(),
                    client: builder.build().context("building identity http client")?,
                    cooldown_until: None,
                    consecutive_failures: 0,
                });
            }
        }

        Ok(Self {
            states: tokio::sync::Mutex::new(states),
            rotation: AtomicUsize::new(0),
            host_gates: tokio::sync::Mutex::new(HashMap::new()),
            per_host_qps: identity.per_host_qps.max(1),
            per_host_burst: identity.per_host_burst.max(1),
            acquire_timeout: Duration::from_secs(identity.acquire_timeout_secs),
            cooldown_base: Duration::from_secs(identity.cooldown_base_secs),
            cooldown_cap: Duration::from_secs(identity.cooldown_cap_secs),
        })
    }

    async fn host_gate(&self, host: &str) -> Arc<HostGate> {
        let mut gates = self.host_gates.lock().await;
        gates
            .entry(host.to_string())
            .or_insert_with(|| {
                let quota = Quota::per_second(NonZeroU32::new(self.per_host_qps).expect("qps >= 1"))
                    .allow_burst(NonZeroU32::new(self.per_host_burst).expect("burst >= 1"));
                Arc::new(HostGate {
                    turnstile: tokio::sync::Mutex::new(()),
                    limiter: RateLimiter::direct(quota),
                })
            })
            .clone()
    }

    /// Acquire an identity for a request to `host`, respecting the host's
    /// token bucket. Waits FIFO-fair behind other callers for the same host.
    pub async fn acquire(&self, host: &str) -> Result<IdentityLease, IdentityPoolError> {
        let gate = self.host_gate(host).await;
        let waited = self.acquire_timeout;

        let result = tokio::time::timeout(self.acquire_timeout, async {
            let _turn = gate.turnstile.lock().await;
            gate.limiter.until_ready().await;
            self.pick_identity().await
        })
        .await;

        match result {
            Ok(lease) => Ok(lease),
            Err(_elapsed) => Err(IdentityPoolError::NoIdentityAvailable {
                host: host.to_string(),
                waited_secs: waited.as_secs(),
            }),
        }
    }

    /// Next non-cooling identity in rotation; sleeps until the earliest
    /// cooldown ends when all are penalized (bounded by the caller timeout).
    async fn pick_identity(&self) -> IdentityLease {
        loop {
            let now = Utc::now();
            let earliest_wakeup = {
                let states = self.states.lock().await;
                let count = states.len();
                let start = self.rotation.fetch_add(1, Ordering::Relaxed);

                let mut found = None;
                for offset in 0..count {
                    let index = (start + offset) % count;
                    if states[index].is_available(now) {
                        found = Some(index);
                        break;
                    }
                }

                if let Some(index) = found {
                    let state = &states[index];
                    return IdentityLease {
                        identity_id: index,
                        user_agent: state.user_agent.clone(),
                        proxy: state.proxy.clone(),
                        client: state.client.clone(),
                    };
                }

                states
                    .iter()
                    .filter_map(|s| s.cooldown_until)
                    .min()
                    .unwrap_or_else(|| now + chrono::Duration::seconds(1))
            };

            let sleep_for = (earliest_wakeup - Utc::now()).to_std().unwrap_or(Duration::from_millis(50));
            tokio::time::sleep(sleep_for.min(Duration::from_secs(5))).await;
        }
    }

    /// Report the outcome of a request made with `identity_id`.
    pub async fn release(&self, host: &str, identity_id: usize, outcome: FetchOutcome) {
        let mut states = self.states.lock().await;
        let Some(state) = states.get_mut(identity_id) else {
            return;
        };

        if outcome.penalizes() {
            state.consecutive_failures += 1;
            let exponent = state.consecutive_failures.saturating_sub(1).min(16);
            let cooldown = self
                .cooldown_base
                .saturating_mul(2u32.saturating_pow(exponent))
                .min(self.cooldown_cap);
            state.cooldown_until = Some(Utc::now() + chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::seconds(30)));
            warn!(
                "Identity {} penalized on {} ({:?}), cooling down {}s",
                identity_id,
                host,
                outcome,
                cooldown.as_secs()
            );
        } else {
            if state.consecutive_failures > 0 {
                debug!("Identity {} recovered on {}", identity_id, host);
            }
            state.consecutive_failures = 0;
            state.cooldown_until = None;
        }
    }

    /// Identities currently in rotation (not cooling down)
    pub async fn available_count(&self) -> usize {
        let now = Utc::now();
        self.states.lock().await.iter().filter(|s| s.is_available(now)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_config(timeout_secs: u64) -> (IdentityConfig, FetcherConfig) {
        let identity = IdentityConfig {
            user_agents: vec!["ua-one".to_string(), "ua-two".to_string()],
            proxies: Vec::new(),
            per_host_qps: 100,
            per_host_burst: 100,
            acquire_timeout_secs: timeout_secs,
            cooldown_base_secs: 30,
            cooldown_cap_secs: 1800,
        };
        let fetcher = FetcherConfig {
            download_delay_ms: 0,
            delay_jitter_frac: 0.0,
            connect_timeout_secs: 5,
            read_timeout_secs: 5,
            total_timeout_secs: 5,
            respect_robots_txt: false,
        };
        (identity, fetcher)
    }

    #[tokio::test]
    async fn rotates_identities() {
        let (identity, fetcher) = pool_config(5);
        let pool = IdentityPool::new(&identity, &fetcher).unwrap();

        let first = pool.acquire("example.com").await.unwrap();
        let second = pool.acquire("example.com").await.unwrap();
        assert_ne!(first.identity_id, second.identity_id);
    }

    #[tokio::test]
    async fn penalized_identity_leaves_rotation() {
        let (identity, fetcher) = pool_config(5);
        let pool = IdentityPool::new(&identity, &fetcher).unwrap();
        assert_eq!(pool.available_count().await, 2);

        pool.release("example.com", 0, FetchOutcome::Captcha).await;
        assert_eq!(pool.available_count().await, 1);

        let lease = pool.acquire("example.com").await.unwrap();
        assert_eq!(lease.identity_id, 1);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let (identity, fetcher) = pool_config(1);
        let pool = IdentityPool::new(&identity, &fetcher).unwrap();
        pool.release("h", 0, FetchOutcome::Blocked).await;
        pool.release("h", 1, FetchOutcome::Blocked).await;

        let err = pool.acquire("h").await.unwrap_err();
        assert!(matches!(err, IdentityPoolError::NoIdentityAvailable { .. }));
    }

    #[tokio::test]
    async fn success_clears_cooldown_state() {
        let (identity, fetcher) = pool_config(5);
        let pool = IdentityPool::new(&identity, &fetcher).unwrap();

        pool.release("h", 0, FetchOutcome::ServerError).await;
        pool.release("h", 0, FetchOutcome::Success).await;
        assert_eq!(pool.available_count().await, 2);
    }
}
