//! Polite HTTP fetcher
//!
//! Issues one request at a time under an identity from the pool, applies
//! randomized jitter over the host's minimum delay, decodes the response by
//! its declared charset (falling back to meta-tag sniffing) and returns a
//! typed error on every failure path. robots.txt is honored by default with
//! a per-request override. The fetcher holds no per-request state beyond
//! what the identity pool tracks.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::infrastructure::config::FetcherConfig;
use crate::infrastructure::identity_pool::{FetchOutcome, IdentityPool, IdentityPoolError};

/// Typed fetch failures. The worker's retry classification keys off these.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("connection refused")]
    ConnectRefused,

    #[error("rate limited by remote host")]
    TooManyRequests,

    #[error("access forbidden")]
    Forbidden,

    #[error("captcha challenge served")]
    Captcha,

    #[error("resource not found")]
    NotFound,

    #[error("server error (status {status})")]
    ServerError { status: u16 },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("robots.txt disallows {url}")]
    RobotsDisallowed { url: String },

    #[error(transparent)]
    NoIdentity(#[from] IdentityPoolError),

    #[error("fetch cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    Network(String),
}

impl FetchError {
    /// Error code used in work-item records and run error digests
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout => "Timeout",
            Self::ConnectRefused => "ConnectRefused",
            Self::TooManyRequests => "TooManyRequests",
            Self::Forbidden => "Forbidden",
            Self::Captcha => "Captcha",
            Self::NotFound => "NotFound",
            Self::ServerError { .. } => "ServerError",
            Self::Malformed(_) => "Malformed",
            Self::RobotsDisallowed { .. } => "RobotsDisallowed",
            Self::NoIdentity(_) => "NoIdentityAvailable",
            Self::Cancelled => "Cancelled",
            Self::Network(_) => "ConnectionError",
        }
    }

    fn outcome(&self) -> FetchOutcome {
        match self {
            Self::TooManyRequests => FetchOutcome::TooManyRequests,
            Self::Forbidden => FetchOutcome::Blocked,
            Self::Captcha => FetchOutcome::Captcha,
            Self::NotFound => FetchOutcome::NotFound,
            Self::ServerError { .. } => FetchOutcome::ServerError,
            _ => FetchOutcome::NetworkError,
        }
    }
}

/// One outbound request
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: reqwest::Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Per-request robots override; `None` uses the configured default
    pub respect_robots: Option<bool>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: reqwest::Method::GET,
            headers: Vec::new(),
            body: None,
            respect_robots: None,
        }
    }

    pub fn ignore_robots(mut self) -> Self {
        self.respect_robots = Some(false);
        self
    }
}

/// Decoded response
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub final_url: String,
    pub status: u16,
    pub body: Vec<u8>,
    pub text: String,
    pub content_type: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

// Header baseline reproducing a common browser ordering
const BASE_HEADERS: &[(&str, &str)] = &[
    ("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    ("Accept-Language", "zh-CN,zh;q=0.9,en;q=0.8"),
    ("Connection", "keep-alive"),
    ("Upgrade-Insecure-Requests", "1"),
    ("Cache-Control", "max-age=0"),
];

static CAPTCHA_MARKERS: &[&str] = &["captcha", "verify-code", "punish?x5secdata", "security check", "滑动验证"];

static META_CHARSET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<meta[^>]+charset\s*=\s*["']?\s*([a-zA-Z0-9_\-]+)"#).expect("meta charset regex")
});

struct RobotsEntry {
    disallowed: Vec<String>,
    fetched_at: DateTime<Utc>,
}

/// The polite HTTP fetcher (C3)
pub struct Fetcher {
    pool: std::sync::Arc<IdentityPool>,
    config: FetcherConfig,
    robots_cache: tokio::sync::Mutex<HashMap<String, RobotsEntry>>,
}

impl Fetcher {
    pub fn new(pool: std::sync::Arc<IdentityPool>, config: FetcherConfig) -> Self {
        Self {
            pool,
            config,
            robots_cache: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a URL, returning the decoded response or a typed error.
    pub async fn fetch(
        &self,
        request: FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse, FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let parsed = url::Url::parse(&request.url)
            .map_err(|e| FetchError::Malformed(format!("invalid url {}: {e}", request.url)))?;
        let host = parsed.host_str().unwrap_or_default().to_string();

        let respect_robots = request.respect_robots.unwrap_or(self.config.respect_robots_txt);
        if respect_robots && !self.allowed_by_robots(&parsed, cancel).await? {
            return Err(FetchError::RobotsDisallowed { url: request.url });
        }

        self.polite_delay(cancel).await?;

        let lease = self.pool.acquire(&host).await?;
        let result = self.send(&lease.client, &request, cancel).await;

        let outcome = match &result {
            Ok(_) => FetchOutcome::Success,
            Err(error) => error.outcome(),
        };
        self.pool.release(&host, lease.identity_id, outcome).await;

        result
    }

    /// Randomized jitter (+-delay_jitter_frac) over the host minimum delay
    async fn polite_delay(&self, cancel: &CancellationToken) -> Result<(), FetchError> {
        let base_ms = self.config.download_delay_ms;
        if base_ms == 0 {
            return Ok(());
        }
        let spread = (base_ms as f64 * self.config.delay_jitter_frac) as i64;
        let offset = if spread > 0 { fastrand::i64(-spread..=spread) } else { 0 };
        let delay_ms = (base_ms as i64 + offset).max(0) as u64;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => Ok(()),
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
        }
    }

    async fn send(
        &self,
        client: &reqwest::Client,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse, FetchError> {
        let mut builder = client.request(request.method.clone(), &request.url);
        for (name, value) in BASE_HEADERS {
            builder = builder.header(*name, *value);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = tokio::select! {
            result = builder.send() => result.map_err(classify_reqwest_error)?,
            _ = cancel.cancelled() => {
                warn!("Fetch cancelled mid-request: {}", request.url);
                return Err(FetchError::Cancelled);
            }
        };

        let status = response.status();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        match status.as_u16() {
            403 => return Err(FetchError::Forbidden),
            404 | 410 => return Err(FetchError::NotFound),
            429 => return Err(FetchError::TooManyRequests),
            code if code >= 500 => return Err(FetchError::ServerError { status: code }),
            _ => {}
        }

        let body = tokio::select! {
            result = response.bytes() => result.map_err(classify_reqwest_error)?.to_vec(),
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
        };

        let text = decode_body(&body, content_type.as_deref());

        if looks_like_captcha(&final_url, &text) {
            return Err(FetchError::Captcha);
        }

        debug!("Fetched {} ({}, {} bytes)", final_url, status, body.len());
        Ok(FetchResponse {
            final_url,
            status: status.as_u16(),
            body,
            text,
            content_type,
            fetched_at: Utc::now(),
        })
    }

    /// Minimal robots.txt gate: Disallow prefixes for `*` agents.
    /// A missing or unreachable robots.txt allows the fetch.
    async fn allowed_by_robots(
        &self,
        url: &url::Url,
        cancel: &CancellationToken,
    ) -> Result<bool, FetchError> {
        let host = url.host_str().unwrap_or_default().to_string();
        let path = url.path().to_string();
        let now = Utc::now();

        {
            let cache = self.robots_cache.lock().await;
            if let Some(entry) = cache.get(&host) {
                if now - entry.fetched_at < chrono::Duration::hours(6) {
                    return Ok(!entry.disallowed.iter().any(|prefix| path.starts_with(prefix)));
                }
            }
        }

        let robots_url = format!("{}://{}/robots.txt", url.scheme(), host);
        let lease = self.pool.acquire(&host).await?;
        let fetched = tokio::select! {
            result = lease.client.get(&robots_url).send() => result,
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
        };
        self.pool.release(&host, lease.identity_id, FetchOutcome::Success).await;

        let disallowed = match fetched {
            Ok(response) if response.status().is_success() => {
                let body = response.text().await.unwrap_or_default();
                parse_robots_disallows(&body)
            }
            _ => {
                debug!("robots.txt unavailable for {host}, assuming allowed");
                Vec::new()
            }
        };

        let allowed = !disallowed.iter().any(|prefix| path.starts_with(prefix));
        self.robots_cache.lock().await.insert(
            host,
            RobotsEntry { disallowed, fetched_at: now },
        );
        Ok(allowed)
    }
}

fn classify_reqwest_error(error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout
    } else if error.is_connect() {
        FetchError::ConnectRefused
    } else {
        FetchError::Network(error.to_string())
    }
}

fn looks_like_captcha(final_url: &str, text: &str) -> bool {
    let url_lower = final_url.to_lowercase();
    if url_lower.contains("captcha") || url_lower.contains("/punish") {
        return true;
    }
    // Challenge pages are small; skip scanning real content bodies
    if text.len() < 20_000 {
        let lower = text.to_lowercase();
        return CAPTCHA_MARKERS.iter().any(|marker| lower.contains(marker));
    }
    false
}

/// Collect `Disallow:` prefixes that apply to `User-agent: *`
fn parse_robots_disallows(body: &str) -> Vec<String> {
    let mut disallowed = Vec::new();
    let mut applies = false;
    for line in body.lines() {
        let line = line.trim();
        if let Some(agent) = line.strip_prefix("User-agent:") {
            applies = agent.trim() == "*";
        } else if applies {
            if let Some(path) = line.strip_prefix("Disallow:") {
                let path = path.trim();
                if !path.is_empty() {
                    disallowed.push(path.to_string());
                }
            }
        }
    }
    disallowed
}

/// Decode by declared charset, falling back to meta-tag sniffing, then UTF-8
fn decode_body(body: &[u8], content_type: Option<&str>) -> String {
    let header_charset = content_type.and_then(|ct| {
        ct.split(';')
            .find_map(|part| part.trim().strip_prefix("charset="))
            .map(|c| c.trim_matches('"').to_string())
    });

    let charset = header_charset.or_else(|| {
        let head = &body[..body.len().min(4096)];
        let ascii_head = String::from_utf8_lossy(head);
        META_CHARSET_RE
            .captures(&ascii_head)
            .map(|caps| caps[1].to_string())
    });

    match charset.as_deref() {
        Some(label) => {
            let encoding = encoding_rs::Encoding::for_label(label.as_bytes())
                .unwrap_or(encoding_rs::UTF_8);
            let (decoded, _, _) = encoding.decode(body);
            decoded.into_owned()
        }
        None => String::from_utf8_lossy(body).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn robots_parser_scopes_to_wildcard_agent() {
        let body = "User-agent: googlebot\nDisallow: /private\n\nUser-agent: *\nDisallow: /admin\nDisallow: /cart\n";
        let disallows = parse_robots_disallows(body);
        assert_eq!(disallows, vec!["/admin".to_string(), "/cart".to_string()]);
    }

    #[test]
    fn decode_prefers_header_charset() {
        // GBK bytes for 苹果
        let gbk_bytes = [0xC6u8, 0xBB, 0xB9, 0xFB];
        let decoded = decode_body(&gbk_bytes, Some("text/html; charset=gbk"));
        assert_eq!(decoded, "苹果");
    }

    #[test]
    fn decode_sniffs_meta_charset() {
        let mut body = b"<html><head><meta charset=\"gbk\"></head><body>".to_vec();
        body.extend_from_slice(&[0xC6u8, 0xBB, 0xB9, 0xFB]);
        let decoded = decode_body(&body, Some("text/html"));
        assert!(decoded.contains("苹果"));
    }

    #[test]
    fn captcha_detection_on_challenge_markers() {
        assert!(looks_like_captcha("https://x.example.com/punish?x5secdata=1", ""));
        assert!(looks_like_captcha("https://ok.example.com/item", "<html>please complete the captcha</html>"));
        assert!(!looks_like_captcha("https://ok.example.com/item", "<html>regular product page</html>"));
    }

    #[test]
    fn fetch_error_codes_are_stable() {
        assert_eq!(FetchError::Timeout.code(), "Timeout");
        assert_eq!(FetchError::ServerError { status: 502 }.code(), "ServerError");
        assert_eq!(FetchError::Captcha.code(), "Captcha");
    }
}
