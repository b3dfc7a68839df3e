//! Shared HTTP client for every fetcher: timeouts, concurrency limits, rate
//! limiting, and retries for throttled responses only. Page-level retries
//! of other failures belong to the load coordinator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// `base * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// At most `burst` requests back to back, then one per `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub burst: u32,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Sent with every request (`Accept-Language`, `Accept`, ...).
    pub default_headers: Vec<(String, String)>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    /// Applied to 429/503 responses; `Retry-After` wins when present.
    pub throttle_backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            default_headers: vec![("Accept-Language".into(), "en-IE,en;q=0.9".into())],
            global_concurrency: 8,
            per_source_concurrency: 1,
            throttle_backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Request spacing with burst allowance. A caller reserves its slot under
/// the lock and sleeps outside it, so waiters are served in arrival order.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    tolerance: Duration,
    next_free: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            interval: limit.interval,
            tolerance: limit.interval.saturating_mul(limit.burst.saturating_sub(1)),
            next_free: Mutex::new(None),
        }
    }

    pub async fn acquire(&self) {
        let wait = {
            let mut next_free = self.next_free.lock().await;
            let now = Instant::now();
            let theoretical = next_free.map_or(now, |t| t.max(now));
            let wait = theoretical
                .saturating_duration_since(now)
                .saturating_sub(self.tolerance);
            *next_free = Some(theoretical + self.interval);
            wait
        };
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "rate limited");
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("http client shut down")]
    Closed,
}

impl HttpError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, HttpError::Request { source, .. } if source.is_timeout())
    }

    /// Worth another attempt later: network trouble, server errors, throttling.
    pub fn is_transient(&self) -> bool {
        match self {
            HttpError::Request { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request() || source.is_body()
            }
            HttpError::Status { status, .. } => {
                *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            HttpError::Closed => false,
        }
    }
}

fn is_throttled(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE
}

/// Only the delta-seconds form; HTTP-dates fall back to the backoff.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn header_map(headers: &[(String, String)]) -> anyhow::Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name `{name}`"))?;
        let value = HeaderValue::from_str(value)
            .with_context(|| format!("invalid value for header `{name}`"))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    rate_limiter: Option<RateLimiter>,
    throttle_backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(header_map(&config.default_headers)?);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building http client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            rate_limiter: config.rate_limit.map(RateLimiter::new),
            throttle_backoff: config.throttle_backoff,
        })
    }

    async fn source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// GET `url` on behalf of `source_id`. Non-success statuses are errors.
    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, HttpError> {
        let source_limit = self.source_semaphore(source_id).await;
        let _source = source_limit.acquire().await.map_err(|_| HttpError::Closed)?;
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| HttpError::Closed)?;

        let span = info_span!("http_fetch", source_id, url);
        self.get_with_throttle_retries(url).instrument(span).await
    }

    async fn get_with_throttle_retries(&self, url: &str) -> Result<FetchedResponse, HttpError> {
        let mut attempt = 0;
        loop {
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|source| HttpError::Request {
                    url: url.to_string(),
                    source,
                })?;
            let status = response.status();
            let final_url = response.url().to_string();

            if status.is_success() {
                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(ToString::to_string);
                let body = response
                    .bytes()
                    .await
                    .map_err(|source| HttpError::Request {
                        url: final_url.clone(),
                        source,
                    })?
                    .to_vec();
                debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                return Ok(FetchedResponse {
                    status,
                    final_url,
                    content_type,
                    body,
                });
            }

            if is_throttled(status) && attempt < self.throttle_backoff.max_retries {
                let wait = retry_after(response.headers())
                    .map(|d| d.min(self.throttle_backoff.max_delay))
                    .unwrap_or_else(|| self.throttle_backoff.delay_for_attempt(attempt));
                warn!(status = status.as_u16(), attempt, wait_ms = wait.as_millis() as u64, "throttled");
                tokio::time::sleep(wait).await;
                attempt += 1;
                continue;
            }

            return Err(HttpError::Status {
                status: status.as_u16(),
                url: final_url,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_millis(350));
    }

    #[test]
    fn retry_after_reads_delta_seconds_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn status_errors_are_transient_only_for_server_side_trouble() {
        let status = |code: u16| HttpError::Status {
            status: code,
            url: "https://listings.test".into(),
        };
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(404).is_transient());
        assert!(!status(403).is_transient());
        assert!(is_throttled(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_throttled(StatusCode::BAD_GATEWAY));
    }

    #[test]
    fn invalid_default_headers_fail_client_construction() {
        let config = HttpClientConfig {
            default_headers: vec![("bad header".into(), "x".into())],
            ..Default::default()
        };
        assert!(HttpFetcher::new(config).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_allows_a_burst_then_spaces_requests() {
        let limiter = RateLimiter::new(RateLimit {
            burst: 2,
            interval: Duration::from_secs(1),
        });
        let started = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(started.elapsed() < Duration::from_millis(10));
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_secs(1));
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
