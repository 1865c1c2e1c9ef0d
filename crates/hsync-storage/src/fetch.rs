//! Bounded, paced and retrying HTTP GETs shared by every source adapter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::pacing::{SimpleTokenBucket, TokenBucketConfig};

/// Whether a failed attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    Fatal,
}

impl RetryDisposition {
    /// Throttling and server-side failures are transient.
    pub fn for_status(status: StatusCode) -> Self {
        match status.as_u16() {
            429 | 500..=599 => Self::Retryable,
            _ => Self::Fatal,
        }
    }

    pub fn for_transport(err: &reqwest::Error) -> Self {
        match (err.is_timeout(), err.is_connect(), err.is_request()) {
            (false, false, false) => Self::Fatal,
            _ => Self::Retryable,
        }
    }
}

/// Capped exponential backoff. A server-supplied `Retry-After` replaces the
/// computed delay but is still capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: usize,
    pub first_delay: Duration,
    pub delay_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retries: 3,
            first_delay: Duration::from_millis(250),
            delay_cap: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(attempt)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        self.first_delay.saturating_mul(factor).min(self.delay_cap)
    }

    /// Delay before retry number `attempt + 1`, or `None` once retries are spent.
    pub fn next_delay(&self, attempt: usize, retry_after: Option<Duration>) -> Option<Duration> {
        if attempt >= self.retries {
            return None;
        }
        Some(
            retry_after
                .map(|hint| hint.min(self.delay_cap))
                .unwrap_or_else(|| self.delay_for_attempt(attempt)),
        )
    }
}

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

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub request_timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub max_in_flight_per_source: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        HttpClientConfig {
            request_timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 16,
            max_in_flight_per_source: 2,
            retry: RetryPolicy::default(),
        }
    }
}

/// A GET request with query parameters and extra headers.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// A successful (2xx) response, fully buffered.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{url} answered {status}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

struct AttemptFailure {
    error: FetchError,
    disposition: RetryDisposition,
    retry_after: Option<Duration>,
}

#[derive(Debug, Clone)]
struct SourceLimits {
    permits: Arc<Semaphore>,
    pacing: Option<Arc<SimpleTokenBucket>>,
}

/// Shared by every adapter in a run. Requests are bounded globally and per
/// source, and paced per source when pacing is registered.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    in_flight_per_source: usize,
    sources: Mutex<HashMap<String, SourceLimits>>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let builder = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .gzip(true)
            .brotli(true);
        let builder = match config.user_agent {
            Some(agent) => builder.user_agent(agent),
            None => builder,
        };

        Ok(HttpFetcher {
            client: builder.build().context("building reqwest client")?,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            in_flight_per_source: config.max_in_flight_per_source.max(1),
            sources: Mutex::new(HashMap::new()),
            retry: config.retry,
        })
    }

    /// Spaces out requests for one source. Sources without pacing are unthrottled.
    pub async fn set_source_pacing(&self, source_name: &str, config: TokenBucketConfig) {
        let mut sources = self.sources.lock().await;
        let limits = sources
            .entry(source_name.to_string())
            .or_insert_with(|| self.new_limits());
        limits.pacing = Some(Arc::new(SimpleTokenBucket::new(config)));
    }

    fn new_limits(&self) -> SourceLimits {
        SourceLimits {
            permits: Arc::new(Semaphore::new(self.in_flight_per_source)),
            pacing: None,
        }
    }

    async fn limits_for(&self, source_name: &str) -> SourceLimits {
        self.sources
            .lock()
            .await
            .entry(source_name.to_string())
            .or_insert_with(|| self.new_limits())
            .clone()
    }

    /// GETs `request` on behalf of `source_name`, retrying transient failures.
    pub async fn fetch(
        &self,
        run_id: Uuid,
        source_name: &str,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let limits = self.limits_for(source_name).await;
        let _global = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let _source = limits
            .permits
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", %run_id, source_name, url = %request.url);
        async {
            let mut attempt = 0usize;
            loop {
                if let Some(pacing) = &limits.pacing {
                    pacing.take().await;
                }
                let failure = match self.send_once(request).await {
                    Ok(response) => return Ok(response),
                    Err(failure) => failure,
                };
                let delay = match failure.disposition {
                    RetryDisposition::Retryable => {
                        self.retry.next_delay(attempt, failure.retry_after)
                    }
                    RetryDisposition::Fatal => None,
                };
                let Some(delay) = delay else {
                    return Err(failure.error);
                };
                debug!(attempt, ?delay, error = %failure.error, "retrying request");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
        .instrument(span)
        .await
    }

    async fn send_once(&self, request: &FetchRequest) -> Result<FetchedResponse, AttemptFailure> {
        let mut builder = self.client.get(&request.url).query(&request.query);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let transport = |err: reqwest::Error| AttemptFailure {
            disposition: RetryDisposition::for_transport(&err),
            retry_after: None,
            error: FetchError::Request(err),
        };
        let response = builder.send().await.map_err(transport)?;
        let (status, url) = (response.status(), response.url().to_string());

        if !status.is_success() {
            return Err(AttemptFailure {
                disposition: RetryDisposition::for_status(status),
                retry_after: retry_after(response.headers()),
                error: FetchError::HttpStatus {
                    status: status.as_u16(),
                    url,
                },
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await.map_err(transport)?.to_vec();
        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status,
            url,
            content_type,
            body,
        })
    }
}
