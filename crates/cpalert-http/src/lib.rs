//! Shared HTTP fetch utilities for contest source adapters.
//!
//! A fetch is exactly one attempt. Retrying belongs to the cascade, which
//! decides from the classified [`SourceFailure`] whether another attempt on the
//! same source is worthwhile.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cpalert_core::SourceFailure;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cpalert-http";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_timeout: Duration,
    pub max_timeout: Duration,
    pub retry_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_timeout: Duration::from_secs(10),
            max_timeout: Duration::from_secs(40),
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl BackoffPolicy {
    pub fn timeout_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_timeout.saturating_mul(factor).min(self.max_timeout)
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.retry_delay.saturating_mul(factor).min(self.max_timeout)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    /// Per-source overrides of `per_source_concurrency`.
    pub source_concurrency: HashMap<String, usize>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: Some(format!("cpalert/{}", env!("CARGO_PKG_VERSION"))),
            global_concurrency: 8,
            per_source_concurrency: 1,
            source_concurrency: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub timeout: Option<Duration>,
    pub pre_call_delay: Duration,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: None,
            pre_call_delay: Duration::ZERO,
            headers: Vec::new(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn pre_call_delay(mut self, delay: Duration) -> Self {
        self.pre_call_delay = delay;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

pub fn classify_status(status: StatusCode) -> SourceFailure {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SourceFailure::Unauthorized,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => SourceFailure::TimedOut,
        StatusCode::TOO_MANY_REQUESTS => SourceFailure::Transient(status.to_string()),
        s if s.is_server_error() => SourceFailure::Transient(s.to_string()),
        s => SourceFailure::Unavailable(s.to_string()),
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> SourceFailure {
    if err.is_timeout() {
        SourceFailure::TimedOut
    } else if err.is_builder() {
        SourceFailure::Unavailable(err.to_string())
    } else {
        SourceFailure::Transient(err.to_string())
    }
}

impl From<FetchError> for SourceFailure {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Timeout { .. } => SourceFailure::TimedOut,
            FetchError::Request { source, .. } => classify_reqwest_error(&source),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(status)
                .map(classify_status)
                .unwrap_or_else(|_| SourceFailure::Unavailable(format!("http status {status}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Reachable,
    Unreachable,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    source_limits: HashMap<String, usize>,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    default_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            source_limits: config.source_concurrency,
            per_source: Mutex::new(HashMap::new()),
            default_timeout: config.timeout,
        })
    }

    pub fn source_limit(&self, source_id: &str) -> usize {
        self.source_limits
            .get(source_id)
            .copied()
            .unwrap_or(self.per_source_limit)
            .max(1)
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.source_limit(source_id))))
            .clone()
    }

    pub async fn get(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: &HttpRequest,
    ) -> Result<FetchedResponse, FetchError> {
        self.send(run_id, source_id, Method::GET, request, None::<&()>)
            .await
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: &HttpRequest,
        body: &B,
    ) -> Result<FetchedResponse, FetchError> {
        self.send(run_id, source_id, Method::POST, request, Some(body))
            .await
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        run_id: Uuid,
        source_id: &str,
        method: Method,
        request: &HttpRequest,
        body: Option<&B>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url = %request.url);
        async {
            let _global = self.global_limit.acquire().await.expect("semaphore not closed");
            let per_source = self.per_source_semaphore(source_id).await;
            let _source = per_source.acquire().await.expect("semaphore not closed");

            if !request.pre_call_delay.is_zero() {
                tokio::time::sleep(request.pre_call_delay).await;
            }

            let timeout = request.timeout.unwrap_or(self.default_timeout);
            let mut builder = self
                .client
                .request(method, &request.url)
                .timeout(timeout);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = body {
                builder = builder.json(body);
            }

            let resp = builder.send().await.map_err(|source| {
                if source.is_timeout() {
                    FetchError::Timeout {
                        url: request.url.clone(),
                    }
                } else {
                    FetchError::Request {
                        url: request.url.clone(),
                        source,
                    }
                }
            })?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                debug!(status = status.as_u16(), "non-success response");
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|source| FetchError::Request {
                    url: final_url.clone(),
                    source,
                })?
                .to_vec();
            debug!(bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn probe(&self, source_id: &str, url: &str) -> ProbeStatus {
        let result = self
            .client
            .get(url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .instrument(info_span!("http_probe", source_id, url))
            .await;
        match result {
            Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
                ProbeStatus::Reachable
            }
            Ok(resp) => {
                debug!(source_id, status = resp.status().as_u16(), "probe got non-success status");
                ProbeStatus::Unreachable
            }
            Err(err) => {
                debug!(source_id, error = %err, "probe failed");
                ProbeStatus::Unreachable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_timeouts_double_and_cap() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(15),
            retry_delay: Duration::from_millis(100),
        };

        assert_eq!(policy.timeout_for_attempt(0), Duration::from_secs(5));
        assert_eq!(policy.timeout_for_attempt(1), Duration::from_secs(10));
        assert_eq!(policy.timeout_for_attempt(2), Duration::from_secs(15));
        assert_eq!(policy.timeout_for_attempt(40), Duration::from_secs(15));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
    }

    #[test]
    fn statuses_map_to_failure_classes() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), SourceFailure::Unauthorized);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), SourceFailure::Unauthorized);
        assert_eq!(classify_status(StatusCode::GATEWAY_TIMEOUT), SourceFailure::TimedOut);
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY).is_retryable());
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND),
            SourceFailure::Unavailable(_)
        ));
    }

    #[test]
    fn fetch_errors_convert_into_source_failures() {
        let timeout: SourceFailure = FetchError::Timeout { url: "https://example.test".into() }.into();
        assert_eq!(timeout, SourceFailure::TimedOut);

        let status: SourceFailure = FetchError::HttpStatus {
            status: 503,
            url: "https://example.test".into(),
        }
        .into();
        assert!(status.is_retryable());
    }

    #[test]
    fn request_builder_collects_headers() {
        let req = HttpRequest::new("https://clist.by/api/v4/contest/")
            .header("Authorization", "ApiKey u:k")
            .pre_call_delay(Duration::from_secs(2))
            .timeout(Duration::from_secs(3));
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.pre_call_delay, Duration::from_secs(2));
        assert_eq!(req.timeout, Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn source_overrides_widen_the_per_source_semaphore() {
        let http = HttpFetcher::new(HttpClientConfig {
            source_concurrency: HashMap::from([("kontests".to_string(), 4)]),
            ..HttpClientConfig::default()
        })
        .expect("client");
        assert_eq!(http.source_limit("kontests"), 4);
        assert_eq!(http.source_limit("codeforces-api"), 1);
        assert_eq!(http.per_source_semaphore("kontests").await.available_permits(), 4);
    }

    #[tokio::test]
    async fn probe_of_unroutable_url_is_unreachable() {
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let status = http.probe("test", "http://127.0.0.1:9/").await;
        assert_eq!(status, ProbeStatus::Unreachable);
    }
}
