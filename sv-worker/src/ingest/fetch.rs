//! Feed fetching
//!
//! Conditional HTTP GET with per-source headers, retries with exponential
//! backoff, and ETag/Last-Modified round-tripping. 304 Not Modified counts
//! as a successful fetch with no body.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, RETRY_AFTER};
use reqwest::Client;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use sv_common::models::Source;
use sv_common::params::HttpConfig;
use sv_common::{Error, Result};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Outcome of a feed fetch.
#[derive(Debug)]
pub struct FetchOutcome {
    pub http_status: Option<i64>,
    pub body: Vec<u8>,
    pub not_modified: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Per-source request spacing.
///
/// Keyed by source id; a fetch waits until `min_interval_seconds` have
/// passed since this process last hit the same source.
pub struct SourceRateGate {
    last_request: Mutex<HashMap<String, Instant>>,
}

impl SourceRateGate {
    pub fn new() -> Self {
        Self {
            last_request: Mutex::new(HashMap::new()),
        }
    }

    pub async fn wait(&self, source_id: &str, min_interval: Duration) {
        if min_interval.is_zero() {
            return;
        }
        let mut last = self.last_request.lock().await;
        if let Some(last_time) = last.get(source_id) {
            let elapsed = last_time.elapsed();
            if elapsed < min_interval {
                let wait_time = min_interval - elapsed;
                debug!(source_id, "rate limiting: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }
        last.insert(source_id.to_string(), Instant::now());
    }
}

impl Default for SourceRateGate {
    fn default() -> Self {
        Self::new()
    }
}

pub fn build_http_client(timeout_seconds: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_seconds.max(1)))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| Error::Internal(format!("HTTP client construction failed: {e}")))
}

fn request_headers(source: &Source, http: &HttpConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let user_agent = source.user_agent.as_deref().unwrap_or(&http.user_agent);
    headers.insert(
        reqwest::header::USER_AGENT,
        HeaderValue::from_str(user_agent)
            .map_err(|_| Error::Validation("user agent is not a valid header value".into()))?,
    );
    for (key, value) in &source.http_headers {
        let name: HeaderName = key
            .parse()
            .map_err(|_| Error::Validation(format!("invalid header name {key}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::Validation(format!("invalid header value for {key}")))?;
        headers.insert(name, value);
    }
    if let Some(etag) = &source.etag {
        if let Ok(value) = HeaderValue::from_str(etag) {
            headers.insert(IF_NONE_MATCH, value);
        }
    }
    if let Some(last_modified) = &source.last_modified {
        if let Ok(value) = HeaderValue::from_str(last_modified) {
            headers.insert(IF_MODIFIED_SINCE, value);
        }
    }
    Ok(headers)
}

/// Fetch the source's feed URL, retrying transient failures.
///
/// 429 and 5xx retry with exponential backoff (honoring Retry-After); other
/// 4xx (except 408) fail permanently.
pub async fn fetch_source_feed(
    client: &Client,
    source: &Source,
    http: &HttpConfig,
) -> Result<FetchOutcome> {
    let headers = request_headers(source, http)?;
    let timeout = source
        .timeout_seconds
        .map(|s| Duration::from_secs(s.max(1) as u64));

    let mut attempt: u32 = 0;
    loop {
        let mut request = client.get(&source.url).headers(headers.clone());
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let result = request.send().await;

        let err = match result {
            Ok(response) => {
                let status = response.status().as_u16();
                if status == 304 {
                    return Ok(FetchOutcome {
                        http_status: Some(304),
                        body: Vec::new(),
                        not_modified: true,
                        etag: source.etag.clone(),
                        last_modified: source.last_modified.clone(),
                    });
                }
                if response.status().is_success() {
                    let etag = header_string(response.headers(), &ETAG);
                    let last_modified = header_string(response.headers(), &LAST_MODIFIED);
                    let body = response
                        .bytes()
                        .await
                        .map_err(|e| Error::Transient(format!("body read failed: {e}")))?;
                    return Ok(FetchOutcome {
                        http_status: Some(status as i64),
                        body: body.to_vec(),
                        not_modified: false,
                        etag,
                        last_modified,
                    });
                }
                let retry_after = header_string(response.headers(), &RETRY_AFTER)
                    .and_then(|v| v.parse::<u64>().ok());
                let body = response.text().await.unwrap_or_default();
                let mut err = Error::from_http_status(status, truncated(&body, 512));
                if let Error::RateLimited {
                    retry_after_seconds,
                    ..
                } = &mut err
                {
                    *retry_after_seconds = retry_after;
                }
                err
            }
            Err(e) if e.is_timeout() => Error::Transient(format!("request timeout: {e}")),
            Err(e) if e.is_connect() => Error::Transient(format!("connection failed: {e}")),
            Err(e) => Error::Transient(format!("request failed: {e}")),
        };

        if !err.kind().is_retryable() || attempt >= http.max_retries {
            return Err(err);
        }
        let delay = http.backoff_seconds.max(1) * (attempt as u64 + 1);
        warn!(
            source_id = %source.id,
            attempt = attempt + 1,
            "feed fetch retrying in {delay}s: {err}"
        );
        tokio::time::sleep(Duration::from_secs(delay)).await;
        attempt += 1;
    }
}

fn header_string(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn truncated(text: &str, max: usize) -> String {
    let mut end = max.min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
