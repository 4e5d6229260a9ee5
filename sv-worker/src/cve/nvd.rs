//! NVD 2.0 API client
//!
//! Paged delta queries over `lastModStartDate`/`lastModEndDate`, spaced by a
//! rate limiter (NVD allows ~1 request/second without an API key), retrying
//! 429/503 with backoff. The raw per-CVE payload is kept for audit.

use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::Duration;
use sv_common::{Error, Result};
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NvdResponse {
    #[serde(default)]
    pub results_per_page: u32,
    #[serde(default)]
    pub start_index: u32,
    #[serde(default)]
    pub total_results: u32,
    #[serde(default)]
    pub vulnerabilities: Vec<NvdVulnerability>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NvdVulnerability {
    pub cve: NvdCve,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NvdCve {
    pub id: String,
    pub published: Option<String>,
    pub last_modified: Option<String>,
    #[serde(default)]
    pub descriptions: Vec<NvdDescription>,
    #[serde(default)]
    pub metrics: Option<NvdMetrics>,
    #[serde(default)]
    pub configurations: Vec<NvdConfiguration>,
    #[serde(default)]
    pub references: Vec<NvdReference>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NvdDescription {
    pub lang: String,
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NvdMetrics {
    #[serde(default, rename = "cvssMetricV31")]
    pub cvss_metric_v31: Vec<NvdMetricEntry>,
    #[serde(default, rename = "cvssMetricV40")]
    pub cvss_metric_v40: Vec<NvdMetricEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NvdMetricEntry {
    pub cvss_data: NvdCvssData,
    pub exploitability_score: Option<f64>,
    pub impact_score: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NvdCvssData {
    pub base_score: Option<f64>,
    pub base_severity: Option<String>,
    pub vector_string: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NvdConfiguration {
    #[serde(default)]
    pub nodes: Vec<NvdNode>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NvdNode {
    #[serde(default)]
    pub cpe_match: Vec<NvdCpeMatch>,
    #[serde(default)]
    pub children: Vec<NvdNode>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NvdCpeMatch {
    pub criteria: String,
    #[serde(default)]
    pub version_start_including: Option<String>,
    #[serde(default)]
    pub version_end_including: Option<String>,
    #[serde(default)]
    pub version_end_excluding: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NvdReference {
    pub url: String,
}

type DirectLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// NVD client with request spacing and retry.
pub struct NvdClient {
    client: Client,
    api_base: String,
    api_key: Option<String>,
    results_per_page: u32,
    backoff_seconds: u64,
    max_retries: u32,
    rate_limiter: DirectLimiter,
}

impl NvdClient {
    pub fn new(
        api_base: String,
        api_key: Option<String>,
        results_per_page: u32,
        rate_limit_seconds: f64,
        backoff_seconds: u64,
        max_retries: u32,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client construction failed: {e}")))?;
        // governor quantizes to requests-per-period; one request per
        // rate_limit_seconds rounded up to a whole second.
        let period = rate_limit_seconds.max(0.1).ceil() as u32;
        let quota = Quota::with_period(Duration::from_secs(period as u64))
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::new(1).expect("1 is non-zero")));
        Ok(Self {
            client,
            api_base,
            api_key,
            results_per_page: results_per_page.clamp(1, 2000),
            backoff_seconds: backoff_seconds.max(1),
            max_retries,
            rate_limiter: RateLimiter::direct(quota),
        })
    }

    /// Fetch one page of the delta window. `cve_id` narrows to one record.
    pub async fn fetch_page(
        &self,
        last_mod_start: &str,
        last_mod_end: &str,
        start_index: u32,
        cve_id: Option<&str>,
    ) -> Result<NvdResponse> {
        self.rate_limiter.until_ready().await;

        let mut params: Vec<(&str, String)> = vec![
            ("lastModStartDate", last_mod_start.to_string()),
            ("lastModEndDate", last_mod_end.to_string()),
            ("startIndex", start_index.to_string()),
            ("resultsPerPage", self.results_per_page.to_string()),
        ];
        if let Some(cve_id) = cve_id {
            params = vec![("cveId", cve_id.to_string())];
        }

        let mut attempt: u32 = 0;
        loop {
            let mut request = self.client.get(&self.api_base).query(&params);
            if let Some(key) = &self.api_key {
                request = request.header("apiKey", key);
            }
            let err = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(start_index, "NVD page fetched");
                    return response
                        .json::<NvdResponse>()
                        .await
                        .map_err(|e| Error::Permanent(format!("NVD response parse failed: {e}")));
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    let mut end = 256.min(body.len());
                    while end > 0 && !body.is_char_boundary(end) {
                        end -= 1;
                    }
                    Error::from_http_status(status, &body[..end])
                }
                Err(e) if e.is_timeout() => Error::Transient(format!("NVD timeout: {e}")),
                Err(e) => Error::Transient(format!("NVD request failed: {e}")),
            };

            if !err.kind().is_retryable() || attempt >= self.max_retries {
                return Err(err);
            }
            let delay = self.backoff_seconds * (attempt as u64 + 1);
            warn!(attempt = attempt + 1, "NVD fetch retrying in {delay}s: {err}");
            tokio::time::sleep(Duration::from_secs(delay)).await;
            attempt += 1;
        }
    }
}
