//! Runtime configuration
//!
//! One merged JSON snapshot persisted in the `settings` table under
//! `runtime_config`. Handlers read a snapshot once at the start of a job and
//! pass it down; writes replace the whole snapshot atomically, so a handler
//! never observes a torn configuration.

use crate::db::settings::{get_setting, set_setting};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::BTreeMap;

pub const RUNTIME_CONFIG_KEY: &str = "runtime_config";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub paths: PathsConfig,
    pub ingest: IngestConfig,
    pub jobs: JobsConfig,
    pub cve: CveConfig,
    pub events: EventsConfig,
    pub alerts: AlertsConfig,
    pub publishing: PublishingConfig,
    pub llm: LlmConfig,
    pub tags: TagPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            ingest: IngestConfig::default(),
            jobs: JobsConfig::default(),
            cve: CveConfig::default(),
            events: EventsConfig::default(),
            alerts: AlertsConfig::default(),
            publishing: PublishingConfig::default(),
            llm: LlmConfig::default(),
            tags: TagPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root for the database file and logs.
    pub data_dir: String,
    /// Hugo source tree: `content/{posts,events,cves}` and `static/`.
    pub site_src_dir: String,
    /// Generated HTML output.
    pub site_public_dir: String,
    pub site_cache_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            site_src_dir: "./site".to_string(),
            site_public_dir: "./site/public".to_string(),
            site_cache_dir: "./site/.cache".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub http: HttpConfig,
    pub filters: FiltersConfig,
    pub dedupe_enabled: bool,
    pub strip_tracking_params: bool,
    pub tracking_params: Vec<String>,
    /// Whether ingest enqueues fetch_article_content for accepted items.
    pub fetch_full_content: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            filters: FiltersConfig::default(),
            dedupe_enabled: true,
            strip_tracking_params: true,
            tracking_params: Vec::new(),
            fetch_full_content: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub backoff_seconds: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: "SemperVigil/0.3 (+https://github.com/sempervigil)".to_string(),
            timeout_seconds: 30,
            max_retries: 3,
            backoff_seconds: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FiltersConfig {
    /// Empty allow list accepts everything; deny beats allow.
    pub allow_keywords: Vec<String>,
    pub deny_keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub lease_ttl_seconds: i64,
    pub retry_base_seconds: i64,
    pub retry_cap_seconds: i64,
    pub rate_limited_base_seconds: i64,
    pub default_max_attempts: i64,
    /// Hard per-type timeout; handlers past it are force-canceled.
    pub hard_timeout_seconds: BTreeMap<String, i64>,
    /// In-process concurrency cap per job type.
    pub type_caps: BTreeMap<String, usize>,
    pub ingest_due_debounce_seconds: i64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        let mut type_caps = BTreeMap::new();
        type_caps.insert("ingest_source".to_string(), 8);
        type_caps.insert("fetch_article_content".to_string(), 8);
        type_caps.insert("summarize_article_llm".to_string(), 2);
        type_caps.insert("build_site".to_string(), 1);
        let mut hard_timeout_seconds = BTreeMap::new();
        hard_timeout_seconds.insert("build_site".to_string(), 1800);
        hard_timeout_seconds.insert("summarize_article_llm".to_string(), 300);
        Self {
            lease_ttl_seconds: 120,
            retry_base_seconds: 10,
            retry_cap_seconds: 3600,
            rate_limited_base_seconds: 60,
            default_max_attempts: 5,
            hard_timeout_seconds,
            type_caps,
            ingest_due_debounce_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CveConfig {
    pub enabled: bool,
    pub api_base: String,
    pub schedule_minutes: i64,
    pub results_per_page: u32,
    pub rate_limit_seconds: f64,
    pub backoff_seconds: u64,
    pub max_retries: u32,
    pub prefer_v4: bool,
    /// Lookback used when no previous successful sync is recorded.
    pub initial_lookback_minutes: i64,
}

impl Default for CveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_base: "https://services.nvd.nist.gov/rest/json/cves/2.0".to_string(),
            schedule_minutes: 60,
            results_per_page: 2000,
            rate_limit_seconds: 1.0,
            backoff_seconds: 2,
            max_retries: 3,
            prefer_v4: true,
            initial_lookback_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub enabled: bool,
    pub merge_window_days: i64,
    /// active → dormant after this many days without updates.
    pub dormant_after_days: i64,
    /// dormant → closed after this many days of total inactivity.
    pub close_after_days: i64,
    pub purge_min_articles: i64,
    /// Events below this severity band with too few articles are purged.
    pub purge_min_severity: String,
    /// proposed → active once link confidence reaches this threshold.
    pub activate_confidence: f64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            merge_window_days: 14,
            dormant_after_days: 30,
            close_after_days: 120,
            purge_min_articles: 2,
            purge_min_severity: "HIGH".to_string(),
            activate_confidence: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub pause_on_failure_enabled: bool,
    pub error_streak: i64,
    pub zero_streak: i64,
    pub pause_minutes: i64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            pause_on_failure_enabled: true,
            error_streak: 5,
            zero_streak: 5,
            pause_minutes: 1440,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishingConfig {
    pub write_json_index: bool,
    /// Fail-open: publish Markdown even when summarization failed.
    pub publish_on_summary_error: bool,
    pub build_debounce_seconds: i64,
    pub builder_cmd: String,
    pub base_url: String,
    pub minify: bool,
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            write_json_index: true,
            publish_on_summary_error: true,
            build_debounce_seconds: 30,
            builder_cmd: "hugo".to_string(),
            base_url: String::new(),
            minify: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub rate_limit_seconds: f64,
    pub timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            rate_limit_seconds: 1.0,
            timeout_seconds: 60,
        }
    }
}

/// Tag derivation rules applied to every ingested item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TagPolicy {
    pub defaults: Vec<String>,
    /// Alias map applied after normalization, e.g. `vulns -> vulnerability`.
    pub normalize: BTreeMap<String, String>,
    /// Regex pattern → tags to add when the pattern matches title+summary.
    pub include_if: BTreeMap<String, Vec<String>>,
    /// Regex pattern → tags to remove when the pattern matches.
    pub exclude_if: BTreeMap<String, Vec<String>>,
}

/// Read the current snapshot, falling back to defaults for missing keys.
pub async fn load_runtime_config(pool: &SqlitePool) -> Result<RuntimeConfig> {
    match get_setting::<Value>(pool, RUNTIME_CONFIG_KEY).await? {
        Some(value) => serde_json::from_value(value)
            .map_err(|e| Error::Config(format!("runtime config is malformed: {e}"))),
        None => Ok(RuntimeConfig::default()),
    }
}

/// Replace the persisted snapshot atomically.
pub async fn save_runtime_config(pool: &SqlitePool, config: &RuntimeConfig) -> Result<()> {
    let errors = validate_runtime_config(config);
    if !errors.is_empty() {
        return Err(Error::Validation(errors.join("; ")));
    }
    set_setting(pool, RUNTIME_CONFIG_KEY, config).await
}

/// Deep-merge a JSON patch onto the current snapshot and persist the result.
///
/// Objects merge recursively; scalars and arrays replace.
pub async fn patch_runtime_config(pool: &SqlitePool, patch: Value) -> Result<RuntimeConfig> {
    if !patch.is_object() {
        return Err(Error::Validation(
            "runtime config patch must be a JSON object".to_string(),
        ));
    }
    let current = load_runtime_config(pool).await?;
    let mut merged = serde_json::to_value(&current)
        .map_err(|e| Error::Internal(format!("config serialization failed: {e}")))?;
    deep_merge(&mut merged, patch);
    let updated: RuntimeConfig = serde_json::from_value(merged)
        .map_err(|e| Error::Validation(format!("patched config is invalid: {e}")))?;
    save_runtime_config(pool, &updated).await?;
    Ok(updated)
}

fn deep_merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match target_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target_map.insert(key, value);
                    }
                }
            }
        }
        (target_slot, patch_value) => *target_slot = patch_value,
    }
}

/// Sanity checks on a snapshot before it is persisted.
pub fn validate_runtime_config(config: &RuntimeConfig) -> Vec<String> {
    let mut errors = Vec::new();
    if config.jobs.lease_ttl_seconds < 10 {
        errors.push("jobs.lease_ttl_seconds must be at least 10".to_string());
    }
    if config.jobs.retry_base_seconds < 1 {
        errors.push("jobs.retry_base_seconds must be at least 1".to_string());
    }
    if config.jobs.default_max_attempts < 1 {
        errors.push("jobs.default_max_attempts must be at least 1".to_string());
    }
    if config.cve.results_per_page == 0 || config.cve.results_per_page > 2000 {
        errors.push("cve.results_per_page must be in 1..=2000".to_string());
    }
    if config.events.merge_window_days < 1 {
        errors.push("events.merge_window_days must be at least 1".to_string());
    }
    if config.ingest.http.timeout_seconds == 0 {
        errors.push("ingest.http.timeout_seconds must be nonzero".to_string());
    }
    if crate::severity::Severity::parse(&config.events.purge_min_severity).is_none() {
        errors.push("events.purge_min_severity must be a CVSS band".to_string());
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    async fn setup() -> SqlitePool {
        let pool = db::init::init_memory_pool().await.unwrap();
        db::migrations::run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn load_returns_defaults_when_unset() {
        let pool = setup().await;
        let config = load_runtime_config(&pool).await.unwrap();
        assert_eq!(config.events.merge_window_days, 14);
        assert!(config.publishing.publish_on_summary_error);
    }

    #[tokio::test]
    async fn patch_merges_deeply() {
        let pool = setup().await;
        let updated = patch_runtime_config(&pool, json!({"events": {"merge_window_days": 7}}))
            .await
            .unwrap();
        assert_eq!(updated.events.merge_window_days, 7);
        // Untouched siblings keep defaults.
        assert_eq!(updated.events.dormant_after_days, 30);
        let reloaded = load_runtime_config(&pool).await.unwrap();
        assert_eq!(reloaded.events.merge_window_days, 7);
    }

    #[tokio::test]
    async fn patch_rejects_invalid_values() {
        let pool = setup().await;
        let err = patch_runtime_config(&pool, json!({"jobs": {"lease_ttl_seconds": 1}}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("lease_ttl_seconds"));
    }

    #[test]
    fn validate_catches_bad_severity() {
        let mut config = RuntimeConfig::default();
        config.events.purge_min_severity = "SEVERE".to_string();
        let errors = validate_runtime_config(&config);
        assert!(errors.iter().any(|e| e.contains("purge_min_severity")));
    }
}
