//! Domain models shared by the worker and admin processes.
//!
//! Every persisted timestamp is an RFC 3339 UTC string (see [`crate::time`]).
//! Enums that appear in the database round-trip through their `as_str` /
//! `parse` pair; the string forms are part of the schema contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// How a source is fetched and parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Rss,
    Atom,
    JsonFeed,
    Html,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Rss => "rss",
            SourceKind::Atom => "atom",
            SourceKind::JsonFeed => "jsonfeed",
            SourceKind::Html => "html",
        }
    }

    pub fn parse(value: &str) -> Option<SourceKind> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rss" => Some(SourceKind::Rss),
            "atom" => Some(SourceKind::Atom),
            "jsonfeed" => Some(SourceKind::JsonFeed),
            "html" => Some(SourceKind::Html),
            _ => None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_interval_minutes() -> i64 {
    60
}

/// A configured upstream feed with its ingestion rules.
///
/// Only id/name/kind/url are required when deserializing an admin upsert;
/// everything else has a sensible default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    /// Slug identifier, e.g. `vendor-blog`.
    pub id: String,
    pub name: String,
    pub kind: SourceKind,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub pause_until: Option<String>,
    #[serde(default)]
    pub paused_reason: Option<String>,
    /// Per-source override of the global User-Agent.
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub http_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
    #[serde(default)]
    pub allow_keywords: Vec<String>,
    #[serde(default)]
    pub deny_keywords: Vec<String>,
    /// Minimum spacing between requests to this source.
    #[serde(default)]
    pub min_interval_seconds: Option<i64>,
    /// CSS selector for item extraction on `html` sources.
    #[serde(default)]
    pub html_item_selector: Option<String>,
    /// HTTP cache validators round-tripped on conditional fetches.
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub last_fetch_at: Option<String>,
}

/// Append-only record of one ingest attempt for a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHealth {
    pub source_id: String,
    pub ts: String,
    pub ok: bool,
    pub http_status: Option<i64>,
    pub found_count: i64,
    pub accepted_count: i64,
    pub seen_count: i64,
    pub filtered_count: i64,
    pub error_count: i64,
    pub duration_ms: i64,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Articles
// ---------------------------------------------------------------------------

/// One ingested source item, normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    /// `sha256(canonical_url + source_id)`.
    pub id: String,
    pub source_id: String,
    pub title: String,
    pub original_url: String,
    pub canonical_url: String,
    pub published_at: Option<String>,
    /// Which feed field supplied `published_at`: published | modified | guessed.
    pub published_at_source: Option<String>,
    pub ingested_at: String,
    pub author: Option<String>,
    /// Summary text carried by the feed entry itself.
    pub summary_text: Option<String>,
    pub content_text: Option<String>,
    pub content_html_excerpt: Option<String>,
    pub content_fetched_at: Option<String>,
    pub content_error: Option<String>,
    pub summary_llm: Option<String>,
    pub summary_model: Option<String>,
    pub summary_generated_at: Option<String>,
    pub summary_error: Option<String>,
    pub tags: Vec<String>,
    pub content_fingerprint: Option<String>,
    pub published_md_path: Option<String>,
}

/// Per-item verdict from the ingest filter chain.
///
/// Reason strings are stable: `deny_keywords:<kw>`, `allow_keywords:miss`,
/// `duplicate`, `missing_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub accepted: bool,
    pub reasons: Vec<String>,
    pub title: String,
    pub original_url: Option<String>,
    pub canonical_url: Option<String>,
    pub stable_id: Option<String>,
    pub published_at: Option<String>,
    pub published_at_source: Option<String>,
    pub tags: Vec<String>,
}

// ---------------------------------------------------------------------------
// CVEs
// ---------------------------------------------------------------------------

/// One CVSS metric block (v3.1 or v4.0) as kept from upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvssMetric {
    pub base_score: Option<f64>,
    pub base_severity: Option<String>,
    pub vector: Option<String>,
    pub exploitability_score: Option<f64>,
    pub impact_score: Option<f64>,
}

/// A vendor/product pair affected by a CVE, with the version strings seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedProduct {
    pub vendor: String,
    pub product: String,
    pub versions: Vec<String>,
}

/// A vulnerability record with versioned CVSS metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cve {
    pub cve_id: String,
    pub published_at: Option<String>,
    pub last_modified_at: Option<String>,
    pub last_seen_at: String,
    pub description_text: Option<String>,
    /// "4.0" | "3.1" | "none"; the preferred_* fields always agree with it.
    pub preferred_cvss_version: String,
    pub preferred_base_score: Option<f64>,
    pub preferred_base_severity: Option<String>,
    pub preferred_vector: Option<String>,
    pub cvss_v31: Option<CvssMetric>,
    pub cvss_v40: Option<CvssMetric>,
    pub affected_products: Vec<AffectedProduct>,
    pub affected_cpes: Vec<String>,
    pub reference_domains: Vec<String>,
    pub snapshot_hash: Option<String>,
}

/// Journal row emitted when a CVE snapshot hash changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CveChange {
    pub cve_id: String,
    pub change_at: String,
    pub change_type: String,
    pub cvss_version: Option<String>,
    pub from_score: Option<f64>,
    pub to_score: Option<f64>,
    pub from_severity: Option<String>,
    pub to_severity: Option<String>,
    pub vector_from: Option<String>,
    pub vector_to: Option<String>,
    pub detail: Value,
}

/// Stable change-type strings for the CVE journal.
pub mod change_types {
    pub const SEVERITY_UPGRADE: &str = "severity_upgrade";
    pub const SEVERITY_DOWNGRADE: &str = "severity_downgrade";
    pub const SCORE_CHANGE: &str = "score_change";
    pub const METRICS_CHANGE: &str = "metrics_change";
    pub const PREFERRED_VERSION_CHANGED: &str = "preferred_version_changed";
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CveCluster,
    Incident,
    ProductChange,
    Manual,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::CveCluster => "cve_cluster",
            EventKind::Incident => "incident",
            EventKind::ProductChange => "product_change",
            EventKind::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<EventKind> {
        match value {
            "cve_cluster" => Some(EventKind::CveCluster),
            "incident" => Some(EventKind::Incident),
            "product_change" => Some(EventKind::ProductChange),
            "manual" => Some(EventKind::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Proposed,
    Active,
    Updating,
    Dormant,
    Closed,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Proposed => "proposed",
            EventStatus::Active => "active",
            EventStatus::Updating => "updating",
            EventStatus::Dormant => "dormant",
            EventStatus::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<EventStatus> {
        match value {
            "proposed" => Some(EventStatus::Proposed),
            "active" => Some(EventStatus::Active),
            "updating" => Some(EventStatus::Updating),
            "dormant" => Some(EventStatus::Dormant),
            "closed" => Some(EventStatus::Closed),
            _ => None,
        }
    }
}

/// A durable narrative grouping of CVEs, products, and articles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    /// Stable key, e.g. `cve:CVE-2024-1234` or `cluster:<product_key>:<window>`.
    pub event_key: String,
    pub kind: EventKind,
    pub title: String,
    pub summary: Option<String>,
    pub severity: Option<String>,
    pub status: EventStatus,
    pub first_seen_at: String,
    pub last_seen_at: String,
    pub status_changed_at: String,
}

/// Link metadata shared by event_cves / event_articles / article_cves rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkMeta {
    pub confidence: f64,
    pub confidence_band: String,
    pub reasons: Vec<String>,
    pub evidence: Value,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<JobStatus> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "canceled" => Some(JobStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

/// A durable unit of work with a type, payload, status, and lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub payload: Value,
    pub status: JobStatus,
    /// Higher first.
    pub priority: i64,
    pub requested_at: String,
    pub run_after: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<String>,
    pub cancel_requested: bool,
    pub idempotency_key: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// LLM
// ---------------------------------------------------------------------------

/// Tunables bound to an LLM profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmParams {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub seed: Option<i64>,
    pub response_schema_id: Option<String>,
}

/// Append-only record of one LLM invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRun {
    pub ts: String,
    pub profile_id: Option<String>,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub prompt_name: String,
    pub input_chars: i64,
    pub output_chars: i64,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub latency_ms: i64,
    pub ok: bool,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Evidence
// ---------------------------------------------------------------------------

/// Structured evidence attached to an article↔CVE link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub extracted_signals: ExtractedSignals,
    pub candidates: Vec<CandidateCve>,
    pub final_decision: FinalDecision,
    pub citation_urls: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedSignals {
    pub cve_ids: Vec<String>,
    pub vendors: Vec<String>,
    pub products: Vec<String>,
    pub incident_keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateCve {
    pub cve_id: String,
    pub component_scores: BTreeMap<String, f64>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalDecision {
    pub decision: String,
    pub confidence: f64,
    pub confidence_band: String,
    pub rule_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trips() {
        for kind in [
            SourceKind::Rss,
            SourceKind::Atom,
            SourceKind::JsonFeed,
            SourceKind::Html,
        ] {
            assert_eq!(SourceKind::parse(kind.as_str()), Some(kind));
        }
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Canceled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            EventStatus::Proposed,
            EventStatus::Active,
            EventStatus::Updating,
            EventStatus::Dormant,
            EventStatus::Closed,
        ] {
            assert_eq!(EventStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }
}
