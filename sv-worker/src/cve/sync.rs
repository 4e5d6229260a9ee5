//! CVE canonicalization and delta sync
//!
//! Each upstream record canonicalizes to the internal shape, picks preferred
//! metrics (v4.0 when present and preferred, else v3.1), and hashes the
//! parts that matter. Only a changed hash produces journal rows, so syncing
//! identical data twice is a complete no-op.

use async_trait::async_trait;
use chrono::{Duration, SecondsFormat, Utc};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use sv_common::ids::snapshot_hash;
use sv_common::models::{change_types, AffectedProduct, Cve, CveChange, CvssMetric};
use sv_common::severity::Severity;
use sv_common::time::{now_iso, parse_iso};
use sv_common::urlnorm::host_of;
use sv_common::Result;
use tracing::info;

use crate::db::{cves, products};
use crate::queue::{self, job_types, EnqueueOptions};
use crate::worker::{JobContext, JobHandler};
use super::nvd::{NvdClient, NvdCve, NvdMetricEntry, NvdNode};

fn metric_from_entry(entries: &[NvdMetricEntry]) -> Option<CvssMetric> {
    entries.first().map(|entry| CvssMetric {
        base_score: entry.cvss_data.base_score,
        base_severity: entry
            .cvss_data
            .base_severity
            .as_deref()
            .and_then(Severity::parse)
            .map(|s| s.as_str().to_string()),
        vector: entry.cvss_data.vector_string.clone(),
        exploitability_score: entry.exploitability_score,
        impact_score: entry.impact_score,
    })
}

/// Pick the preferred metric block: v4.0 if present and preferred, else
/// v3.1, else v4.0, else none.
fn select_preferred<'a>(
    v31: Option<&'a CvssMetric>,
    v40: Option<&'a CvssMetric>,
    prefer_v4: bool,
) -> (&'static str, Option<&'a CvssMetric>) {
    if prefer_v4 {
        if let Some(metric) = v40 {
            return ("4.0", Some(metric));
        }
    }
    if let Some(metric) = v31 {
        return ("3.1", Some(metric));
    }
    if let Some(metric) = v40 {
        return ("4.0", Some(metric));
    }
    ("none", None)
}

fn walk_cpes(nodes: &[NvdNode], out: &mut Vec<String>) {
    for node in nodes {
        for cpe in &node.cpe_match {
            out.push(cpe.criteria.clone());
        }
        walk_cpes(&node.children, out);
    }
}

/// `cpe:2.3:a:vendor:product:version:…` → (vendor, product, version).
fn cpe_vendor_product(cpe: &str) -> Option<(String, String, Option<String>)> {
    let parts: Vec<&str> = cpe.split(':').collect();
    if parts.len() < 5 {
        return None;
    }
    let vendor = parts[3];
    let product = parts[4];
    if vendor.is_empty() || vendor == "*" || product.is_empty() || product == "*" {
        return None;
    }
    let version = parts
        .get(5)
        .filter(|v| !v.is_empty() && **v != "*" && **v != "-")
        .map(|v| v.to_string());
    Some((vendor.to_string(), product.to_string(), version))
}

/// Canonicalize one upstream record to the internal shape.
pub fn canonicalize(record: &NvdCve, prefer_v4: bool) -> Cve {
    let description = record
        .descriptions
        .iter()
        .find(|d| d.lang == "en")
        .map(|d| d.value.clone());

    let v31 = record
        .metrics
        .as_ref()
        .and_then(|m| metric_from_entry(&m.cvss_metric_v31));
    let v40 = record
        .metrics
        .as_ref()
        .and_then(|m| metric_from_entry(&m.cvss_metric_v40));
    let (version, preferred) = select_preferred(v31.as_ref(), v40.as_ref(), prefer_v4);

    let mut cpes = Vec::new();
    for configuration in &record.configurations {
        walk_cpes(&configuration.nodes, &mut cpes);
    }
    cpes.sort();
    cpes.dedup();

    let mut product_map: std::collections::BTreeMap<(String, String), Vec<String>> =
        std::collections::BTreeMap::new();
    for cpe in &cpes {
        if let Some((vendor, product, cpe_version)) = cpe_vendor_product(cpe) {
            let versions = product_map.entry((vendor, product)).or_default();
            if let Some(cpe_version) = cpe_version {
                if !versions.contains(&cpe_version) {
                    versions.push(cpe_version);
                }
            }
        }
    }
    let affected_products: Vec<AffectedProduct> = product_map
        .into_iter()
        .map(|((vendor, product), versions)| AffectedProduct {
            vendor,
            product,
            versions,
        })
        .collect();

    let mut reference_domains: Vec<String> = record
        .references
        .iter()
        .filter_map(|r| host_of(&r.url))
        .collect();
    reference_domains.sort();
    reference_domains.dedup();

    let mut cve = Cve {
        cve_id: record.id.clone(),
        published_at: record.published.clone(),
        last_modified_at: record.last_modified.clone(),
        last_seen_at: now_iso(),
        description_text: description,
        preferred_cvss_version: version.to_string(),
        preferred_base_score: preferred.and_then(|m| m.base_score),
        preferred_base_severity: preferred.and_then(|m| m.base_severity.clone()),
        preferred_vector: preferred.and_then(|m| m.vector.clone()),
        cvss_v31: v31,
        cvss_v40: v40,
        affected_products,
        affected_cpes: cpes,
        reference_domains,
        snapshot_hash: None,
    };
    cve.snapshot_hash = Some(compute_snapshot_hash(&cve));
    cve
}

/// Hash the content that matters for change detection: preferred metrics,
/// description, products, and reference domains. `last_seen_at` is excluded
/// so touching a record does not look like a change.
pub fn compute_snapshot_hash(cve: &Cve) -> String {
    let canonical = json!({
        "preferred": {
            "version": cve.preferred_cvss_version,
            "score": cve.preferred_base_score,
            "severity": cve.preferred_base_severity,
            "vector": cve.preferred_vector,
        },
        "v31": cve.cvss_v31,
        "v40": cve.cvss_v40,
        "description": cve.description_text,
        "products": cve.affected_products,
        "references": cve.reference_domains,
    });
    snapshot_hash(&canonical.to_string())
}

fn severity_rank(value: Option<&str>) -> i32 {
    value
        .and_then(Severity::parse)
        .map(|s| s.rank() as i32)
        .unwrap_or(-1)
}

/// Compute journal rows for a changed CVE.
pub fn diff_cves(previous: &Cve, current: &Cve, observed_at: &str) -> Vec<CveChange> {
    let mut changes = Vec::new();
    let base = |change_type: &str, detail: Value| CveChange {
        cve_id: current.cve_id.clone(),
        change_at: observed_at.to_string(),
        change_type: change_type.to_string(),
        cvss_version: Some(current.preferred_cvss_version.clone()),
        from_score: previous.preferred_base_score,
        to_score: current.preferred_base_score,
        from_severity: previous.preferred_base_severity.clone(),
        to_severity: current.preferred_base_severity.clone(),
        vector_from: previous.preferred_vector.clone(),
        vector_to: current.preferred_vector.clone(),
        detail,
    };

    let prev_band = previous.preferred_base_severity.as_deref();
    let new_band = current.preferred_base_severity.as_deref();
    if let (Some(prev), Some(new)) = (prev_band, new_band) {
        if prev != new {
            let change_type = if severity_rank(new_band) > severity_rank(prev_band) {
                change_types::SEVERITY_UPGRADE
            } else {
                change_types::SEVERITY_DOWNGRADE
            };
            changes.push(base(
                change_type,
                json!({ "reasons": ["rule.cve.cvss.band_change"], "from": prev, "to": new }),
            ));
        }
    }

    if previous.preferred_base_score != current.preferred_base_score
        && previous.preferred_base_score.is_some()
        && current.preferred_base_score.is_some()
    {
        changes.push(base(
            change_types::SCORE_CHANGE,
            json!({
                "reasons": ["rule.cve.cvss.score_change"],
                "from": previous.preferred_base_score,
                "to": current.preferred_base_score,
            }),
        ));
    }

    if previous.preferred_vector != current.preferred_vector {
        changes.push(base(
            change_types::METRICS_CHANGE,
            json!({
                "reasons": ["rule.cve.vector.changed"],
                "from": previous.preferred_vector,
                "to": current.preferred_vector,
            }),
        ));
    }

    if previous.preferred_cvss_version != current.preferred_cvss_version
        && previous.preferred_cvss_version != "none"
    {
        changes.push(base(
            change_types::PREFERRED_VERSION_CHANGED,
            json!({
                "reasons": ["rule.cve.preferred_version_changed"],
                "from": previous.preferred_cvss_version,
                "to": current.preferred_cvss_version,
            }),
        ));
    }

    changes
}

/// Per-record sync result.
#[derive(Debug, Default)]
pub struct SyncStats {
    pub processed: u64,
    pub new_records: u64,
    pub changed: u64,
    pub change_rows: u64,
}

/// Apply one canonicalized record: upsert, journal, replace product links.
pub async fn apply_cve(
    pool: &SqlitePool,
    record: &NvdCve,
    prefer_v4: bool,
    raw: Option<&Value>,
    stats: &mut SyncStats,
) -> Result<()> {
    let current = canonicalize(record, prefer_v4);
    stats.processed += 1;

    let previous = cves::get_cve(pool, &current.cve_id).await?;
    let unchanged = previous
        .as_ref()
        .and_then(|p| p.snapshot_hash.as_deref())
        .map(|hash| Some(hash) == current.snapshot_hash.as_deref())
        .unwrap_or(false);

    if unchanged {
        // Only refresh last_seen_at; no journal rows.
        cves::upsert_cve_stub(pool, &current.cve_id).await?;
        return Ok(());
    }

    let raw_json = raw.map(|v| v.to_string());
    cves::upsert_cve(pool, &current, raw_json.as_deref()).await?;

    for affected in &current.affected_products {
        products::upsert_product(pool, &affected.vendor, &affected.product).await?;
    }
    products::replace_cve_products(pool, &current.cve_id, &current.affected_products).await?;

    match previous {
        // A stub (no hash yet) counts as new, not changed.
        Some(previous) if previous.snapshot_hash.is_some() => {
            let observed_at = now_iso();
            let changes = diff_cves(&previous, &current, &observed_at);
            for change in &changes {
                cves::insert_cve_change(pool, change).await?;
            }
            stats.changed += 1;
            stats.change_rows += changes.len() as u64;
        }
        _ => stats.new_records += 1,
    }
    Ok(())
}

fn nvd_timestamp(dt: chrono::DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Handler for `cve_sync`: page through the delta window and apply records.
pub struct CveSyncHandler;

impl CveSyncHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CveSyncHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for CveSyncHandler {
    async fn run(&self, ctx: &JobContext) -> Result<Value> {
        let config = &ctx.config.cve;
        if !config.enabled {
            return Ok(json!({ "status": "disabled" }));
        }

        let now = Utc::now();
        let last_sync: Option<String> =
            sv_common::db::settings::get_setting(&ctx.pool, "cve.last_successful_sync_at").await?;
        let window_start = last_sync
            .as_deref()
            .and_then(parse_iso)
            .unwrap_or_else(|| now - Duration::minutes(config.initial_lookback_minutes));
        let start_iso = nvd_timestamp(window_start);
        let end_iso = nvd_timestamp(now);

        let cve_id_filter = ctx
            .job
            .payload
            .get("cve_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let client = NvdClient::new(
            config.api_base.clone(),
            std::env::var("NVD_API_KEY").ok(),
            config.results_per_page,
            config.rate_limit_seconds,
            config.backoff_seconds,
            config.max_retries,
        )?;

        let mut stats = SyncStats::default();
        let mut start_index: u32 = 0;
        loop {
            ctx.check_canceled()?;
            let page = ctx
                .cancelable(client.fetch_page(
                    &start_iso,
                    &end_iso,
                    start_index,
                    cve_id_filter.as_deref(),
                ))
                .await?;

            if page.vulnerabilities.is_empty() {
                break;
            }
            for vulnerability in &page.vulnerabilities {
                ctx.check_canceled()?;
                let raw = serde_json::to_value(&vulnerability.cve).ok();
                apply_cve(
                    &ctx.pool,
                    &vulnerability.cve,
                    config.prefer_v4,
                    raw.as_ref(),
                    &mut stats,
                )
                .await?;
            }

            let page_size = if page.results_per_page > 0 {
                page.results_per_page
            } else {
                config.results_per_page
            };
            start_index += page_size;
            if cve_id_filter.is_some() || start_index >= page.total_results {
                break;
            }
        }

        sv_common::db::settings::set_setting(
            &ctx.pool,
            "cve.last_successful_sync_at",
            &nvd_timestamp(now),
        )
        .await?;

        // A delta that touched anything warrants re-correlating events.
        if ctx.config.events.enabled && (stats.new_records > 0 || stats.changed > 0) {
            queue::enqueue_job(
                &ctx.pool,
                job_types::EVENTS_REBUILD,
                None,
                EnqueueOptions {
                    idempotency_key: Some("events_rebuild".to_string()),
                    ..Default::default()
                },
            )
            .await
            .ok();
        }

        info!(
            processed = stats.processed,
            new_records = stats.new_records,
            changed = stats.changed,
            "CVE sync complete"
        );
        Ok(json!({
            "start": start_iso,
            "end": end_iso,
            "processed": stats.processed,
            "new": stats.new_records,
            "changed": stats.changed,
            "change_rows": stats.change_rows,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cve::nvd::{NvdCvssData, NvdMetrics};

    fn record(v31: Option<(f64, &str)>, v40: Option<(f64, &str)>) -> NvdCve {
        let entry = |score: f64, severity: &str, vector: &str| NvdMetricEntry {
            cvss_data: NvdCvssData {
                base_score: Some(score),
                base_severity: Some(severity.to_string()),
                vector_string: Some(vector.to_string()),
            },
            exploitability_score: None,
            impact_score: None,
        };
        NvdCve {
            id: "CVE-2025-1000".to_string(),
            published: Some("2025-01-01T00:00:00Z".to_string()),
            last_modified: Some("2025-02-01T00:00:00Z".to_string()),
            descriptions: vec![super::super::nvd::NvdDescription {
                lang: "en".to_string(),
                value: "A vulnerability.".to_string(),
            }],
            metrics: Some(NvdMetrics {
                cvss_metric_v31: v31
                    .map(|(s, sev)| vec![entry(s, sev, "CVSS:3.1/AV:N")])
                    .unwrap_or_default(),
                cvss_metric_v40: v40
                    .map(|(s, sev)| vec![entry(s, sev, "CVSS:4.0/AV:N")])
                    .unwrap_or_default(),
            }),
            configurations: vec![],
            references: vec![],
        }
    }

    #[test]
    fn prefers_v4_when_configured() {
        let cve = canonicalize(&record(Some((7.5, "HIGH")), Some((9.1, "CRITICAL"))), true);
        assert_eq!(cve.preferred_cvss_version, "4.0");
        assert_eq!(cve.preferred_base_score, Some(9.1));
        assert_eq!(cve.preferred_base_severity.as_deref(), Some("CRITICAL"));
    }

    #[test]
    fn falls_back_to_v31_when_v4_absent_or_unpreferred() {
        let cve = canonicalize(&record(Some((7.5, "HIGH")), Some((9.1, "CRITICAL"))), false);
        assert_eq!(cve.preferred_cvss_version, "3.1");
        assert_eq!(cve.preferred_base_score, Some(7.5));

        let cve = canonicalize(&record(Some((7.5, "HIGH")), None), true);
        assert_eq!(cve.preferred_cvss_version, "3.1");
    }

    #[test]
    fn no_metrics_means_none() {
        let cve = canonicalize(&record(None, None), true);
        assert_eq!(cve.preferred_cvss_version, "none");
        assert!(cve.preferred_base_score.is_none());
        assert!(cve.preferred_base_severity.is_none());
    }

    #[test]
    fn identical_records_hash_identically() {
        let a = canonicalize(&record(Some((7.5, "HIGH")), None), true);
        let b = canonicalize(&record(Some((7.5, "HIGH")), None), true);
        assert_eq!(a.snapshot_hash, b.snapshot_hash);
        let c = canonicalize(&record(Some((8.0, "HIGH")), None), true);
        assert_ne!(a.snapshot_hash, c.snapshot_hash);
    }

    #[test]
    fn severity_upgrade_is_journaled() {
        let previous = canonicalize(&record(Some((7.5, "HIGH")), None), true);
        let current = canonicalize(&record(Some((7.5, "HIGH")), Some((9.4, "CRITICAL"))), true);
        let changes = diff_cves(&previous, &current, "2025-03-01T00:00:00Z");
        let upgrade = changes
            .iter()
            .find(|c| c.change_type == change_types::SEVERITY_UPGRADE)
            .expect("severity upgrade row");
        assert_eq!(upgrade.from_severity.as_deref(), Some("HIGH"));
        assert_eq!(upgrade.to_severity.as_deref(), Some("CRITICAL"));
        assert!(changes
            .iter()
            .any(|c| c.change_type == change_types::PREFERRED_VERSION_CHANGED));
    }

    #[test]
    fn identical_snapshots_produce_no_changes() {
        let a = canonicalize(&record(Some((7.5, "HIGH")), None), true);
        let b = canonicalize(&record(Some((7.5, "HIGH")), None), true);
        assert!(diff_cves(&a, &b, "2025-03-01T00:00:00Z").is_empty());
    }

    #[test]
    fn cpe_extraction() {
        assert_eq!(
            cpe_vendor_product("cpe:2.3:a:acme:widget:1.2.3:*:*:*:*:*:*:*"),
            Some(("acme".to_string(), "widget".to_string(), Some("1.2.3".to_string())))
        );
        assert_eq!(cpe_vendor_product("cpe:2.3:a:*:widget"), None);
        assert_eq!(cpe_vendor_product("garbage"), None);
    }
}
