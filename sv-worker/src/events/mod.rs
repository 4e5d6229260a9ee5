//! Event correlation
//!
//! Deterministic clustering of CVEs into events: CVEs sharing a product key
//! within a rolling window form one cluster event; product-less CVEs get a
//! per-CVE event. Rebuild recomputes the whole generated set inside one
//! transaction, so a failed rebuild leaves the previous events intact.
//! `manual` events are never modified or deleted.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use sv_common::models::{Event, EventKind, EventStatus, LinkMeta};
use sv_common::params::EventsConfig;
use sv_common::severity::Severity;
use sv_common::time::{day_of, now_iso, parse_iso};
use sv_common::Result;
use tracing::info;
use uuid::Uuid;

use crate::db::{articles, cves, events as events_db, products};
use crate::publish::{indexes, markdown};
use crate::queue::{self, job_types};
use crate::worker::{JobContext, JobHandler};

/// Timeline facts about one CVE, as the clustering sees it.
#[derive(Debug, Clone)]
pub struct CveFacts {
    pub cve_id: String,
    /// published_at falling back to last_seen_at.
    pub anchor_at: String,
    pub severity: Option<String>,
    pub score: Option<f64>,
}

/// One event the clustering decided should exist.
#[derive(Debug, Clone)]
pub struct ComputedEvent {
    pub event_key: String,
    pub cve_ids: Vec<String>,
    pub product_keys: Vec<String>,
    /// Day the cluster window opened; None for per-CVE events.
    pub window_start: Option<String>,
}

/// Group CVEs into cluster events by product key within a rolling window.
///
/// Pure and deterministic: same inputs, byte-identical outputs. CVEs are
/// walked per product in (anchor, id) order; a CVE outside the current
/// window opens a new one keyed by its day.
pub fn compute_clusters(
    facts: &[CveFacts],
    product_links: &[(String, String)],
    window_days: i64,
) -> Vec<ComputedEvent> {
    let by_id: HashMap<&str, &CveFacts> =
        facts.iter().map(|f| (f.cve_id.as_str(), f)).collect();

    let mut by_product: BTreeMap<&str, Vec<&CveFacts>> = BTreeMap::new();
    let mut with_products: BTreeSet<&str> = BTreeSet::new();
    for (cve_id, product_key) in product_links {
        if let Some(fact) = by_id.get(cve_id.as_str()) {
            by_product.entry(product_key.as_str()).or_default().push(fact);
            with_products.insert(cve_id.as_str());
        }
    }

    let mut computed = Vec::new();
    for (product_key, mut members) in by_product {
        members.sort_by(|a, b| (a.anchor_at.as_str(), a.cve_id.as_str())
            .cmp(&(b.anchor_at.as_str(), b.cve_id.as_str())));
        let mut window: Option<(DateTime<Utc>, ComputedEvent)> = None;
        for member in members {
            let anchor = parse_iso(&member.anchor_at).unwrap_or_else(Utc::now);
            match &mut window {
                Some((start, event))
                    if anchor < *start + Duration::days(window_days) =>
                {
                    if !event.cve_ids.contains(&member.cve_id) {
                        event.cve_ids.push(member.cve_id.clone());
                    }
                }
                _ => {
                    if let Some((_, event)) = window.take() {
                        computed.push(event);
                    }
                    let window_start_day = day_of(&member.anchor_at).to_string();
                    window = Some((
                        anchor,
                        ComputedEvent {
                            event_key: format!("cluster:{product_key}:{window_start_day}"),
                            cve_ids: vec![member.cve_id.clone()],
                            product_keys: vec![product_key.to_string()],
                            window_start: Some(window_start_day),
                        },
                    ));
                }
            }
        }
        if let Some((_, event)) = window.take() {
            computed.push(event);
        }
    }

    for fact in facts {
        if !with_products.contains(fact.cve_id.as_str()) {
            computed.push(ComputedEvent {
                event_key: format!("cve:{}", fact.cve_id),
                cve_ids: vec![fact.cve_id.clone()],
                product_keys: Vec::new(),
                window_start: None,
            });
        }
    }

    computed.sort_by(|a, b| a.event_key.cmp(&b.event_key));
    computed
}

/// Inputs to a lifecycle transition decision.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleInput<'a> {
    pub confidence_max: f64,
    pub article_count: usize,
    /// New severity strictly above the previously stored one.
    pub severity_upgraded: bool,
    /// Evidence newer than the stored last_seen_at arrived this rebuild.
    pub new_evidence: bool,
    pub last_seen_at: &'a str,
    pub now: DateTime<Utc>,
}

/// One step of the event lifecycle state machine.
pub fn next_status(
    current: EventStatus,
    input: &LifecycleInput<'_>,
    config: &EventsConfig,
) -> EventStatus {
    let days_idle = parse_iso(input.last_seen_at)
        .map(|seen| (input.now - seen).num_days())
        .unwrap_or(0);
    match current {
        EventStatus::Proposed => {
            if input.confidence_max >= config.activate_confidence || input.article_count >= 2 {
                EventStatus::Active
            } else {
                EventStatus::Proposed
            }
        }
        // `updating` resolves back to active once the summary is refreshed,
        // which is exactly what a rebuild does.
        EventStatus::Active | EventStatus::Updating => {
            if days_idle > config.dormant_after_days {
                EventStatus::Dormant
            } else {
                EventStatus::Active
            }
        }
        EventStatus::Dormant => {
            if input.new_evidence && input.confidence_max >= config.activate_confidence {
                EventStatus::Active
            } else if days_idle > config.close_after_days {
                EventStatus::Closed
            } else {
                EventStatus::Dormant
            }
        }
        EventStatus::Closed => {
            if input.severity_upgraded || input.new_evidence {
                EventStatus::Active
            } else {
                EventStatus::Closed
            }
        }
    }
}

fn link_meta_from_row(
    confidence: f64,
    confidence_band: &str,
    reasons_json: &str,
    evidence_json: &str,
) -> LinkMeta {
    LinkMeta {
        confidence,
        confidence_band: confidence_band.to_string(),
        reasons: serde_json::from_str(reasons_json).unwrap_or_default(),
        evidence: serde_json::from_str(evidence_json).unwrap_or_default(),
    }
}

/// Deterministic summary text for a generated event.
fn compose_summary(
    product_names: &[String],
    cve_lines: &[String],
    reference_domains: &[String],
) -> String {
    let mut parts = Vec::new();
    if !product_names.is_empty() {
        parts.push(format!("Affected: {}.", product_names.join(", ")));
    }
    if !cve_lines.is_empty() {
        parts.push(format!("CVEs: {}.", cve_lines.join(", ")));
    }
    if !reference_domains.is_empty() {
        parts.push(format!(
            "References: {}.",
            reference_domains.iter().take(8).cloned().collect::<Vec<_>>().join(", ")
        ));
    }
    parts.join(" ")
}

/// Rebuild statistics returned in the job result.
#[derive(Debug, Default)]
pub struct RebuildStats {
    pub computed: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted_stale: usize,
    pub skipped_manual: usize,
    pub articles_linked: usize,
}

/// Recompute the generated event set from CVEs, products, and article links.
pub async fn rebuild_events(pool: &SqlitePool, config: &EventsConfig) -> Result<RebuildStats> {
    let now = Utc::now();

    // Phase 1: read everything (outside the write transaction).
    let all_cves = cves::list_cves(pool).await?;
    let product_links = products::list_cve_product_links(pool).await?;
    let article_links = articles::list_article_cve_links(pool).await?;
    let existing_events = events_db::list_events(pool).await?;

    let facts: Vec<CveFacts> = all_cves
        .iter()
        .map(|cve| CveFacts {
            cve_id: cve.cve_id.clone(),
            anchor_at: cve
                .published_at
                .clone()
                .unwrap_or_else(|| cve.last_seen_at.clone()),
            severity: cve.preferred_base_severity.clone(),
            score: cve.preferred_base_score,
        })
        .collect();
    let facts_by_id: HashMap<&str, &CveFacts> =
        facts.iter().map(|f| (f.cve_id.as_str(), f)).collect();
    let domains_by_id: HashMap<&str, &[String]> = all_cves
        .iter()
        .map(|c| (c.cve_id.as_str(), c.reference_domains.as_slice()))
        .collect();

    // article links grouped per CVE: (article_id, meta, anchor timestamp)
    let mut links_by_cve: HashMap<&str, Vec<(String, LinkMeta, String)>> = HashMap::new();
    for (article_id, cve_id, confidence, band, reasons, evidence, published, ingested) in
        &article_links
    {
        links_by_cve.entry(cve_id.as_str()).or_default().push((
            article_id.clone(),
            link_meta_from_row(*confidence, band, reasons, evidence),
            published.clone().unwrap_or_else(|| ingested.clone()),
        ));
    }

    let mut product_display: HashMap<String, String> = HashMap::new();
    for (_, product_key) in &product_links {
        if !product_display.contains_key(product_key) {
            let display = products::get_product_display(pool, product_key)
                .await?
                .unwrap_or_else(|| product_key.clone());
            product_display.insert(product_key.clone(), display);
        }
    }

    let computed = compute_clusters(&facts, &product_links, config.merge_window_days);
    let computed_keys: BTreeSet<&str> =
        computed.iter().map(|e| e.event_key.as_str()).collect();
    let existing_by_key: HashMap<&str, &Event> = existing_events
        .iter()
        .map(|e| (e.event_key.as_str(), e))
        .collect();

    let mut stats = RebuildStats {
        computed: computed.len(),
        ..Default::default()
    };

    // Phase 2: apply the new set in one transaction.
    let mut tx = pool.begin().await?;
    for cluster in &computed {
        let existing = existing_by_key.get(cluster.event_key.as_str()).copied();
        if matches!(existing, Some(e) if e.kind == EventKind::Manual) {
            stats.skipped_manual += 1;
            continue;
        }

        // Rollups over member CVEs and their article links.
        let mut severity: Option<Severity> = None;
        let mut anchors: Vec<String> = Vec::new();
        let mut cve_link_rows: Vec<(String, LinkMeta)> = Vec::new();
        let mut article_rows: BTreeMap<String, LinkMeta> = BTreeMap::new();
        let mut cve_lines: Vec<String> = Vec::new();
        let mut reference_domains: BTreeSet<String> = BTreeSet::new();
        let mut confidence_max: f64 = 0.0;

        for cve_id in &cluster.cve_ids {
            let fact = facts_by_id.get(cve_id.as_str());
            if let Some(fact) = fact {
                anchors.push(fact.anchor_at.clone());
                if let Some(band) = fact.severity.as_deref().and_then(Severity::parse) {
                    severity = Some(severity.map_or(band, |s| s.max(band)));
                }
                cve_lines.push(match (fact.score, fact.severity.as_deref()) {
                    (Some(score), Some(band)) => format!("{cve_id} ({score} {band})"),
                    (Some(score), None) => format!("{cve_id} ({score})"),
                    _ => cve_id.clone(),
                });
            }
            if let Some(domains) = domains_by_id.get(cve_id.as_str()) {
                reference_domains.extend(domains.iter().cloned());
            }
            let article_meta = links_by_cve.get(cve_id.as_str());
            let cve_confidence = article_meta
                .map(|links| {
                    links
                        .iter()
                        .map(|(_, meta, _)| meta.confidence)
                        .fold(0.0f64, f64::max)
                })
                .unwrap_or(0.0);
            confidence_max = confidence_max.max(cve_confidence);
            let (link_confidence, band) = if cve_confidence > 0.0 {
                (cve_confidence, "linked")
            } else {
                (1.0, "member")
            };
            cve_link_rows.push((
                cve_id.clone(),
                LinkMeta {
                    confidence: link_confidence,
                    confidence_band: band.to_string(),
                    reasons: vec!["rule.event.cve_member".to_string()],
                    evidence: json!({ "cve_id": cve_id }),
                },
            ));
            if let Some(links) = article_meta {
                for (article_id, meta, anchor) in links {
                    anchors.push(anchor.clone());
                    article_rows.insert(article_id.clone(), meta.clone());
                }
            }
        }

        anchors.sort();
        let first_seen = anchors.first().cloned().unwrap_or_else(now_iso);
        let last_seen = anchors.last().cloned().unwrap_or_else(now_iso);

        let title = match (&cluster.window_start, cluster.product_keys.first()) {
            (Some(window_start), Some(product_key)) => {
                let display = product_display
                    .get(product_key)
                    .cloned()
                    .unwrap_or_else(|| product_key.clone());
                format!("{display} vulnerabilities, {window_start}")
            }
            _ => format!("{} activity", cluster.cve_ids.first().map(String::as_str).unwrap_or("CVE")),
        };
        let product_names: Vec<String> = cluster
            .product_keys
            .iter()
            .map(|key| product_display.get(key).cloned().unwrap_or_else(|| key.clone()))
            .collect();
        let summary = compose_summary(
            &product_names,
            &cve_lines,
            &reference_domains.iter().cloned().collect::<Vec<_>>(),
        );

        let previous_severity = existing
            .and_then(|e| e.severity.as_deref())
            .and_then(Severity::parse);
        let severity_upgraded = match (previous_severity, severity) {
            (Some(prev), Some(new)) => new > prev,
            (None, Some(_)) => false,
            _ => false,
        };
        let new_evidence = existing
            .map(|e| last_seen > e.last_seen_at)
            .unwrap_or(false);
        let current_status = existing.map(|e| e.status).unwrap_or(EventStatus::Proposed);
        let status = next_status(
            current_status,
            &LifecycleInput {
                confidence_max,
                article_count: article_rows.len(),
                severity_upgraded,
                new_evidence,
                last_seen_at: &last_seen,
                now,
            },
            config,
        );
        if current_status == EventStatus::Closed && status == EventStatus::Active {
            info!(event_key = %cluster.event_key, "closed event reopened");
        }
        let status_changed_at = match existing {
            Some(e) if e.status == status => e.status_changed_at.clone(),
            _ => now_iso(),
        };

        let event = Event {
            id: existing
                .map(|e| e.id.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            event_key: cluster.event_key.clone(),
            kind: EventKind::CveCluster,
            title,
            summary: if summary.is_empty() { None } else { Some(summary) },
            severity: severity.map(|s| s.as_str().to_string()),
            status,
            first_seen_at: first_seen,
            last_seen_at: last_seen,
            status_changed_at,
        };

        let Some(event_id) = events_db::upsert_event_in_tx(&mut tx, &event).await? else {
            stats.skipped_manual += 1;
            continue;
        };
        let article_rows: Vec<(String, LinkMeta)> = article_rows.into_iter().collect();
        stats.articles_linked += article_rows.len();
        events_db::replace_event_links_in_tx(
            &mut tx,
            &event_id,
            &cve_link_rows,
            &cluster.product_keys,
            &article_rows,
        )
        .await?;
        if existing.is_some() {
            stats.updated += 1;
        } else {
            stats.created += 1;
        }
    }

    // Generated events whose key the clustering no longer produces are stale.
    for event in &existing_events {
        if event.kind == EventKind::Manual {
            continue;
        }
        if !computed_keys.contains(event.event_key.as_str()) {
            events_db::delete_event_in_tx(&mut tx, &event.id).await?;
            stats.deleted_stale += 1;
        }
    }
    tx.commit().await?;

    info!(
        computed = stats.computed,
        created = stats.created,
        updated = stats.updated,
        deleted_stale = stats.deleted_stale,
        "events rebuilt"
    );
    Ok(stats)
}

/// Remove weak-evidence events: fewer than `purge_min_articles` linked
/// articles AND severity below `purge_min_severity`. Manual events are
/// never touched.
pub async fn purge_events(pool: &SqlitePool, config: &EventsConfig) -> Result<u64> {
    let min_severity =
        Severity::parse(&config.purge_min_severity).unwrap_or(Severity::High);
    let all = events_db::list_events(pool).await?;
    let mut purged = 0u64;
    let mut tx = pool.begin().await?;
    for event in &all {
        if event.kind == EventKind::Manual {
            continue;
        }
        let article_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM event_articles WHERE event_id = ?")
                .bind(&event.id)
                .fetch_one(&mut *tx)
                .await?;
        let severity = event.severity.as_deref().and_then(Severity::parse);
        let weak_severity = severity.map(|s| s < min_severity).unwrap_or(true);
        if article_count < config.purge_min_articles && weak_severity {
            events_db::delete_event_in_tx(&mut tx, &event.id).await?;
            purged += 1;
        }
    }
    tx.commit().await?;
    info!(purged, "weak events purged");
    Ok(purged)
}

/// Publish event pages and the events index after a rebuild.
async fn publish_events(pool: &SqlitePool, site_src_dir: &Path) -> Result<usize> {
    let all = events_db::list_events(pool).await?;
    let mut written = 0;
    for event in &all {
        let cve_ids = events_db::list_event_cve_ids(pool, &event.id).await?;
        let mut cve_rows = Vec::with_capacity(cve_ids.len());
        for cve_id in &cve_ids {
            let cve = cves::get_cve(pool, cve_id).await?;
            cve_rows.push((
                cve_id.clone(),
                cve.as_ref().and_then(|c| c.preferred_base_severity.clone()),
                cve.as_ref().and_then(|c| c.preferred_base_score),
            ));
        }
        let mut product_names = Vec::new();
        for key in events_db::list_event_product_keys(pool, &event.id).await? {
            product_names.push(
                products::get_product_display(pool, &key)
                    .await?
                    .unwrap_or(key),
            );
        }
        let mut article_rows = Vec::new();
        for article_id in events_db::list_event_article_ids(pool, &event.id).await? {
            if let Some(article) = articles::get_article(pool, &article_id).await? {
                article_rows.push((article.title, article.canonical_url));
            }
        }
        let page = markdown::EventPage {
            event,
            cves: cve_rows,
            products: product_names,
            articles: article_rows,
        };
        markdown::write_event_markdown(&page, site_src_dir)?;
        written += 1;
    }
    indexes::write_events_index(pool, site_src_dir).await?;
    Ok(written)
}

/// Handler for `events_rebuild`. Exclusive across workers via its
/// idempotency key.
pub struct EventsRebuildHandler;

#[async_trait]
impl JobHandler for EventsRebuildHandler {
    async fn run(&self, ctx: &JobContext) -> Result<Value> {
        if !ctx.config.events.enabled {
            return Ok(json!({ "status": "disabled" }));
        }
        ctx.check_canceled()?;
        let stats = rebuild_events(&ctx.pool, &ctx.config.events).await?;
        let pages = publish_events(
            &ctx.pool,
            Path::new(&ctx.config.paths.site_src_dir),
        )
        .await?;
        queue::enqueue_build_site_if_needed(
            &ctx.pool,
            job_types::EVENTS_REBUILD,
            ctx.config.publishing.build_debounce_seconds,
        )
        .await?;
        Ok(json!({
            "computed": stats.computed,
            "created": stats.created,
            "updated": stats.updated,
            "deleted_stale": stats.deleted_stale,
            "skipped_manual": stats.skipped_manual,
            "articles_linked": stats.articles_linked,
            "pages_written": pages,
        }))
    }
}

/// Handler for `events_purge`.
pub struct EventsPurgeHandler;

#[async_trait]
impl JobHandler for EventsPurgeHandler {
    async fn run(&self, ctx: &JobContext) -> Result<Value> {
        let purged = purge_events(&ctx.pool, &ctx.config.events).await?;
        if purged > 0 {
            queue::enqueue_build_site_if_needed(
                &ctx.pool,
                job_types::EVENTS_PURGE,
                ctx.config.publishing.build_debounce_seconds,
            )
            .await?;
        }
        Ok(json!({ "purged": purged }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(cve_id: &str, anchor: &str, severity: Option<&str>) -> CveFacts {
        CveFacts {
            cve_id: cve_id.to_string(),
            anchor_at: format!("{anchor}T00:00:00Z"),
            severity: severity.map(str::to_string),
            score: None,
        }
    }

    #[test]
    fn cves_sharing_a_product_within_window_cluster() {
        let facts = vec![
            fact("CVE-2025-0001", "2025-03-01", Some("HIGH")),
            fact("CVE-2025-0002", "2025-03-05", Some("MEDIUM")),
        ];
        let links = vec![
            ("CVE-2025-0001".to_string(), "acme/widget".to_string()),
            ("CVE-2025-0002".to_string(), "acme/widget".to_string()),
        ];
        let clusters = compute_clusters(&facts, &links, 14);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].event_key, "cluster:acme/widget:2025-03-01");
        assert_eq!(clusters[0].cve_ids, vec!["CVE-2025-0001", "CVE-2025-0002"]);
    }

    #[test]
    fn window_boundary_starts_a_new_cluster() {
        let facts = vec![
            fact("CVE-2025-0001", "2025-03-01", None),
            fact("CVE-2025-0002", "2025-03-20", None),
        ];
        let links = vec![
            ("CVE-2025-0001".to_string(), "acme/widget".to_string()),
            ("CVE-2025-0002".to_string(), "acme/widget".to_string()),
        ];
        let clusters = compute_clusters(&facts, &links, 14);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].event_key, "cluster:acme/widget:2025-03-01");
        assert_eq!(clusters[1].event_key, "cluster:acme/widget:2025-03-20");
    }

    #[test]
    fn productless_cve_gets_its_own_event() {
        let facts = vec![fact("CVE-2025-0003", "2025-03-01", None)];
        let clusters = compute_clusters(&facts, &[], 14);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].event_key, "cve:CVE-2025-0003");
        assert!(clusters[0].product_keys.is_empty());
    }

    #[test]
    fn clustering_is_deterministic() {
        let facts = vec![
            fact("CVE-2025-0002", "2025-03-05", None),
            fact("CVE-2025-0001", "2025-03-01", None),
            fact("CVE-2025-0009", "2025-03-02", None),
        ];
        let links = vec![
            ("CVE-2025-0002".to_string(), "acme/widget".to_string()),
            ("CVE-2025-0001".to_string(), "acme/widget".to_string()),
        ];
        let a = compute_clusters(&facts, &links, 14);
        let b = compute_clusters(&facts, &links, 14);
        let render = |clusters: &[ComputedEvent]| {
            clusters
                .iter()
                .map(|c| format!("{}:{:?}", c.event_key, c.cve_ids))
                .collect::<Vec<_>>()
        };
        assert_eq!(render(&a), render(&b));
    }

    fn lifecycle_config() -> EventsConfig {
        EventsConfig::default()
    }

    fn input<'a>(last_seen: &'a str, now: &str) -> LifecycleInput<'a> {
        LifecycleInput {
            confidence_max: 0.0,
            article_count: 0,
            severity_upgraded: false,
            new_evidence: false,
            last_seen_at: last_seen,
            now: parse_iso(&format!("{now}T00:00:00Z")).unwrap(),
        }
    }

    #[test]
    fn proposed_activates_on_confidence_or_corroboration() {
        let config = lifecycle_config();
        let mut i = input("2025-03-01T00:00:00Z", "2025-03-02");
        assert_eq!(next_status(EventStatus::Proposed, &i, &config), EventStatus::Proposed);
        i.confidence_max = 1.0;
        assert_eq!(next_status(EventStatus::Proposed, &i, &config), EventStatus::Active);
        i.confidence_max = 0.0;
        i.article_count = 2;
        assert_eq!(next_status(EventStatus::Proposed, &i, &config), EventStatus::Active);
    }

    #[test]
    fn active_goes_dormant_then_closed() {
        let config = lifecycle_config();
        let i = input("2025-01-01T00:00:00Z", "2025-02-15");
        assert_eq!(next_status(EventStatus::Active, &i, &config), EventStatus::Dormant);
        let i = input("2025-01-01T00:00:00Z", "2025-06-01");
        assert_eq!(next_status(EventStatus::Dormant, &i, &config), EventStatus::Closed);
    }

    #[test]
    fn dormant_reactivates_on_high_confidence_evidence() {
        let config = lifecycle_config();
        let mut i = input("2025-03-01T00:00:00Z", "2025-03-02");
        i.new_evidence = true;
        i.confidence_max = 1.0;
        assert_eq!(next_status(EventStatus::Dormant, &i, &config), EventStatus::Active);
    }

    #[test]
    fn closed_reopens_on_severity_upgrade() {
        let config = lifecycle_config();
        let mut i = input("2025-01-01T00:00:00Z", "2025-06-01");
        assert_eq!(next_status(EventStatus::Closed, &i, &config), EventStatus::Closed);
        i.severity_upgraded = true;
        assert_eq!(next_status(EventStatus::Closed, &i, &config), EventStatus::Active);
    }

    #[test]
    fn updating_resolves_to_active() {
        let config = lifecycle_config();
        let i = input("2025-03-01T00:00:00Z", "2025-03-02");
        assert_eq!(next_status(EventStatus::Updating, &i, &config), EventStatus::Active);
    }
}
