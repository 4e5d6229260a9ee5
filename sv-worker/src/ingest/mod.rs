//! Ingest & normalization
//!
//! One `ingest_source` job per source: fetch the feed, normalize items to
//! canonical article drafts, dedup, filter, extract explicit CVE links,
//! persist, enqueue the downstream content stages, and record a health row.
//! A failing source records its failure and never takes the worker down.

pub mod fetch;
pub mod filter;
pub mod health;
pub mod parse;
pub mod tags;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::time::{Duration, Instant};
use sv_common::ids::{content_fingerprint, stable_article_id};
use sv_common::models::{Article, Decision, Source, SourceHealth};
use sv_common::params::RuntimeConfig;
use sv_common::time::{now_iso, parse_iso, to_iso};
use sv_common::urlnorm::canonicalize_url;
use sv_common::{Error, Result};
use tracing::{debug, info};

use crate::cve::extract::{explicit_link_meta, extract_cve_ids};
use crate::db::{articles, cves, sources};
use crate::llm;
use crate::publish;
use crate::queue::{self, job_types, EnqueueOptions};
use crate::worker::{JobContext, JobHandler};
use self::fetch::{build_http_client, fetch_source_feed, SourceRateGate};
use self::parse::{parse_items, strip_html, RawItem};

/// Everything one ingest run produced, persisted or not.
#[derive(Debug)]
pub struct SourceOutcome {
    pub source_id: String,
    pub status: String,
    pub http_status: Option<i64>,
    pub found_count: i64,
    pub accepted_count: i64,
    pub seen_count: i64,
    pub filtered_count: i64,
    pub missing_url_count: i64,
    pub error: Option<String>,
    pub articles: Vec<Article>,
    pub decisions: Vec<Decision>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl SourceOutcome {
    fn failed(source_id: &str, http_status: Option<i64>, error: String) -> Self {
        Self {
            source_id: source_id.to_string(),
            status: "error".to_string(),
            http_status,
            found_count: 0,
            accepted_count: 0,
            seen_count: 0,
            filtered_count: 0,
            missing_url_count: 0,
            error: Some(error),
            articles: Vec::new(),
            decisions: Vec::new(),
            etag: None,
            last_modified: None,
        }
    }
}

/// Normalize and judge one raw item.
///
/// `seen_ids` dedups within the batch; the database dedups across runs.
async fn evaluate_item(
    pool: &SqlitePool,
    config: &RuntimeConfig,
    source: &Source,
    item: &RawItem,
    fetched_at: &str,
    seen_ids: &mut std::collections::HashSet<String>,
) -> Result<(Decision, Option<Article>)> {
    let title = item
        .title
        .as_deref()
        .map(strip_html)
        .filter(|t| !t.is_empty());
    let summary = item.summary.as_deref().map(strip_html);
    let derived_tags = tags::derive_tags(
        &config.tags,
        &source.tags,
        title.as_deref().unwrap_or(""),
        summary.as_deref(),
    );

    let (published_at, published_at_source) = derive_published_at(item, fetched_at);

    let Some(link) = item.link.as_deref().filter(|l| !l.is_empty()) else {
        return Ok((
            Decision {
                accepted: false,
                reasons: vec!["missing_url".to_string()],
                title: title.unwrap_or_default(),
                original_url: None,
                canonical_url: None,
                stable_id: None,
                published_at: Some(published_at),
                published_at_source: Some(published_at_source),
                tags: derived_tags,
            },
            None,
        ));
    };

    let canonical_url = canonicalize_url(
        link,
        config.ingest.strip_tracking_params,
        &config.ingest.tracking_params,
    )
    .unwrap_or_else(|| link.to_string());
    let stable_id = stable_article_id(&canonical_url, &source.id);

    let combined = format!(
        "{} {}",
        title.as_deref().unwrap_or(""),
        summary.as_deref().unwrap_or("")
    );
    let mut reasons = filter::filter_reasons(
        combined.trim(),
        &source.allow_keywords,
        &source.deny_keywords,
        &config.ingest.filters.allow_keywords,
        &config.ingest.filters.deny_keywords,
    );

    if seen_ids.contains(&stable_id) {
        reasons.push("duplicate".to_string());
    } else if config.ingest.dedupe_enabled && articles::article_exists(pool, &stable_id).await? {
        reasons.push("duplicate".to_string());
    }

    let accepted = reasons.is_empty();
    let title_text = title.unwrap_or_else(|| canonical_url.clone());
    let decision = Decision {
        accepted,
        reasons,
        title: title_text.clone(),
        original_url: Some(link.to_string()),
        canonical_url: Some(canonical_url.clone()),
        stable_id: Some(stable_id.clone()),
        published_at: Some(published_at.clone()),
        published_at_source: Some(published_at_source.clone()),
        tags: derived_tags.clone(),
    };
    if !accepted {
        return Ok((decision, None));
    }

    seen_ids.insert(stable_id.clone());
    let fingerprint = content_fingerprint(&title_text, summary.as_deref().unwrap_or(""));
    let article = Article {
        id: stable_id,
        source_id: source.id.clone(),
        title: title_text,
        original_url: link.to_string(),
        canonical_url,
        published_at: Some(published_at),
        published_at_source: Some(published_at_source),
        ingested_at: fetched_at.to_string(),
        author: item.author.clone().filter(|a| !a.is_empty()),
        summary_text: summary.filter(|s| !s.is_empty()),
        content_text: None,
        content_html_excerpt: None,
        content_fetched_at: None,
        content_error: None,
        summary_llm: None,
        summary_model: None,
        summary_generated_at: None,
        summary_error: None,
        tags: derived_tags,
        content_fingerprint: Some(fingerprint),
        published_md_path: None,
    };
    Ok((decision, Some(article)))
}

/// published → updated → guessed, recording which field won.
fn derive_published_at(item: &RawItem, fetched_at: &str) -> (String, String) {
    if let Some(published) = item.published {
        return (to_iso(published), "published".to_string());
    }
    if let Some(updated) = item.updated {
        return (to_iso(updated), "modified".to_string());
    }
    (fetched_at.to_string(), "guessed".to_string())
}

/// Run fetch + parse + evaluate for a source. Nothing is persisted here; in
/// test mode the caller just reads the decisions.
pub async fn process_source(
    pool: &SqlitePool,
    config: &RuntimeConfig,
    source: &Source,
) -> Result<SourceOutcome> {
    let client = build_http_client(config.ingest.http.timeout_seconds)?;
    let fetched = match fetch_source_feed(&client, source, &config.ingest.http).await {
        Ok(fetched) => fetched,
        Err(e) => {
            let status = match &e {
                Error::Permanent(msg) | Error::Transient(msg) => msg
                    .strip_prefix("HTTP ")
                    .and_then(|rest| rest.split(':').next())
                    .and_then(|code| code.parse::<i64>().ok()),
                _ => None,
            };
            return Ok(SourceOutcome::failed(&source.id, status, e.to_string()));
        }
    };

    if fetched.not_modified {
        debug!(source_id = %source.id, "feed not modified");
        return Ok(SourceOutcome {
            source_id: source.id.clone(),
            status: "ok".to_string(),
            http_status: fetched.http_status,
            found_count: 0,
            accepted_count: 0,
            seen_count: 0,
            filtered_count: 0,
            missing_url_count: 0,
            error: None,
            articles: Vec::new(),
            decisions: Vec::new(),
            etag: fetched.etag,
            last_modified: fetched.last_modified,
        });
    }

    let items = match parse_items(
        source.kind,
        &fetched.body,
        &source.url,
        source.html_item_selector.as_deref(),
    ) {
        Ok(items) => items,
        Err(e) => {
            return Ok(SourceOutcome::failed(
                &source.id,
                fetched.http_status,
                e.to_string(),
            ))
        }
    };

    let fetched_at = now_iso();
    let mut seen_ids = std::collections::HashSet::new();
    let mut accepted = Vec::new();
    let mut decisions = Vec::new();
    let mut seen_count = 0;
    let mut filtered_count = 0;
    let mut missing_url_count = 0;

    for item in &items {
        let (decision, article) =
            evaluate_item(pool, config, source, item, &fetched_at, &mut seen_ids).await?;
        if !decision.accepted {
            if decision.reasons.iter().any(|r| r == "duplicate") {
                seen_count += 1;
            } else if decision.reasons.iter().any(|r| r == "missing_url") {
                missing_url_count += 1;
            } else {
                filtered_count += 1;
            }
        }
        if let Some(article) = article {
            accepted.push(article);
        }
        decisions.push(decision);
    }

    info!(
        source_id = %source.id,
        found_count = items.len(),
        accepted_count = accepted.len(),
        seen_count,
        filtered_count,
        "source parsed"
    );

    Ok(SourceOutcome {
        source_id: source.id.clone(),
        status: "ok".to_string(),
        http_status: fetched.http_status,
        found_count: items.len() as i64,
        accepted_count: accepted.len() as i64,
        seen_count,
        filtered_count,
        missing_url_count,
        error: None,
        articles: accepted,
        decisions,
        etag: fetched.etag,
        last_modified: fetched.last_modified,
    })
}

/// Handler for `ingest_source{source_id}`.
pub struct IngestSourceHandler {
    rate_gate: SourceRateGate,
}

impl IngestSourceHandler {
    pub fn new() -> Self {
        Self {
            rate_gate: SourceRateGate::new(),
        }
    }
}

impl Default for IngestSourceHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for IngestSourceHandler {
    async fn run(&self, ctx: &JobContext) -> Result<Value> {
        let source_id = ctx.payload_str("source_id")?;
        let source = sources::get_source(&ctx.pool, &source_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("source {source_id}")))?;

        let started = Instant::now();
        let started_at = now_iso();

        // A paused or disabled source records a skipped run and succeeds.
        let paused = source
            .pause_until
            .as_deref()
            .and_then(parse_iso)
            .map(|until| until > chrono::Utc::now())
            .unwrap_or(false);
        if !source.enabled || paused {
            let status = if paused { "paused" } else { "skipped" };
            health::record_run(
                &ctx.pool,
                &SourceHealth {
                    source_id: source.id.clone(),
                    ts: started_at,
                    ok: true,
                    http_status: None,
                    found_count: 0,
                    accepted_count: 0,
                    seen_count: 0,
                    filtered_count: 0,
                    error_count: 0,
                    duration_ms: 0,
                    last_error: source.paused_reason.clone(),
                },
            )
            .await?;
            return Ok(json!({ "source_id": source.id, "status": status }));
        }

        let min_interval = Duration::from_secs(source.min_interval_seconds.unwrap_or(0).max(0) as u64);
        self.rate_gate.wait(&source.id, min_interval).await;
        ctx.check_canceled()?;

        let outcome = ctx
            .cancelable(process_source(&ctx.pool, &ctx.config, &source))
            .await?;
        let duration_ms = started.elapsed().as_millis() as i64;

        health::record_run(
            &ctx.pool,
            &SourceHealth {
                source_id: source.id.clone(),
                ts: now_iso(),
                ok: outcome.status == "ok",
                http_status: outcome.http_status,
                found_count: outcome.found_count,
                accepted_count: outcome.accepted_count,
                seen_count: outcome.seen_count,
                filtered_count: outcome.filtered_count,
                error_count: outcome.missing_url_count,
                duration_ms,
                last_error: outcome.error.clone(),
            },
        )
        .await?;

        if outcome.status != "ok" {
            health::maybe_auto_pause(&ctx.pool, &ctx.config.alerts, &source.id).await?;
            return Ok(json!({
                "source_id": source.id,
                "status": outcome.status,
                "error": outcome.error,
            }));
        }

        sources::record_fetch_validators(
            &ctx.pool,
            &source.id,
            outcome.etag.as_deref(),
            outcome.last_modified.as_deref(),
        )
        .await?;

        ctx.check_canceled()?;
        let inserted = articles::insert_articles(&ctx.pool, &outcome.articles).await?;

        let mut linked_cves = 0usize;
        for article in &outcome.articles {
            ctx.check_canceled()?;
            let cve_ids = extract_cve_ids([
                article.title.as_str(),
                article.summary_text.as_deref().unwrap_or(""),
                article.original_url.as_str(),
            ]);
            if !cve_ids.is_empty() {
                for cve_id in &cve_ids {
                    cves::upsert_cve_stub(&ctx.pool, cve_id).await?;
                }
                let meta = explicit_link_meta(&cve_ids, &article.original_url);
                linked_cves +=
                    articles::upsert_article_cve_links(&ctx.pool, &article.id, &cve_ids, &meta)
                        .await?;
                // Fresh evidence on an existing event means its summary is stale.
                crate::db::events::mark_events_updating_for_cves(&ctx.pool, &cve_ids).await?;
            }
            enqueue_next_stage(&ctx.pool, &ctx.config, article).await?;
        }

        if linked_cves > 0 && ctx.config.events.enabled {
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

        health::maybe_auto_pause(&ctx.pool, &ctx.config.alerts, &source.id).await?;

        Ok(json!({
            "source_id": source.id,
            "status": "ok",
            "found_count": outcome.found_count,
            "accepted_count": outcome.accepted_count,
            "inserted_count": inserted,
            "seen_count": outcome.seen_count,
            "filtered_count": outcome.filtered_count,
            "missing_url_count": outcome.missing_url_count,
            "linked_cves": linked_cves,
        }))
    }
}

/// After insert, an article flows to content fetch, else straight to
/// summarize, else straight to markdown.
async fn enqueue_next_stage(
    pool: &SqlitePool,
    config: &RuntimeConfig,
    article: &Article,
) -> Result<()> {
    if config.ingest.fetch_full_content {
        queue::enqueue_job(
            pool,
            job_types::FETCH_ARTICLE_CONTENT,
            Some(json!({ "article_id": article.id, "source_id": article.source_id })),
            EnqueueOptions::default(),
        )
        .await?;
        return Ok(());
    }
    if llm::maybe_enqueue_summarize(pool, &article.id, &article.source_id).await? {
        return Ok(());
    }
    publish::enqueue_write_markdown(pool, &article.id, &article.source_id).await?;
    Ok(())
}

/// Handler for `ingest_due_sources`: fan one job out per due source.
pub struct IngestDueSourcesHandler;

#[async_trait]
impl JobHandler for IngestDueSourcesHandler {
    async fn run(&self, ctx: &JobContext) -> Result<Value> {
        let due = sources::list_due_sources(&ctx.pool, &now_iso()).await?;
        let mut enqueued = Vec::with_capacity(due.len());
        for source in &due {
            ctx.check_canceled()?;
            queue::enqueue_job(
                &ctx.pool,
                job_types::INGEST_SOURCE,
                Some(json!({ "source_id": source.id })),
                EnqueueOptions::default(),
            )
            .await?;
            enqueued.push(source.id.clone());
        }
        info!(count = enqueued.len(), "due sources enqueued");
        Ok(json!({ "enqueued_count": enqueued.len(), "source_ids": enqueued }))
    }
}

/// Admin test-source: run the pipeline through filtering in memory, with
/// per-item accept/reject reasons, persisting nothing.
pub async fn run_test_source(
    pool: &SqlitePool,
    config: &RuntimeConfig,
    source_id: &str,
) -> Result<Value> {
    let source = sources::get_source(pool, source_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("source {source_id}")))?;
    let outcome = process_source(pool, config, &source).await?;
    let preview: Vec<Value> = outcome
        .decisions
        .iter()
        .take(20)
        .map(|decision| {
            json!({
                "decision": if decision.accepted { "ACCEPT" } else { "SKIP" },
                "reasons": decision.reasons,
                "title": decision.title,
                "url": decision.canonical_url,
                "published_at": decision.published_at,
                "tags": decision.tags,
            })
        })
        .collect();
    Ok(json!({
        "source_id": outcome.source_id,
        "status": outcome.status,
        "http_status": outcome.http_status,
        "error": outcome.error,
        "found_count": outcome.found_count,
        "accepted_count": outcome.accepted_count,
        "seen_count": outcome.seen_count,
        "filtered_count": outcome.filtered_count,
        "missing_url_count": outcome.missing_url_count,
        "preview": preview,
    }))
}
