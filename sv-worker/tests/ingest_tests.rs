//! Ingest pipeline: happy path against a fixture feed, dedup idempotence,
//! explicit CVE linking, filters, and the auto-pause policy.

mod common;

use common::{make_ctx, serve_fixture, setup_pool, test_source};
use serde_json::json;
use sv_common::models::SourceHealth;
use sv_common::time::{now_iso, now_plus_seconds_iso};
use sv_worker::db::{articles, health as health_db, sources};
use sv_worker::ingest::{health, IngestSourceHandler};
use sv_worker::queue::job_types;
use sv_worker::worker::JobHandler;

const THREE_ITEM_RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Fixture Feed</title>
    <item>
      <title>First advisory</title>
      <link>https://fixture.example/a</link>
      <description>Nothing special</description>
      <pubDate>Tue, 04 Mar 2025 10:00:00 GMT</pubDate>
    </item>
    <item>
      <title>Second advisory</title>
      <link>https://fixture.example/b?utm_source=rss</link>
      <description>Exploit leverages CVE-2024-00123 and cve-2024-99999.</description>
    </item>
    <item>
      <title>Third advisory</title>
      <link>https://fixture.example/c</link>
    </item>
  </channel>
</rss>"#;

const EMPTY_RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel><title>Empty</title></channel></rss>"#;

#[tokio::test]
async fn happy_path_ingest_creates_articles_and_downstream_jobs() {
    let pool = setup_pool().await;
    let url = serve_fixture(THREE_ITEM_RSS, "application/rss+xml").await;
    sources::upsert_source(&pool, &test_source("s1", &url))
        .await
        .unwrap();

    let (ctx, _cancel) = make_ctx(
        &pool,
        common::default_config(),
        job_types::INGEST_SOURCE,
        json!({ "source_id": "s1" }),
    );
    let result = IngestSourceHandler::new().run(&ctx).await.unwrap();

    assert_eq!(result["status"], "ok");
    assert_eq!(result["found_count"], 3);
    assert_eq!(result["accepted_count"], 3);
    assert_eq!(articles::count_articles(&pool).await.unwrap(), 3);

    // One health row with the full counts.
    let runs = health_db::list_recent_runs(&pool, "s1", 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].ok);
    assert_eq!(runs[0].found_count, 3);
    assert_eq!(runs[0].accepted_count, 3);

    // Each accepted article got a content-fetch job.
    assert_eq!(
        common::count_jobs_of_type(&pool, job_types::FETCH_ARTICLE_CONTENT).await,
        3
    );
}

#[tokio::test]
async fn second_ingest_of_unchanged_feed_creates_nothing() {
    let pool = setup_pool().await;
    let url = serve_fixture(THREE_ITEM_RSS, "application/rss+xml").await;
    sources::upsert_source(&pool, &test_source("s1", &url))
        .await
        .unwrap();

    let handler = IngestSourceHandler::new();
    let (ctx, _cancel) = make_ctx(
        &pool,
        common::default_config(),
        job_types::INGEST_SOURCE,
        json!({ "source_id": "s1" }),
    );
    handler.run(&ctx).await.unwrap();
    assert_eq!(articles::count_articles(&pool).await.unwrap(), 3);

    let (ctx2, _cancel2) = make_ctx(
        &pool,
        common::default_config(),
        job_types::INGEST_SOURCE,
        json!({ "source_id": "s1" }),
    );
    let second = handler.run(&ctx2).await.unwrap();
    assert_eq!(second["accepted_count"], 0);
    assert_eq!(second["seen_count"], 3, "all items deduped on the second run");
    assert_eq!(articles::count_articles(&pool).await.unwrap(), 3);
}

#[tokio::test]
async fn explicit_cve_mentions_become_links_and_stubs() {
    let pool = setup_pool().await;
    let url = serve_fixture(THREE_ITEM_RSS, "application/rss+xml").await;
    sources::upsert_source(&pool, &test_source("s1", &url))
        .await
        .unwrap();

    let (ctx, _cancel) = make_ctx(
        &pool,
        common::default_config(),
        job_types::INGEST_SOURCE,
        json!({ "source_id": "s1" }),
    );
    let result = IngestSourceHandler::new().run(&ctx).await.unwrap();
    assert_eq!(result["linked_cves"], 2);

    let links: Vec<(String, f64, String)> = sqlx::query_as(
        "SELECT cve_id, confidence, reasons_json FROM article_cves ORDER BY cve_id",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(links.len(), 2);
    assert_eq!(links[0].0, "CVE-2024-00123");
    assert_eq!(links[1].0, "CVE-2024-99999");
    for (_, confidence, reasons) in &links {
        assert_eq!(*confidence, 1.0);
        assert!(reasons.contains("rule.cve.explicit"));
    }

    // Both stubs exist with a last_seen_at.
    let stub_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cves")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(stub_count, 2);
}

#[tokio::test]
async fn relinking_the_same_cve_is_idempotent() {
    let pool = setup_pool().await;
    common::insert_seed_article(&pool, "a1", "s1", "Story").await;
    let meta = sv_worker::cve::extract::explicit_link_meta(
        &["CVE-2024-0001".to_string()],
        "https://example.com/a1",
    );
    for _ in 0..2 {
        articles::upsert_article_cve_links(&pool, "a1", &["CVE-2024-0001".to_string()], &meta)
            .await
            .unwrap();
    }
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM article_cves")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn deny_keywords_filter_items() {
    let pool = setup_pool().await;
    let url = serve_fixture(THREE_ITEM_RSS, "application/rss+xml").await;
    let mut source = test_source("s1", &url);
    source.deny_keywords = vec!["exploit".to_string()];
    sources::upsert_source(&pool, &source).await.unwrap();

    let (ctx, _cancel) = make_ctx(
        &pool,
        common::default_config(),
        job_types::INGEST_SOURCE,
        json!({ "source_id": "s1" }),
    );
    let result = IngestSourceHandler::new().run(&ctx).await.unwrap();
    assert_eq!(result["accepted_count"], 2);
    assert_eq!(result["filtered_count"], 1);
}

#[tokio::test]
async fn zero_article_streak_pauses_the_source() {
    let pool = setup_pool().await;
    let url = serve_fixture(EMPTY_RSS, "application/rss+xml").await;
    sources::upsert_source(&pool, &test_source("s1", &url))
        .await
        .unwrap();

    let mut config = common::default_config();
    config.alerts.zero_streak = 2;

    let handler = IngestSourceHandler::new();
    for _ in 0..2 {
        let (ctx, _cancel) = make_ctx(
            &pool,
            config.clone(),
            job_types::INGEST_SOURCE,
            json!({ "source_id": "s1" }),
        );
        handler.run(&ctx).await.unwrap();
    }

    let source = sources::get_source(&pool, "s1").await.unwrap().unwrap();
    let pause_until = source.pause_until.expect("source must be paused");
    assert!(pause_until > now_iso());
    let reason = source.paused_reason.unwrap();
    assert!(reason.contains("zero_streak"), "reason was {reason}");

    // A paused source is not due; once the window passes it is again.
    assert!(sources::list_due_sources(&pool, &now_iso())
        .await
        .unwrap()
        .is_empty());
    assert!(!sources::list_due_sources(&pool, &now_plus_seconds_iso(2 * 86400))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn error_streak_pauses_via_health_records() {
    let pool = setup_pool().await;
    sources::upsert_source(&pool, &test_source("s1", "https://unused.example/feed"))
        .await
        .unwrap();
    let mut config = common::default_config();
    config.alerts.error_streak = 3;

    for _ in 0..3 {
        health::record_run(
            &pool,
            &SourceHealth {
                source_id: "s1".to_string(),
                ts: now_iso(),
                ok: false,
                http_status: Some(500),
                found_count: 0,
                accepted_count: 0,
                seen_count: 0,
                filtered_count: 0,
                error_count: 0,
                duration_ms: 10,
                last_error: Some("HTTP 500".to_string()),
            },
        )
        .await
        .unwrap();
    }
    let reason = health::maybe_auto_pause(&pool, &config.alerts, "s1")
        .await
        .unwrap()
        .expect("error streak must pause");
    assert!(reason.contains("error_streak:3"));

    // The trigger leaves an alert row behind.
    let alerts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM health_alerts WHERE source_id = 's1'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(alerts, 1);
}

#[tokio::test]
async fn disabled_source_records_a_skipped_run() {
    let pool = setup_pool().await;
    let mut source = test_source("s1", "https://unused.example/feed");
    source.enabled = false;
    sources::upsert_source(&pool, &source).await.unwrap();

    let (ctx, _cancel) = make_ctx(
        &pool,
        common::default_config(),
        job_types::INGEST_SOURCE,
        json!({ "source_id": "s1" }),
    );
    let result = IngestSourceHandler::new().run(&ctx).await.unwrap();
    assert_eq!(result["status"], "skipped");
    let runs = health_db::list_recent_runs(&pool, "s1", 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].found_count, 0);
}
