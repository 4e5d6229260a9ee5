//! Event correlation: rebuild determinism, clustering shape, lifecycle
//! effects, manual preservation, and the weak-evidence purge.

mod common;

use common::{insert_seed_article, setup_pool};
use sqlx::SqlitePool;
use sv_common::models::EventStatus;
use sv_worker::cve::extract::explicit_link_meta;
use sv_worker::db::{articles, events as events_db, products};
use sv_worker::events::{purge_events, rebuild_events};

async fn seed_cve(pool: &SqlitePool, cve_id: &str, published: &str, severity: Option<&str>) {
    sqlx::query(
        "INSERT INTO cves (cve_id, published_at, last_seen_at, preferred_cvss_version,
                           preferred_base_severity, snapshot_hash)
         VALUES (?, ?, ?, '3.1', ?, 'seed')",
    )
    .bind(cve_id)
    .bind(format!("{published}T00:00:00Z"))
    .bind(format!("{published}T00:00:00Z"))
    .bind(severity)
    .execute(pool)
    .await
    .unwrap();
}

async fn link_product(pool: &SqlitePool, cve_id: &str, vendor: &str, product: &str) {
    let key = products::upsert_product(pool, vendor, product).await.unwrap();
    sqlx::query("INSERT OR IGNORE INTO cve_products (cve_id, product_key) VALUES (?, ?)")
        .bind(cve_id)
        .bind(key)
        .execute(pool)
        .await
        .unwrap();
}

async fn link_article(pool: &SqlitePool, article_id: &str, cve_id: &str) {
    let meta = explicit_link_meta(
        &[cve_id.to_string()],
        &format!("https://example.com/{article_id}"),
    );
    articles::upsert_article_cve_links(pool, article_id, &[cve_id.to_string()], &meta)
        .await
        .unwrap();
}

/// Render the full event link state as comparable text.
async fn link_fingerprint(pool: &SqlitePool) -> Vec<String> {
    let mut out = Vec::new();
    let mut events = events_db::list_events(pool).await.unwrap();
    events.sort_by(|a, b| a.event_key.cmp(&b.event_key));
    for event in events {
        let cves = events_db::list_event_cve_ids(pool, &event.id).await.unwrap();
        let product_keys = events_db::list_event_product_keys(pool, &event.id).await.unwrap();
        let articles = events_db::list_event_article_ids(pool, &event.id).await.unwrap();
        out.push(format!(
            "{}|{}|{:?}|{:?}|{:?}|{:?}|{:?}",
            event.event_key,
            event.title,
            event.severity,
            event.status,
            cves,
            product_keys,
            articles
        ));
    }
    out
}

#[tokio::test]
async fn rebuild_is_deterministic() {
    let pool = setup_pool().await;
    seed_cve(&pool, "CVE-2025-0001", "2025-03-01", Some("HIGH")).await;
    seed_cve(&pool, "CVE-2025-0002", "2025-03-04", Some("MEDIUM")).await;
    seed_cve(&pool, "CVE-2025-0003", "2025-03-02", None).await;
    link_product(&pool, "CVE-2025-0001", "Acme", "Widget").await;
    link_product(&pool, "CVE-2025-0002", "Acme", "Widget").await;
    insert_seed_article(&pool, "a1", "s1", "Widget under attack").await;
    insert_seed_article(&pool, "a2", "s1", "More widget woes").await;
    link_article(&pool, "a1", "CVE-2025-0001").await;
    link_article(&pool, "a2", "CVE-2025-0002").await;

    let config = common::default_config().events;
    rebuild_events(&pool, &config).await.unwrap();
    let first = link_fingerprint(&pool).await;
    rebuild_events(&pool, &config).await.unwrap();
    let second = link_fingerprint(&pool).await;
    assert_eq!(first, second, "unchanged inputs must rebuild identically");
    assert!(!first.is_empty());
}

#[tokio::test]
async fn clustering_groups_by_product_within_window() {
    let pool = setup_pool().await;
    seed_cve(&pool, "CVE-2025-0001", "2025-03-01", Some("HIGH")).await;
    seed_cve(&pool, "CVE-2025-0002", "2025-03-04", Some("CRITICAL")).await;
    // Outside the 14-day window: separate cluster.
    seed_cve(&pool, "CVE-2025-0009", "2025-04-01", Some("LOW")).await;
    link_product(&pool, "CVE-2025-0001", "Acme", "Widget").await;
    link_product(&pool, "CVE-2025-0002", "Acme", "Widget").await;
    link_product(&pool, "CVE-2025-0009", "Acme", "Widget").await;
    // No product: per-CVE event.
    seed_cve(&pool, "CVE-2025-0003", "2025-03-02", None).await;

    let config = common::default_config().events;
    rebuild_events(&pool, &config).await.unwrap();

    let events = events_db::list_events(&pool).await.unwrap();
    let keys: Vec<&str> = {
        let mut keys: Vec<&str> = events.iter().map(|e| e.event_key.as_str()).collect();
        keys.sort();
        keys
    };
    assert_eq!(
        keys,
        vec![
            "cluster:acme/widget:2025-03-01",
            "cluster:acme/widget:2025-04-01",
            "cve:CVE-2025-0003",
        ]
    );

    // Cluster severity is the max over members; title uses the product.
    let cluster = events_db::get_event_by_key(&pool, "cluster:acme/widget:2025-03-01")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cluster.severity.as_deref(), Some("CRITICAL"));
    assert!(cluster.title.contains("Acme Widget"));
    assert!(cluster.title.contains("2025-03-01"));
}

#[tokio::test]
async fn corroborated_events_activate() {
    let pool = setup_pool().await;
    seed_cve(&pool, "CVE-2025-0001", "2025-03-01", Some("HIGH")).await;
    link_product(&pool, "CVE-2025-0001", "Acme", "Widget").await;
    insert_seed_article(&pool, "a1", "s1", "Exploited").await;
    link_article(&pool, "a1", "CVE-2025-0001").await;

    let config = common::default_config().events;
    rebuild_events(&pool, &config).await.unwrap();
    let event = events_db::get_event_by_key(&pool, "cluster:acme/widget:2025-03-01")
        .await
        .unwrap()
        .unwrap();
    // One high-confidence explicit link crosses the activation threshold.
    assert_eq!(event.status, EventStatus::Active);

    // A CVE with no article evidence stays proposed.
    seed_cve(&pool, "CVE-2025-0005", "2025-03-01", None).await;
    rebuild_events(&pool, &config).await.unwrap();
    let lonely = events_db::get_event_by_key(&pool, "cve:CVE-2025-0005")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lonely.status, EventStatus::Proposed);
}

#[tokio::test]
async fn manual_events_survive_rebuild_and_purge() {
    let pool = setup_pool().await;
    let manual = events_db::create_manual_event(
        &pool,
        "Operator tracked incident",
        Some("Hand-written summary"),
        Some("LOW"),
    )
    .await
    .unwrap();

    seed_cve(&pool, "CVE-2025-0001", "2025-03-01", Some("LOW")).await;
    let config = common::default_config().events;
    rebuild_events(&pool, &config).await.unwrap();
    purge_events(&pool, &config).await.unwrap();

    let survived = events_db::get_event(&pool, &manual.id).await.unwrap().unwrap();
    assert_eq!(survived.title, "Operator tracked incident");
    assert_eq!(survived.summary.as_deref(), Some("Hand-written summary"));
}

#[tokio::test]
async fn purge_removes_weak_events_only() {
    let pool = setup_pool().await;
    // Weak: LOW severity, no articles.
    seed_cve(&pool, "CVE-2025-0001", "2025-03-01", Some("LOW")).await;
    // Strong severity: kept even without articles.
    seed_cve(&pool, "CVE-2025-0002", "2025-03-01", Some("CRITICAL")).await;
    // Weak severity but corroborated by two articles: kept.
    seed_cve(&pool, "CVE-2025-0003", "2025-03-01", Some("LOW")).await;
    insert_seed_article(&pool, "a1", "s1", "one").await;
    insert_seed_article(&pool, "a2", "s1", "two").await;
    link_article(&pool, "a1", "CVE-2025-0003").await;
    link_article(&pool, "a2", "CVE-2025-0003").await;

    let config = common::default_config().events;
    rebuild_events(&pool, &config).await.unwrap();
    let purged = purge_events(&pool, &config).await.unwrap();
    assert_eq!(purged, 1);

    let remaining: Vec<String> = events_db::list_events(&pool)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_key)
        .collect();
    assert!(remaining.contains(&"cve:CVE-2025-0002".to_string()));
    assert!(remaining.contains(&"cve:CVE-2025-0003".to_string()));
    assert!(!remaining.contains(&"cve:CVE-2025-0001".to_string()));
}

#[tokio::test]
async fn stale_generated_events_are_deleted_on_rebuild() {
    let pool = setup_pool().await;
    seed_cve(&pool, "CVE-2025-0001", "2025-03-01", None).await;
    let config = common::default_config().events;
    rebuild_events(&pool, &config).await.unwrap();
    assert!(events_db::get_event_by_key(&pool, "cve:CVE-2025-0001")
        .await
        .unwrap()
        .is_some());

    // The CVE gains a product; its per-CVE event gives way to the cluster.
    link_product(&pool, "CVE-2025-0001", "Acme", "Widget").await;
    rebuild_events(&pool, &config).await.unwrap();
    assert!(events_db::get_event_by_key(&pool, "cve:CVE-2025-0001")
        .await
        .unwrap()
        .is_none());
    assert!(events_db::get_event_by_key(&pool, "cluster:acme/widget:2025-03-01")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn event_links_carry_confidence_from_article_links() {
    let pool = setup_pool().await;
    seed_cve(&pool, "CVE-2025-0001", "2025-03-01", Some("HIGH")).await;
    link_product(&pool, "CVE-2025-0001", "Acme", "Widget").await;
    insert_seed_article(&pool, "a1", "s1", "Story").await;
    link_article(&pool, "a1", "CVE-2025-0001").await;

    let config = common::default_config().events;
    rebuild_events(&pool, &config).await.unwrap();

    let event = events_db::get_event_by_key(&pool, "cluster:acme/widget:2025-03-01")
        .await
        .unwrap()
        .unwrap();
    let row: (f64, String, String) = sqlx::query_as(
        "SELECT confidence, confidence_band, reasons_json FROM event_articles WHERE event_id = ?",
    )
    .bind(&event.id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(row.0, 1.0);
    assert_eq!(row.1, "linked");
    assert!(row.2.contains("rule.cve.explicit"));

    // Event summary composes products and CVEs deterministically.
    assert!(event.summary.as_deref().unwrap_or("").contains("Acme Widget"));
    assert!(event.summary.as_deref().unwrap_or("").contains("CVE-2025-0001"));
}
