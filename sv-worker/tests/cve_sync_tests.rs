//! CVE sync properties: journal quiescence on identical data, severity
//! upgrade detection, preferred-version selection, and atomic product
//! replacement.

mod common;

use common::setup_pool;
use sv_common::models::change_types;
use sv_worker::cve::nvd::{
    NvdConfiguration, NvdCpeMatch, NvdCve, NvdCvssData, NvdDescription, NvdMetricEntry,
    NvdMetrics, NvdNode, NvdReference,
};
use sv_worker::cve::sync::{apply_cve, SyncStats};
use sv_worker::db::{cves, products};

fn metric(score: f64, severity: &str, vector: &str) -> NvdMetricEntry {
    NvdMetricEntry {
        cvss_data: NvdCvssData {
            base_score: Some(score),
            base_severity: Some(severity.to_string()),
            vector_string: Some(vector.to_string()),
        },
        exploitability_score: Some(3.9),
        impact_score: Some(5.9),
    }
}

fn record(cve_id: &str, v31: Option<NvdMetricEntry>, v40: Option<NvdMetricEntry>) -> NvdCve {
    NvdCve {
        id: cve_id.to_string(),
        published: Some("2025-01-01T00:00:00Z".to_string()),
        last_modified: Some("2025-02-01T00:00:00Z".to_string()),
        descriptions: vec![NvdDescription {
            lang: "en".to_string(),
            value: "A test vulnerability.".to_string(),
        }],
        metrics: Some(NvdMetrics {
            cvss_metric_v31: v31.into_iter().collect(),
            cvss_metric_v40: v40.into_iter().collect(),
        }),
        configurations: vec![NvdConfiguration {
            nodes: vec![NvdNode {
                cpe_match: vec![NvdCpeMatch {
                    criteria: "cpe:2.3:a:acme:widget:1.0:*:*:*:*:*:*:*".to_string(),
                    version_start_including: None,
                    version_end_including: None,
                    version_end_excluding: None,
                }],
                children: vec![],
            }],
        }],
        references: vec![NvdReference {
            url: "https://security.acme.example/advisory/1".to_string(),
        }],
    }
}

#[tokio::test]
async fn syncing_identical_data_twice_journals_nothing() {
    let pool = setup_pool().await;
    let record = record("CVE-2025-1000", Some(metric(7.5, "HIGH", "CVSS:3.1/AV:N")), None);

    let mut stats = SyncStats::default();
    apply_cve(&pool, &record, true, None, &mut stats).await.unwrap();
    assert_eq!(stats.new_records, 1);

    let mut stats = SyncStats::default();
    apply_cve(&pool, &record, true, None, &mut stats).await.unwrap();
    assert_eq!(stats.changed, 0);
    assert_eq!(stats.change_rows, 0);

    let changes = cves::list_cve_changes(&pool, "CVE-2025-1000").await.unwrap();
    assert!(changes.is_empty(), "identical syncs must journal nothing");
}

#[tokio::test]
async fn severity_upgrade_journals_and_switches_preferred_version() {
    let pool = setup_pool().await;
    let v31_only = record("CVE-2025-1000", Some(metric(7.5, "HIGH", "CVSS:3.1/AV:N")), None);
    let mut stats = SyncStats::default();
    apply_cve(&pool, &v31_only, true, None, &mut stats).await.unwrap();

    let stored = cves::get_cve(&pool, "CVE-2025-1000").await.unwrap().unwrap();
    assert_eq!(stored.preferred_cvss_version, "3.1");
    assert_eq!(stored.preferred_base_severity.as_deref(), Some("HIGH"));

    let with_v40 = record(
        "CVE-2025-1000",
        Some(metric(7.5, "HIGH", "CVSS:3.1/AV:N")),
        Some(metric(9.4, "CRITICAL", "CVSS:4.0/AV:N")),
    );
    let mut stats = SyncStats::default();
    apply_cve(&pool, &with_v40, true, None, &mut stats).await.unwrap();
    assert_eq!(stats.changed, 1);

    let stored = cves::get_cve(&pool, "CVE-2025-1000").await.unwrap().unwrap();
    assert_eq!(stored.preferred_cvss_version, "4.0");
    assert_eq!(stored.preferred_base_score, Some(9.4));
    assert_eq!(stored.preferred_base_severity.as_deref(), Some("CRITICAL"));

    let changes = cves::list_cve_changes(&pool, "CVE-2025-1000").await.unwrap();
    let upgrade = changes
        .iter()
        .find(|c| c.change_type == change_types::SEVERITY_UPGRADE)
        .expect("severity upgrade journaled");
    assert_eq!(upgrade.from_severity.as_deref(), Some("HIGH"));
    assert_eq!(upgrade.to_severity.as_deref(), Some("CRITICAL"));
}

#[tokio::test]
async fn prefer_v4_false_keeps_v31_preferred() {
    let pool = setup_pool().await;
    let both = record(
        "CVE-2025-2000",
        Some(metric(7.5, "HIGH", "CVSS:3.1/AV:N")),
        Some(metric(9.4, "CRITICAL", "CVSS:4.0/AV:N")),
    );
    let mut stats = SyncStats::default();
    apply_cve(&pool, &both, false, None, &mut stats).await.unwrap();

    let stored = cves::get_cve(&pool, "CVE-2025-2000").await.unwrap().unwrap();
    assert_eq!(stored.preferred_cvss_version, "3.1");
    assert_eq!(stored.preferred_base_score, Some(7.5));
    // Both metric blobs are retained regardless of preference.
    assert!(stored.cvss_v31.is_some());
    assert!(stored.cvss_v40.is_some());
}

#[tokio::test]
async fn products_and_reference_domains_are_extracted() {
    let pool = setup_pool().await;
    let record = record("CVE-2025-3000", Some(metric(5.0, "MEDIUM", "CVSS:3.1/AV:L")), None);
    let mut stats = SyncStats::default();
    apply_cve(&pool, &record, true, None, &mut stats).await.unwrap();

    let keys = products::list_product_keys_for_cve(&pool, "CVE-2025-3000")
        .await
        .unwrap();
    assert_eq!(keys, vec!["acme/widget"]);

    let stored = cves::get_cve(&pool, "CVE-2025-3000").await.unwrap().unwrap();
    assert_eq!(stored.reference_domains, vec!["security.acme.example"]);
    assert_eq!(stored.affected_products.len(), 1);
    assert_eq!(stored.affected_products[0].versions, vec!["1.0"]);
}

#[tokio::test]
async fn product_links_are_replaced_not_accumulated() {
    let pool = setup_pool().await;
    let first = record("CVE-2025-4000", Some(metric(5.0, "MEDIUM", "v")), None);
    let mut stats = SyncStats::default();
    apply_cve(&pool, &first, true, None, &mut stats).await.unwrap();

    // Same CVE now reports a different product.
    let mut second = record("CVE-2025-4000", Some(metric(5.0, "MEDIUM", "v")), None);
    second.configurations[0].nodes[0].cpe_match[0].criteria =
        "cpe:2.3:a:acme:gadget:2.0:*:*:*:*:*:*:*".to_string();
    let mut stats = SyncStats::default();
    apply_cve(&pool, &second, true, None, &mut stats).await.unwrap();

    let keys = products::list_product_keys_for_cve(&pool, "CVE-2025-4000")
        .await
        .unwrap();
    assert_eq!(keys, vec!["acme/gadget"], "links replaced atomically");
}

#[tokio::test]
async fn stub_upgrade_counts_as_new_not_changed() {
    let pool = setup_pool().await;
    cves::upsert_cve_stub(&pool, "CVE-2025-5000").await.unwrap();

    let full = record("CVE-2025-5000", Some(metric(7.5, "HIGH", "v")), None);
    let mut stats = SyncStats::default();
    apply_cve(&pool, &full, true, None, &mut stats).await.unwrap();
    assert_eq!(stats.new_records, 1);
    assert_eq!(stats.changed, 0);
    assert!(cves::list_cve_changes(&pool, "CVE-2025-5000")
        .await
        .unwrap()
        .is_empty());
}
