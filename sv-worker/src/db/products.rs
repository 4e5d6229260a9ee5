//! Vendor and product entities
//!
//! `product_key = <vendor_norm>/<product_norm>` joins CVEs to products; the
//! key is what the correlation engine clusters on.

use sqlx::SqlitePool;
use sv_common::ids::normalize_name;
use sv_common::models::AffectedProduct;
use sv_common::Result;

/// Build the join key for a vendor/product pair.
pub fn product_key(vendor: &str, product: &str) -> String {
    format!("{}/{}", normalize_name(vendor), normalize_name(product))
}

pub async fn upsert_vendor(pool: &SqlitePool, vendor_display: &str) -> Result<String> {
    let vendor_norm = normalize_name(vendor_display);
    sqlx::query(
        r#"
        INSERT INTO vendors (vendor_norm, display_name)
        VALUES (?, ?)
        ON CONFLICT(vendor_norm) DO UPDATE SET display_name = excluded.display_name
        "#,
    )
    .bind(&vendor_norm)
    .bind(vendor_display)
    .execute(pool)
    .await?;
    Ok(vendor_norm)
}

pub async fn upsert_product(
    pool: &SqlitePool,
    vendor_display: &str,
    product_display: &str,
) -> Result<String> {
    let vendor_norm = upsert_vendor(pool, vendor_display).await?;
    let product_norm = normalize_name(product_display);
    let key = format!("{vendor_norm}/{product_norm}");
    sqlx::query(
        r#"
        INSERT INTO products (product_key, vendor_norm, product_norm, display_name)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(product_key) DO UPDATE SET display_name = excluded.display_name
        "#,
    )
    .bind(&key)
    .bind(&vendor_norm)
    .bind(&product_norm)
    .bind(format!("{vendor_display} {product_display}"))
    .execute(pool)
    .await?;
    Ok(key)
}

/// Replace the product links for one CVE atomically.
pub async fn replace_cve_products(
    pool: &SqlitePool,
    cve_id: &str,
    products: &[AffectedProduct],
) -> Result<usize> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM cve_products WHERE cve_id = ?")
        .bind(cve_id)
        .execute(&mut *tx)
        .await?;
    let mut linked = 0;
    for affected in products {
        let key = product_key(&affected.vendor, &affected.product);
        sqlx::query(
            r#"
            INSERT INTO cve_products (cve_id, product_key, versions_json)
            VALUES (?, ?, ?)
            ON CONFLICT(cve_id, product_key) DO UPDATE SET versions_json = excluded.versions_json
            "#,
        )
        .bind(cve_id)
        .bind(&key)
        .bind(serde_json::to_string(&affected.versions).unwrap_or_else(|_| "[]".into()))
        .execute(&mut *tx)
        .await?;
        linked += 1;
    }
    tx.commit().await?;
    Ok(linked)
}

pub async fn list_product_keys_for_cve(pool: &SqlitePool, cve_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT product_key FROM cve_products WHERE cve_id = ? ORDER BY product_key",
    )
    .bind(cve_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(key,)| key).collect())
}

/// All CVE→product links, ordered for deterministic clustering.
pub async fn list_cve_product_links(pool: &SqlitePool) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT cve_id, product_key FROM cve_products ORDER BY product_key, cve_id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_product_display(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT display_name FROM products WHERE product_key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(name,)| name))
}
