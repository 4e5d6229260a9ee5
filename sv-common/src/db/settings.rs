//! Settings key/value store
//!
//! Small typed facade over the `settings` table. Values are JSON; readers
//! deserialize into whatever type they expect.

use crate::time::now_iso;
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::SqlitePool;

/// Read a setting, deserializing its JSON value. None when unset.
pub async fn get_setting<T: DeserializeOwned>(pool: &SqlitePool, key: &str) -> Result<Option<T>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT value_json FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;
    match row {
        Some((json,)) => {
            let value = serde_json::from_str(&json)
                .map_err(|e| Error::Internal(format!("setting {key} is malformed: {e}")))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Write a setting, replacing any previous value.
pub async fn set_setting<T: Serialize>(pool: &SqlitePool, key: &str, value: &T) -> Result<()> {
    let json = serde_json::to_string(value)
        .map_err(|e| Error::Internal(format!("setting {key} failed to serialize: {e}")))?;
    sqlx::query(
        r#"
        INSERT INTO settings (key, value_json, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            value_json = excluded.value_json,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(json)
    .bind(now_iso())
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete a setting. Missing keys are not an error.
pub async fn delete_setting(pool: &SqlitePool, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM settings WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn setup() -> SqlitePool {
        let pool = db::init::init_memory_pool().await.unwrap();
        db::migrations::run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn set_then_get() {
        let pool = setup().await;
        set_setting(&pool, "cve.last_successful_sync_at", &"2025-01-01T00:00:00Z")
            .await
            .unwrap();
        let value: Option<String> = get_setting(&pool, "cve.last_successful_sync_at")
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("2025-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn overwrite_replaces() {
        let pool = setup().await;
        set_setting(&pool, "k", &1i64).await.unwrap();
        set_setting(&pool, "k", &2i64).await.unwrap();
        let value: Option<i64> = get_setting(&pool, "k").await.unwrap();
        assert_eq!(value, Some(2));
    }

    #[tokio::test]
    async fn missing_is_none() {
        let pool = setup().await;
        let value: Option<String> = get_setting(&pool, "nope").await.unwrap();
        assert!(value.is_none());
        delete_setting(&pool, "nope").await.unwrap();
    }
}
