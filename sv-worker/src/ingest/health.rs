//! Source health recording and auto-pause
//!
//! Every ingest attempt appends a health row. When the recent runs show a
//! long enough error streak or zero-article streak, the source is paused
//! for a configurable window and an alert row records the trigger.

use sqlx::SqlitePool;
use sv_common::models::SourceHealth;
use sv_common::params::AlertsConfig;
use sv_common::Result;
use tracing::warn;

use crate::db::{health, sources};

pub async fn record_run(pool: &SqlitePool, run: &SourceHealth) -> Result<()> {
    health::insert_health_run(pool, run).await
}

/// Check streaks and pause the source when a threshold is crossed.
///
/// Returns the pause reason when a pause was applied.
pub async fn maybe_auto_pause(
    pool: &SqlitePool,
    alerts: &AlertsConfig,
    source_id: &str,
) -> Result<Option<String>> {
    if !alerts.pause_on_failure_enabled {
        return Ok(None);
    }
    let streaks = health::get_run_streaks(pool, source_id).await?;

    let (alert_type, reason) = if streaks.consecutive_errors >= alerts.error_streak {
        (
            "error_streak",
            format!("auto_pause:error_streak:{}", streaks.consecutive_errors),
        )
    } else if streaks.consecutive_zero_articles >= alerts.zero_streak {
        (
            "zero_streak",
            format!(
                "auto_pause:zero_streak:{}",
                streaks.consecutive_zero_articles
            ),
        )
    } else {
        return Ok(None);
    };

    sources::pause_source(pool, source_id, &reason, alerts.pause_minutes).await?;
    health::record_health_alert(pool, source_id, alert_type, &reason).await?;
    warn!(source_id, reason = %reason, "source auto-paused");
    Ok(Some(reason))
}
