//! Publishing assembly
//!
//! Markdown pages, JSON search indexes, and the external site build. Every
//! upstream stage funnels into a debounced `build_site` enqueue so a burst
//! of writers produces a single build.

pub mod indexes;
pub mod markdown;
pub mod site;

pub use site::BuildSiteHandler;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::path::Path;
use sv_common::{Error, Result};
use tracing::info;

use crate::db::articles;
use crate::queue::{self, job_types};
use crate::worker::{JobContext, JobHandler};

/// Enqueue a markdown write for an article unless one is already pending.
pub async fn enqueue_write_markdown(
    pool: &SqlitePool,
    article_id: &str,
    source_id: &str,
) -> Result<()> {
    if queue::has_pending_article_job(pool, job_types::WRITE_ARTICLE_MARKDOWN, article_id).await? {
        return Ok(());
    }
    queue::enqueue_job(
        pool,
        job_types::WRITE_ARTICLE_MARKDOWN,
        Some(json!({ "article_id": article_id, "source_id": source_id })),
        Default::default(),
    )
    .await?;
    Ok(())
}

/// Handler for `write_article_markdown{article_id}`.
pub struct WriteArticleMarkdownHandler;

#[async_trait]
impl JobHandler for WriteArticleMarkdownHandler {
    async fn run(&self, ctx: &JobContext) -> Result<Value> {
        let article_id = ctx.payload_str("article_id")?;
        let article = articles::get_article(&ctx.pool, &article_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("article {article_id}")))?;

        let site_src = Path::new(&ctx.config.paths.site_src_dir);
        let path = markdown::write_article_markdown(&article, site_src)?;
        let path_str = path.to_string_lossy().into_owned();
        articles::update_published_md_path(&ctx.pool, &article_id, &path_str).await?;

        if ctx.config.publishing.write_json_index {
            indexes::write_articles_index(&ctx.pool, site_src).await?;
        }
        queue::enqueue_build_site_if_needed(
            &ctx.pool,
            job_types::WRITE_ARTICLE_MARKDOWN,
            ctx.config.publishing.build_debounce_seconds,
        )
        .await?;

        info!(article_id = %article_id, path = %path_str, "article markdown written");
        Ok(json!({ "article_id": article_id, "path": path_str }))
    }
}
