//! LLM stage routing and summarization
//!
//! A stage (`summarize_article`) routes to a profile; a profile binds a
//! provider, model, prompt, and params. The summarize handler runs on the
//! dedicated `llm` worker class so provider spend is isolated from general
//! work, throttled by low per-type concurrency plus request spacing.

pub mod client;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::time::{Duration, Instant};
use sv_common::models::LlmRun;
use sv_common::secrets::SecretBox;
use sv_common::time::now_iso;
use sv_common::{Error, Result};
use tokio::sync::Mutex;
use tracing::info;

use crate::db::{articles, llm as llm_db, sources};
use crate::publish;
use crate::queue::{self, job_types};
use crate::worker::{JobContext, JobHandler};
use self::client::{complete, render_messages};

/// Stage name for article summarization.
pub const STAGE_SUMMARIZE_ARTICLE: &str = "summarize_article";

/// Enqueue a summarize job when a profile is routed and the article has no
/// summary yet. Returns false when the stage is skipped.
pub async fn maybe_enqueue_summarize(
    pool: &SqlitePool,
    article_id: &str,
    source_id: &str,
) -> Result<bool> {
    let Some(profile) = llm_db::get_profile_for_stage(pool, STAGE_SUMMARIZE_ARTICLE).await? else {
        return Ok(false);
    };
    let Some(article) = articles::get_article(pool, article_id).await? else {
        return Ok(false);
    };
    if article.summary_llm.is_some() {
        return Ok(false);
    }
    if queue::has_pending_article_job(pool, job_types::SUMMARIZE_ARTICLE_LLM, article_id).await? {
        return Ok(true);
    }
    queue::enqueue_job(
        pool,
        job_types::SUMMARIZE_ARTICLE_LLM,
        Some(json!({
            "article_id": article_id,
            "source_id": source_id,
            "profile_id": profile.id,
        })),
        Default::default(),
    )
    .await?;
    Ok(true)
}

/// Handler for `summarize_article_llm{article_id}`.
pub struct SummarizeArticleHandler {
    /// Spacing between provider requests from this process.
    last_request: Mutex<Option<Instant>>,
}

impl SummarizeArticleHandler {
    pub fn new() -> Self {
        Self {
            last_request: Mutex::new(None),
        }
    }

    async fn space_requests(&self, min_interval: Duration) {
        if min_interval.is_zero() {
            return;
        }
        let mut last = self.last_request.lock().await;
        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < min_interval {
                tokio::time::sleep(min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

impl Default for SummarizeArticleHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for SummarizeArticleHandler {
    async fn run(&self, ctx: &JobContext) -> Result<Value> {
        let article_id = ctx.payload_str("article_id")?;
        let article = articles::get_article(&ctx.pool, &article_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("article {article_id}")))?;

        let Some(profile) =
            llm_db::get_profile_for_stage(&ctx.pool, STAGE_SUMMARIZE_ARTICLE).await?
        else {
            // Route removed between enqueue and execution; skip quietly.
            articles::update_article_summary(
                &ctx.pool,
                &article_id,
                None,
                None,
                Some("llm_stage_unrouted"),
            )
            .await?;
            enqueue_publish_after_summary(ctx, &article_id, &article.source_id).await?;
            return Ok(json!({ "article_id": article_id, "skipped": "no_profile" }));
        };

        let content = article
            .content_text
            .as_deref()
            .or(article.summary_text.as_deref())
            .unwrap_or(&article.title)
            .trim()
            .to_string();
        if content.is_empty() {
            articles::update_article_summary(
                &ctx.pool,
                &article_id,
                None,
                None,
                Some("missing_content"),
            )
            .await?;
            enqueue_publish_after_summary(ctx, &article_id, &article.source_id).await?;
            return Err(Error::Validation(format!(
                "article {article_id} has no content to summarize"
            )));
        }

        let provider = llm_db::get_provider(&ctx.pool, &profile.provider_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("provider {}", profile.provider_id)))?;
        let model = llm_db::get_model(&ctx.pool, &profile.model_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("model {}", profile.model_id)))?;
        let prompt = llm_db::get_prompt(&ctx.pool, &profile.prompt_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("prompt {}", profile.prompt_id)))?;

        let api_key = match &provider.api_key_cipher {
            Some(cipher) => Some(
                SecretBox::from_env()?.decrypt(cipher, format!("provider:{}", provider.id).as_bytes())?,
            ),
            None => None,
        };

        let source_name = sources::get_source_name(&ctx.pool, &article.source_id)
            .await?
            .unwrap_or_default();
        let input = format!(
            "Title: {}\nSource: {}\nPublished: {}\nURL: {}\n\nContent:\n{}\n",
            article.title,
            source_name,
            article.published_at.as_deref().unwrap_or("unknown"),
            article.original_url,
            content,
        );
        let input_chars = input.len() as i64;
        let messages = render_messages(&prompt.system_template, &prompt.user_template, &input);

        self.space_requests(Duration::from_secs_f64(
            ctx.config.llm.rate_limit_seconds.max(0.0),
        ))
        .await;
        ctx.check_canceled()?;

        let started = Instant::now();
        let result = ctx
            .cancelable(complete(
                provider.base_url.as_deref(),
                api_key.as_deref(),
                &model.model_name,
                &messages,
                &profile.params,
                provider.timeout_seconds.max(1) as u64,
            ))
            .await;
        let latency_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(completion) => {
                let summary_payload =
                    serde_json::to_string(&json!({ "summary": completion.content }))
                        .unwrap_or_else(|_| completion.content.clone());
                articles::update_article_summary(
                    &ctx.pool,
                    &article_id,
                    Some(&summary_payload),
                    Some(&model.model_name),
                    None,
                )
                .await?;
                llm_db::insert_llm_run(
                    &ctx.pool,
                    &LlmRun {
                        ts: now_iso(),
                        profile_id: Some(profile.id.clone()),
                        provider_id: Some(provider.id.clone()),
                        model_id: Some(model.id.clone()),
                        prompt_name: prompt.name.clone(),
                        input_chars,
                        output_chars: completion.content.len() as i64,
                        prompt_tokens: completion.prompt_tokens,
                        completion_tokens: completion.completion_tokens,
                        latency_ms,
                        ok: true,
                        error: None,
                    },
                )
                .await?;
                publish::enqueue_write_markdown(&ctx.pool, &article_id, &article.source_id)
                    .await?;
                info!(article_id = %article_id, latency_ms, "article summarized");
                Ok(json!({
                    "article_id": article_id,
                    "profile_id": profile.id,
                    "latency_ms": latency_ms,
                }))
            }
            Err(e) => {
                llm_db::insert_llm_run(
                    &ctx.pool,
                    &LlmRun {
                        ts: now_iso(),
                        profile_id: Some(profile.id.clone()),
                        provider_id: Some(provider.id.clone()),
                        model_id: Some(model.id.clone()),
                        prompt_name: prompt.name.clone(),
                        input_chars,
                        output_chars: 0,
                        prompt_tokens: None,
                        completion_tokens: None,
                        latency_ms,
                        ok: false,
                        error: Some(e.to_string()),
                    },
                )
                .await?;
                articles::update_article_summary(
                    &ctx.pool,
                    &article_id,
                    None,
                    None,
                    Some(&e.to_string()),
                )
                .await?;
                // Only the terminal failure decides the publish path; retries
                // would otherwise enqueue duplicate markdown jobs.
                if !e.kind().is_retryable() {
                    enqueue_publish_after_summary(ctx, &article_id, &article.source_id).await?;
                }
                Err(e)
            }
        }
    }
}

/// Fail-open vs fail-closed after a summary error, per runtime config.
async fn enqueue_publish_after_summary(
    ctx: &JobContext,
    article_id: &str,
    source_id: &str,
) -> Result<()> {
    if ctx.config.publishing.publish_on_summary_error {
        publish::enqueue_write_markdown(&ctx.pool, article_id, source_id).await?;
    }
    Ok(())
}
