//! Article content fetching
//!
//! Fetches the article page, extracts readable text (plus a short HTML
//! excerpt kept for debugging), and hands the article to the summarize
//! stage — or straight to markdown when no LLM profile is routed.

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::{json, Value};
use std::time::Duration;
use sv_common::{Error, ErrorKind, Result};
use tracing::warn;

use crate::db::articles;
use crate::ingest::fetch::build_http_client;
use crate::llm;
use crate::publish;
use crate::worker::{JobContext, JobHandler};

/// Keep this much raw HTML on the article row for debugging extraction.
const HTML_EXCERPT_BYTES: usize = 2048;

/// Handler for `fetch_article_content{article_id}`.
pub struct FetchArticleContentHandler;

impl FetchArticleContentHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FetchArticleContentHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for FetchArticleContentHandler {
    async fn run(&self, ctx: &JobContext) -> Result<Value> {
        let article_id = ctx.payload_str("article_id")?;
        let article = articles::get_article(&ctx.pool, &article_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("article {article_id}")))?;

        let url = if !article.original_url.is_empty() {
            article.original_url.clone()
        } else {
            article.canonical_url.clone()
        };
        if url.is_empty() {
            articles::update_article_content(
                &ctx.pool,
                &article_id,
                None,
                None,
                Some("article has no URL"),
            )
            .await?;
            return Err(Error::Validation(format!("article {article_id} has no URL")));
        }

        ctx.check_canceled()?;
        let fetched = ctx
            .cancelable(fetch_article_html(
                &url,
                &ctx.config.ingest.http.user_agent,
                ctx.config.ingest.http.timeout_seconds,
            ))
            .await;

        match fetched {
            Ok(html) => {
                let text = extract_readable_text(&html);
                let excerpt = truncate_utf8(&html, HTML_EXCERPT_BYTES);
                articles::update_article_content(
                    &ctx.pool,
                    &article_id,
                    Some(&text),
                    Some(&excerpt),
                    None,
                )
                .await?;

                if !llm::maybe_enqueue_summarize(&ctx.pool, &article_id, &article.source_id).await? {
                    publish::enqueue_write_markdown(&ctx.pool, &article_id, &article.source_id)
                        .await?;
                }
                Ok(json!({
                    "article_id": article_id,
                    "content_chars": text.len(),
                }))
            }
            Err(e) => {
                warn!(article_id = %article_id, url = %url, "content fetch failed: {e}");
                articles::update_article_content(
                    &ctx.pool,
                    &article_id,
                    None,
                    None,
                    Some(&format!("fetch_failed: {e}")),
                )
                .await?;
                // A permanent failure still publishes the article without
                // body text; transient failures retry via the queue.
                if !e.kind().is_retryable() && e.kind() != ErrorKind::Canceled {
                    publish::enqueue_write_markdown(&ctx.pool, &article_id, &article.source_id)
                        .await?;
                }
                Err(e)
            }
        }
    }
}

async fn fetch_article_html(url: &str, user_agent: &str, timeout_seconds: u64) -> Result<String> {
    let client = build_http_client(timeout_seconds)?;
    let response = client
        .get(url)
        .header(reqwest::header::USER_AGENT, user_agent)
        .timeout(Duration::from_secs(timeout_seconds.max(1)))
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                Error::Transient(format!("article fetch timeout: {e}"))
            } else {
                Error::Transient(format!("article fetch failed: {e}"))
            }
        })?;
    let status = response.status().as_u16();
    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::from_http_status(status, truncate_utf8(&body, 256)));
    }
    response
        .text()
        .await
        .map_err(|e| Error::Transient(format!("article body read failed: {e}")))
}

/// Pull the readable text out of an article page.
///
/// Prefers an `<article>` element; falls back to the largest `<div>`, then
/// the whole page, with script/style/nav chrome removed either way.
pub fn extract_readable_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let article_sel = Selector::parse("article").expect("static selector");
    let div_sel = Selector::parse("div").expect("static selector");
    let chrome_sel =
        Selector::parse("script, style, nav, footer, header, aside").expect("static selector");

    let chrome_text: std::collections::HashSet<String> = document
        .select(&chrome_sel)
        .map(|el| el.text().collect::<Vec<_>>().join(" "))
        .collect();

    if let Some(article) = document.select(&article_sel).next() {
        return normalize_whitespace(&article.text().collect::<Vec<_>>().join(" "));
    }

    let mut best = String::new();
    for div in document.select(&div_sel) {
        let text = div.text().collect::<Vec<_>>().join(" ");
        if text.len() > best.len() && !chrome_text.contains(&text) {
            best = text;
        }
    }
    if !best.is_empty() {
        return normalize_whitespace(&best);
    }
    normalize_whitespace(
        &document
            .root_element()
            .text()
            .collect::<Vec<_>>()
            .join(" "),
    )
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_utf8(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_article_element() {
        let html = r#"<html><body>
            <nav>Site navigation</nav>
            <article><p>The actual story</p><p>continues here.</p></article>
            <footer>Copyright</footer>
        </body></html>"#;
        let text = extract_readable_text(html);
        assert_eq!(text, "The actual story continues here.");
    }

    #[test]
    fn falls_back_to_largest_div() {
        let html = r#"<html><body>
            <div>short</div>
            <div>this is the much longer main content block of the page</div>
        </body></html>"#;
        let text = extract_readable_text(html);
        assert!(text.contains("main content block"));
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        let text = "é".repeat(3000);
        let excerpt = truncate_utf8(&text, HTML_EXCERPT_BYTES);
        assert!(excerpt.len() <= HTML_EXCERPT_BYTES);
        assert!(excerpt.chars().all(|c| c == 'é'));
    }
}
