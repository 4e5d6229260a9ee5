//! Markdown generation
//!
//! Deterministic front-matter + body for articles, events, and CVEs under
//! `content/{posts,events,cves}/`. File names embed the publish date, a
//! slug, and an id prefix so re-publishing overwrites the same file.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use sv_common::ids::slugify;
use sv_common::models::{Article, Cve, Event};
use sv_common::time::day_of;
use sv_common::{Error, Result};

#[derive(Debug, Serialize)]
struct ArticleFrontMatter<'a> {
    title: &'a str,
    date: &'a str,
    source: &'a str,
    tags: &'a [String],
    canonical_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    author: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<&'a str>,
    draft: bool,
}

/// The summary shown on the article page: LLM summary when present, feed
/// summary otherwise.
pub fn display_summary(article: &Article) -> Option<String> {
    if let Some(raw) = &article.summary_llm {
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(raw) {
            if let Some(text) = parsed.get("summary").and_then(|v| v.as_str()) {
                return Some(text.to_string());
            }
        }
        return Some(raw.clone());
    }
    article.summary_text.clone()
}

fn front_matter_block<T: Serialize>(front: &T) -> Result<String> {
    let yaml = serde_yaml::to_string(front)
        .map_err(|e| Error::Internal(format!("front matter serialization failed: {e}")))?;
    Ok(format!("---\n{yaml}---\n\n"))
}

fn article_filename(article: &Article) -> String {
    let date = day_of(
        article
            .published_at
            .as_deref()
            .unwrap_or(&article.ingested_at),
    );
    let slug = slugify(&article.title, 80);
    let id_prefix = &article.id[..article.id.len().min(8)];
    format!("{date}-{slug}-{id_prefix}.md")
}

/// Write one article page. Returns the path written.
pub fn write_article_markdown(article: &Article, site_src_dir: &Path) -> Result<PathBuf> {
    let posts_dir = site_src_dir.join("content").join("posts");
    fs::create_dir_all(&posts_dir)?;
    let path = posts_dir.join(article_filename(article));

    let summary = display_summary(article);
    let date = article
        .published_at
        .as_deref()
        .unwrap_or(&article.ingested_at);
    let front = ArticleFrontMatter {
        title: &article.title,
        date,
        source: &article.source_id,
        tags: &article.tags,
        canonical_url: &article.canonical_url,
        author: article.author.as_deref(),
        summary: summary.as_deref(),
        draft: false,
    };

    let mut content = front_matter_block(&front)?;
    if let Some(summary) = &summary {
        content.push_str(summary.trim());
        content.push_str("\n\n");
    }
    content.push_str(&format!("[Read more]({})\n", article.canonical_url));
    fs::write(&path, content)?;
    Ok(path)
}

#[derive(Debug, Serialize)]
struct EventFrontMatter<'a> {
    title: &'a str,
    kind: &'a str,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    severity: Option<&'a str>,
    first_seen_at: &'a str,
    last_seen_at: &'a str,
}

/// Everything needed to render one event page.
pub struct EventPage<'a> {
    pub event: &'a Event,
    /// (cve_id, severity, score)
    pub cves: Vec<(String, Option<String>, Option<f64>)>,
    /// Product display names.
    pub products: Vec<String>,
    /// (title, url)
    pub articles: Vec<(String, String)>,
}

/// Write one event page at `content/events/<id>.md`.
pub fn write_event_markdown(page: &EventPage<'_>, site_src_dir: &Path) -> Result<PathBuf> {
    let events_dir = site_src_dir.join("content").join("events");
    fs::create_dir_all(&events_dir)?;
    let path = events_dir.join(format!("{}.md", page.event.id));

    let front = EventFrontMatter {
        title: &page.event.title,
        kind: page.event.kind.as_str(),
        status: page.event.status.as_str(),
        severity: page.event.severity.as_deref(),
        first_seen_at: &page.event.first_seen_at,
        last_seen_at: &page.event.last_seen_at,
    };
    let mut content = front_matter_block(&front)?;

    if let Some(summary) = &page.event.summary {
        content.push_str(summary.trim());
        content.push_str("\n\n");
    }
    if !page.cves.is_empty() {
        content.push_str("## CVEs\n\n");
        for (cve_id, severity, score) in page.cves.iter().take(50) {
            let severity = severity.as_deref().unwrap_or("UNKNOWN");
            match score {
                Some(score) => {
                    content.push_str(&format!("- {cve_id} [{severity}] ({score})\n"))
                }
                None => content.push_str(&format!("- {cve_id} [{severity}]\n")),
            }
        }
        content.push('\n');
    }
    if !page.products.is_empty() {
        content.push_str("## Products\n\n");
        for product in page.products.iter().take(50) {
            content.push_str(&format!("- {product}\n"));
        }
        content.push('\n');
    }
    if !page.articles.is_empty() {
        content.push_str("## Articles\n\n");
        for (title, url) in page.articles.iter().take(50) {
            content.push_str(&format!("- [{title}]({url})\n"));
        }
        content.push('\n');
    }

    fs::write(&path, content.trim_end().to_string() + "\n")?;
    Ok(path)
}

#[derive(Debug, Serialize)]
struct CveFrontMatter<'a> {
    title: &'a str,
    date: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    severity: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    score: Option<f64>,
    cvss_version: &'a str,
}

/// Write one CVE page at `content/cves/<cve_id>.md`.
pub fn write_cve_markdown(cve: &Cve, site_src_dir: &Path) -> Result<PathBuf> {
    let cves_dir = site_src_dir.join("content").join("cves");
    fs::create_dir_all(&cves_dir)?;
    let path = cves_dir.join(format!("{}.md", cve.cve_id));

    let date = cve
        .published_at
        .as_deref()
        .unwrap_or(&cve.last_seen_at);
    let front = CveFrontMatter {
        title: &cve.cve_id,
        date,
        severity: cve.preferred_base_severity.as_deref(),
        score: cve.preferred_base_score,
        cvss_version: &cve.preferred_cvss_version,
    };
    let mut content = front_matter_block(&front)?;

    if let Some(description) = &cve.description_text {
        content.push_str(description.trim());
        content.push_str("\n\n");
    }
    if let Some(vector) = &cve.preferred_vector {
        content.push_str(&format!("Vector: `{vector}`\n\n"));
    }
    if !cve.affected_products.is_empty() {
        content.push_str("## Affected products\n\n");
        for product in cve.affected_products.iter().take(50) {
            content.push_str(&format!("- {} {}\n", product.vendor, product.product));
        }
        content.push('\n');
    }
    if !cve.reference_domains.is_empty() {
        content.push_str("## References\n\n");
        for domain in cve.reference_domains.iter().take(50) {
            content.push_str(&format!("- {domain}\n"));
        }
        content.push('\n');
    }

    fs::write(&path, content.trim_end().to_string() + "\n")?;
    Ok(path)
}
