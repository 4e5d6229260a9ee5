//! Feed and HTML parsing
//!
//! RSS, Atom, and JSON Feed bodies go through feed-rs, which detects the
//! concrete format itself; `html` sources are walked with a configured CSS
//! item selector. Everything normalizes to [`RawItem`].

use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use sv_common::models::SourceKind;
use sv_common::{Error, Result};
use url::Url;

/// One pre-normalization item from a feed or page.
#[derive(Debug, Clone, Default)]
pub struct RawItem {
    pub title: Option<String>,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
}

/// Parse a fetched body into items according to the source kind.
pub fn parse_items(
    kind: SourceKind,
    body: &[u8],
    base_url: &str,
    html_item_selector: Option<&str>,
) -> Result<Vec<RawItem>> {
    match kind {
        SourceKind::Rss | SourceKind::Atom | SourceKind::JsonFeed => parse_feed(body),
        SourceKind::Html => {
            let selector = html_item_selector.ok_or_else(|| {
                Error::Validation("html source requires an item selector".to_string())
            })?;
            parse_html(body, base_url, selector)
        }
    }
}

fn parse_feed(body: &[u8]) -> Result<Vec<RawItem>> {
    let feed = feed_rs::parser::parse(body)
        .map_err(|e| Error::Permanent(format!("feed parse failed: {e}")))?;
    Ok(feed
        .entries
        .into_iter()
        .map(|entry| {
            let summary = entry
                .summary
                .map(|text| text.content)
                .or_else(|| entry.content.and_then(|content| content.body));
            RawItem {
                title: entry.title.map(|text| text.content),
                link: entry
                    .links
                    .first()
                    .map(|link| link.href.clone())
                    .or_else(|| {
                        // Some feeds put the permalink in the entry id.
                        if entry.id.starts_with("http") {
                            Some(entry.id.clone())
                        } else {
                            None
                        }
                    }),
                summary,
                author: entry.authors.first().map(|person| person.name.trim().to_string()),
                published: entry.published,
                updated: entry.updated,
            }
        })
        .collect())
}

fn parse_html(body: &[u8], base_url: &str, item_selector: &str) -> Result<Vec<RawItem>> {
    let html = String::from_utf8_lossy(body);
    let document = Html::parse_document(&html);
    let selector = Selector::parse(item_selector)
        .map_err(|e| Error::Validation(format!("invalid item selector: {e}")))?;
    let anchor = Selector::parse("a").expect("static selector");
    let base = Url::parse(base_url).ok();

    let mut items = Vec::new();
    for element in document.select(&selector) {
        let link_el = element.select(&anchor).next();
        let href = link_el.and_then(|a| a.value().attr("href")).map(|href| {
            match &base {
                Some(base) => base
                    .join(href)
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| href.to_string()),
                None => href.to_string(),
            }
        });
        let title = link_el
            .map(|a| collect_text(a.text()))
            .filter(|t| !t.is_empty())
            .or_else(|| Some(collect_text(element.text())).filter(|t| !t.is_empty()));
        items.push(RawItem {
            title,
            link: href,
            ..Default::default()
        });
    }
    Ok(items)
}

fn collect_text<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strip markup from a feed-supplied title or summary.
pub fn strip_html(text: &str) -> String {
    if !text.contains('<') {
        return collect_text(std::iter::once(text));
    }
    let fragment = Html::parse_fragment(text);
    collect_text(fragment.root_element().text())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS_FIXTURE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Security Feed</title>
    <item>
      <title>Critical flaw &lt;b&gt;patched&lt;/b&gt;</title>
      <link>https://example.com/a?utm_source=rss</link>
      <description>Details inside</description>
      <pubDate>Tue, 04 Mar 2025 10:00:00 GMT</pubDate>
    </item>
    <item>
      <title>Second story</title>
      <link>https://example.com/b</link>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn parses_rss() {
        let items = parse_items(SourceKind::Rss, RSS_FIXTURE.as_bytes(), "https://example.com", None)
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].link.as_deref(), Some("https://example.com/a?utm_source=rss"));
        assert!(items[0].published.is_some());
        assert_eq!(items[1].title.as_deref(), Some("Second story"));
    }

    #[test]
    fn parses_html_with_selector() {
        let html = r#"<html><body>
            <div class="story"><a href="/posts/one">First post</a></div>
            <div class="story"><a href="https://other.example/two">Second post</a></div>
        </body></html>"#;
        let items = parse_items(
            SourceKind::Html,
            html.as_bytes(),
            "https://example.com",
            Some("div.story"),
        )
        .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].link.as_deref(), Some("https://example.com/posts/one"));
        assert_eq!(items[0].title.as_deref(), Some("First post"));
        assert_eq!(items[1].link.as_deref(), Some("https://other.example/two"));
    }

    #[test]
    fn html_source_without_selector_is_rejected() {
        let err = parse_items(SourceKind::Html, b"<html></html>", "https://example.com", None)
            .unwrap_err();
        assert!(err.to_string().contains("selector"));
    }

    #[test]
    fn strip_html_flattens_markup() {
        assert_eq!(strip_html("Critical flaw <b>patched</b>"), "Critical flaw patched");
        assert_eq!(strip_html("plain  title"), "plain title");
    }

    #[test]
    fn garbage_feed_is_permanent_error() {
        let err = parse_feed(b"{ not a feed").unwrap_err();
        assert_eq!(err.kind(), sv_common::ErrorKind::Permanent);
    }
}
