//! Stable identifiers and hashing
//!
//! Article ids are content-addressed: the SHA-256 of the canonical URL plus
//! the owning source id, so re-ingesting the same item is always a no-op.

use sha2::{Digest, Sha256};

/// Stable article id: `sha256(canonical_url + source_id)` as lowercase hex.
pub fn stable_article_id(canonical_url: &str, source_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_url.as_bytes());
    hasher.update(source_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cross-source duplicate fingerprint over normalized title + body text.
///
/// Non-destructive: used for grouping only, never for uniqueness.
pub fn content_fingerprint(title: &str, text: &str) -> String {
    let normalized = format!(
        "{}\n{}",
        title.trim().to_lowercase(),
        text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
    );
    format!("{:x}", Sha256::digest(normalized.as_bytes()))
}

/// Hash arbitrary canonical JSON into a snapshot hash.
pub fn snapshot_hash(canonical_json: &str) -> String {
    format!("{:x}", Sha256::digest(canonical_json.as_bytes()))
}

/// Lowercase, ASCII-safe slug for file names. Never empty.
pub fn slugify(text: &str, max_length: usize) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_dash = true;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_matches('-');
    let truncated: String = slug.chars().take(max_length).collect();
    let truncated = truncated.trim_matches('-').to_string();
    if truncated.is_empty() {
        "untitled".to_string()
    } else {
        truncated
    }
}

/// Normalize a vendor/product name to a join key: lowercase, underscores.
pub fn normalize_name(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_sep = true;
    for ch in value.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_sep = false;
        } else if !last_sep {
            out.push('_');
            last_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}
