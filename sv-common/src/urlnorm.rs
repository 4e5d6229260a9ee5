//! Canonical URL normalization
//!
//! Feed items frequently carry tracking decorations and unstable fragments;
//! the canonical form (lowercase host, no fragment, tracking params removed,
//! query sorted) is what article identity hashes over.

use url::Url;

/// Tracking query parameters stripped by default.
pub const DEFAULT_TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
];

/// Normalize a URL to its canonical form.
///
/// Returns None when the input is not an absolute http(s) URL.
pub fn canonicalize_url(
    raw: &str,
    strip_tracking_params: bool,
    tracking_params: &[String],
) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if strip_tracking_params {
        pairs.retain(|(key, _)| {
            let lowered = key.to_lowercase();
            !tracking_params.iter().any(|p| p.to_lowercase() == lowered)
                && !DEFAULT_TRACKING_PARAMS.contains(&lowered.as_str())
        });
    }
    pairs.sort();

    url.set_query(None);
    if !pairs.is_empty() {
        let mut serializer = url.query_pairs_mut();
        for (key, value) in &pairs {
            serializer.append_pair(key, value);
        }
        drop(serializer);
    }
    if url.path().is_empty() {
        url.set_path("/");
    }
    Some(url.to_string())
}

/// The registrable host of a URL, lowercased. Used for reference domains.
pub fn host_of(raw: &str) -> Option<String> {
    Url::parse(raw.trim())
        .ok()?
        .host_str()
        .map(|h| h.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tracking_and_fragment() {
        let out = canonicalize_url(
            "https://Example.COM/post?utm_source=feed&b=2&a=1#section",
            true,
            &[],
        )
        .unwrap();
        assert_eq!(out, "https://example.com/post?a=1&b=2");
    }

    #[test]
    fn keeps_params_when_stripping_disabled() {
        let out = canonicalize_url("https://example.com/x?utm_source=feed", false, &[]).unwrap();
        assert!(out.contains("utm_source=feed"));
    }

    #[test]
    fn rejects_non_http() {
        assert!(canonicalize_url("ftp://example.com/file", true, &[]).is_none());
        assert!(canonicalize_url("not a url", true, &[]).is_none());
    }

    #[test]
    fn extra_tracking_params_are_honored() {
        let extra = vec!["ref".to_string()];
        let out = canonicalize_url("https://example.com/x?ref=abc&id=1", true, &extra).unwrap();
        assert_eq!(out, "https://example.com/x?id=1");
    }

    #[test]
    fn host_extraction() {
        assert_eq!(
            host_of("https://NVD.nist.gov/vuln/detail/CVE-2024-1"),
            Some("nvd.nist.gov".to_string())
        );
        assert_eq!(host_of("garbage"), None);
    }
}
