//! Explicit CVE id extraction
//!
//! Case-insensitive scan for CVE identifiers in article text; matches are
//! uppercased and deduplicated. An explicit mention is the strongest link
//! signal we have, so these links carry confidence 1.0.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use sv_common::models::{
    CandidateCve, Evidence, ExtractedSignals, FinalDecision, LinkMeta,
};

static CVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bCVE-\d{4}-\d{4,7}\b").expect("static regex"));

/// Stable rule id recorded on explicit-mention links.
pub const RULE_CVE_EXPLICIT: &str = "rule.cve.explicit";

/// Extract the sorted, deduplicated, uppercased CVE ids mentioned in `texts`.
pub fn extract_cve_ids<'a>(texts: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut found: BTreeSet<String> = BTreeSet::new();
    for text in texts {
        for matched in CVE_RE.find_iter(text) {
            found.insert(matched.as_str().to_uppercase());
        }
    }
    found.into_iter().collect()
}

/// Build the link metadata for explicit mentions found in one article.
pub fn explicit_link_meta(cve_ids: &[String], citation_url: &str) -> LinkMeta {
    let evidence = Evidence {
        extracted_signals: ExtractedSignals {
            cve_ids: cve_ids.to_vec(),
            ..Default::default()
        },
        candidates: cve_ids
            .iter()
            .map(|cve_id| CandidateCve {
                cve_id: cve_id.clone(),
                component_scores: BTreeMap::from([("explicit".to_string(), 1.0)]),
                confidence: 1.0,
            })
            .collect(),
        final_decision: FinalDecision {
            decision: "linked".to_string(),
            confidence: 1.0,
            confidence_band: "linked".to_string(),
            rule_ids: vec![RULE_CVE_EXPLICIT.to_string()],
        },
        citation_urls: vec![citation_url.to_string()],
    };
    LinkMeta {
        confidence: 1.0,
        confidence_band: "linked".to_string(),
        reasons: vec![RULE_CVE_EXPLICIT.to_string()],
        evidence: serde_json::to_value(evidence).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_and_uppercases() {
        let ids = extract_cve_ids([
            "Exploit leverages CVE-2024-00123 and cve-2024-99999.",
            "also CVE-2024-00123 again",
        ]);
        assert_eq!(ids, vec!["CVE-2024-00123", "CVE-2024-99999"]);
    }

    #[test]
    fn respects_digit_bounds() {
        assert!(extract_cve_ids(["CVE-2024-123"]).is_empty());
        assert_eq!(
            extract_cve_ids(["CVE-2024-1234567"]),
            vec!["CVE-2024-1234567"]
        );
        // An eight-digit tail is not a valid id, but its seven-digit prefix is
        // not either once bounded by \b; nothing should match.
        assert!(extract_cve_ids(["CVE-2024-12345678x"]).is_empty());
    }

    #[test]
    fn no_matches_in_plain_text() {
        assert!(extract_cve_ids(["kernel release notes"]).is_empty());
    }

    #[test]
    fn link_meta_carries_rule_and_citation() {
        let meta = explicit_link_meta(
            &["CVE-2024-0001".to_string()],
            "https://example.com/post",
        );
        assert_eq!(meta.confidence, 1.0);
        assert_eq!(meta.reasons, vec![RULE_CVE_EXPLICIT.to_string()]);
        let evidence: Evidence = serde_json::from_value(meta.evidence).unwrap();
        assert_eq!(evidence.citation_urls, vec!["https://example.com/post"]);
    }
}
