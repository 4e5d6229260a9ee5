//! Tag derivation
//!
//! Tags come from three places: the source's own tag list, the policy
//! defaults, and regex include/exclude rules over title+summary. The final
//! set is normalized, alias-mapped, sorted, and deduplicated.

use regex::RegexBuilder;
use std::collections::BTreeSet;
use sv_common::params::TagPolicy;

/// Normalize one tag: lowercase, dashes, no junk characters.
pub fn normalize_tag(tag: &str) -> String {
    let mut out = String::with_capacity(tag.len());
    let mut last_dash = true;
    for ch in tag.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

fn apply_alias(policy: &TagPolicy, tag: String) -> String {
    policy
        .normalize
        .get(&tag)
        .map(|alias| normalize_tag(alias))
        .unwrap_or(tag)
}

/// Derive the tag set for one item.
pub fn derive_tags(
    policy: &TagPolicy,
    source_tags: &[String],
    title: &str,
    summary: Option<&str>,
) -> Vec<String> {
    let text = format!("{}\n{}", title, summary.unwrap_or(""));
    let mut tags: BTreeSet<String> = BTreeSet::new();

    for tag in source_tags.iter().chain(policy.defaults.iter()) {
        let normalized = normalize_tag(tag);
        if !normalized.is_empty() {
            tags.insert(apply_alias(policy, normalized));
        }
    }

    for (pattern, include_tags) in &policy.include_if {
        let Ok(re) = RegexBuilder::new(pattern).case_insensitive(true).build() else {
            continue;
        };
        if re.is_match(&text) {
            for tag in include_tags {
                let normalized = normalize_tag(tag);
                if !normalized.is_empty() {
                    tags.insert(apply_alias(policy, normalized));
                }
            }
        }
    }

    for (pattern, exclude_tags) in &policy.exclude_if {
        let Ok(re) = RegexBuilder::new(pattern).case_insensitive(true).build() else {
            continue;
        };
        if re.is_match(&text) {
            for tag in exclude_tags {
                let normalized = apply_alias(policy, normalize_tag(tag));
                tags.remove(&normalized);
            }
        }
    }

    tags.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn policy() -> TagPolicy {
        let mut include_if = BTreeMap::new();
        include_if.insert(
            r"ransomware|extortion".to_string(),
            vec!["ransomware".to_string()],
        );
        let mut exclude_if = BTreeMap::new();
        exclude_if.insert(r"sponsored".to_string(), vec!["news".to_string()]);
        let mut normalize = BTreeMap::new();
        normalize.insert("vulns".to_string(), "vulnerability".to_string());
        TagPolicy {
            defaults: vec!["news".to_string()],
            normalize,
            include_if,
            exclude_if,
        }
    }

    #[test]
    fn defaults_and_source_tags_merge() {
        let tags = derive_tags(&policy(), &["Linux".to_string()], "quiet day", None);
        assert_eq!(tags, vec!["linux", "news"]);
    }

    #[test]
    fn include_rule_fires_case_insensitively() {
        let tags = derive_tags(&policy(), &[], "RANSOMWARE gang returns", None);
        assert!(tags.contains(&"ransomware".to_string()));
    }

    #[test]
    fn exclude_rule_removes_tag() {
        let tags = derive_tags(&policy(), &[], "Sponsored post", None);
        assert!(!tags.contains(&"news".to_string()));
    }

    #[test]
    fn aliases_apply() {
        let tags = derive_tags(&policy(), &["vulns".to_string()], "t", None);
        assert!(tags.contains(&"vulnerability".to_string()));
    }

    #[test]
    fn normalize_tag_cleans_input() {
        assert_eq!(normalize_tag("  Zero Day!! "), "zero-day");
        assert_eq!(normalize_tag("C++"), "c");
    }
}
