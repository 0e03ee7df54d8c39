//! Tag normalization and prompt/KPT matching primitives.
//!
//! Everything in this module is a pure function; the selector composes
//! these into its weighting formula.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

/// Maximum length of a normalized tag.
pub const MAX_TAG_LEN: usize = 64;

/// Minimum length for a prompt token to count as significant.
const MIN_TOKEN_LEN: usize = 3;

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9]+").expect("word regex"));

/// Common English words that carry no retrieval signal.
static STOP_WORDS: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    BTreeSet::from([
        "about", "after", "all", "also", "and", "any", "are", "because", "been", "before", "but",
        "can", "could", "did", "does", "doing", "for", "from", "get", "had", "has", "have", "her",
        "here", "him", "his", "how", "into", "its", "just", "like", "make", "more", "most", "not",
        "now", "only", "other", "our", "out", "over", "please", "same", "she", "should", "some",
        "than", "that", "the", "their", "them", "then", "there", "these", "they", "this", "under",
        "use", "very", "was", "were", "what", "when", "where", "which", "while", "who", "why",
        "will", "with", "would", "you", "your",
    ])
});

fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(token)
}

/// Normalize a single raw tag into its canonical slug form.
///
/// Trim, lowercase, strip punctuation except hyphens, collapse internal
/// whitespace runs to a single hyphen, cap at [`MAX_TAG_LEN`]. Returns
/// `None` when nothing survives.
pub fn normalize_tag(raw: &str) -> Option<String> {
    let mut slug = String::with_capacity(raw.len());
    let mut pending_hyphen = false;

    for ch in raw.trim().chars() {
        if ch.is_whitespace() {
            pending_hyphen = !slug.is_empty();
            continue;
        }
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_alphanumeric() || ch == '-' {
            if pending_hyphen {
                slug.push('-');
                pending_hyphen = false;
            }
            slug.push(ch);
        }
    }

    let slug: String = slug.trim_matches('-').chars().take(MAX_TAG_LEN).collect();
    if slug.is_empty() {
        None
    } else {
        Some(slug)
    }
}

/// Normalize a collection of raw tags into a deduplicated tag set.
pub fn normalize_tags<I, S>(raw: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .filter_map(|s| normalize_tag(s.as_ref()))
        .collect()
}

/// Fraction of prompt tags satisfied by a KPT's tag set.
///
/// Asymmetric on purpose: a KPT that covers everything the user asked
/// about scores 1.0 no matter how many extra tags it carries.
pub fn coverage(prompt_tags: &BTreeSet<String>, kpt_tags: &BTreeSet<String>) -> f64 {
    if prompt_tags.is_empty() {
        return 0.0;
    }
    let overlap = prompt_tags.intersection(kpt_tags).count();
    overlap as f64 / prompt_tags.len().max(1) as f64
}

/// Extract the significant tokens of a prompt, in first-occurrence order.
///
/// Tokens are lowercase alphanumeric runs of at least three characters
/// that are not stop words. Duplicates are dropped.
pub fn significant_tokens(prompt: &str) -> Vec<String> {
    let lowered = prompt.to_lowercase();
    let mut seen = BTreeSet::new();
    let mut tokens = Vec::new();
    for m in WORD.find_iter(&lowered) {
        let token = m.as_str();
        if token.len() < MIN_TOKEN_LEN || is_stop_word(token) {
            continue;
        }
        if seen.insert(token.to_string()) {
            tokens.push(token.to_string());
        }
    }
    tokens
}

/// Count token-boundary matches of the prompt's significant tokens in a
/// KPT's text. Case-insensitive; each occurrence counts once.
pub fn hits(prompt: &str, kpt_text: &str) -> u32 {
    let tokens = significant_tokens(prompt);
    if tokens.is_empty() {
        return 0;
    }
    let lowered = kpt_text.to_lowercase();
    let mut count = 0u32;
    for m in WORD.find_iter(&lowered) {
        if tokens.iter().any(|t| t == m.as_str()) {
            count += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_tag_basic() {
        assert_eq!(normalize_tag("  Payment  "), Some("payment".to_string()));
        assert_eq!(normalize_tag("Retry Logic"), Some("retry-logic".to_string()));
        assert_eq!(normalize_tag("backoff!"), Some("backoff".to_string()));
        assert_eq!(normalize_tag("rate-limit"), Some("rate-limit".to_string()));
    }

    #[test]
    fn test_normalize_tag_collapses_whitespace() {
        assert_eq!(normalize_tag("a   b\tc"), Some("a-b-c".to_string()));
    }

    #[test]
    fn test_normalize_tag_drops_empty() {
        assert_eq!(normalize_tag("   "), None);
        assert_eq!(normalize_tag("!!!"), None);
        assert_eq!(normalize_tag("---"), None);
    }

    #[test]
    fn test_normalize_tag_caps_length() {
        let long = "x".repeat(100);
        assert_eq!(normalize_tag(&long).unwrap().len(), MAX_TAG_LEN);
    }

    #[test]
    fn test_normalize_tags_dedupes() {
        let tags = normalize_tags(["Payment", "payment ", "PAYMENT!"]);
        assert_eq!(tags.len(), 1);
        assert!(tags.contains("payment"));
    }

    #[test]
    fn test_coverage_asymmetric() {
        let prompt: BTreeSet<String> = ["payment", "retry"].iter().map(|s| s.to_string()).collect();
        let kpt: BTreeSet<String> = ["payment", "retry", "backoff", "http"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(coverage(&prompt, &kpt), 1.0);
        assert_eq!(coverage(&kpt, &prompt), 0.5);
    }

    #[test]
    fn test_coverage_empty_prompt() {
        let prompt = BTreeSet::new();
        let kpt: BTreeSet<String> = ["payment".to_string()].into_iter().collect();
        assert_eq!(coverage(&prompt, &kpt), 0.0);
    }

    #[test]
    fn test_significant_tokens_filters() {
        let tokens = significant_tokens("Please fix the retry logic for the payment gateway");
        assert_eq!(tokens, vec!["fix", "retry", "logic", "payment", "gateway"]);
    }

    #[test]
    fn test_hits_counts_boundaries() {
        let n = hits(
            "fix the retry logic",
            "Use exponential backoff when a retry fails; cap retry attempts at 5",
        );
        // "retry" twice, "fix"/"logic" absent ("fails" is not "fix").
        assert_eq!(n, 2);
    }

    #[test]
    fn test_hits_case_insensitive() {
        assert_eq!(hits("Payment", "PAYMENT payment PayMent"), 3);
    }
}
