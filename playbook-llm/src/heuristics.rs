//! Deterministic local fallbacks: tag extraction when the model is
//! unreachable, and the keyword-based temperature override.

use once_cell::sync::Lazy;
use playbook_core::tags::{normalize_tag, significant_tokens};
use playbook_core::TagInference;
use regex::Regex;
use std::collections::HashMap;

static URGENT_CUES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(fix|bug|error|urgent|critical|broken)\b").expect("cue regex"));
static PRODUCTION_CUES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(production|deploy|release|customer)\b").expect("cue regex")
});
static EXPLORATORY_CUES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(explore|learn|research|alternative|innovative)\b").expect("cue regex")
});

/// Extract tags from prompt tokens by frequency: most frequent first,
/// ties broken by first occurrence. Used whenever `infer_tags` fails.
pub fn fallback_tags(prompt: &str, max_tags: usize) -> Vec<String> {
    let tokens = significant_tokens(prompt);
    if tokens.is_empty() {
        return Vec::new();
    }

    let lowered = prompt.to_lowercase();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for token in &tokens {
        counts.insert(token, lowered.matches(token.as_str()).count().max(1));
    }

    let mut ranked: Vec<(usize, &String)> = tokens
        .iter()
        .enumerate()
        .map(|(order, token)| (order, token))
        .collect();
    ranked.sort_by(|(order_a, a), (order_b, b)| {
        counts[b.as_str()]
            .cmp(&counts[a.as_str()])
            .then(order_a.cmp(order_b))
    });

    ranked
        .into_iter()
        .filter_map(|(_, token)| normalize_tag(token))
        .take(max_tags)
        .collect()
}

/// A fully local stand-in for the tagger when the gateway fails.
pub fn fallback_inference(prompt: &str, max_tags: usize, default_temperature: f64) -> TagInference {
    TagInference {
        tags: fallback_tags(prompt, max_tags),
        temperature: default_temperature.clamp(0.0, 1.0),
        complexity: None,
    }
}

/// Override the model-suggested temperature from prompt keywords.
///
/// Urgent cues clamp to at most 0.3, production cues to at most 0.5,
/// exploratory cues lift to at least 0.7. The first matching category
/// wins, so an urgent prompt that also mentions research stays cautious.
pub fn adaptive_temperature(prompt: &str, temperature: f64) -> f64 {
    let t = temperature.clamp(0.0, 1.0);
    if URGENT_CUES.is_match(prompt) {
        t.min(0.3)
    } else if PRODUCTION_CUES.is_match(prompt) {
        t.min(0.5)
    } else if EXPLORATORY_CUES.is_match(prompt) {
        t.max(0.7)
    } else {
        t
    }
}
