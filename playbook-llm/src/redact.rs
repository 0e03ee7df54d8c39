//! Secret redaction for anything that leaves the process as a log line
//! or diagnostic record.

use once_cell::sync::Lazy;
use regex::Regex;

const PLACEHOLDER: &str = "[redacted]";

static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Provider API keys (sk-..., sk-proj-..., anthropic-style).
        r"\bsk-[A-Za-z0-9_-]{8,}",
        // HTTP auth headers.
        r"(?i)\b(?:bearer|basic)\s+[A-Za-z0-9+/._=-]{8,}",
        // key=value / key: value style assignments.
        r#"(?i)\b(api[_-]?key|auth[_-]?token|secret|password|authorization)\b\s*[=:]\s*"?[^\s",]+"#,
        // JWTs.
        r"\beyJ[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("secret pattern"))
    .collect()
});

/// Replace anything that looks like a credential with a placeholder.
pub fn redact(text: &str) -> String {
    let mut out = text.to_string();
    for pattern in SECRET_PATTERNS.iter() {
        out = pattern.replace_all(&out, PLACEHOLDER).into_owned();
    }
    out
}
