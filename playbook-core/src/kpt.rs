//! Key point (KPT) entity: one durable lesson extracted from a
//! conversation.
//!
//! Two body shapes exist on disk: a single `text` field (legacy) and a
//! `when`/`do` pair. Both deserialize into [`KeyPointText`] and each
//! writes back in its own shape, so a load/store cycle never rewrites a
//! shape the model did not migrate.

use serde::de::Error as DeError;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;

/// Prefix shared by all KPT names.
pub const NAME_PREFIX: &str = "kpt_";

/// Format the canonical name for a 1-based playbook position.
pub fn format_name(position: usize) -> String {
    format!("kpt_{:03}", position)
}

/// Default effectiveness for model-omitted attributes.
pub const DEFAULT_EFFECT_RATING: f64 = 0.5;
/// Default risk for model-omitted attributes.
pub const DEFAULT_RISK_LEVEL: f64 = -0.3;
/// Default novelty for model-omitted attributes.
pub const DEFAULT_INNOVATION_LEVEL: f64 = 0.5;

/// Clamp a rating to the unit interval.
pub fn clamp_unit(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Clamp a risk level to its signed scale. More negative is safer.
pub fn clamp_risk(v: f64) -> f64 {
    v.clamp(-1.0, 0.0)
}

/// The natural-language body of a key point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPointText {
    /// Single free-form statement (legacy shape).
    Plain(String),
    /// Condition/action pair (v2.0 shape).
    WhenDo { when: String, then: String },
}

impl KeyPointText {
    /// Render the body as a single sentence for injection and matching.
    pub fn render(&self) -> String {
        match self {
            Self::Plain(text) => text.clone(),
            Self::WhenDo { when, then } => format!("When {}, do {}", when, then),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Plain(text) => text.trim().is_empty(),
            Self::WhenDo { when, then } => when.trim().is_empty() || then.trim().is_empty(),
        }
    }
}

/// A scored, tagged lesson in the playbook.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPoint {
    /// `kpt_NNN`, dense and unique after every reflection.
    pub name: String,
    pub text: KeyPointText,
    /// Normalized, deduplicated, never empty at rest.
    pub tags: BTreeSet<String>,
    /// Accumulates +1/0/-3 across reflections; saturating.
    pub score: i32,
    /// Expected effectiveness when applied, in [0, 1].
    pub effect_rating: f64,
    /// In [-1, 0]; closer to zero is riskier.
    pub risk_level: f64,
    /// How exploratory the lesson is, in [0, 1].
    pub innovation_level: f64,
    /// Pending items are excluded from injection; derived from the
    /// divider position on disk, not serialized per item.
    pub pending: bool,
}

impl KeyPoint {
    /// Build a freshly extracted key point with default attributes.
    pub fn new_pending(name: impl Into<String>, text: KeyPointText, tags: BTreeSet<String>) -> Self {
        Self {
            name: name.into(),
            text,
            tags,
            score: 0,
            effect_rating: DEFAULT_EFFECT_RATING,
            risk_level: DEFAULT_RISK_LEVEL,
            innovation_level: DEFAULT_INNOVATION_LEVEL,
            pending: true,
        }
    }

    /// Clamp the bounded numeric attributes in place. Score is exempt;
    /// the prune threshold bounds it from below.
    pub fn clamp_attributes(&mut self) {
        self.effect_rating = clamp_unit(self.effect_rating);
        self.risk_level = clamp_risk(self.risk_level);
        self.innovation_level = clamp_unit(self.innovation_level);
    }

    /// The tag used by the selector's diversity floor: lexicographically
    /// first, so it is stable under tag-set unions.
    pub fn primary_tag(&self) -> Option<&str> {
        self.tags.iter().next().map(String::as_str)
    }
}

impl Serialize for KeyPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("name", &self.name)?;
        match &self.text {
            KeyPointText::Plain(text) => map.serialize_entry("text", text)?,
            KeyPointText::WhenDo { when, then } => {
                map.serialize_entry("when", when)?;
                map.serialize_entry("do", then)?;
            }
        }
        map.serialize_entry("tags", &self.tags)?;
        map.serialize_entry("score", &self.score)?;
        map.serialize_entry("effect_rating", &self.effect_rating)?;
        map.serialize_entry("risk_level", &self.risk_level)?;
        map.serialize_entry("innovation_level", &self.innovation_level)?;
        map.end()
    }
}

/// Wire shape accepted on read; tolerates either body form and missing
/// numeric attributes.
#[derive(Deserialize)]
struct RawKeyPoint {
    name: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    when: Option<String>,
    #[serde(default, rename = "do")]
    then: Option<String>,
    #[serde(default)]
    tags: BTreeSet<String>,
    #[serde(default)]
    score: i32,
    #[serde(default = "default_effect")]
    effect_rating: f64,
    #[serde(default = "default_risk")]
    risk_level: f64,
    #[serde(default = "default_innovation")]
    innovation_level: f64,
}

fn default_effect() -> f64 {
    DEFAULT_EFFECT_RATING
}

fn default_risk() -> f64 {
    DEFAULT_RISK_LEVEL
}

fn default_innovation() -> f64 {
    DEFAULT_INNOVATION_LEVEL
}

impl<'de> Deserialize<'de> for KeyPoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawKeyPoint::deserialize(deserializer)?;
        let text = match (raw.when, raw.then, raw.text) {
            (Some(when), Some(then), _) => KeyPointText::WhenDo { when, then },
            (_, _, Some(text)) => KeyPointText::Plain(text),
            _ => {
                return Err(D::Error::custom(format!(
                    "key point {} has neither text nor when/do",
                    raw.name
                )))
            }
        };
        Ok(KeyPoint {
            name: raw.name,
            text,
            tags: raw.tags,
            score: raw.score,
            effect_rating: raw.effect_rating,
            risk_level: raw.risk_level,
            innovation_level: raw.innovation_level,
            pending: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_set(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_format_name_zero_padded() {
        assert_eq!(format_name(1), "kpt_001");
        assert_eq!(format_name(42), "kpt_042");
        assert_eq!(format_name(250), "kpt_250");
    }

    #[test]
    fn test_render_when_do() {
        let text = KeyPointText::WhenDo {
            when: "a payment call times out".to_string(),
            then: "retry with exponential backoff".to_string(),
        };
        assert_eq!(
            text.render(),
            "When a payment call times out, do retry with exponential backoff"
        );
    }

    #[test]
    fn test_serde_plain_round_trip() {
        let kpt = KeyPoint {
            name: "kpt_001".to_string(),
            text: KeyPointText::Plain("Use exponential backoff for payment retries".to_string()),
            tags: tag_set(&["backoff", "payment", "retry"]),
            score: 3,
            effect_rating: 0.9,
            risk_level: -0.6,
            innovation_level: 0.1,
            pending: false,
        };
        let json = serde_json::to_string(&kpt).unwrap();
        let back: KeyPoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kpt);
        assert!(json.contains("\"text\""));
        assert!(!json.contains("\"when\""));
    }

    #[test]
    fn test_serde_when_do_round_trip() {
        let kpt = KeyPoint {
            name: "kpt_002".to_string(),
            text: KeyPointText::WhenDo {
                when: "tests are flaky".to_string(),
                then: "quarantine them behind a feature flag".to_string(),
            },
            tags: tag_set(&["testing"]),
            score: 0,
            effect_rating: 0.5,
            risk_level: -0.3,
            innovation_level: 0.5,
            pending: false,
        };
        let json = serde_json::to_string(&kpt).unwrap();
        assert!(json.contains("\"when\""));
        assert!(json.contains("\"do\""));
        assert!(!json.contains("\"text\""));
        let back: KeyPoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kpt);
    }

    #[test]
    fn test_deserialize_defaults() {
        let kpt: KeyPoint =
            serde_json::from_str(r#"{"name":"kpt_001","text":"x","tags":["a"]}"#).unwrap();
        assert_eq!(kpt.score, 0);
        assert_eq!(kpt.effect_rating, DEFAULT_EFFECT_RATING);
        assert_eq!(kpt.risk_level, DEFAULT_RISK_LEVEL);
        assert_eq!(kpt.innovation_level, DEFAULT_INNOVATION_LEVEL);
    }

    #[test]
    fn test_deserialize_rejects_bodyless() {
        let result = serde_json::from_str::<KeyPoint>(r#"{"name":"kpt_001","tags":["a"]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_clamp_attributes() {
        let mut kpt = KeyPoint::new_pending(
            "kpt_001",
            KeyPointText::Plain("x".to_string()),
            tag_set(&["a"]),
        );
        kpt.effect_rating = 1.5;
        kpt.risk_level = 0.9;
        kpt.innovation_level = -0.2;
        kpt.clamp_attributes();
        assert_eq!(kpt.effect_rating, 1.0);
        assert_eq!(kpt.risk_level, 0.0);
        assert_eq!(kpt.innovation_level, 0.0);
    }

    #[test]
    fn test_primary_tag_is_lexicographic_min() {
        let kpt = KeyPoint::new_pending(
            "kpt_001",
            KeyPointText::Plain("x".to_string()),
            tag_set(&["retry", "backoff", "payment"]),
        );
        assert_eq!(kpt.primary_tag(), Some("backoff"));
    }
}
