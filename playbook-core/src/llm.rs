//! Typed shapes exchanged with the LLM gateway.
//!
//! Pure data only; the gateway implementation lives in `playbook-llm`
//! and the merge/score semantics live in `playbook-engine`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reply to a tag-inference request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagInference {
    pub tags: Vec<String>,
    /// Selection temperature in [0, 1] suggested from prompt cues.
    pub temperature: f64,
    /// Free-form complexity assessment ("low" / "medium" / "high").
    #[serde(default)]
    pub complexity: Option<String>,
}

/// How the model judged an existing key point against a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Assessment {
    Helpful,
    Neutral,
    Harmful,
    NotApplicable,
}

impl Assessment {
    /// Score delta applied by the reflector.
    pub fn score_delta(self) -> i32 {
        match self {
            Self::Helpful => 1,
            Self::Neutral | Self::NotApplicable => 0,
            Self::Harmful => -3,
        }
    }
}

/// Per-key-point adjustments proposed by a reflection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KptDelta {
    pub assessment: Assessment,
    #[serde(default)]
    pub tag_additions: Vec<String>,
    #[serde(default)]
    pub text_rewrite: Option<String>,
}

/// A candidate key point extracted from a transcript. Either `text` or
/// the `when`/`do` pair must be present; missing numeric attributes get
/// the documented defaults on admission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateKeyPoint {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default, rename = "do")]
    pub then: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub effect_rating: Option<f64>,
    #[serde(default)]
    pub risk_level: Option<f64>,
    #[serde(default)]
    pub innovation_level: Option<f64>,
}

/// A merge grouping proposed by the model. The reflector re-validates
/// the similarity against the configured threshold and picks the actual
/// survivor by score, regardless of what the model nominated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeGroup {
    pub survivor: String,
    pub absorbed: Vec<String>,
    /// Model-reported semantic similarity in [0, 1].
    pub similarity: f64,
}

impl MergeGroup {
    /// Survivor plus absorbed, deduplicated, order preserved.
    pub fn members(&self) -> Vec<&str> {
        let mut members: Vec<&str> = vec![self.survivor.as_str()];
        for name in &self.absorbed {
            if !members.contains(&name.as_str()) {
                members.push(name.as_str());
            }
        }
        members
    }
}

/// Everything a single reflection call returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReflectionResult {
    #[serde(default)]
    pub new_kpts: Vec<CandidateKeyPoint>,
    /// Keyed by key point name; BTreeMap keeps application order stable.
    #[serde(default)]
    pub deltas: BTreeMap<String, KptDelta>,
    #[serde(default)]
    pub merges: Vec<MergeGroup>,
    /// Pending names to graduate to the stable region.
    #[serde(default)]
    pub promotions: Vec<String>,
}

impl ReflectionResult {
    /// All key point names this result refers to, for rebase accounting.
    pub fn referenced_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.deltas.keys().map(String::as_str).collect();
        for group in &self.merges {
            for member in group.members() {
                if !names.contains(&member) {
                    names.push(member);
                }
            }
        }
        for name in &self.promotions {
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }
        names
    }
}

/// Reply to a legacy-shape migration request. Applied only when the
/// model is confident enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhenDoMigration {
    pub when: String,
    #[serde(rename = "do")]
    pub then: String,
    pub confidence: f64,
}

/// Minimum confidence for a migration to replace the legacy shape.
pub const MIGRATION_CONFIDENCE_FLOOR: f64 = 0.7;
