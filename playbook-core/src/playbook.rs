//! The playbook document: an ordered, partitioned sequence of key points.
//!
//! On disk the stable and pending regions are separated by a
//! `{"divider": true}` sentinel inside the `key_points` array. In memory
//! the partition is a `pending` flag on each key point. Unknown array
//! entries are skipped on read so foreign annotations survive a
//! round-trip without breaking us.

use crate::error::StorageError;
use crate::kpt::{format_name, KeyPoint};
use crate::tags::normalize_tag;
use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Schema version written by this implementation.
pub const SCHEMA_VERSION: &str = "2.0";

/// Bounds enforced by [`Playbook::validate`]; sourced from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationLimits {
    /// Items at or below this score must have been pruned.
    pub prune_threshold: i32,
    /// Maximum number of key points at rest.
    pub max_kpts: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            prune_threshold: -5,
            max_kpts: 250,
        }
    }
}

/// The persisted per-project corpus of key points.
#[derive(Debug, Clone, PartialEq)]
pub struct Playbook {
    pub version: String,
    pub last_updated: DateTime<Utc>,
    /// Stable region first, then pending; see [`Playbook::validate`].
    pub key_points: Vec<KeyPoint>,
}

impl Playbook {
    /// A new, empty playbook at the current schema version.
    pub fn empty() -> Self {
        Self {
            version: SCHEMA_VERSION.to_string(),
            last_updated: Utc::now(),
            key_points: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.key_points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.key_points.len()
    }

    /// Key points eligible for injection.
    pub fn stable(&self) -> impl Iterator<Item = &KeyPoint> {
        self.key_points.iter().filter(|k| !k.pending)
    }

    /// Freshly extracted key points awaiting corroboration.
    pub fn pending(&self) -> impl Iterator<Item = &KeyPoint> {
        self.key_points.iter().filter(|k| k.pending)
    }

    pub fn get(&self, name: &str) -> Option<&KeyPoint> {
        self.key_points.iter().find(|k| k.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut KeyPoint> {
        self.key_points.iter_mut().find(|k| k.name == name)
    }

    /// Record a mutation time; callers do this once per rewrite.
    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    /// Assign dense `kpt_001..kpt_N` names in current order.
    pub fn renumber(&mut self) {
        for (i, kpt) in self.key_points.iter_mut().enumerate() {
            kpt.name = format_name(i + 1);
        }
    }

    /// True when no stable item follows a pending one.
    pub fn is_partitioned(&self) -> bool {
        let mut seen_pending = false;
        for kpt in &self.key_points {
            if kpt.pending {
                seen_pending = true;
            } else if seen_pending {
                return false;
            }
        }
        true
    }

    /// Clamp every key point's bounded attributes in place.
    pub fn clamp_attributes(&mut self) {
        for kpt in &mut self.key_points {
            kpt.clamp_attributes();
        }
    }

    /// Check every at-rest invariant; the first failure is reported.
    pub fn validate(&self, limits: &ValidationLimits) -> Result<(), StorageError> {
        let fail = |invariant: String| Err(StorageError::InvariantViolation { invariant });

        if self.key_points.len() > limits.max_kpts {
            return fail(format!(
                "size {} exceeds max_kpts {}",
                self.key_points.len(),
                limits.max_kpts
            ));
        }
        if !self.is_partitioned() {
            return fail("stable key point after the pending region".to_string());
        }

        let mut names: Vec<&str> = Vec::with_capacity(self.key_points.len());
        for kpt in &self.key_points {
            if kpt.text.is_empty() {
                return fail(format!("{} has an empty body", kpt.name));
            }
            if kpt.tags.is_empty() {
                return fail(format!("{} has no tags", kpt.name));
            }
            for tag in &kpt.tags {
                if normalize_tag(tag).as_deref() != Some(tag.as_str()) {
                    return fail(format!("{} carries unnormalized tag {:?}", kpt.name, tag));
                }
            }
            if kpt.score <= limits.prune_threshold {
                return fail(format!(
                    "{} score {} at or below prune threshold {}",
                    kpt.name, kpt.score, limits.prune_threshold
                ));
            }
            if !(0.0..=1.0).contains(&kpt.effect_rating) {
                return fail(format!("{} effect_rating out of [0,1]", kpt.name));
            }
            if !(-1.0..=0.0).contains(&kpt.risk_level) {
                return fail(format!("{} risk_level out of [-1,0]", kpt.name));
            }
            if !(0.0..=1.0).contains(&kpt.innovation_level) {
                return fail(format!("{} innovation_level out of [0,1]", kpt.name));
            }
            names.push(&kpt.name);
        }

        let mut sorted = names.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != names.len() {
            return fail("duplicate key point names".to_string());
        }
        for (i, name) in sorted.iter().enumerate() {
            let expected = format_name(i + 1);
            if *name != expected {
                return fail(format!("names are not dense: expected {expected}, found {name}"));
            }
        }
        Ok(())
    }
}

impl Serialize for Playbook {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Divider {
            divider: bool,
        }

        #[derive(Serialize)]
        #[serde(untagged)]
        enum Entry<'a> {
            Kpt(&'a KeyPoint),
            Divider(Divider),
        }

        let mut entries: Vec<Entry> = self.stable().map(Entry::Kpt).collect();
        entries.push(Entry::Divider(Divider { divider: true }));
        entries.extend(self.pending().map(Entry::Kpt));

        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("version", &self.version)?;
        map.serialize_entry("last_updated", &self.last_updated)?;
        map.serialize_entry("key_points", &entries)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Playbook {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct RawPlaybook {
            #[serde(default)]
            version: Option<String>,
            #[serde(default)]
            last_updated: Option<DateTime<Utc>>,
            #[serde(default)]
            key_points: Vec<serde_json::Value>,
        }

        let raw = RawPlaybook::deserialize(deserializer)?;
        let mut key_points = Vec::with_capacity(raw.key_points.len());
        let mut in_pending = false;
        for entry in raw.key_points {
            if entry
                .as_object()
                .and_then(|o| o.get("divider"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            {
                in_pending = true;
                continue;
            }
            // Anything that is not a key point is a foreign annotation.
            if let Ok(mut kpt) = serde_json::from_value::<KeyPoint>(entry) {
                kpt.pending = in_pending;
                key_points.push(kpt);
            }
        }

        Ok(Playbook {
            version: raw.version.unwrap_or_else(|| SCHEMA_VERSION.to_string()),
            last_updated: raw.last_updated.unwrap_or_else(Utc::now),
            key_points,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kpt::KeyPointText;
    use std::collections::BTreeSet;

    fn make_kpt(name: &str, score: i32, pending: bool) -> KeyPoint {
        let mut kpt = KeyPoint::new_pending(
            name,
            KeyPointText::Plain(format!("lesson for {name}")),
            BTreeSet::from(["general".to_string()]),
        );
        kpt.score = score;
        kpt.pending = pending;
        kpt
    }

    fn make_playbook(kpts: Vec<KeyPoint>) -> Playbook {
        Playbook {
            version: SCHEMA_VERSION.to_string(),
            last_updated: Utc::now(),
            key_points: kpts,
        }
    }

    #[test]
    fn test_divider_round_trip() {
        let playbook = make_playbook(vec![
            make_kpt("kpt_001", 3, false),
            make_kpt("kpt_002", 1, false),
            make_kpt("kpt_003", 0, true),
        ]);
        let json = serde_json::to_string_pretty(&playbook).unwrap();
        assert!(json.contains("\"divider\": true"));

        let back: Playbook = serde_json::from_str(&json).unwrap();
        assert_eq!(back, playbook);
        assert_eq!(back.stable().count(), 2);
        assert_eq!(back.pending().count(), 1);
    }

    #[test]
    fn test_missing_divider_means_all_stable() {
        let json = r#"{"version":"2.0","last_updated":"2026-01-01T00:00:00Z",
            "key_points":[{"name":"kpt_001","text":"x","tags":["a"]}]}"#;
        let playbook: Playbook = serde_json::from_str(json).unwrap();
        assert_eq!(playbook.stable().count(), 1);
        assert_eq!(playbook.pending().count(), 0);
    }

    #[test]
    fn test_unknown_entries_skipped() {
        let json = r#"{"version":"2.0","last_updated":"2026-01-01T00:00:00Z",
            "key_points":[
                {"name":"kpt_001","text":"x","tags":["a"]},
                {"comment":"left by another tool"},
                {"divider":true},
                {"name":"kpt_002","text":"y","tags":["b"]}
            ]}"#;
        let playbook: Playbook = serde_json::from_str(json).unwrap();
        assert_eq!(playbook.len(), 2);
        assert!(playbook.get("kpt_002").unwrap().pending);
    }

    #[test]
    fn test_validate_accepts_good_playbook() {
        let playbook = make_playbook(vec![
            make_kpt("kpt_001", 3, false),
            make_kpt("kpt_002", 0, true),
        ]);
        assert!(playbook.validate(&ValidationLimits::default()).is_ok());
    }

    #[test]
    fn test_validate_rejects_interleaved_regions() {
        let playbook = make_playbook(vec![
            make_kpt("kpt_001", 3, false),
            make_kpt("kpt_002", 0, true),
            make_kpt("kpt_003", 1, false),
        ]);
        assert!(playbook.validate(&ValidationLimits::default()).is_err());
    }

    #[test]
    fn test_validate_rejects_sparse_names() {
        let playbook = make_playbook(vec![
            make_kpt("kpt_001", 3, false),
            make_kpt("kpt_003", 1, false),
        ]);
        assert!(playbook.validate(&ValidationLimits::default()).is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let playbook = make_playbook(vec![
            make_kpt("kpt_001", 3, false),
            make_kpt("kpt_001", 1, false),
        ]);
        assert!(playbook.validate(&ValidationLimits::default()).is_err());
    }

    #[test]
    fn test_validate_rejects_prunable_score() {
        let playbook = make_playbook(vec![make_kpt("kpt_001", -5, false)]);
        assert!(playbook.validate(&ValidationLimits::default()).is_err());
    }

    #[test]
    fn test_validate_rejects_unnormalized_tag() {
        let mut kpt = make_kpt("kpt_001", 0, false);
        kpt.tags = BTreeSet::from(["Not Normalized".to_string()]);
        let playbook = make_playbook(vec![kpt]);
        assert!(playbook.validate(&ValidationLimits::default()).is_err());
    }

    #[test]
    fn test_validate_rejects_oversize() {
        let limits = ValidationLimits {
            prune_threshold: -5,
            max_kpts: 2,
        };
        let playbook = make_playbook(vec![
            make_kpt("kpt_001", 0, false),
            make_kpt("kpt_002", 0, false),
            make_kpt("kpt_003", 0, false),
        ]);
        assert!(playbook.validate(&limits).is_err());
    }

    #[test]
    fn test_renumber_dense() {
        let mut playbook = make_playbook(vec![
            make_kpt("kpt_007", 3, false),
            make_kpt("kpt_002", 1, false),
            make_kpt("kpt_009", 0, true),
        ]);
        playbook.renumber();
        let names: Vec<_> = playbook.key_points.iter().map(|k| k.name.clone()).collect();
        assert_eq!(names, vec!["kpt_001", "kpt_002", "kpt_003"]);
    }
}
