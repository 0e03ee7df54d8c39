//! The reflection pipeline: fold one LLM reflection into the playbook.
//!
//! `apply` is pure and never touches disk. The caller brackets it with
//! a storage snapshot and an exclusive lock; `rebase` re-targets an
//! already-computed reflection when the on-disk playbook moved while
//! the LLM call ran unlocked.

use playbook_core::tags::{normalize_tag, normalize_tags, significant_tokens};
use playbook_core::{
    format_name, KeyPoint, KeyPointText, MergeGroup, Playbook, PlaybookConfig, ReflectError,
    ReflectionResult, StorageError, ValidationLimits, SCHEMA_VERSION,
};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Tag given to an admitted key point when the model supplied none and
/// its body yields no usable token.
const LAST_RESORT_TAG: &str = "general";

/// Applies reflection results under the configured thresholds.
#[derive(Debug, Clone)]
pub struct Reflector {
    merge_threshold: f64,
    limits: ValidationLimits,
}

impl Reflector {
    pub fn new(merge_threshold: f64, limits: ValidationLimits) -> Self {
        Self {
            merge_threshold,
            limits,
        }
    }

    pub fn from_config(config: &PlaybookConfig) -> Self {
        Self::new(config.merge_threshold, config.limits())
    }

    /// Produce the playbook that supersedes `current`.
    ///
    /// Steps, in order: score deltas, merges, admissions, promotions,
    /// prune, evict, reorder, renumber, validate. A validation failure
    /// rejects the whole reflection and leaves `current` untouched.
    pub fn apply(
        &self,
        current: &Playbook,
        outcome: &ReflectionResult,
    ) -> Result<Playbook, ReflectError> {
        let mut next = current.clone();

        self.apply_deltas(&mut next, outcome);
        self.apply_merges(&mut next, outcome);
        self.admit_new(&mut next, outcome);
        self.promote(&mut next, outcome);
        self.prune(&mut next);
        self.evict(&mut next);
        self.reorder(&mut next);
        next.renumber();
        next.version = SCHEMA_VERSION.to_string();
        next.touch();

        match next.validate(&self.limits) {
            Ok(()) => Ok(next),
            Err(StorageError::InvariantViolation { invariant }) => {
                Err(ReflectError::Rejected { invariant })
            }
            Err(other) => Err(ReflectError::Rejected {
                invariant: other.to_string(),
            }),
        }
    }

    /// Re-target a reflection computed against an older playbook onto
    /// the state now on disk. Names that vanished are dropped; when
    /// more than half of them are gone the reflection concedes.
    pub fn rebase(
        &self,
        outcome: &ReflectionResult,
        latest: &Playbook,
    ) -> Result<ReflectionResult, ReflectError> {
        let referenced = outcome.referenced_names();
        if !referenced.is_empty() {
            let missing = referenced
                .iter()
                .filter(|name| latest.get(name).is_none())
                .count();
            if missing * 2 > referenced.len() {
                return Err(ReflectError::ConcurrentUpdate {
                    reason: format!(
                        "{missing} of {} referenced key points no longer exist",
                        referenced.len()
                    ),
                });
            }
        }

        let mut rebased = outcome.clone();
        rebased.deltas.retain(|name, _| latest.get(name).is_some());
        rebased.merges = outcome
            .merges
            .iter()
            .filter_map(|group| {
                let members: Vec<String> = group
                    .members()
                    .into_iter()
                    .filter(|m| latest.get(m).is_some())
                    .map(String::from)
                    .collect();
                if members.len() < 2 {
                    return None;
                }
                Some(MergeGroup {
                    survivor: members[0].clone(),
                    absorbed: members[1..].to_vec(),
                    similarity: group.similarity,
                })
            })
            .collect();
        rebased.promotions.retain(|name| latest.get(name).is_some());
        Ok(rebased)
    }

    fn apply_deltas(&self, next: &mut Playbook, outcome: &ReflectionResult) {
        for (name, delta) in &outcome.deltas {
            let Some(kpt) = next.get_mut(name) else {
                tracing::debug!(name = %name, "delta for unknown key point dropped");
                continue;
            };
            kpt.score = kpt.score.saturating_add(delta.assessment.score_delta());
            kpt.tags.extend(normalize_tags(&delta.tag_additions));
            if let Some(rewrite) = &delta.text_rewrite {
                if !rewrite.trim().is_empty() {
                    kpt.text = KeyPointText::Plain(rewrite.clone());
                }
            }
        }
    }

    /// Merge groups at or above the similarity threshold, highest
    /// similarity first. A member already claimed by a stronger group
    /// drops out of weaker ones; a group left with fewer than two
    /// members dissolves.
    fn apply_merges(&self, next: &mut Playbook, outcome: &ReflectionResult) {
        let mut groups: Vec<&MergeGroup> = outcome
            .merges
            .iter()
            .filter(|g| g.similarity >= self.merge_threshold)
            .collect();
        groups.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.survivor.cmp(&b.survivor))
        });

        let mut claimed: BTreeSet<String> = BTreeSet::new();
        for group in groups {
            let members: Vec<String> = group
                .members()
                .into_iter()
                .filter(|m| !claimed.contains(*m) && next.get(m).is_some())
                .map(String::from)
                .collect();
            if members.len() < 2 {
                continue;
            }
            claimed.extend(members.iter().cloned());

            // Survivor is the highest-scored member, smaller name on tie.
            let survivor_name = members
                .iter()
                .max_by(|a, b| {
                    let ka = next.get(a).expect("member present");
                    let kb = next.get(b).expect("member present");
                    ka.score.cmp(&kb.score).then_with(|| b.cmp(a))
                })
                .expect("non-empty group")
                .clone();

            let total = members
                .iter()
                .map(|m| next.get(m).expect("member present").score)
                .fold(0i32, i32::saturating_add);
            let mut union_tags = BTreeSet::new();
            for member in &members {
                union_tags.extend(next.get(member).expect("member present").tags.iter().cloned());
            }

            let survivor = next.get_mut(&survivor_name).expect("survivor present");
            survivor.score = total;
            survivor.tags = union_tags;
            // Absorbing a re-discovered lesson corroborates the survivor.
            survivor.pending = false;

            next.key_points
                .retain(|k| k.name == survivor_name || !members.contains(&k.name));
        }
    }

    fn admit_new(&self, next: &mut Playbook, outcome: &ReflectionResult) {
        let mut next_number = next
            .key_points
            .iter()
            .filter_map(|k| parse_name(&k.name))
            .max()
            .unwrap_or(0);

        for candidate in &outcome.new_kpts {
            let text = match (&candidate.when, &candidate.then, &candidate.text) {
                (Some(when), Some(then), _)
                    if !when.trim().is_empty() && !then.trim().is_empty() =>
                {
                    KeyPointText::WhenDo {
                        when: when.clone(),
                        then: then.clone(),
                    }
                }
                (_, _, Some(text)) if !text.trim().is_empty() => KeyPointText::Plain(text.clone()),
                _ => {
                    tracing::debug!("bodyless candidate key point dropped");
                    continue;
                }
            };

            let mut tags = normalize_tags(&candidate.tags);
            if tags.is_empty() {
                // The extractor returned nothing usable; synthesize one.
                let synthesized = significant_tokens(&text.render())
                    .into_iter()
                    .find_map(|token| normalize_tag(&token))
                    .unwrap_or_else(|| LAST_RESORT_TAG.to_string());
                tags.insert(synthesized);
            }

            next_number += 1;
            let mut kpt = KeyPoint::new_pending(format_name(next_number), text, tags);
            if let Some(v) = candidate.effect_rating {
                kpt.effect_rating = v;
            }
            if let Some(v) = candidate.risk_level {
                kpt.risk_level = v;
            }
            if let Some(v) = candidate.innovation_level {
                kpt.innovation_level = v;
            }
            kpt.clamp_attributes();
            next.key_points.push(kpt);
        }
    }

    fn promote(&self, next: &mut Playbook, outcome: &ReflectionResult) {
        for name in &outcome.promotions {
            if let Some(kpt) = next.get_mut(name) {
                kpt.pending = false;
            }
        }
    }

    fn prune(&self, next: &mut Playbook) {
        next.key_points
            .retain(|k| k.score > self.limits.prune_threshold);
    }

    /// Evict lowest-scored stable items until the size bound holds;
    /// ties evict the larger name. Pending items go newest-first only
    /// if the stable region alone cannot get under the bound.
    fn evict(&self, next: &mut Playbook) {
        while next.len() > self.limits.max_kpts {
            let victim = next
                .key_points
                .iter()
                .enumerate()
                .filter(|(_, k)| !k.pending)
                .min_by(|(_, a), (_, b)| {
                    a.score.cmp(&b.score).then_with(|| b.name.cmp(&a.name))
                })
                .map(|(i, _)| i);
            match victim {
                Some(index) => {
                    next.key_points.remove(index);
                }
                None => {
                    next.key_points.pop();
                }
            }
        }
    }

    /// Stable region by descending score then name; pending region in
    /// insertion order.
    fn reorder(&self, next: &mut Playbook) {
        let mut stable: Vec<KeyPoint> = Vec::new();
        let mut pending: Vec<KeyPoint> = Vec::new();
        for kpt in next.key_points.drain(..) {
            if kpt.pending {
                pending.push(kpt);
            } else {
                stable.push(kpt);
            }
        }
        stable.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
        next.key_points = stable;
        next.key_points.extend(pending);
    }
}

fn parse_name(name: &str) -> Option<usize> {
    name.strip_prefix("kpt_")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use playbook_core::{Assessment, CandidateKeyPoint, KptDelta};
    use std::collections::BTreeMap;

    fn make_reflector() -> Reflector {
        Reflector::new(0.80, ValidationLimits::default())
    }

    fn make_kpt(name: &str, score: i32, pending: bool) -> KeyPoint {
        let mut kpt = KeyPoint::new_pending(
            name,
            KeyPointText::Plain(format!("lesson behind {name}")),
            BTreeSet::from(["general".to_string()]),
        );
        kpt.score = score;
        kpt.pending = pending;
        kpt
    }

    fn make_playbook(kpts: Vec<KeyPoint>) -> Playbook {
        let mut playbook = Playbook::empty();
        playbook.key_points = kpts;
        playbook
    }

    fn delta(assessment: Assessment) -> KptDelta {
        KptDelta {
            assessment,
            tag_additions: Vec::new(),
            text_rewrite: None,
        }
    }

    fn candidate(text: &str, tags: &[&str]) -> CandidateKeyPoint {
        CandidateKeyPoint {
            text: Some(text.to_string()),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            ..CandidateKeyPoint::default()
        }
    }

    #[test]
    fn test_first_reflection_admits_pending() {
        let outcome = ReflectionResult {
            new_kpts: vec![CandidateKeyPoint {
                when: Some("payment calls fail transiently".to_string()),
                then: Some("retry with exponential backoff".to_string()),
                tags: vec!["payment".to_string(), "retry".to_string(), "backoff".to_string()],
                ..CandidateKeyPoint::default()
            }],
            ..ReflectionResult::default()
        };
        let next = make_reflector().apply(&Playbook::empty(), &outcome).unwrap();

        assert_eq!(next.len(), 1);
        let kpt = &next.key_points[0];
        assert_eq!(kpt.name, "kpt_001");
        assert!(kpt.pending);
        assert_eq!(kpt.score, 0);
        assert_eq!(
            kpt.tags,
            BTreeSet::from([
                "backoff".to_string(),
                "payment".to_string(),
                "retry".to_string()
            ])
        );
    }

    #[test]
    fn test_deltas_accumulate_scores() {
        let playbook = make_playbook(vec![
            make_kpt("kpt_001", 2, false),
            make_kpt("kpt_002", 0, false),
            make_kpt("kpt_003", 1, false),
        ]);
        let outcome = ReflectionResult {
            deltas: BTreeMap::from([
                ("kpt_001".to_string(), delta(Assessment::Helpful)),
                ("kpt_002".to_string(), delta(Assessment::Harmful)),
                ("kpt_003".to_string(), delta(Assessment::NotApplicable)),
            ]),
            ..ReflectionResult::default()
        };
        let next = make_reflector().apply(&playbook, &outcome).unwrap();

        // Reorder puts the highest score first; look entries up by score.
        let scores: Vec<i32> = next.key_points.iter().map(|k| k.score).collect();
        assert!(scores.contains(&3));
        assert!(scores.contains(&-3));
        assert!(scores.contains(&1));
    }

    #[test]
    fn test_promotion_graduates_pending() {
        let playbook = make_playbook(vec![make_kpt("kpt_001", 0, true)]);
        let outcome = ReflectionResult {
            deltas: BTreeMap::from([("kpt_001".to_string(), delta(Assessment::Helpful))]),
            promotions: vec!["kpt_001".to_string()],
            ..ReflectionResult::default()
        };
        let next = make_reflector().apply(&playbook, &outcome).unwrap();
        let kpt = next.get("kpt_001").unwrap();
        assert!(!kpt.pending);
        assert_eq!(kpt.score, 1);
    }

    #[test]
    fn test_merge_sums_scores_and_unions_tags() {
        let mut a = make_kpt("kpt_001", 1, false);
        a.tags = BTreeSet::from(["payment".to_string(), "retry".to_string()]);
        let mut b = make_kpt("kpt_002", 0, true);
        b.tags = BTreeSet::from(["backoff".to_string()]);
        let playbook = make_playbook(vec![a, b]);

        let outcome = ReflectionResult {
            merges: vec![MergeGroup {
                survivor: "kpt_002".to_string(),
                absorbed: vec!["kpt_001".to_string()],
                similarity: 0.85,
            }],
            ..ReflectionResult::default()
        };
        let next = make_reflector().apply(&playbook, &outcome).unwrap();

        assert_eq!(next.len(), 1);
        let survivor = &next.key_points[0];
        // The higher-scored member survives, not the model's nominee.
        assert_eq!(survivor.text.render(), "lesson behind kpt_001");
        assert_eq!(survivor.score, 1);
        assert!(!survivor.pending);
        assert_eq!(
            survivor.tags,
            BTreeSet::from([
                "backoff".to_string(),
                "payment".to_string(),
                "retry".to_string()
            ])
        );
    }

    #[test]
    fn test_merge_below_threshold_ignored() {
        let playbook = make_playbook(vec![
            make_kpt("kpt_001", 1, false),
            make_kpt("kpt_002", 0, false),
        ]);
        let outcome = ReflectionResult {
            merges: vec![MergeGroup {
                survivor: "kpt_001".to_string(),
                absorbed: vec!["kpt_002".to_string()],
                similarity: 0.75,
            }],
            ..ReflectionResult::default()
        };
        let next = make_reflector().apply(&playbook, &outcome).unwrap();
        assert_eq!(next.len(), 2);
    }

    #[test]
    fn test_merge_score_sum_is_order_independent() {
        for order in [
            vec!["kpt_002", "kpt_003"],
            vec!["kpt_003", "kpt_002"],
        ] {
            let playbook = make_playbook(vec![
                make_kpt("kpt_001", 4, false),
                make_kpt("kpt_002", 2, false),
                make_kpt("kpt_003", -1, false),
            ]);
            let outcome = ReflectionResult {
                merges: vec![MergeGroup {
                    survivor: "kpt_001".to_string(),
                    absorbed: order.iter().map(|s| s.to_string()).collect(),
                    similarity: 0.9,
                }],
                ..ReflectionResult::default()
            };
            let next = make_reflector().apply(&playbook, &outcome).unwrap();
            assert_eq!(next.len(), 1);
            assert_eq!(next.key_points[0].score, 5);
        }
    }

    #[test]
    fn test_overlapping_groups_resolved_by_similarity() {
        let playbook = make_playbook(vec![
            make_kpt("kpt_001", 3, false),
            make_kpt("kpt_002", 2, false),
            make_kpt("kpt_003", 1, false),
        ]);
        // Both groups want kpt_002; the stronger one gets it and the
        // weaker one dissolves below two members.
        let outcome = ReflectionResult {
            merges: vec![
                MergeGroup {
                    survivor: "kpt_003".to_string(),
                    absorbed: vec!["kpt_002".to_string()],
                    similarity: 0.82,
                },
                MergeGroup {
                    survivor: "kpt_001".to_string(),
                    absorbed: vec!["kpt_002".to_string()],
                    similarity: 0.95,
                },
            ],
            ..ReflectionResult::default()
        };
        let next = make_reflector().apply(&playbook, &outcome).unwrap();
        assert_eq!(next.len(), 2);
        // kpt_001 absorbed kpt_002 (3 + 2); kpt_003 kept its own score.
        let scores: Vec<i32> = next.key_points.iter().map(|k| k.score).collect();
        assert!(scores.contains(&5));
        assert!(scores.contains(&1));
    }

    #[test]
    fn test_prune_removes_harmful_items() {
        let playbook = make_playbook(vec![
            make_kpt("kpt_001", -3, false),
            make_kpt("kpt_002", 1, false),
        ]);
        let outcome = ReflectionResult {
            deltas: BTreeMap::from([("kpt_001".to_string(), delta(Assessment::Harmful))]),
            ..ReflectionResult::default()
        };
        let next = make_reflector().apply(&playbook, &outcome).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next.key_points[0].score, 1);
    }

    #[test]
    fn test_eviction_respects_size_bound() {
        let limits = ValidationLimits {
            prune_threshold: -5,
            max_kpts: 3,
        };
        let reflector = Reflector::new(0.80, limits);
        let playbook = make_playbook(vec![
            make_kpt("kpt_001", 5, false),
            make_kpt("kpt_002", 1, false),
            make_kpt("kpt_003", 4, false),
            make_kpt("kpt_004", 2, false),
        ]);
        let next = reflector.apply(&playbook, &ReflectionResult::default()).unwrap();
        assert_eq!(next.len(), 3);
        let scores: Vec<i32> = next.key_points.iter().map(|k| k.score).collect();
        assert_eq!(scores, vec![5, 4, 2]);
    }

    #[test]
    fn test_eviction_falls_back_to_pending() {
        let limits = ValidationLimits {
            prune_threshold: -5,
            max_kpts: 2,
        };
        let reflector = Reflector::new(0.80, limits);
        let playbook = make_playbook(vec![
            make_kpt("kpt_001", 1, false),
            make_kpt("kpt_002", 0, true),
            make_kpt("kpt_003", 0, true),
            make_kpt("kpt_004", 0, true),
        ]);
        let next = reflector.apply(&playbook, &ReflectionResult::default()).unwrap();
        assert_eq!(next.len(), 2);
    }

    #[test]
    fn test_reorder_and_renumber() {
        let playbook = make_playbook(vec![
            make_kpt("kpt_001", 1, false),
            make_kpt("kpt_002", 7, false),
            make_kpt("kpt_003", 0, true),
            make_kpt("kpt_004", 4, false),
        ]);
        let next = make_reflector().apply(&playbook, &ReflectionResult::default()).unwrap();

        let names: Vec<&str> = next.key_points.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, vec!["kpt_001", "kpt_002", "kpt_003", "kpt_004"]);
        let scores: Vec<i32> = next.key_points.iter().map(|k| k.score).collect();
        assert_eq!(scores, vec![7, 4, 1, 0]);
        assert!(next.key_points[3].pending);
    }

    #[test]
    fn test_admitted_candidate_without_tags_gets_one() {
        let outcome = ReflectionResult {
            new_kpts: vec![candidate("profile before optimizing hot loops", &[])],
            ..ReflectionResult::default()
        };
        let next = make_reflector().apply(&Playbook::empty(), &outcome).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(
            next.key_points[0].tags,
            BTreeSet::from(["profile".to_string()])
        );
    }

    #[test]
    fn test_bodyless_candidate_dropped() {
        let outcome = ReflectionResult {
            new_kpts: vec![CandidateKeyPoint::default()],
            ..ReflectionResult::default()
        };
        let next = make_reflector().apply(&Playbook::empty(), &outcome).unwrap();
        assert!(next.is_empty());
    }

    #[test]
    fn test_text_rewrite_replaces_body() {
        let playbook = make_playbook(vec![make_kpt("kpt_001", 1, false)]);
        let outcome = ReflectionResult {
            deltas: BTreeMap::from([(
                "kpt_001".to_string(),
                KptDelta {
                    assessment: Assessment::Helpful,
                    tag_additions: vec!["Sharper Tag".to_string()],
                    text_rewrite: Some("always gate payment retries on idempotency".to_string()),
                },
            )]),
            ..ReflectionResult::default()
        };
        let next = make_reflector().apply(&playbook, &outcome).unwrap();
        let kpt = &next.key_points[0];
        assert_eq!(
            kpt.text.render(),
            "always gate payment retries on idempotency"
        );
        assert!(kpt.tags.contains("sharper-tag"));
    }

    #[test]
    fn test_idempotent_when_nothing_applies() {
        let playbook = make_playbook(vec![
            make_kpt("kpt_001", 5, false),
            make_kpt("kpt_002", 2, false),
        ]);
        let reflector = make_reflector();
        let once = reflector.apply(&playbook, &ReflectionResult::default()).unwrap();
        let twice = reflector.apply(&once, &ReflectionResult::default()).unwrap();
        assert_eq!(once.key_points, twice.key_points);
    }

    #[test]
    fn test_rebase_drops_vanished_names() {
        let latest = make_playbook(vec![
            make_kpt("kpt_001", 1, false),
            make_kpt("kpt_002", 0, true),
        ]);
        let outcome = ReflectionResult {
            deltas: BTreeMap::from([
                ("kpt_001".to_string(), delta(Assessment::Helpful)),
                ("kpt_009".to_string(), delta(Assessment::Harmful)),
            ]),
            promotions: vec!["kpt_002".to_string()],
            ..ReflectionResult::default()
        };
        let rebased = make_reflector().rebase(&outcome, &latest).unwrap();
        assert_eq!(rebased.deltas.len(), 1);
        assert!(rebased.deltas.contains_key("kpt_001"));
        assert_eq!(rebased.promotions, vec!["kpt_002".to_string()]);
    }

    #[test]
    fn test_rebase_concedes_when_most_names_vanished() {
        let latest = make_playbook(vec![make_kpt("kpt_001", 1, false)]);
        let outcome = ReflectionResult {
            deltas: BTreeMap::from([
                ("kpt_007".to_string(), delta(Assessment::Helpful)),
                ("kpt_008".to_string(), delta(Assessment::Helpful)),
                ("kpt_009".to_string(), delta(Assessment::Harmful)),
            ]),
            ..ReflectionResult::default()
        };
        let err = make_reflector().rebase(&outcome, &latest).unwrap_err();
        assert!(matches!(err, ReflectError::ConcurrentUpdate { .. }));
    }

    #[test]
    fn test_rebase_shrinks_merge_groups() {
        let latest = make_playbook(vec![
            make_kpt("kpt_001", 1, false),
            make_kpt("kpt_002", 0, false),
        ]);
        let outcome = ReflectionResult {
            merges: vec![
                MergeGroup {
                    survivor: "kpt_001".to_string(),
                    absorbed: vec!["kpt_002".to_string(), "kpt_009".to_string()],
                    similarity: 0.9,
                },
                MergeGroup {
                    survivor: "kpt_008".to_string(),
                    absorbed: vec!["kpt_009".to_string()],
                    similarity: 0.9,
                },
            ],
            deltas: BTreeMap::from([
                ("kpt_001".to_string(), delta(Assessment::Helpful)),
                ("kpt_002".to_string(), delta(Assessment::Neutral)),
            ]),
            ..ReflectionResult::default()
        };
        let rebased = make_reflector().rebase(&outcome, &latest).unwrap();
        assert_eq!(rebased.merges.len(), 1);
        assert_eq!(rebased.merges[0].members().len(), 2);
    }
}
