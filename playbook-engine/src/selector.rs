//! The injection hot path: pick the most relevant stable key points for
//! a prompt.
//!
//! Weighting is fully deterministic: identical inputs produce identical
//! output. All arithmetic is f64 with fixed constants; ties break by
//! score, then name.

use playbook_core::tags;
use playbook_core::{KeyPoint, Playbook};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Score at or above which a key point counts as proven knowledge.
pub const HIGH_CONFIDENCE_THRESHOLD: i32 = 2;

/// Multiplier floor; keeps every candidate selectable in principle.
pub const WEIGHT_FLOOR: f64 = 0.05;

/// Minimum working-set size after the relaxation pass.
const RELAXED_POOL_FLOOR: usize = 15;

/// The two selection layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// Proven items, favored at low temperature.
    HighConfidence,
    /// Unproven or exploratory items, favored at high temperature.
    Recommendation,
}

/// One selected key point with its final weight.
#[derive(Debug, Clone)]
pub struct Selected<'a> {
    pub kpt: &'a KeyPoint,
    pub weight: f64,
    pub layer: Layer,
}

/// Inputs to one selection run.
#[derive(Debug, Clone)]
pub struct SelectionRequest<'a> {
    pub prompt: &'a str,
    pub prompt_tags: &'a BTreeSet<String>,
    /// Bias between proven (low) and exploratory (high) knowledge.
    pub temperature: f64,
    pub limit: usize,
}

struct Scored<'a> {
    kpt: &'a KeyPoint,
    weight: f64,
    layer: Layer,
}

/// Piecewise temperature multiplier for a layer.
fn temperature_multiplier(layer: Layer, t: f64) -> f64 {
    match layer {
        Layer::HighConfidence => {
            let mut mu = 2.5 - 1.5 * t;
            if t <= 0.3 {
                mu += 0.5;
            } else if t >= 0.7 {
                mu -= 0.3;
            }
            mu
        }
        Layer::Recommendation => {
            let mut mu = 2.0 * t;
            if t <= 0.3 {
                mu *= 0.3;
            } else if t >= 0.7 {
                mu += 0.5;
            }
            mu
        }
    }
}

/// Risk ceiling; anything whose `risk_level` sits above it is dropped.
fn extreme_risk_threshold(t: f64) -> f64 {
    if t <= 0.4 {
        0.8
    } else {
        0.6
    }
}

fn layer_of(kpt: &KeyPoint) -> Layer {
    if kpt.score >= HIGH_CONFIDENCE_THRESHOLD {
        Layer::HighConfidence
    } else {
        Layer::Recommendation
    }
}

/// Full weight of one candidate at temperature `t`.
fn weigh(kpt: &KeyPoint, prompt: &str, prompt_tags: &BTreeSet<String>, t: f64) -> (f64, Layer) {
    let text = kpt.text.render();
    let coverage = tags::coverage(prompt_tags, &kpt.tags);
    let hits = tags::hits(prompt, &text) as f64;
    let clamped_score = kpt.score.clamp(-5, 20) as f64;
    let base = 10.0 * coverage + 3.0 * clamped_score + 5.0 * hits;

    let layer = layer_of(kpt);
    let mut mu = temperature_multiplier(layer, t);
    match layer {
        Layer::HighConfidence => {
            mu += 0.3 * kpt.effect_rating;
            if kpt.risk_level <= -0.5 {
                mu += 0.2;
            }
        }
        Layer::Recommendation => {
            mu += 0.4 * kpt.innovation_level;
            if kpt.risk_level >= -0.2 {
                mu *= 0.8;
            }
        }
    }

    (base * mu.max(WEIGHT_FLOOR), layer)
}

fn rank(a: &Scored, b: &Scored) -> Ordering {
    b.weight
        .partial_cmp(&a.weight)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.kpt.score.cmp(&a.kpt.score))
        .then_with(|| a.kpt.name.cmp(&b.kpt.name))
}

/// Select up to `limit` stable key points for injection, best first.
pub fn select<'a>(playbook: &'a Playbook, request: &SelectionRequest) -> Vec<Selected<'a>> {
    if request.limit == 0 {
        return Vec::new();
    }
    let t = request.temperature.clamp(0.0, 1.0);

    // Candidate filter: stable items that share a tag with the prompt
    // or mention one of its significant tokens.
    let stable: Vec<&KeyPoint> = playbook.stable().collect();
    let mut candidates: Vec<&KeyPoint> = stable
        .iter()
        .copied()
        .filter(|k| {
            k.tags.intersection(request.prompt_tags).next().is_some()
                || tags::hits(request.prompt, &k.text.render()) > 0
        })
        .collect();

    // Thin working set: relax by pulling in top-scored stable items.
    if candidates.len() < request.limit * 2 {
        let target = (request.limit * 2).max(RELAXED_POOL_FLOOR);
        let mut by_score = stable.clone();
        by_score.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
        for kpt in by_score {
            if candidates.len() >= target {
                break;
            }
            if !candidates.iter().any(|c| c.name == kpt.name) {
                candidates.push(kpt);
            }
        }
    }

    // Weigh, then gate extreme risk.
    let gate = extreme_risk_threshold(t);
    let mut pool: Vec<Scored<'a>> = candidates
        .into_iter()
        .filter(|k| k.risk_level <= gate)
        .map(|kpt| {
            let (weight, layer) = weigh(kpt, request.prompt, request.prompt_tags, t);
            Scored { kpt, weight, layer }
        })
        .collect();

    // Greedy pick with a diversity floor: once a primary tag owns half
    // the selection, remaining candidates under it lose half their
    // weight so a single topic cannot crowd out everything else.
    let mut selected: Vec<Selected<'a>> = Vec::with_capacity(request.limit);
    let mut tag_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut halved: BTreeSet<String> = BTreeSet::new();
    while selected.len() < request.limit && !pool.is_empty() {
        pool.sort_by(rank);
        let pick = pool.remove(0);
        if let Some(tag) = pick.kpt.primary_tag() {
            let tag = tag.to_string();
            let count = tag_counts.entry(tag.clone()).or_insert(0);
            *count += 1;
            if 2 * *count >= request.limit && !halved.contains(&tag) {
                for other in pool.iter_mut() {
                    if other.kpt.primary_tag() == Some(tag.as_str()) {
                        other.weight *= 0.5;
                    }
                }
                halved.insert(tag);
            }
        }
        selected.push(Selected {
            kpt: pick.kpt,
            weight: pick.weight,
            layer: pick.layer,
        });
    }
    selected
}
