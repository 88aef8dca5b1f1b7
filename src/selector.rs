//! Fashion-model selection.
//!
//! Every candidate gets an additive score from the weight table in
//! [`ScoringWeights`]. Candidates matching both the target gender and the
//! mapped garment category exactly are always ranked ahead of the rest; within
//! a rank the highest score wins, with a small random jitter breaking ties.

use crate::catalog::{FashionModel, Gender, ModelCategory};
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

const FORMAL_KEYWORDS: &[&str] = &[
    "suit", "blazer", "formal", "tuxedo", "dress shirt", "business", "office",
];
const EVENING_KEYWORDS: &[&str] = &["dress", "gown", "evening", "cocktail", "party"];
const ATHLETIC_KEYWORDS: &[&str] = &[
    "sport", "gym", "athletic", "running", "yoga", "workout", "jersey", "track", "tracksuit",
];
const CASUAL_KEYWORDS: &[&str] = &[
    "casual", "t-shirt", "tshirt", "tee", "jeans", "denim", "hoodie", "sweatshirt",
];

/// Lowercased alphanumeric words of a free-text label.
pub(crate) fn label_words(label: &str) -> Vec<String> {
    label
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// True when some keyword lines up with whole words of `words`. The last
/// word of a keyword may carry a plural `s`/`es`, so "dress" matches
/// "dresses" but "tee" never matches "sateen".
pub(crate) fn mentions_any(words: &[String], keywords: &[&str]) -> bool {
    keywords.iter().any(|keyword| {
        let wanted = label_words(keyword);
        let Some((last, head)) = wanted.split_last() else {
            return false;
        };
        words.windows(wanted.len()).any(|window| {
            window[..head.len()] == *head && same_or_plural(&window[head.len()], last)
        })
    })
}

fn same_or_plural(word: &str, stem: &str) -> bool {
    matches!(word.strip_prefix(stem), Some("" | "s" | "es"))
}

/// Maps a free-text garment label onto a model category.
pub fn map_garment_to_category(label: &str) -> ModelCategory {
    let words = label_words(label);
    let has_any = |keywords: &[&str]| mentions_any(&words, keywords);
    if has_any(FORMAL_KEYWORDS) {
        ModelCategory::Formal
    } else if has_any(EVENING_KEYWORDS) {
        ModelCategory::Evening
    } else if has_any(ATHLETIC_KEYWORDS) {
        ModelCategory::Athletic
    } else if has_any(CASUAL_KEYWORDS) {
        ModelCategory::Casual
    } else {
        ModelCategory::General
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CategoryAffinity {
    pub between: [ModelCategory; 2],
    pub weight: f64,
}

impl CategoryAffinity {
    fn links(&self, a: ModelCategory, b: ModelCategory) -> bool {
        (self.between[0] == a && self.between[1] == b)
            || (self.between[0] == b && self.between[1] == a)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub gender_exact: f64,
    pub gender_unisex: f64,
    pub gender_mismatch: f64,
    pub category_exact: f64,
    pub category_general: f64,
    pub category_affinities: Vec<CategoryAffinity>,
    /// Awarded in full at a 100% success rate, linearly below.
    pub success_rate_max: f64,
    pub recent_usage_per_use: f64,
    pub recent_usage_cap: f64,
    pub overuse_threshold: u64,
    pub overuse_penalty: f64,
    pub featured: f64,
    pub interactions_factor: f64,
    pub interactions_cap: f64,
    pub sort_order_base: f64,
    pub legacy_usage_factor: f64,
    pub legacy_usage_cap: f64,
    pub jitter_max: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        use ModelCategory::*;
        let affinity = |a, b, weight| CategoryAffinity {
            between: [a, b],
            weight,
        };
        Self {
            gender_exact: 100.0,
            gender_unisex: 80.0,
            gender_mismatch: 20.0,
            category_exact: 60.0,
            category_general: 35.0,
            category_affinities: vec![
                affinity(Formal, Evening, 15.0),
                affinity(Casual, Athletic, 12.0),
                affinity(Casual, Formal, 5.0),
                affinity(General, Formal, 8.0),
                affinity(General, Casual, 8.0),
                affinity(General, Athletic, 8.0),
                affinity(General, Evening, 8.0),
            ],
            success_rate_max: 30.0,
            recent_usage_per_use: 1.5,
            recent_usage_cap: 15.0,
            overuse_threshold: 50,
            overuse_penalty: 5.0,
            featured: 20.0,
            interactions_factor: 0.1,
            interactions_cap: 15.0,
            sort_order_base: 15.0,
            legacy_usage_factor: 0.05,
            legacy_usage_cap: 10.0,
            jitter_max: 3.0,
        }
    }
}

impl ScoringWeights {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).wrap_err("parsing scoring weights yaml")
    }

    pub fn from_yaml_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path).wrap_err("reading scoring weights file")?;
        Self::from_yaml_str(&raw)
    }

    fn affinity(&self, target: ModelCategory, model: ModelCategory) -> f64 {
        self.category_affinities
            .iter()
            .filter(|a| a.links(target, model))
            .map(|a| a.weight)
            .fold(0.0, f64::max)
    }
}

/// Per-factor score for one candidate, excluding jitter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub gender: f64,
    pub category: f64,
    pub success_rate: f64,
    pub recent_usage: f64,
    pub featured: f64,
    pub interactions: f64,
    pub sort_order: f64,
    pub legacy_usage: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.gender
            + self.category
            + self.success_rate
            + self.recent_usage
            + self.featured
            + self.interactions
            + self.sort_order
            + self.legacy_usage
    }
}

/// Deterministic part of the score.
pub fn score_model(
    model: &FashionModel,
    gender: Gender,
    category: ModelCategory,
    weights: &ScoringWeights,
    now: DateTime<Utc>,
) -> ScoreBreakdown {
    let telemetry = &model.telemetry;

    let gender_score = if model.gender == gender {
        weights.gender_exact
    } else if model.gender == Gender::Unisex {
        weights.gender_unisex
    } else {
        weights.gender_mismatch
    };

    let category_score = if model.category == category {
        weights.category_exact
    } else if model.category == ModelCategory::General {
        weights.category_general
    } else {
        weights.affinity(category, model.category)
    };

    let success = telemetry.success_rate.clamp(0.0, 100.0) / 100.0 * weights.success_rate_max;

    let recent = telemetry.recent_usage_at(now) as f64 * weights.recent_usage_per_use;
    let mut recent = recent.min(weights.recent_usage_cap);
    if telemetry.usage_count > weights.overuse_threshold {
        recent -= weights.overuse_penalty;
    }

    ScoreBreakdown {
        gender: gender_score,
        category: category_score,
        success_rate: success,
        recent_usage: recent.max(0.0),
        featured: if model.is_featured { weights.featured } else { 0.0 },
        interactions: (telemetry.total_interactions as f64 * weights.interactions_factor)
            .min(weights.interactions_cap),
        sort_order: (weights.sort_order_base - model.sort_order as f64).max(0.0),
        legacy_usage: (telemetry.usage_count as f64 * weights.legacy_usage_factor)
            .min(weights.legacy_usage_cap),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedModel {
    pub model: FashionModel,
    pub exact_match: bool,
    pub breakdown: ScoreBreakdown,
    pub jitter: f64,
    pub score: f64,
}

/// Scores every candidate and returns the winner, or `None` for an empty set.
pub fn select_best<R: Rng + ?Sized>(
    candidates: &[FashionModel],
    gender: Gender,
    category: ModelCategory,
    weights: &ScoringWeights,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Option<RankedModel> {
    candidates
        .iter()
        .map(|model| {
            let breakdown = score_model(model, gender, category, weights, now);
            let jitter = if weights.jitter_max > 0.0 {
                rng.random_range(0.0..weights.jitter_max)
            } else {
                0.0
            };
            RankedModel {
                model: model.clone(),
                exact_match: model.gender == gender && model.category == category,
                breakdown,
                jitter,
                score: breakdown.total() + jitter,
            }
        })
        .max_by(|a, b| {
            a.exact_match.cmp(&b.exact_match).then_with(|| {
                a.score
                    .partial_cmp(&b.score)
                    .unwrap_or(Ordering::Equal)
            })
        })
}

/// Selection entry point: a pinned id bypasses scoring.
pub fn select_model<R: Rng + ?Sized>(
    candidates: &[FashionModel],
    gender: Gender,
    garment_category: &str,
    pinned_id: Option<&str>,
    weights: &ScoringWeights,
    rng: &mut R,
) -> Option<RankedModel> {
    let category = map_garment_to_category(garment_category);
    let now = Utc::now();
    if let Some(pinned) = pinned_id {
        return candidates.iter().find(|m| m.id == pinned).map(|model| {
            let breakdown = score_model(model, gender, category, weights, now);
            RankedModel {
                model: model.clone(),
                exact_match: model.gender == gender && model.category == category,
                breakdown,
                jitter: 0.0,
                score: breakdown.total(),
            }
        });
    }
    select_best(candidates, gender, category, weights, now, rng)
}
