//! Immutable stage output artifacts.
//!
//! Each pipeline stage produces exactly one artifact per assessment per
//! successful attempt. A retry may overwrite an artifact only while the
//! owning stage job has not reached `Succeeded`; once the stage succeeds
//! its artifact is frozen (the store enforces this).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use assay_core::{AssessmentId, ItemId};

use crate::snapshot::ItemKind;

/// Per-item result of the inline rule scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleItemScore {
    /// The item scored.
    pub item_id: ItemId,
    /// The item's kind (choice or profile).
    pub kind: ItemKind,
    /// Points awarded.
    pub points: f64,
    /// Maximum points for this item (weight-scaled).
    pub max_points: f64,
    /// Name of the rule that produced the score.
    pub rule: String,
    /// Human-readable explanation.
    pub explanation: String,
    /// Topic tags copied from the snapshot item.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl RuleItemScore {
    /// Score as a fraction of the maximum, 0 when the maximum is 0.
    #[must_use]
    pub fn ratio(&self) -> f64 {
        if self.max_points > 0.0 {
            self.points / self.max_points
        } else {
            0.0
        }
    }
}

/// Aggregated output of the inline rule scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleScoreSet {
    /// Owning assessment.
    pub assessment_id: AssessmentId,
    /// Per-item breakdown.
    pub items: Vec<RuleItemScore>,
    /// When the scores were computed.
    pub scored_at: DateTime<Utc>,
}

impl RuleScoreSet {
    /// Total points across all items.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.items.iter().map(|i| i.points).sum()
    }

    /// Maximum possible points across all items.
    #[must_use]
    pub fn max_total(&self) -> f64 {
        self.items.iter().map(|i| i.max_points).sum()
    }

    /// Overall percentage (0-100), 0 when no items were scored.
    #[must_use]
    pub fn percentage(&self) -> f64 {
        let max = self.max_total();
        if max > 0.0 {
            self.total() / max * 100.0
        } else {
            0.0
        }
    }

    /// Tags of items that scored below the given ratio.
    ///
    /// Used by the retrieval stage to bias the query toward weak areas.
    #[must_use]
    pub fn weak_area_tags(&self, threshold: f64) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();
        for item in &self.items {
            if item.ratio() < threshold {
                for tag in &item.tags {
                    if !tags.contains(tag) {
                        tags.push(tag.clone());
                    }
                }
            }
        }
        tags
    }
}

/// Structured rubric response from the external scorer, each dimension in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RubricScores {
    /// How clearly the answer is expressed.
    pub clarity: f64,
    /// Factual and technical accuracy.
    pub accuracy: f64,
    /// Logical structure of the argument.
    pub coherence: f64,
}

impl RubricScores {
    /// Mean of the three dimensions.
    #[must_use]
    pub fn mean(&self) -> f64 {
        (self.clarity + self.accuracy + self.coherence) / 3.0
    }

    /// Clamps every dimension into [0, 1], reporting whether anything moved.
    ///
    /// A scorer occasionally returns values outside the contract range; the
    /// item is kept but flagged suspect instead of failing the whole stage.
    #[must_use]
    pub fn clamped(self) -> (Self, bool) {
        let clamp = |v: f64| v.clamp(0.0, 1.0);
        let clamped = Self {
            clarity: clamp(self.clarity),
            accuracy: clamp(self.accuracy),
            coherence: clamp(self.coherence),
        };
        let moved = clamped != self;
        (clamped, moved)
    }
}

/// Scored rubric for one open-ended item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EssayItemScore {
    /// The item scored.
    pub item_id: ItemId,
    /// Rubric dimensions after clamping.
    pub scores: RubricScores,
    /// True when the scorer returned an out-of-range value that was clamped.
    pub suspect: bool,
    /// Item weight copied from the snapshot.
    pub weight: f64,
    /// Scorer latency for this item.
    pub latency_ms: u64,
}

/// Aggregated output of the essay scoring stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EssayScoreSet {
    /// Owning assessment.
    pub assessment_id: AssessmentId,
    /// Per-item rubric scores (only items that scored successfully).
    pub items: Vec<EssayItemScore>,
    /// Items the scorer failed on after retries within the attempt.
    #[serde(default)]
    pub failed_items: Vec<ItemId>,
    /// Identifier of the scoring model, as reported by the scorer.
    pub model: String,
    /// When the set was produced.
    pub scored_at: DateTime<Utc>,
}

impl EssayScoreSet {
    /// Weighted percentage (0-100) across scored items.
    #[must_use]
    pub fn percentage(&self) -> f64 {
        let weight_sum: f64 = self.items.iter().map(|i| i.weight).sum();
        if weight_sum <= 0.0 {
            return 0.0;
        }
        let weighted: f64 = self.items.iter().map(|i| i.scores.mean() * i.weight).sum();
        weighted / weight_sum * 100.0
    }

    /// True when some items failed while others scored.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.failed_items.is_empty() && !self.items.is_empty()
    }
}

/// One ranked catalog entry in a recommendation set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationItem {
    /// 1-indexed rank.
    pub rank: u32,
    /// Catalog entry identifier.
    pub entry_id: String,
    /// Entry title.
    pub title: String,
    /// Similarity score reported by the index (or the fixed fallback score).
    pub similarity: f64,
    /// Source snippet retained for provenance.
    pub snippet: String,
}

/// Aggregated output of the retrieval stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationSet {
    /// Owning assessment.
    pub assessment_id: AssessmentId,
    /// Ranked entries, best first.
    pub items: Vec<RecommendationItem>,
    /// Query terms sent to the index (provenance trace).
    pub query_terms: Vec<String>,
    /// True when the static fallback table was used instead of the index.
    pub degraded: bool,
    /// When the set was produced.
    pub generated_at: DateTime<Utc>,
}

/// Score breakdown carried on the final summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    /// Rule-scored percentage (0-100).
    pub rule_pct: f64,
    /// Essay percentage (0-100); `None` when no essay artifact exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub essay_pct: Option<f64>,
    /// Blended overall percentage (0-100).
    pub overall_pct: f64,
}

/// Final fused output, written exactly once by the fusion coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionSummary {
    /// Owning assessment.
    pub assessment_id: AssessmentId,
    /// Narrative summary of the evaluation.
    pub summary: String,
    /// Numeric breakdown backing the narrative.
    pub breakdown: ScoreBreakdown,
    /// Ranked recommendation items (may be empty on full degradation).
    pub recommendations: Vec<RecommendationItem>,
    /// True when any stage contributed fallback or missing data.
    pub degraded: bool,
    /// Explanation of what degraded, naming the stages involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
    /// When fusion completed.
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rubric_clamping_flags_out_of_range_values() {
        let raw = RubricScores {
            clarity: 1.4,
            accuracy: 0.8,
            coherence: -0.1,
        };
        let (clamped, moved) = raw.clamped();
        assert!(moved);
        assert_eq!(clamped.clarity, 1.0);
        assert_eq!(clamped.accuracy, 0.8);
        assert_eq!(clamped.coherence, 0.0);
    }

    #[test]
    fn rubric_clamping_is_noop_in_range() {
        let raw = RubricScores {
            clarity: 0.2,
            accuracy: 0.9,
            coherence: 1.0,
        };
        let (clamped, moved) = raw.clamped();
        assert!(!moved);
        assert_eq!(clamped, raw);
    }

    #[test]
    fn rule_score_set_percentage() {
        let set = RuleScoreSet {
            assessment_id: AssessmentId::generate(),
            items: vec![
                RuleItemScore {
                    item_id: ItemId::generate(),
                    kind: ItemKind::Choice,
                    points: 100.0,
                    max_points: 100.0,
                    rule: "exact_match".into(),
                    explanation: "correct".into(),
                    tags: vec!["api".into()],
                },
                RuleItemScore {
                    item_id: ItemId::generate(),
                    kind: ItemKind::Choice,
                    points: 0.0,
                    max_points: 100.0,
                    rule: "exact_match".into(),
                    explanation: "incorrect".into(),
                    tags: vec!["sql".into()],
                },
            ],
            scored_at: Utc::now(),
        };
        assert!((set.percentage() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn weak_area_tags_deduplicate_and_filter() {
        let make = |points: f64, tag: &str| RuleItemScore {
            item_id: ItemId::generate(),
            kind: ItemKind::Choice,
            points,
            max_points: 100.0,
            rule: "exact_match".into(),
            explanation: String::new(),
            tags: vec![tag.to_string()],
        };
        let set = RuleScoreSet {
            assessment_id: AssessmentId::generate(),
            items: vec![make(0.0, "sql"), make(10.0, "sql"), make(100.0, "api")],
            scored_at: Utc::now(),
        };
        assert_eq!(set.weak_area_tags(0.6), vec!["sql".to_string()]);
    }

    #[test]
    fn essay_percentage_weights_items() {
        let set = EssayScoreSet {
            assessment_id: AssessmentId::generate(),
            items: vec![
                EssayItemScore {
                    item_id: ItemId::generate(),
                    scores: RubricScores {
                        clarity: 1.0,
                        accuracy: 1.0,
                        coherence: 1.0,
                    },
                    suspect: false,
                    weight: 3.0,
                    latency_ms: 1200,
                },
                EssayItemScore {
                    item_id: ItemId::generate(),
                    scores: RubricScores {
                        clarity: 0.0,
                        accuracy: 0.0,
                        coherence: 0.0,
                    },
                    suspect: false,
                    weight: 1.0,
                    latency_ms: 900,
                },
            ],
            failed_items: vec![],
            model: "scorer-v2".into(),
            scored_at: Utc::now(),
        };
        assert!((set.percentage() - 75.0).abs() < 1e-9);
    }
}
