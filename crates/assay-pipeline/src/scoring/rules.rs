//! Deterministic rule scoring of closed-form items.
//!
//! A pure function over the response snapshot and the rule definitions
//! embedded in the question snapshot. Runs synchronously inside submission
//! finalization and is never retried: it cannot fail except on malformed
//! input, which aborts finalization before any job is enqueued.

use chrono::Utc;

use assay_core::AssessmentId;

use crate::artifact::{RuleItemScore, RuleScoreSet};
use crate::error::Result;
use crate::snapshot::{ItemKind, ItemRule, ResponseSet, Snapshot, SnapshotItem};

/// Full credit for a weight-1.0 item.
pub const ITEM_MAX_SCORE: f64 = 100.0;

/// Scores every closed-form item in the snapshot.
///
/// Essay items are skipped; they belong to the asynchronous scoring stage.
///
/// # Errors
///
/// Returns [`crate::error::Error::InvalidSnapshot`] when the snapshot fails
/// structural validation.
pub fn score_rules(
    assessment_id: AssessmentId,
    snapshot: &Snapshot,
    responses: &ResponseSet,
) -> Result<RuleScoreSet> {
    snapshot.validate()?;

    let items = snapshot
        .items
        .iter()
        .filter(|item| item.kind != ItemKind::Essay)
        .map(|item| score_item(item, responses))
        .collect();

    Ok(RuleScoreSet {
        assessment_id,
        items,
        scored_at: Utc::now(),
    })
}

fn score_item(item: &SnapshotItem, responses: &ResponseSet) -> RuleItemScore {
    let max_points = ITEM_MAX_SCORE * item.weight;
    let base = |points: f64, rule: &'static str, explanation: String| RuleItemScore {
        item_id: item.item_id,
        kind: item.kind,
        points,
        max_points,
        rule: rule.to_string(),
        explanation,
        tags: item.tags.clone(),
    };

    let Some(answer) = responses.answer_for(item.item_id) else {
        return base(0.0, "no_response", "no answer given".to_string());
    };

    match &item.rule {
        ItemRule::CorrectOption { correct, .. } => {
            if answer.eq_ignore_ascii_case(correct) {
                base(max_points, "exact_match", "correct answer".to_string())
            } else {
                base(
                    0.0,
                    "exact_match",
                    format!("expected '{correct}', got '{answer}'"),
                )
            }
        }
        ItemRule::ScoringMap { points } => {
            let matched = points
                .iter()
                .find(|(option, _)| option.eq_ignore_ascii_case(answer));
            match matched {
                Some((_, raw)) => {
                    let scaled = (raw / ITEM_MAX_SCORE) * max_points;
                    base(scaled, "scoring_map", format!("profile option scores {raw}"))
                }
                None => base(
                    0.0,
                    "scoring_map",
                    format!("option '{answer}' is not in the scoring map"),
                ),
            }
        }
        ItemRule::Completeness => base(
            max_points,
            "completeness",
            "profile answered".to_string(),
        ),
        // Unreachable for validated snapshots: essay items are filtered out
        // and validation rejects mismatched rules.
        ItemRule::Rubric { .. } => base(0.0, "no_rule", "item has no inline rule".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::TrackRef;
    use assay_core::ItemId;
    use std::collections::BTreeMap;

    fn choice(correct: &str) -> SnapshotItem {
        SnapshotItem {
            item_id: ItemId::generate(),
            kind: ItemKind::Choice,
            prompt: "Pick one.".into(),
            weight: 1.0,
            tags: vec!["api".into()],
            rule: ItemRule::CorrectOption {
                correct: correct.into(),
                options: vec!["A".into(), "B".into(), correct.into()],
            },
        }
    }

    fn profile_map() -> SnapshotItem {
        let mut points = BTreeMap::new();
        points.insert("A".to_string(), 20.0);
        points.insert("B".to_string(), 60.0);
        points.insert("C".to_string(), 100.0);
        SnapshotItem {
            item_id: ItemId::generate(),
            kind: ItemKind::Profile,
            prompt: "Experience level?".into(),
            weight: 1.0,
            tags: vec![],
            rule: ItemRule::ScoringMap { points },
        }
    }

    fn snapshot(items: Vec<SnapshotItem>) -> Snapshot {
        Snapshot::new(TrackRef::new("backend-engineer", "Backend Engineer"), items)
    }

    #[test]
    fn correct_choice_earns_full_weighted_credit() {
        let mut item = choice("C");
        item.weight = 2.0;
        let id = item.item_id;
        let set = score_rules(
            AssessmentId::generate(),
            &snapshot(vec![item]),
            &ResponseSet::from_pairs([(id, "c".to_string())]),
        )
        .unwrap();
        assert_eq!(set.items.len(), 1);
        assert!((set.items[0].points - 200.0).abs() < f64::EPSILON);
        assert_eq!(set.items[0].rule, "exact_match");
    }

    #[test]
    fn wrong_choice_earns_zero() {
        let item = choice("C");
        let id = item.item_id;
        let set = score_rules(
            AssessmentId::generate(),
            &snapshot(vec![item]),
            &ResponseSet::from_pairs([(id, "A".to_string())]),
        )
        .unwrap();
        assert_eq!(set.items[0].points, 0.0);
    }

    #[test]
    fn missing_response_scores_zero_with_explanation() {
        let item = choice("C");
        let set = score_rules(
            AssessmentId::generate(),
            &snapshot(vec![item]),
            &ResponseSet::default(),
        )
        .unwrap();
        assert_eq!(set.items[0].points, 0.0);
        assert_eq!(set.items[0].rule, "no_response");
    }

    #[test]
    fn profile_scoring_map_scales_points() {
        let item = profile_map();
        let id = item.item_id;
        let set = score_rules(
            AssessmentId::generate(),
            &snapshot(vec![item]),
            &ResponseSet::from_pairs([(id, "B".to_string())]),
        )
        .unwrap();
        assert!((set.items[0].points - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_profile_option_scores_zero() {
        let item = profile_map();
        let id = item.item_id;
        let set = score_rules(
            AssessmentId::generate(),
            &snapshot(vec![item]),
            &ResponseSet::from_pairs([(id, "Z".to_string())]),
        )
        .unwrap();
        assert_eq!(set.items[0].points, 0.0);
    }

    #[test]
    fn essay_items_are_excluded() {
        let essay = SnapshotItem {
            item_id: ItemId::generate(),
            kind: ItemKind::Essay,
            prompt: "Explain idempotency.".into(),
            weight: 1.0,
            tags: vec![],
            rule: ItemRule::Rubric {
                text: "clarity, accuracy, coherence".into(),
            },
        };
        let set = score_rules(
            AssessmentId::generate(),
            &snapshot(vec![choice("C"), essay]),
            &ResponseSet::default(),
        )
        .unwrap();
        assert_eq!(set.items.len(), 1);
    }

    #[test]
    fn malformed_snapshot_aborts() {
        let result = score_rules(
            AssessmentId::generate(),
            &snapshot(vec![]),
            &ResponseSet::default(),
        );
        assert!(result.is_err());
    }
}
