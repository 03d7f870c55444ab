//! Immutable question/track snapshots captured at submission time.
//!
//! The snapshot provider hands the pipeline a frozen bundle of items, rules,
//! and rubrics when a submission is finalized. The pipeline never re-reads
//! live question definitions mid-assessment: every stage works from this
//! bundle, so a catalog edit cannot change an in-flight evaluation.

use serde::{Deserialize, Serialize};

use assay_core::ItemId;

use crate::error::{Error, Result};

/// The track a learner is being assessed against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackRef {
    /// Stable slug, e.g. `backend-engineer`.
    pub slug: String,
    /// Display title, e.g. `Backend Engineer`.
    pub title: String,
    /// Retrieval tags for this track (seed terms for the content index).
    #[serde(default)]
    pub tags: Vec<String>,
}

impl TrackRef {
    /// Creates a new track reference.
    #[must_use]
    pub fn new(slug: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            title: title.into(),
            tags: Vec::new(),
        }
    }

    /// Adds retrieval tags.
    #[must_use]
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// The kind of a question item, which determines its scoring path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Closed-form item with one correct option; scored inline by rule.
    Choice,
    /// Self-assessment item scored by an option-to-points map; inline.
    Profile,
    /// Open-ended item scored asynchronously by the external scorer.
    Essay,
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Choice => write!(f, "choice"),
            Self::Profile => write!(f, "profile"),
            Self::Essay => write!(f, "essay"),
        }
    }
}

/// Rule definition embedded in a snapshot item.
///
/// Closed-form kinds carry their scoring data here so the rule scorer is a
/// pure function over the snapshot; essay kinds carry the rubric text sent
/// to the external scorer instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ItemRule {
    /// Exact-match against the correct option (case-insensitive).
    CorrectOption {
        /// The option identifier that earns full credit.
        correct: String,
        /// All options presented to the learner.
        options: Vec<String>,
    },
    /// Option-to-points map; points are on a 0-100 scale.
    ScoringMap {
        /// Points awarded per option.
        points: std::collections::BTreeMap<String, f64>,
    },
    /// Any non-empty response earns full credit.
    Completeness,
    /// Rubric text for the external essay scorer.
    Rubric {
        /// The rubric prompt fragment.
        text: String,
    },
}

/// One question item frozen into the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotItem {
    /// Item identifier.
    pub item_id: ItemId,
    /// Scoring path for this item.
    pub kind: ItemKind,
    /// The question text shown to the learner.
    pub prompt: String,
    /// Relative weight of this item within the assessment.
    pub weight: f64,
    /// Topic tags, used for degraded-area retrieval signals.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Embedded scoring rule or rubric.
    pub rule: ItemRule,
}

/// The immutable bundle handed to the pipeline at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Track being assessed.
    pub track: TrackRef,
    /// Frozen question items.
    pub items: Vec<SnapshotItem>,
}

impl Snapshot {
    /// Creates a new snapshot.
    #[must_use]
    pub fn new(track: TrackRef, items: Vec<SnapshotItem>) -> Self {
        Self { track, items }
    }

    /// Returns items of the given kind.
    pub fn items_of_kind(&self, kind: ItemKind) -> impl Iterator<Item = &SnapshotItem> {
        self.items.iter().filter(move |item| item.kind == kind)
    }

    /// Returns true if the snapshot contains any open-ended items.
    #[must_use]
    pub fn has_essays(&self) -> bool {
        self.items_of_kind(ItemKind::Essay).next().is_some()
    }

    /// Validates structural integrity before any scoring happens.
    ///
    /// A malformed snapshot aborts finalization: it means the pipeline has
    /// nothing sound to enqueue, so failing here is the only path that fails
    /// an assessment outright.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSnapshot`] if any item is unusable.
    pub fn validate(&self) -> Result<()> {
        if self.items.is_empty() {
            return Err(Error::invalid_snapshot("snapshot contains no items"));
        }

        for item in &self.items {
            if item.weight <= 0.0 || !item.weight.is_finite() {
                return Err(Error::invalid_snapshot(format!(
                    "item {} has non-positive weight {}",
                    item.item_id, item.weight
                )));
            }

            match (&item.kind, &item.rule) {
                (ItemKind::Choice, ItemRule::CorrectOption { correct, options }) => {
                    if options.is_empty() {
                        return Err(Error::invalid_snapshot(format!(
                            "choice item {} has no options",
                            item.item_id
                        )));
                    }
                    if !options.iter().any(|o| o.eq_ignore_ascii_case(correct)) {
                        return Err(Error::invalid_snapshot(format!(
                            "choice item {} correct option '{}' is not among its options",
                            item.item_id, correct
                        )));
                    }
                }
                (ItemKind::Profile, ItemRule::ScoringMap { points }) => {
                    if points.is_empty() {
                        return Err(Error::invalid_snapshot(format!(
                            "profile item {} has an empty scoring map",
                            item.item_id
                        )));
                    }
                }
                (ItemKind::Profile, ItemRule::Completeness) => {}
                (ItemKind::Essay, ItemRule::Rubric { text }) => {
                    if text.trim().is_empty() {
                        return Err(Error::invalid_snapshot(format!(
                            "essay item {} has an empty rubric",
                            item.item_id
                        )));
                    }
                }
                (kind, _) => {
                    return Err(Error::invalid_snapshot(format!(
                        "item {} rule does not match its kind '{kind}'",
                        item.item_id
                    )));
                }
            }
        }

        Ok(())
    }
}

/// A learner's answer to one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResponse {
    /// The item answered.
    pub item_id: ItemId,
    /// Selected option (choice/profile) or free text (essay).
    pub answer: String,
}

/// The full response set locked at submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSet {
    /// Per-item answers.
    pub responses: Vec<ItemResponse>,
}

impl ResponseSet {
    /// Creates a response set from (item, answer) pairs.
    #[must_use]
    pub fn from_pairs(pairs: impl IntoIterator<Item = (ItemId, String)>) -> Self {
        Self {
            responses: pairs
                .into_iter()
                .map(|(item_id, answer)| ItemResponse { item_id, answer })
                .collect(),
        }
    }

    /// Looks up the trimmed answer for an item, if one was given.
    #[must_use]
    pub fn answer_for(&self, item_id: ItemId) -> Option<&str> {
        self.responses
            .iter()
            .find(|r| r.item_id == item_id)
            .map(|r| r.answer.trim())
            .filter(|a| !a.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choice_item(correct: &str, options: &[&str]) -> SnapshotItem {
        SnapshotItem {
            item_id: ItemId::generate(),
            kind: ItemKind::Choice,
            prompt: "Which HTTP verb is idempotent?".into(),
            weight: 1.0,
            tags: vec!["api".into()],
            rule: ItemRule::CorrectOption {
                correct: correct.into(),
                options: options.iter().map(|s| (*s).to_string()).collect(),
            },
        }
    }

    #[test]
    fn valid_snapshot_passes_validation() {
        let snapshot = Snapshot::new(
            TrackRef::new("backend-engineer", "Backend Engineer"),
            vec![choice_item("PUT", &["POST", "PUT"])],
        );
        assert!(snapshot.validate().is_ok());
    }

    #[test]
    fn empty_snapshot_is_rejected() {
        let snapshot = Snapshot::new(TrackRef::new("backend-engineer", "Backend Engineer"), vec![]);
        assert!(matches!(
            snapshot.validate(),
            Err(Error::InvalidSnapshot { .. })
        ));
    }

    #[test]
    fn choice_item_without_matching_correct_option_is_rejected() {
        let snapshot = Snapshot::new(
            TrackRef::new("backend-engineer", "Backend Engineer"),
            vec![choice_item("DELETE", &["POST", "PUT"])],
        );
        assert!(matches!(
            snapshot.validate(),
            Err(Error::InvalidSnapshot { .. })
        ));
    }

    #[test]
    fn zero_weight_is_rejected() {
        let mut item = choice_item("PUT", &["POST", "PUT"]);
        item.weight = 0.0;
        let snapshot = Snapshot::new(
            TrackRef::new("backend-engineer", "Backend Engineer"),
            vec![item],
        );
        assert!(matches!(
            snapshot.validate(),
            Err(Error::InvalidSnapshot { .. })
        ));
    }

    #[test]
    fn mismatched_rule_kind_is_rejected() {
        let item = SnapshotItem {
            item_id: ItemId::generate(),
            kind: ItemKind::Essay,
            prompt: "Explain caching.".into(),
            weight: 1.0,
            tags: vec![],
            rule: ItemRule::Completeness,
        };
        let snapshot = Snapshot::new(
            TrackRef::new("backend-engineer", "Backend Engineer"),
            vec![item],
        );
        assert!(matches!(
            snapshot.validate(),
            Err(Error::InvalidSnapshot { .. })
        ));
    }

    #[test]
    fn answer_lookup_trims_and_skips_empty() {
        let id = ItemId::generate();
        let set = ResponseSet::from_pairs([(id, "  PUT  ".to_string())]);
        assert_eq!(set.answer_for(id), Some("PUT"));

        let blank = ResponseSet::from_pairs([(id, "   ".to_string())]);
        assert_eq!(blank.answer_for(id), None);
    }
}
