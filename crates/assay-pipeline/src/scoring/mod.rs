//! Scoring stages: inline deterministic rules and asynchronous essay scoring.

pub mod essay;
pub mod rules;

pub use essay::{EssayScorer, ScoreRequest, ScoredRubric, ScorerError};
pub use rules::score_rules;
