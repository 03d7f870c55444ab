//! Assessment aggregate and lifecycle state machine.
//!
//! The assessment is the aggregate root of the pipeline. Its terminal fields
//! (`status`, `degraded`, the fused summary) are owned exclusively by the
//! fusion coordinator; every other component reads but never writes them.
//! Once terminal, scores and recommendations are frozen and further activity
//! lands in the append-only audit trail instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use assay_core::AssessmentId;

use crate::error::{Error, Result};
use crate::job::Stage;
use crate::snapshot::{ResponseSet, Snapshot};

/// Assessment lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentStatus {
    /// Created, learner still answering; not yet finalized.
    InProgress,
    /// Finalized; inline rule scores exist and async stages are running.
    AwaitingAsync,
    /// Fusion produced a final summary.
    Completed,
    /// Finalization failed validation; nothing was enqueued.
    Failed,
}

impl AssessmentStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::InProgress => matches!(target, Self::AwaitingAsync | Self::Failed),
            Self::AwaitingAsync => matches!(target, Self::Completed | Self::Failed),
            Self::Completed | Self::Failed => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::AwaitingAsync => "awaiting_async",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl Default for AssessmentStatus {
    fn default() -> Self {
        Self::InProgress
    }
}

impl std::fmt::Display for AssessmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// The assessment aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assessment {
    /// Unique assessment identifier.
    pub id: AssessmentId,
    /// Owning learner reference.
    pub owner: String,
    /// Lifecycle state.
    pub status: AssessmentStatus,
    /// True when any stage contributed fallback or missing data.
    pub degraded: bool,
    /// Which stages degraded, for explainable results.
    #[serde(default)]
    pub degraded_stages: Vec<Stage>,
    /// Caller-supplied idempotency key, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Frozen question/track bundle.
    pub snapshot: Snapshot,
    /// Locked response set.
    pub responses: ResponseSet,
    /// When the assessment was created.
    pub created_at: DateTime<Utc>,
    /// When the submission was finalized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    /// When a terminal state was reached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Assessment {
    /// Creates a new assessment in `InProgress`.
    #[must_use]
    pub fn new(owner: impl Into<String>, snapshot: Snapshot, responses: ResponseSet) -> Self {
        Self {
            id: AssessmentId::generate(),
            owner: owner.into(),
            status: AssessmentStatus::InProgress,
            degraded: false,
            degraded_stages: Vec::new(),
            idempotency_key: None,
            snapshot,
            responses,
            created_at: Utc::now(),
            submitted_at: None,
            completed_at: None,
        }
    }

    /// Attaches an idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Returns true if the assessment is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transitions to a new lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    #[tracing::instrument(
        skip(self),
        fields(assessment_id = %self.id, from = %self.status, to = %target)
    )]
    pub fn transition_to(&mut self, target: AssessmentStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: "assessment lifecycle does not allow this transition".to_string(),
            });
        }
        self.status = target;
        match target {
            AssessmentStatus::AwaitingAsync => self.submitted_at = Some(Utc::now()),
            AssessmentStatus::Completed | AssessmentStatus::Failed => {
                self.completed_at = Some(Utc::now());
            }
            AssessmentStatus::InProgress => {}
        }
        Ok(())
    }

    /// Records that a stage degraded, keeping the list deduplicated.
    pub fn record_degraded_stage(&mut self, stage: Stage) {
        self.degraded = true;
        if !self.degraded_stages.contains(&stage) {
            self.degraded_stages.push(stage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::TrackRef;

    fn assessment() -> Assessment {
        Assessment::new(
            "learner-1",
            Snapshot::new(TrackRef::new("backend-engineer", "Backend Engineer"), vec![]),
            ResponseSet::default(),
        )
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut a = assessment();
        a.transition_to(AssessmentStatus::AwaitingAsync).unwrap();
        assert!(a.submitted_at.is_some());
        a.transition_to(AssessmentStatus::Completed).unwrap();
        assert!(a.completed_at.is_some());
        assert!(a.is_terminal());
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let mut a = assessment();
        a.transition_to(AssessmentStatus::AwaitingAsync).unwrap();
        a.transition_to(AssessmentStatus::Completed).unwrap();
        let err = a.transition_to(AssessmentStatus::Failed);
        assert!(matches!(err, Err(Error::InvalidStateTransition { .. })));
    }

    #[test]
    fn cannot_complete_before_finalization() {
        let mut a = assessment();
        assert!(a.transition_to(AssessmentStatus::Completed).is_err());
    }

    #[test]
    fn degraded_stages_deduplicate() {
        let mut a = assessment();
        a.record_degraded_stage(Stage::Retrieve);
        a.record_degraded_stage(Stage::Retrieve);
        assert_eq!(a.degraded_stages, vec![Stage::Retrieve]);
        assert!(a.degraded);
    }
}
