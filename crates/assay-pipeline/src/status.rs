//! Read-only status and result projections.
//!
//! Progress is stage-weighted and intentionally coarse: a stage contributes
//! nothing until its job is terminal and its full weight afterwards. No
//! partial credit is tracked mid-stage, which keeps the projection free of
//! races against in-flight leases and makes reported progress monotonic.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use assay_core::AssessmentId;

use crate::artifact::FusionSummary;
use crate::assessment::AssessmentStatus;
use crate::error::{Error, Result};
use crate::job::Stage;
use crate::store::PipelineStore;
use crate::webhook::WebhookDelivery;

/// Progress weight of the inline rule scoring stage.
pub const RULE_WEIGHT: f64 = 20.0;
/// Progress weight of the essay scoring stage.
pub const ESSAY_WEIGHT: f64 = 30.0;
/// Progress weight of the retrieval stage.
pub const RETRIEVAL_WEIGHT: f64 = 30.0;
/// Progress weight of the fusion stage.
pub const FUSION_WEIGHT: f64 = 20.0;

/// Point-in-time progress of one stage.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageProgress {
    /// Stage name (`rule_score`, `essay_score`, `retrieve`, `fuse`).
    pub name: &'static str,
    /// Contribution to overall progress when complete.
    pub weight: f64,
    /// Current state label.
    pub state: String,
    /// True once the stage reached a terminal outcome.
    pub complete: bool,
}

/// Point-in-time view of an assessment.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// The assessment.
    pub assessment_id: AssessmentId,
    /// Lifecycle status label.
    pub status: AssessmentStatus,
    /// Whether any stage degraded so far.
    pub degraded: bool,
    /// Which stages degraded.
    pub degraded_stages: Vec<Stage>,
    /// Weighted overall progress, 0-100.
    pub progress: f64,
    /// Per-stage breakdown.
    pub stages: Vec<StageProgress>,
    /// When the submission was finalized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    /// When a terminal state was reached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result projection: the final payload or an explicit in-progress signal.
///
/// `GetResult` before completion never returns a partial payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ResultView {
    /// The assessment completed and the summary is final.
    Ready {
        /// The fused summary.
        summary: FusionSummary,
        /// Terminal status.
        status: AssessmentStatus,
        /// When fusion completed.
        #[serde(skip_serializing_if = "Option::is_none")]
        completed_at: Option<DateTime<Utc>>,
    },
    /// Still processing; poll again later.
    Processing {
        /// Current lifecycle status.
        status: AssessmentStatus,
        /// Weighted overall progress, 0-100.
        progress: f64,
    },
}

/// Read-only projection over assessments, jobs, and deliveries.
pub struct StatusAggregator {
    store: Arc<dyn PipelineStore>,
}

impl StatusAggregator {
    /// Creates an aggregator over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    /// Computes the weighted status report.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AssessmentNotFound`] for unknown assessments.
    pub async fn get_status(&self, assessment_id: AssessmentId) -> Result<StatusReport> {
        let Some(assessment) = self.store.get_assessment(&assessment_id).await? else {
            return Err(Error::AssessmentNotFound { assessment_id });
        };
        let jobs = self.store.jobs_for(&assessment_id).await?;

        let submitted = assessment.status != AssessmentStatus::InProgress;
        let mut stages = vec![StageProgress {
            name: "rule_score",
            weight: RULE_WEIGHT,
            state: if submitted { "succeeded" } else { "pending" }.to_string(),
            complete: submitted,
        }];

        for (stage, weight) in [
            (Stage::EssayScore, ESSAY_WEIGHT),
            (Stage::Retrieve, RETRIEVAL_WEIGHT),
            (Stage::Fuse, FUSION_WEIGHT),
        ] {
            let job = jobs.iter().find(|j| j.stage == stage);
            let (state, complete) = match job {
                Some(job) => (job.status.as_label().to_string(), job.is_terminal()),
                None => ("pending".to_string(), false),
            };
            stages.push(StageProgress {
                name: stage.as_label(),
                weight,
                state,
                complete,
            });
        }

        let progress = if assessment.is_terminal() {
            100.0
        } else {
            stages
                .iter()
                .filter(|s| s.complete)
                .map(|s| s.weight)
                .sum()
        };

        Ok(StatusReport {
            assessment_id,
            status: assessment.status,
            degraded: assessment.degraded,
            degraded_stages: assessment.degraded_stages,
            progress,
            stages,
            submitted_at: assessment.submitted_at,
            completed_at: assessment.completed_at,
        })
    }

    /// Returns the final result, or an explicit "still processing" signal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AssessmentNotFound`] for unknown assessments, and a
    /// storage error if a completed assessment has no summary (which the
    /// fusion coordinator's write ordering rules out).
    pub async fn get_result(&self, assessment_id: AssessmentId) -> Result<ResultView> {
        let Some(assessment) = self.store.get_assessment(&assessment_id).await? else {
            return Err(Error::AssessmentNotFound { assessment_id });
        };

        if assessment.status != AssessmentStatus::Completed {
            let progress = self.get_status(assessment_id).await?.progress;
            return Ok(ResultView::Processing {
                status: assessment.status,
                progress,
            });
        }

        let summary = self
            .store
            .get_fusion_summary(&assessment_id)
            .await?
            .ok_or_else(|| Error::storage("completed assessment has no fusion summary"))?;

        Ok(ResultView::Ready {
            summary,
            status: assessment.status,
            completed_at: assessment.completed_at,
        })
    }

    /// Webhook delivery log for the ops surface.
    ///
    /// Permanently failed deliveries are only visible here; they never
    /// affect assessment state.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn delivery_log(&self, assessment_id: AssessmentId) -> Result<Vec<WebhookDelivery>> {
        self.store.deliveries_for(&assessment_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assessment::Assessment;
    use crate::job::JobPayload;
    use crate::snapshot::{ResponseSet, Snapshot, TrackRef};
    use crate::store::memory::InMemoryStore;

    async fn seeded() -> (Arc<InMemoryStore>, AssessmentId) {
        let store = Arc::new(InMemoryStore::new());
        let mut a = Assessment::new(
            "learner-1",
            Snapshot::new(TrackRef::new("backend-engineer", "Backend Engineer"), vec![]),
            ResponseSet::default(),
        );
        a.status = AssessmentStatus::AwaitingAsync;
        let id = a.id;
        store.create_assessment(&a, None).await.unwrap();
        store
            .enqueue(id, JobPayload::EssayScore { item_ids: vec![] })
            .await
            .unwrap();
        store
            .enqueue(
                id,
                JobPayload::Retrieve {
                    track_slug: "backend-engineer".into(),
                    top_k: 8,
                },
            )
            .await
            .unwrap();
        store.enqueue(id, JobPayload::Fuse).await.unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn progress_starts_at_rule_weight_after_submission() {
        let (store, id) = seeded().await;
        let aggregator = StatusAggregator::new(store);
        let report = aggregator.get_status(id).await.unwrap();
        assert!((report.progress - 20.0).abs() < f64::EPSILON);
        assert_eq!(report.stages.len(), 4);
    }

    #[tokio::test]
    async fn progress_adds_stage_weight_on_terminal_job() {
        let (store, id) = seeded().await;
        let job = store
            .lease(Stage::Retrieve, "w", std::time::Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        store.complete_job(&job.id, "w", "recommendations").await.unwrap();

        let aggregator = StatusAggregator::new(store);
        let report = aggregator.get_status(id).await.unwrap();
        assert!((report.progress - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn result_is_processing_until_completed() {
        let (store, id) = seeded().await;
        let aggregator = StatusAggregator::new(store);
        match aggregator.get_result(id).await.unwrap() {
            ResultView::Processing { status, progress } => {
                assert_eq!(status, AssessmentStatus::AwaitingAsync);
                assert!((progress - 20.0).abs() < f64::EPSILON);
            }
            ResultView::Ready { .. } => panic!("result must not be ready yet"),
        }
    }

    #[tokio::test]
    async fn unknown_assessment_is_an_error() {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
        let aggregator = StatusAggregator::new(store);
        let missing = AssessmentId::generate();
        assert!(matches!(
            aggregator.get_status(missing).await,
            Err(Error::AssessmentNotFound { .. })
        ));
    }
}
