//! Fan-in fusion of rule scores, essay scores, and recommendations.
//!
//! The coordinator is triggered by completion of either upstream stage and
//! re-checks predecessor states on every trigger; it proceeds only once both
//! `essay_score` and `retrieve` have reached a terminal outcome (success or
//! dead-letter). A dead-lettered stage without a usable artifact degrades
//! the result instead of blocking it: bounded retries guarantee both
//! predecessors terminate, so fusion always eventually runs.
//!
//! This module is the **single writer** of terminal assessment state. The
//! terminal transition is a conditional update that only succeeds while the
//! status is not yet terminal, so concurrent triggers elect exactly one
//! winner.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use assay_core::AssessmentId;

use crate::artifact::{
    EssayScoreSet, FusionSummary, RecommendationItem, RuleScoreSet, ScoreBreakdown,
};
use crate::assessment::{Assessment, AssessmentStatus};
use crate::error::Result;
use crate::events::{EventKind, EventSink, PipelineEvent};
use crate::job::{JobError, JobStatus, Stage, StageJob};
use crate::metrics::PipelineMetrics;
use crate::retrieval::fallback_for_track;
use crate::store::{PipelineStore, TerminalWrite};
use crate::webhook::WebhookNotifier;
use crate::worker::{StageHandler, StageOutcome};

/// Join progress observed by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinState {
    /// Retrieval finished; still waiting on essay scoring.
    WaitingEssay,
    /// Essay scoring finished; still waiting on retrieval.
    WaitingRetrieval,
    /// Neither predecessor is terminal yet.
    WaitingBoth,
    /// Both predecessors are terminal; fusion may run.
    Fusing,
    /// The assessment already reached a terminal state.
    Done,
}

impl JoinState {
    /// Computes the join state from predecessor jobs.
    ///
    /// A missing job counts as not-yet-terminal: the join never runs ahead
    /// of the dispatcher.
    #[must_use]
    pub fn observe(
        assessment: &Assessment,
        essay: Option<&StageJob>,
        retrieve: Option<&StageJob>,
    ) -> Self {
        if assessment.is_terminal() {
            return Self::Done;
        }
        let essay_terminal = essay.is_some_and(StageJob::is_terminal);
        let retrieve_terminal = retrieve.is_some_and(StageJob::is_terminal);
        match (essay_terminal, retrieve_terminal) {
            (true, true) => Self::Fusing,
            (false, true) => Self::WaitingEssay,
            (true, false) => Self::WaitingRetrieval,
            (false, false) => Self::WaitingBoth,
        }
    }
}

/// Result of one fusion attempt.
#[derive(Debug)]
pub enum FusionOutcome {
    /// Both predecessors were terminal and a summary now exists.
    Fused {
        /// Whether this call performed the terminal write.
        write: TerminalWrite,
        /// Whether the fused result is degraded.
        degraded: bool,
    },
    /// The join predicate is not satisfied yet.
    NotReady(JoinState),
}

/// Coordinates the fan-in join and writes terminal assessment state.
pub struct FusionCoordinator {
    store: Arc<dyn PipelineStore>,
    metrics: PipelineMetrics,
}

impl FusionCoordinator {
    /// Creates a coordinator over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self {
            store,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Attempts to fuse the assessment.
    ///
    /// Idempotent: re-triggering after the terminal write is a no-op that
    /// reports `Fused` with `TerminalWrite::AlreadyTerminal`.
    ///
    /// # Errors
    ///
    /// Returns storage errors. Join-not-ready is reported through
    /// [`FusionOutcome::NotReady`], never as an error.
    #[tracing::instrument(skip(self), fields(assessment_id = %assessment_id))]
    pub async fn fuse(&self, assessment_id: AssessmentId) -> Result<FusionOutcome> {
        let Some(assessment) = self.store.get_assessment(&assessment_id).await? else {
            return Err(crate::error::Error::AssessmentNotFound { assessment_id });
        };

        let essay_job = self.store.get_job(&assessment_id, Stage::EssayScore).await?;
        let retrieve_job = self.store.get_job(&assessment_id, Stage::Retrieve).await?;
        let join = JoinState::observe(&assessment, essay_job.as_ref(), retrieve_job.as_ref());

        match join {
            JoinState::Done => {
                return Ok(FusionOutcome::Fused {
                    write: TerminalWrite::AlreadyTerminal {
                        actual: assessment.status,
                    },
                    degraded: assessment.degraded,
                });
            }
            JoinState::Fusing => {}
            waiting => return Ok(FusionOutcome::NotReady(waiting)),
        }

        let rules = self.store.get_rule_scores(&assessment_id).await?;
        let essays = self.store.get_essay_scores(&assessment_id).await?;
        let recommendations = self.store.get_recommendations(&assessment_id).await?;

        // Rule scores are written inline at finalization; their absence means
        // the pipeline has nothing trustworthy to summarize.
        let Some(rules) = rules else {
            tracing::error!("rule score artifact missing at fusion time");
            let write = self
                .store
                .finalize_assessment(&assessment_id, AssessmentStatus::Failed, true)
                .await?;
            return Ok(FusionOutcome::Fused {
                write,
                degraded: true,
            });
        };

        let summary = compose_summary(
            &assessment,
            &rules,
            essays.as_ref(),
            recommendations.as_ref(),
            essay_job.as_ref(),
            retrieve_job.as_ref(),
        );
        let degraded = summary.degraded;

        if let Err(e) = self.store.put_fusion_summary(&summary).await {
            // A concurrent trigger may have finalized between our join check
            // and this write; re-read before treating it as a failure.
            let current = self.store.get_assessment(&assessment_id).await?;
            if let Some(current) = current.filter(Assessment::is_terminal) {
                return Ok(FusionOutcome::Fused {
                    write: TerminalWrite::AlreadyTerminal {
                        actual: current.status,
                    },
                    degraded: current.degraded,
                });
            }
            return Err(e);
        }

        let write = self
            .store
            .finalize_assessment(&assessment_id, AssessmentStatus::Completed, degraded)
            .await?;

        if write.is_applied() {
            self.metrics.record_fusion(degraded);
            tracing::info!(
                degraded,
                overall_pct = summary.breakdown.overall_pct,
                "assessment fused"
            );
        }

        Ok(FusionOutcome::Fused { write, degraded })
    }
}

/// Builds the fused summary from whatever artifacts exist.
fn compose_summary(
    assessment: &Assessment,
    rules: &RuleScoreSet,
    essays: Option<&EssayScoreSet>,
    recommendations: Option<&crate::artifact::RecommendationSet>,
    essay_job: Option<&StageJob>,
    retrieve_job: Option<&StageJob>,
) -> FusionSummary {
    let mut degraded_notes: Vec<String> = Vec::new();

    let essay_dead = essay_job.is_some_and(|j| j.status == JobStatus::DeadLetter);
    let retrieve_dead = retrieve_job.is_some_and(|j| j.status == JobStatus::DeadLetter);

    let has_essay_items = assessment.snapshot.has_essays();
    let essay_pct = match essays {
        Some(set) if !set.items.is_empty() => {
            if set.is_partial() {
                degraded_notes
                    .push("essay_score stage scored only part of the items".to_string());
            }
            Some(set.percentage())
        }
        _ if essay_dead => {
            degraded_notes.push(format!(
                "essay_score stage dead-lettered after {} attempts",
                essay_job.map_or(0, |j| j.attempts)
            ));
            None
        }
        _ => {
            if has_essay_items && essays.is_none() {
                degraded_notes.push("essay scores are unavailable".to_string());
            }
            None
        }
    };

    let items: Vec<RecommendationItem> = match recommendations {
        Some(set) => {
            if set.degraded {
                degraded_notes.push("retrieve stage used the static fallback".to_string());
            }
            set.items.clone()
        }
        None => {
            // Retrieval never produced an artifact (dead-letter path); fall
            // back to the static per-track table so the learner still gets
            // something actionable.
            degraded_notes.push(format!(
                "retrieve stage dead-lettered after {} attempts; recommendations come from the static fallback",
                retrieve_job.map_or(0, |j| j.attempts)
            ));
            fallback_for_track(&assessment.snapshot.track.slug, DEFAULT_FALLBACK_K)
        }
    };
    if retrieve_dead && recommendations.is_some() {
        degraded_notes.push("retrieve stage dead-lettered".to_string());
    }

    let breakdown = blend_scores(rules, essays);
    let degraded = assessment.degraded || !degraded_notes.is_empty();
    let degraded_reason = if degraded_notes.is_empty() {
        None
    } else {
        Some(degraded_notes.join("; "))
    };

    let summary = narrative(
        &assessment.snapshot.track.title,
        &breakdown,
        essay_pct,
        &items,
        degraded_reason.as_deref(),
    );

    FusionSummary {
        assessment_id: assessment.id,
        summary,
        breakdown,
        recommendations: items,
        degraded,
        degraded_reason,
        generated_at: Utc::now(),
    }
}

const DEFAULT_FALLBACK_K: usize = 8;

/// Blends rule and essay points into one breakdown.
///
/// Essay rubric means are projected onto the same 0-100-per-weight scale as
/// rule items, so the overall percentage is a single weighted ratio rather
/// than an average of averages.
fn blend_scores(rules: &RuleScoreSet, essays: Option<&EssayScoreSet>) -> ScoreBreakdown {
    let rule_total = rules.total();
    let rule_max = rules.max_total();

    let (essay_total, essay_max, essay_pct) = match essays {
        Some(set) if !set.items.is_empty() => {
            let total: f64 = set
                .items
                .iter()
                .map(|i| i.scores.mean() * 100.0 * i.weight)
                .sum();
            let max: f64 = set.items.iter().map(|i| 100.0 * i.weight).sum();
            (total, max, Some(set.percentage()))
        }
        _ => (0.0, 0.0, None),
    };

    let combined_max = rule_max + essay_max;
    let overall_pct = if combined_max > 0.0 {
        (rule_total + essay_total) / combined_max * 100.0
    } else {
        0.0
    };

    ScoreBreakdown {
        rule_pct: rules.percentage(),
        essay_pct,
        overall_pct,
    }
}

/// Renders the narrative summary.
fn narrative(
    track_title: &str,
    breakdown: &ScoreBreakdown,
    essay_pct: Option<f64>,
    items: &[RecommendationItem],
    degraded_reason: Option<&str>,
) -> String {
    let mut lines = vec![format!(
        "Overall readiness for {track_title}: {:.1}%.",
        breakdown.overall_pct
    )];

    match essay_pct {
        Some(pct) => lines.push(format!(
            "Closed-form items scored {:.1}%, open-ended answers {:.1}%.",
            breakdown.rule_pct, pct
        )),
        None => lines.push(format!(
            "Closed-form items scored {:.1}%.",
            breakdown.rule_pct
        )),
    }

    if let Some(first) = items.first() {
        lines.push(format!(
            "{} recommended next steps, starting with \"{}\".",
            items.len(),
            first.title
        ));
    } else {
        lines.push("No recommendations could be produced.".to_string());
    }

    if let Some(reason) = degraded_reason {
        lines.push(format!("Partial result: {reason}."));
    }

    lines.join(" ")
}

/// Handler for `fuse` stage jobs.
///
/// Completion of the fuse job and the terminal assessment write are
/// deliberately separate steps; re-processing after a crash between them is
/// harmless because `fuse` is idempotent.
pub struct FusionHandler {
    coordinator: FusionCoordinator,
    notifier: Arc<WebhookNotifier>,
    events: Arc<dyn EventSink>,
    retry_delay: Duration,
}

impl FusionHandler {
    /// Creates a handler that retries the join every `retry_delay` until
    /// both predecessors are terminal.
    #[must_use]
    pub fn new(
        store: Arc<dyn PipelineStore>,
        notifier: Arc<WebhookNotifier>,
        events: Arc<dyn EventSink>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            coordinator: FusionCoordinator::new(store),
            notifier,
            events,
            retry_delay,
        }
    }
}

#[async_trait]
impl StageHandler for FusionHandler {
    fn stage(&self) -> Stage {
        Stage::Fuse
    }

    async fn handle(&self, job: &StageJob) -> StageOutcome {
        match self.coordinator.fuse(job.assessment_id).await {
            Ok(FusionOutcome::Fused { write, degraded }) => {
                if write.is_applied() {
                    self.events.push(PipelineEvent::new(
                        job.assessment_id,
                        EventKind::FusionCompleted { degraded },
                    ));
                    if let Err(e) = self.notifier.enqueue_for(job.assessment_id).await {
                        // Webhook bookkeeping must never fail the pipeline.
                        tracing::warn!(error = %e, "failed to enqueue webhook deliveries");
                    }
                }
                StageOutcome::Completed {
                    result_ref: "fusion_summary".to_string(),
                }
            }
            Ok(FusionOutcome::NotReady(join)) => {
                tracing::debug!(join = ?join, "fusion join not ready");
                StageOutcome::NotReady {
                    retry_in: self.retry_delay,
                }
            }
            Err(e) => StageOutcome::Failed(JobError::transient(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{EssayItemScore, RubricScores, RuleItemScore};
    use crate::job::JobPayload;
    use crate::snapshot::{ItemKind, ResponseSet, Snapshot, TrackRef};
    use assay_core::ItemId;

    fn assessment() -> Assessment {
        let mut a = Assessment::new(
            "learner-1",
            Snapshot::new(TrackRef::new("backend-engineer", "Backend Engineer"), vec![]),
            ResponseSet::default(),
        );
        a.status = AssessmentStatus::AwaitingAsync;
        a
    }

    fn terminal_job(assessment: &Assessment, payload: JobPayload, status: JobStatus) -> StageJob {
        let mut job = StageJob::new(assessment.id, payload, 3);
        job.status = status;
        job
    }

    fn rules(assessment: &Assessment) -> RuleScoreSet {
        RuleScoreSet {
            assessment_id: assessment.id,
            items: vec![RuleItemScore {
                item_id: ItemId::generate(),
                kind: ItemKind::Choice,
                points: 80.0,
                max_points: 100.0,
                rule: "exact_match".into(),
                explanation: String::new(),
                tags: vec![],
            }],
            scored_at: Utc::now(),
        }
    }

    #[test]
    fn join_waits_for_both_predecessors() {
        let a = assessment();
        let essay = terminal_job(
            &a,
            JobPayload::EssayScore { item_ids: vec![] },
            JobStatus::Succeeded,
        );
        let mut retrieve = terminal_job(
            &a,
            JobPayload::Retrieve {
                track_slug: "backend-engineer".into(),
                top_k: 8,
            },
            JobStatus::Leased,
        );

        assert_eq!(
            JoinState::observe(&a, Some(&essay), Some(&retrieve)),
            JoinState::WaitingRetrieval
        );

        retrieve.status = JobStatus::DeadLetter;
        assert_eq!(
            JoinState::observe(&a, Some(&essay), Some(&retrieve)),
            JoinState::Fusing
        );
    }

    #[test]
    fn join_treats_missing_jobs_as_pending() {
        let a = assessment();
        assert_eq!(JoinState::observe(&a, None, None), JoinState::WaitingBoth);
    }

    #[test]
    fn join_reports_done_on_terminal_assessment() {
        let mut a = assessment();
        a.transition_to(AssessmentStatus::Completed).unwrap();
        assert_eq!(JoinState::observe(&a, None, None), JoinState::Done);
    }

    #[test]
    fn blend_projects_essays_onto_rule_scale() {
        let a = assessment();
        let rule_set = rules(&a);
        let essay_set = EssayScoreSet {
            assessment_id: a.id,
            items: vec![EssayItemScore {
                item_id: ItemId::generate(),
                scores: RubricScores {
                    clarity: 0.6,
                    accuracy: 0.6,
                    coherence: 0.6,
                },
                suspect: false,
                weight: 1.0,
                latency_ms: 100,
            }],
            failed_items: vec![],
            model: "fixed".into(),
            scored_at: Utc::now(),
        };
        let breakdown = blend_scores(&rule_set, Some(&essay_set));
        // (80 + 60) / 200
        assert!((breakdown.overall_pct - 70.0).abs() < 1e-9);
        assert!((breakdown.rule_pct - 80.0).abs() < 1e-9);
        assert!((breakdown.essay_pct.unwrap() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn dead_lettered_retrieval_produces_fallback_and_reason() {
        let a = assessment();
        let essay = terminal_job(
            &a,
            JobPayload::EssayScore { item_ids: vec![] },
            JobStatus::Succeeded,
        );
        let mut retrieve = terminal_job(
            &a,
            JobPayload::Retrieve {
                track_slug: "backend-engineer".into(),
                top_k: 8,
            },
            JobStatus::DeadLetter,
        );
        retrieve.attempts = 3;

        let summary = compose_summary(
            &a,
            &rules(&a),
            None,
            None,
            Some(&essay),
            Some(&retrieve),
        );
        assert!(summary.degraded);
        assert!(!summary.recommendations.is_empty());
        let reason = summary.degraded_reason.unwrap();
        assert!(reason.contains("retrieve"));
        assert!(reason.contains("3 attempts"));
    }

    #[test]
    fn clean_fusion_is_not_degraded() {
        let a = assessment();
        let essay = terminal_job(
            &a,
            JobPayload::EssayScore { item_ids: vec![] },
            JobStatus::Succeeded,
        );
        let retrieve = terminal_job(
            &a,
            JobPayload::Retrieve {
                track_slug: "backend-engineer".into(),
                top_k: 8,
            },
            JobStatus::Succeeded,
        );
        let recommendations = crate::artifact::RecommendationSet {
            assessment_id: a.id,
            items: fallback_for_track("backend-engineer", 3),
            query_terms: vec![],
            degraded: false,
            generated_at: Utc::now(),
        };

        let summary = compose_summary(
            &a,
            &rules(&a),
            None,
            Some(&recommendations),
            Some(&essay),
            Some(&retrieve),
        );
        assert!(!summary.degraded);
        assert!(summary.degraded_reason.is_none());
        assert!(summary.summary.contains("80.0%"));
    }
}
