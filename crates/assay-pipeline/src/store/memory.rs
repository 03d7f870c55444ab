//! In-memory store implementation for testing.
//!
//! This module provides [`InMemoryStore`], a thread-safe in-memory
//! implementation of the [`PipelineStore`] trait suitable for testing and
//! development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **Single-process only**: State is not shared across process boundaries
//! - **No persistence**: All state is lost when the process exits
//!
//! The CAS semantics, however, match what a transactional store must provide:
//! every mutation happens under one lock acquisition, so observable behavior
//! under concurrency is the same as a conditional-update SQL implementation.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use assay_core::{AssessmentId, JobId};

use super::{CasResult, CreateOutcome, FailOutcome, PipelineStore, TerminalWrite};
use crate::artifact::{EssayScoreSet, FusionSummary, RecommendationSet, RuleScoreSet};
use crate::assessment::{Assessment, AssessmentStatus};
use crate::error::{Error, Result};
use crate::idempotency::IdempotencyRecord;
use crate::job::{JobError, JobPayload, JobStatus, RetryPolicy, Stage, StageJob};
use crate::webhook::WebhookDelivery;

/// Internal store state protected by a single lock.
#[derive(Debug, Default)]
struct StoreState {
    assessments: HashMap<AssessmentId, Assessment>,
    jobs: HashMap<JobId, StageJob>,
    job_index: HashMap<(AssessmentId, Stage), JobId>,
    idempotency: HashMap<String, IdempotencyRecord>,
    rule_scores: HashMap<AssessmentId, RuleScoreSet>,
    essay_scores: HashMap<AssessmentId, EssayScoreSet>,
    recommendations: HashMap<AssessmentId, RecommendationSet>,
    summaries: HashMap<AssessmentId, FusionSummary>,
    webhook_targets: HashMap<AssessmentId, Vec<String>>,
    deliveries: HashMap<(AssessmentId, String), WebhookDelivery>,
}

/// In-memory store for testing.
///
/// Provides a simple, thread-safe implementation of the [`PipelineStore`]
/// trait using `RwLock` for synchronization. The lock is never held across
/// an await point.
#[derive(Debug)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
    policy: RetryPolicy,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("store lock poisoned")
}

fn chrono_dur(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

impl InMemoryStore {
    /// Creates a new in-memory store with the default retry policy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            policy: RetryPolicy::default(),
        }
    }

    /// Creates a store with a custom retry policy.
    ///
    /// Use this to test retry exhaustion with short backoff delays.
    #[must_use]
    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            policy,
        }
    }

    /// Returns the number of assessments currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn assessment_count(&self) -> Result<usize> {
        let count = {
            let state = self.state.read().map_err(poison_err)?;
            state.assessments.len()
        };
        Ok(count)
    }
}

#[async_trait]
impl PipelineStore for InMemoryStore {
    async fn create_assessment(
        &self,
        assessment: &Assessment,
        record: Option<&IdempotencyRecord>,
    ) -> Result<CreateOutcome> {
        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(record) = record {
            if let Some(existing) = state.idempotency.get(&record.key) {
                // A key outlives its TTL only when its assessment is gone;
                // assessments are soft-deleted, so an existing one still
                // claims the key.
                let reusable = existing.is_expired_at(Utc::now())
                    && !state.assessments.contains_key(&existing.assessment_id);
                if reusable {
                    state.idempotency.remove(&record.key);
                } else {
                    let existing = existing.clone();
                    drop(state);
                    return Ok(CreateOutcome::KeyExists(existing));
                }
            }
            state
                .idempotency
                .insert(record.key.clone(), record.clone());
        }

        state.assessments.insert(assessment.id, assessment.clone());
        drop(state);
        Ok(CreateOutcome::Created)
    }

    async fn get_assessment(&self, id: &AssessmentId) -> Result<Option<Assessment>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.assessments.get(id).cloned()
        };
        Ok(result)
    }

    async fn find_idempotency_record(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(existing) = state.idempotency.get(key) else {
            drop(state);
            return Ok(None);
        };
        let reusable = existing.is_expired_at(Utc::now())
            && !state.assessments.contains_key(&existing.assessment_id);
        if reusable {
            state.idempotency.remove(key);
            drop(state);
            return Ok(None);
        }
        let existing = existing.clone();
        drop(state);
        Ok(Some(existing))
    }

    async fn mark_stage_degraded(&self, id: &AssessmentId, stage: Stage) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if let Some(assessment) = state.assessments.get_mut(id) {
            // Terminal assessments are frozen; late degradation signals are
            // audit-only and the summary already reflects what fused.
            if !assessment.is_terminal() {
                assessment.record_degraded_stage(stage);
            }
        }
        drop(state);
        Ok(())
    }

    async fn finalize_assessment(
        &self,
        id: &AssessmentId,
        status: AssessmentStatus,
        degraded: bool,
    ) -> Result<TerminalWrite> {
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(assessment) = state.assessments.get_mut(id) else {
            drop(state);
            return Ok(TerminalWrite::NotFound);
        };
        if assessment.is_terminal() {
            let actual = assessment.status;
            drop(state);
            return Ok(TerminalWrite::AlreadyTerminal { actual });
        }
        assessment.transition_to(status)?;
        assessment.degraded = assessment.degraded || degraded;
        drop(state);
        Ok(TerminalWrite::Applied)
    }

    async fn enqueue(&self, assessment_id: AssessmentId, payload: JobPayload) -> Result<StageJob> {
        let stage = payload.stage();
        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(job_id) = state.job_index.get(&(assessment_id, stage)) {
            let existing = state
                .jobs
                .get(job_id)
                .cloned()
                .ok_or_else(|| Error::storage("job index points at a missing job"))?;
            drop(state);
            return Ok(existing);
        }

        let job = StageJob::new(assessment_id, payload, self.policy.max_attempts);
        state.job_index.insert((assessment_id, stage), job.id);
        state.jobs.insert(job.id, job.clone());
        drop(state);
        Ok(job)
    }

    async fn lease(
        &self,
        stage: Stage,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<StageJob>> {
        let now = Utc::now();
        let mut state = self.state.write().map_err(poison_err)?;

        let mut candidates: Vec<(DateTime<Utc>, JobId)> = state
            .jobs
            .values()
            .filter(|j| j.stage == stage && j.is_leasable_at(now))
            .map(|j| (j.enqueued_at, j.id))
            .collect();
        candidates.sort();

        let Some((_, job_id)) = candidates.into_iter().next() else {
            drop(state);
            return Ok(None);
        };

        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::storage("leased job vanished"))?;

        // An expired lease is reclaimed in place: the status stays Leased and
        // only the ownership changes. This is the crash recovery path.
        if job.status != JobStatus::Leased {
            job.transition_to(JobStatus::Leased)?;
        }
        job.lease_owner = Some(worker_id.to_string());
        job.lease_expires_at = Some(now + chrono_dur(lease_duration));
        job.next_run_at = None;

        let leased = job.clone();
        drop(state);
        Ok(Some(leased))
    }

    async fn lease_job(
        &self,
        job_id: &JobId,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<StageJob>> {
        let now = Utc::now();
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(job) = state.jobs.get_mut(job_id) else {
            drop(state);
            return Ok(None);
        };
        if !job.is_leasable_at(now) {
            drop(state);
            return Ok(None);
        }
        if job.status != JobStatus::Leased {
            job.transition_to(JobStatus::Leased)?;
        }
        job.lease_owner = Some(worker_id.to_string());
        job.lease_expires_at = Some(now + chrono_dur(lease_duration));
        job.next_run_at = None;
        let leased = job.clone();
        drop(state);
        Ok(Some(leased))
    }

    async fn heartbeat(
        &self,
        job_id: &JobId,
        worker_id: &str,
        extension: Duration,
    ) -> Result<CasResult> {
        let now = Utc::now();
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(job) = state.jobs.get_mut(job_id) else {
            drop(state);
            return Ok(CasResult::NotFound);
        };
        if job.status != JobStatus::Leased {
            let actual = job.status;
            drop(state);
            return Ok(CasResult::StateMismatch { actual });
        }
        if !job.holds_lease(worker_id, now) {
            drop(state);
            return Ok(CasResult::LeaseMismatch);
        }
        job.lease_expires_at = Some(now + chrono_dur(extension));
        drop(state);
        Ok(CasResult::Success)
    }

    async fn complete_job(
        &self,
        job_id: &JobId,
        worker_id: &str,
        result_ref: &str,
    ) -> Result<CasResult> {
        let now = Utc::now();
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(job) = state.jobs.get_mut(job_id) else {
            drop(state);
            return Ok(CasResult::NotFound);
        };
        if job.status != JobStatus::Leased {
            let actual = job.status;
            drop(state);
            return Ok(CasResult::StateMismatch { actual });
        }
        if !job.holds_lease(worker_id, now) {
            drop(state);
            return Ok(CasResult::LeaseMismatch);
        }
        job.result_ref = Some(result_ref.to_string());
        job.last_error = None;
        job.transition_to(JobStatus::Succeeded)?;
        drop(state);
        Ok(CasResult::Success)
    }

    async fn fail_job(
        &self,
        job_id: &JobId,
        worker_id: &str,
        error: JobError,
    ) -> Result<FailOutcome> {
        let now = Utc::now();
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(job) = state.jobs.get_mut(job_id) else {
            drop(state);
            return Ok(FailOutcome::NotFound);
        };
        if job.status != JobStatus::Leased || !job.holds_lease(worker_id, now) {
            drop(state);
            return Ok(FailOutcome::LeaseMismatch);
        }

        job.attempts += 1;
        job.last_error = Some(error.clone());

        if error.is_retryable() && self.policy.allows_retry(job.attempts) {
            let backoff = self.policy.backoff(job.attempts);
            let next_run_at = now + chrono_dur(backoff);
            job.next_run_at = Some(next_run_at);
            job.lease_owner = None;
            job.lease_expires_at = None;
            job.transition_to(JobStatus::Failed)?;
            drop(state);
            return Ok(FailOutcome::Retried { next_run_at });
        }

        let assessment_id = job.assessment_id;
        let stage = job.stage;
        job.transition_to(JobStatus::DeadLetter)?;
        // Degraded signal to the owning assessment, in the same atomic step.
        if let Some(assessment) = state.assessments.get_mut(&assessment_id) {
            if !assessment.is_terminal() {
                assessment.record_degraded_stage(stage);
            }
        }
        drop(state);
        Ok(FailOutcome::DeadLettered)
    }

    async fn release_job(
        &self,
        job_id: &JobId,
        worker_id: &str,
        delay: Duration,
    ) -> Result<CasResult> {
        let now = Utc::now();
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(job) = state.jobs.get_mut(job_id) else {
            drop(state);
            return Ok(CasResult::NotFound);
        };
        if job.status != JobStatus::Leased || !job.holds_lease(worker_id, now) {
            drop(state);
            return Ok(CasResult::LeaseMismatch);
        }
        job.lease_owner = None;
        job.lease_expires_at = None;
        job.next_run_at = Some(now + chrono_dur(delay));
        job.transition_to(JobStatus::Queued)?;
        drop(state);
        Ok(CasResult::Success)
    }

    async fn get_job(
        &self,
        assessment_id: &AssessmentId,
        stage: Stage,
    ) -> Result<Option<StageJob>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .job_index
                .get(&(*assessment_id, stage))
                .and_then(|id| state.jobs.get(id))
                .cloned()
        };
        Ok(result)
    }

    async fn jobs_for(&self, assessment_id: &AssessmentId) -> Result<Vec<StageJob>> {
        let mut jobs: Vec<StageJob> = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .jobs
                .values()
                .filter(|j| j.assessment_id == *assessment_id)
                .cloned()
                .collect()
        };
        jobs.sort_by_key(|j| j.stage);
        Ok(jobs)
    }

    async fn put_rule_scores(&self, set: &RuleScoreSet) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if state
            .assessments
            .get(&set.assessment_id)
            .is_some_and(Assessment::is_terminal)
        {
            drop(state);
            return Err(Error::storage("rule scores are frozen on a terminal assessment"));
        }
        state.rule_scores.insert(set.assessment_id, set.clone());
        drop(state);
        Ok(())
    }

    async fn get_rule_scores(&self, id: &AssessmentId) -> Result<Option<RuleScoreSet>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.rule_scores.get(id).cloned()
        };
        Ok(result)
    }

    async fn put_essay_scores(&self, set: &EssayScoreSet) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let frozen = state
            .job_index
            .get(&(set.assessment_id, Stage::EssayScore))
            .and_then(|id| state.jobs.get(id))
            .is_some_and(|j| j.status == JobStatus::Succeeded);
        if frozen {
            drop(state);
            return Err(Error::storage(
                "essay scores are frozen after the stage succeeded",
            ));
        }
        state.essay_scores.insert(set.assessment_id, set.clone());
        drop(state);
        Ok(())
    }

    async fn get_essay_scores(&self, id: &AssessmentId) -> Result<Option<EssayScoreSet>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.essay_scores.get(id).cloned()
        };
        Ok(result)
    }

    async fn put_recommendations(&self, set: &RecommendationSet) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let frozen = state
            .job_index
            .get(&(set.assessment_id, Stage::Retrieve))
            .and_then(|id| state.jobs.get(id))
            .is_some_and(|j| j.status == JobStatus::Succeeded);
        if frozen {
            drop(state);
            return Err(Error::storage(
                "recommendations are frozen after the stage succeeded",
            ));
        }
        state.recommendations.insert(set.assessment_id, set.clone());
        drop(state);
        Ok(())
    }

    async fn get_recommendations(&self, id: &AssessmentId) -> Result<Option<RecommendationSet>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.recommendations.get(id).cloned()
        };
        Ok(result)
    }

    async fn put_fusion_summary(&self, summary: &FusionSummary) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if state
            .assessments
            .get(&summary.assessment_id)
            .is_some_and(Assessment::is_terminal)
        {
            drop(state);
            return Err(Error::storage(
                "fusion summary is frozen on a terminal assessment",
            ));
        }
        state.summaries.insert(summary.assessment_id, summary.clone());
        drop(state);
        Ok(())
    }

    async fn get_fusion_summary(&self, id: &AssessmentId) -> Result<Option<FusionSummary>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.summaries.get(id).cloned()
        };
        Ok(result)
    }

    async fn add_webhook_target(&self, id: &AssessmentId, url: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let targets = state.webhook_targets.entry(*id).or_default();
        if !targets.iter().any(|t| t == url) {
            targets.push(url.to_string());
        }
        drop(state);
        Ok(())
    }

    async fn webhook_targets(&self, id: &AssessmentId) -> Result<Vec<String>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.webhook_targets.get(id).cloned().unwrap_or_default()
        };
        Ok(result)
    }

    async fn upsert_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let key = (delivery.assessment_id, delivery.url.clone());
        match state.deliveries.get(&key) {
            // A different record already tracks this (assessment, URL);
            // enqueueing again must not reset its attempt history.
            Some(existing) if existing.id != delivery.id => {}
            _ => {
                state.deliveries.insert(key, delivery.clone());
            }
        }
        drop(state);
        Ok(())
    }

    async fn due_deliveries(&self, now: DateTime<Utc>) -> Result<Vec<WebhookDelivery>> {
        let mut due: Vec<WebhookDelivery> = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .deliveries
                .values()
                .filter(|d| d.is_due_at(now))
                .cloned()
                .collect()
        };
        due.sort_by_key(|d| d.created_at);
        Ok(due)
    }

    async fn deliveries_for(&self, id: &AssessmentId) -> Result<Vec<WebhookDelivery>> {
        let mut all: Vec<WebhookDelivery> = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .deliveries
                .values()
                .filter(|d| d.assessment_id == *id)
                .cloned()
                .collect()
        };
        all.sort_by_key(|d| d.created_at);
        Ok(all)
    }
}
