//! Durable storage for pipeline state.
//!
//! The `PipelineStore` trait defines the persistence layer for assessments,
//! stage jobs, stage artifacts, idempotency records, and webhook deliveries.
//!
//! ## Design Principles
//!
//! - **CAS semantics**: Every state transition is a guarded compare-and-swap;
//!   two workers can never complete the same job, and two fusion triggers can
//!   never both finalize an assessment
//! - **Lease ownership**: Job mutations require a live lease held by the
//!   calling worker
//! - **Testability**: In-memory implementation for tests; production targets
//!   any store with atomic conditional updates
//!
//! ## Single-writer invariant
//!
//! `finalize_assessment` is the only path to a terminal assessment status and
//! is conditional on the status not already being terminal. The fusion
//! coordinator is its only caller.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use assay_core::{AssessmentId, JobId};

use crate::artifact::{EssayScoreSet, FusionSummary, RecommendationSet, RuleScoreSet};
use crate::assessment::{Assessment, AssessmentStatus};
use crate::error::Result;
use crate::idempotency::IdempotencyRecord;
use crate::job::{JobError, JobPayload, JobStatus, Stage, StageJob};
use crate::webhook::WebhookDelivery;

/// Result of a compare-and-swap job operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// Operation succeeded.
    Success,
    /// Job not found.
    NotFound,
    /// Job state didn't match what the operation requires.
    StateMismatch {
        /// The actual state that was found.
        actual: JobStatus,
    },
    /// The calling worker does not hold a live lease on the job.
    LeaseMismatch,
}

impl CasResult {
    /// Returns true if the operation succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Result of the conditional terminal write on an assessment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalWrite {
    /// The terminal status was applied; this caller won the race.
    Applied,
    /// Another caller already finalized the assessment.
    AlreadyTerminal {
        /// The terminal status that was found.
        actual: AssessmentStatus,
    },
    /// Assessment not found.
    NotFound,
}

impl TerminalWrite {
    /// Returns true if this caller performed the terminal transition.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Result of creating an assessment together with its idempotency record.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// Assessment and record were written.
    Created,
    /// The idempotency key was concurrently taken; nothing was written.
    KeyExists(IdempotencyRecord),
}

/// Disposition of a failed stage attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Retry scheduled.
    Retried {
        /// Earliest time the job may be leased again.
        next_run_at: DateTime<Utc>,
    },
    /// Retries exhausted or failure permanent; the owning assessment was
    /// marked degraded for this stage.
    DeadLettered,
    /// Job not found.
    NotFound,
    /// The calling worker does not hold a live lease on the job.
    LeaseMismatch,
}

/// Storage abstraction for pipeline state.
///
/// Implementations must provide atomic conditional updates: the lease
/// mechanism and the single terminal write are the pipeline's only hard
/// dependencies on the store's consistency model.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    // --- Assessments ---

    /// Creates an assessment, atomically writing its idempotency record.
    ///
    /// When `record` is given and its key is already present (a concurrent
    /// admit won), nothing is written and the existing record is returned so
    /// the guard can resolve replay vs conflict.
    async fn create_assessment(
        &self,
        assessment: &Assessment,
        record: Option<&IdempotencyRecord>,
    ) -> Result<CreateOutcome>;

    /// Gets an assessment by ID.
    async fn get_assessment(&self, id: &AssessmentId) -> Result<Option<Assessment>>;

    /// Looks up a live idempotency record by key.
    ///
    /// A record past its TTL is reaped (and `None` returned) only when its
    /// assessment no longer exists; an existing assessment keeps its claim
    /// on the key.
    async fn find_idempotency_record(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    /// Records that a stage degraded on the owning assessment.
    ///
    /// Append-only with respect to terminal assessments: the degraded flag
    /// may still be recorded for audit, but scores and summaries are frozen.
    async fn mark_stage_degraded(&self, id: &AssessmentId, stage: Stage) -> Result<()>;

    /// Conditionally applies a terminal status.
    ///
    /// Succeeds only when the current status is not already terminal,
    /// guaranteeing a single winner under concurrent fusion triggers.
    async fn finalize_assessment(
        &self,
        id: &AssessmentId,
        status: AssessmentStatus,
        degraded: bool,
    ) -> Result<TerminalWrite>;

    // --- Stage jobs ---

    /// Enqueues a stage job, idempotently per (assessment, stage).
    ///
    /// Re-enqueueing an existing stage returns the existing job unchanged;
    /// a replayed submission therefore never creates a second job.
    async fn enqueue(&self, assessment_id: AssessmentId, payload: JobPayload) -> Result<StageJob>;

    /// Leases the next available job of the given stage.
    ///
    /// Visibility-timeout semantics: jobs with an unexpired lease are
    /// invisible; expired leases are reclaimed here, which is the crash
    /// recovery path. Returns `None` when no job is lease-able.
    async fn lease(
        &self,
        stage: Stage,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<StageJob>>;

    /// Leases one specific job, if it is lease-able right now.
    ///
    /// Used by the fusion trigger: an upstream completion pokes the join by
    /// claiming the assessment's own `fuse` job rather than whatever job is
    /// oldest.
    async fn lease_job(
        &self,
        job_id: &JobId,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<StageJob>>;

    /// Extends a held lease.
    async fn heartbeat(
        &self,
        job_id: &JobId,
        worker_id: &str,
        extension: Duration,
    ) -> Result<CasResult>;

    /// Completes a leased job, recording the artifact pointer.
    async fn complete_job(
        &self,
        job_id: &JobId,
        worker_id: &str,
        result_ref: &str,
    ) -> Result<CasResult>;

    /// Fails a leased job attempt.
    ///
    /// Transient errors schedule a retry until attempts are exhausted;
    /// permanent errors dead-letter immediately. Dead-lettering also marks
    /// the owning assessment degraded for this stage, in the same atomic
    /// step.
    async fn fail_job(
        &self,
        job_id: &JobId,
        worker_id: &str,
        error: JobError,
    ) -> Result<FailOutcome>;

    /// Releases a leased job back to the queue without consuming an attempt.
    ///
    /// Used by the fusion worker when the join predicate is not yet
    /// satisfied; `delay` postpones the next lease.
    async fn release_job(
        &self,
        job_id: &JobId,
        worker_id: &str,
        delay: Duration,
    ) -> Result<CasResult>;

    /// Gets the job for an (assessment, stage) pair.
    async fn get_job(&self, assessment_id: &AssessmentId, stage: Stage)
        -> Result<Option<StageJob>>;

    /// Gets all jobs for an assessment.
    async fn jobs_for(&self, assessment_id: &AssessmentId) -> Result<Vec<StageJob>>;

    // --- Artifacts ---

    /// Persists the inline rule score set.
    async fn put_rule_scores(&self, set: &RuleScoreSet) -> Result<()>;

    /// Gets the rule score set.
    async fn get_rule_scores(&self, id: &AssessmentId) -> Result<Option<RuleScoreSet>>;

    /// Persists the essay score set.
    ///
    /// A retry may overwrite a prior attempt's artifact only while the
    /// essay stage has not succeeded; afterwards the artifact is frozen.
    async fn put_essay_scores(&self, set: &EssayScoreSet) -> Result<()>;

    /// Gets the essay score set.
    async fn get_essay_scores(&self, id: &AssessmentId) -> Result<Option<EssayScoreSet>>;

    /// Persists the recommendation set (same overwrite rule as essays).
    async fn put_recommendations(&self, set: &RecommendationSet) -> Result<()>;

    /// Gets the recommendation set.
    async fn get_recommendations(&self, id: &AssessmentId) -> Result<Option<RecommendationSet>>;

    /// Persists the fusion summary.
    async fn put_fusion_summary(&self, summary: &FusionSummary) -> Result<()>;

    /// Gets the fusion summary.
    async fn get_fusion_summary(&self, id: &AssessmentId) -> Result<Option<FusionSummary>>;

    // --- Webhook deliveries ---

    /// Registers a webhook target URL for an assessment.
    async fn add_webhook_target(&self, id: &AssessmentId, url: &str) -> Result<()>;

    /// Lists registered webhook targets.
    async fn webhook_targets(&self, id: &AssessmentId) -> Result<Vec<String>>;

    /// Inserts a delivery record, idempotently per (assessment, URL).
    async fn upsert_delivery(&self, delivery: &WebhookDelivery) -> Result<()>;

    /// Lists deliveries due for an attempt at `now`.
    async fn due_deliveries(&self, now: DateTime<Utc>) -> Result<Vec<WebhookDelivery>>;

    /// Lists all deliveries for an assessment (ops surface).
    async fn deliveries_for(&self, id: &AssessmentId) -> Result<Vec<WebhookDelivery>>;
}
