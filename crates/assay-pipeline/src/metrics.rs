//! Observability metrics for the evaluation pipeline.
//!
//! Metrics are exposed via the `metrics` crate facade and are designed to
//! support alerting on stuck stages, dashboarding pipeline throughput, and
//! correlating retries/dead-letters with collaborator incidents.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `assay_jobs_leased_total` | Counter | `stage` | Jobs leased by workers |
//! | `assay_job_outcomes_total` | Counter | `stage`, `outcome` | Terminal and retry outcomes |
//! | `assay_retries_total` | Counter | `stage` | Retry schedules |
//! | `assay_dead_letters_total` | Counter | `stage` | Dead-lettered jobs |
//! | `assay_fusions_total` | Counter | `degraded` | Completed fusions |
//! | `assay_stage_duration_seconds` | Histogram | `stage` | Stage attempt duration |
//! | `assay_webhook_attempts_total` | Counter | - | Webhook delivery attempts |
//! | `assay_webhook_exhausted_total` | Counter | - | Deliveries that ran out of attempts |

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Jobs leased by workers.
    pub const JOBS_LEASED_TOTAL: &str = "assay_jobs_leased_total";
    /// Counter: Job attempt outcomes.
    pub const JOB_OUTCOMES_TOTAL: &str = "assay_job_outcomes_total";
    /// Counter: Retry schedules.
    pub const RETRIES_TOTAL: &str = "assay_retries_total";
    /// Counter: Dead-lettered jobs.
    pub const DEAD_LETTERS_TOTAL: &str = "assay_dead_letters_total";
    /// Counter: Completed fusions.
    pub const FUSIONS_TOTAL: &str = "assay_fusions_total";
    /// Histogram: Stage attempt duration in seconds.
    pub const STAGE_DURATION_SECONDS: &str = "assay_stage_duration_seconds";
    /// Counter: Webhook delivery attempts.
    pub const WEBHOOK_ATTEMPTS: &str = "assay_webhook_attempts_total";
    /// Counter: Webhook deliveries that exhausted their attempts.
    pub const WEBHOOK_EXHAUSTED: &str = "assay_webhook_exhausted_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Pipeline stage (essay_score, retrieve, fuse).
    pub const STAGE: &str = "stage";
    /// Attempt outcome (succeeded, retried, dead_letter).
    pub const OUTCOME: &str = "outcome";
    /// Whether the fused result carried fallbacks ("true"/"false").
    pub const DEGRADED: &str = "degraded";
}

/// High-level interface for recording pipeline metrics.
///
/// Cheap to clone and share across worker tasks.
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics;

impl PipelineMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a job lease.
    pub fn record_lease(&self, stage: &str) {
        counter!(
            names::JOBS_LEASED_TOTAL,
            labels::STAGE => stage.to_string(),
        )
        .increment(1);
    }

    /// Records a job attempt outcome.
    pub fn record_outcome(&self, stage: &str, outcome: &str) {
        counter!(
            names::JOB_OUTCOMES_TOTAL,
            labels::STAGE => stage.to_string(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Records a scheduled retry.
    pub fn record_retry(&self, stage: &str) {
        counter!(
            names::RETRIES_TOTAL,
            labels::STAGE => stage.to_string(),
        )
        .increment(1);
    }

    /// Records a dead-lettered job.
    pub fn record_dead_letter(&self, stage: &str) {
        counter!(
            names::DEAD_LETTERS_TOTAL,
            labels::STAGE => stage.to_string(),
        )
        .increment(1);
    }

    /// Records a completed fusion.
    pub fn record_fusion(&self, degraded: bool) {
        counter!(
            names::FUSIONS_TOTAL,
            labels::DEGRADED => degraded.to_string(),
        )
        .increment(1);
    }

    /// Records stage attempt duration.
    pub fn observe_stage_duration(&self, stage: &str, duration_secs: f64) {
        histogram!(
            names::STAGE_DURATION_SECONDS,
            labels::STAGE => stage.to_string(),
        )
        .record(duration_secs);
    }

    /// Records a webhook delivery attempt.
    pub fn record_webhook_attempt(&self) {
        counter!(names::WEBHOOK_ATTEMPTS).increment(1);
    }

    /// Records a webhook delivery that exhausted its attempts.
    pub fn record_webhook_exhausted(&self) {
        counter!(names::WEBHOOK_EXHAUSTED).increment(1);
    }
}
