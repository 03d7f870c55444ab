//! Stage job state and lease lifecycle.
//!
//! This module provides:
//! - `Stage`: The three pipeline stages tracked as durable jobs
//! - `JobStatus`: The state machine for stage job execution
//! - `JobPayload`: Tagged per-stage payloads, checked at enqueue time
//! - `StageJob`: One durable work item per (assessment, stage)
//! - `RetryPolicy`: Exponential backoff with jitter and dead-letter bounds
//!
//! ## Lease model
//!
//! A lease is a time-bounded exclusive claim: a leased job is invisible to
//! other `lease` calls until `lease_expires_at`. A worker that crashes
//! without completing or heartbeating simply lets the lease expire, after
//! which the job becomes lease-able again. Effects must therefore be
//! idempotent: the same job may be processed more than once after a crash.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use assay_core::{AssessmentId, ItemId, JobId};

use crate::error::{Error, Result};

/// The pipeline stages tracked as durable jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Open-ended items scored by the external scorer.
    EssayScore,
    /// Catalog retrieval from the external content index.
    Retrieve,
    /// Fan-in join producing the final summary.
    Fuse,
}

impl Stage {
    /// All stages in dispatch order.
    pub const ALL: [Self; 3] = [Self::EssayScore, Self::Retrieve, Self::Fuse];

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::EssayScore => "essay_score",
            Self::Retrieve => "retrieve",
            Self::Fuse => "fuse",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// Stage job state machine.
///
/// ```text
/// ┌────────┐  lease   ┌────────┐  complete  ┌───────────┐
/// │ QUEUED │─────────►│ LEASED │───────────►│ SUCCEEDED │
/// └────────┘          └────────┘            └───────────┘
///      ▲                │    │
///      │ lease expired  │    │ fail(retryable, attempts left)
///      └────────────────┘    ▼
///                       ┌────────┐  retry due, lease   ┌────────┐
///                       │ FAILED │────────────────────►│ LEASED │
///                       └────────┘                     └────────┘
///                            │ attempts exhausted / non-retryable
///                            ▼
///                      ┌─────────────┐
///                      │ DEAD_LETTER │
///                      └─────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be leased.
    Queued,
    /// Exclusively claimed by a worker until the lease expires.
    Leased,
    /// Completed successfully; artifact is frozen.
    Succeeded,
    /// Failed, waiting for its retry backoff to elapse.
    Failed,
    /// Exhausted retries or failed permanently; routed for inspection.
    DeadLetter,
}

impl JobStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::DeadLetter)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Queued => matches!(target, Self::Leased | Self::DeadLetter),
            Self::Leased => matches!(
                target,
                Self::Succeeded | Self::Failed | Self::DeadLetter | Self::Queued
            ),
            Self::Failed => matches!(target, Self::Leased | Self::DeadLetter),
            Self::Succeeded | Self::DeadLetter => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Leased => "leased",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// Tagged per-stage payload, validated against the stage at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "stage")]
pub enum JobPayload {
    /// Payload for the essay scoring stage.
    EssayScore {
        /// Open-ended items to score.
        item_ids: Vec<ItemId>,
    },
    /// Payload for the retrieval stage.
    Retrieve {
        /// Track slug driving the query and the static fallback.
        track_slug: String,
        /// Number of entries to request from the index.
        top_k: usize,
    },
    /// Payload for the fusion stage (all inputs come from artifacts).
    Fuse,
}

impl JobPayload {
    /// The stage this payload belongs to.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        match self {
            Self::EssayScore { .. } => Stage::EssayScore,
            Self::Retrieve { .. } => Stage::Retrieve,
            Self::Fuse => Stage::Fuse,
        }
    }
}

/// Failure classification for a stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Timeout, rate limit, or temporary collaborator unavailability.
    Transient,
    /// Auth failure, content policy rejection, malformed payload.
    Permanent,
}

/// Error information recorded on a failed stage attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    /// Failure classification.
    pub kind: JobErrorKind,
    /// Error message.
    pub message: String,
}

impl JobError {
    /// Creates a transient (retryable) error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: JobErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Creates a permanent (non-retryable) error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: JobErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Returns true if this failure may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind, JobErrorKind::Transient)
    }
}

/// Retry policy shared by all stage workers and the webhook notifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum attempts before dead-lettering.
    pub max_attempts: u32,
    /// Base delay for the first retry.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound on any computed delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Computes the backoff delay before the next attempt.
    ///
    /// Exponential with full jitter: a uniform draw from zero to
    /// `min(base * 2^(attempts - 1), max_delay)`, so concurrent retries
    /// spread out instead of stampeding the collaborator together.
    #[must_use]
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let ceiling = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(exponent))
            .min(self.max_delay);
        if ceiling.is_zero() {
            return Duration::ZERO;
        }
        let millis = ceiling.as_millis().min(u128::from(u64::MAX)) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }

    /// Returns true if another attempt is allowed after `attempts` failures.
    #[must_use]
    pub const fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// One durable pipeline work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageJob {
    /// Unique job identifier.
    pub id: JobId,
    /// Owning assessment.
    pub assessment_id: AssessmentId,
    /// The stage this job executes.
    pub stage: Stage,
    /// Execution state.
    pub status: JobStatus,
    /// Typed payload for the stage worker.
    pub payload: JobPayload,
    /// Failed attempt count (increments on `fail`).
    pub attempts: u32,
    /// Maximum attempts before dead-lettering.
    pub max_attempts: u32,
    /// Earliest time the job may next be leased (retry backoff).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    /// Worker currently holding the lease.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<String>,
    /// When the current lease becomes void.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Pointer to the artifact produced by a successful attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    /// Most recent failure, kept for the ops surface.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<JobError>,
    /// When the job was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// When the job reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageJob {
    /// Creates a new queued job.
    ///
    /// The payload's stage is taken as the job's stage, which makes a
    /// stage/payload mismatch unrepresentable.
    #[must_use]
    pub fn new(assessment_id: AssessmentId, payload: JobPayload, max_attempts: u32) -> Self {
        Self {
            id: JobId::generate(),
            assessment_id,
            stage: payload.stage(),
            status: JobStatus::Queued,
            payload,
            attempts: 0,
            max_attempts,
            next_run_at: None,
            lease_owner: None,
            lease_expires_at: None,
            result_ref: None,
            last_error: None,
            enqueued_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Returns true if the job is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if the job can be leased at `now`.
    ///
    /// Covers three cases: freshly queued work, failed work whose retry
    /// backoff has elapsed, and leased work whose lease has expired
    /// (crash recovery).
    #[must_use]
    pub fn is_leasable_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Queued => self.next_run_at.is_none_or(|t| t <= now),
            JobStatus::Failed => self.next_run_at.is_none_or(|t| t <= now),
            JobStatus::Leased => self.lease_expires_at.is_some_and(|t| t <= now),
            JobStatus::Succeeded | JobStatus::DeadLetter => false,
        }
    }

    /// Returns true if `worker_id` holds a live lease at `now`.
    #[must_use]
    pub fn holds_lease(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Leased
            && self.lease_owner.as_deref() == Some(worker_id)
            && self.lease_expires_at.is_some_and(|t| t > now)
    }

    /// Transitions to a new state.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    pub fn transition_to(&mut self, target: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: format!("job {} stage {}", self.id, self.stage),
            });
        }
        self.status = target;
        if target.is_terminal() {
            self.completed_at = Some(Utc::now());
            self.lease_owner = None;
            self.lease_expires_at = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn job() -> StageJob {
        StageJob::new(
            AssessmentId::generate(),
            JobPayload::Retrieve {
                track_slug: "backend-engineer".into(),
                top_k: 8,
            },
            3,
        )
    }

    #[test]
    fn payload_determines_stage() {
        assert_eq!(job().stage, Stage::Retrieve);
        let essay = StageJob::new(
            AssessmentId::generate(),
            JobPayload::EssayScore { item_ids: vec![] },
            3,
        );
        assert_eq!(essay.stage, Stage::EssayScore);
    }

    #[test]
    fn queued_job_is_leasable() {
        assert!(job().is_leasable_at(Utc::now()));
    }

    #[test]
    fn leased_job_is_not_leasable_until_expiry() {
        let mut j = job();
        let now = Utc::now();
        j.status = JobStatus::Leased;
        j.lease_owner = Some("worker-1".into());
        j.lease_expires_at = Some(now + ChronoDuration::seconds(30));
        assert!(!j.is_leasable_at(now));
        assert!(j.is_leasable_at(now + ChronoDuration::seconds(31)));
    }

    #[test]
    fn failed_job_respects_backoff_schedule() {
        let mut j = job();
        let now = Utc::now();
        j.status = JobStatus::Failed;
        j.next_run_at = Some(now + ChronoDuration::seconds(5));
        assert!(!j.is_leasable_at(now));
        assert!(j.is_leasable_at(now + ChronoDuration::seconds(6)));
    }

    #[test]
    fn terminal_jobs_reject_transitions() {
        let mut j = job();
        j.transition_to(JobStatus::Leased).unwrap();
        j.transition_to(JobStatus::Succeeded).unwrap();
        assert!(j.transition_to(JobStatus::Queued).is_err());
        assert!(j.lease_owner.is_none());
    }

    #[test]
    fn queued_cannot_jump_to_succeeded() {
        let mut j = job();
        assert!(j.transition_to(JobStatus::Succeeded).is_err());
    }

    #[test]
    fn backoff_is_bounded_by_cap() {
        let policy = RetryPolicy::default();
        for attempts in 1..=10 {
            let delay = policy.backoff(attempts);
            assert!(delay <= policy.max_delay, "attempt {attempts}: {delay:?}");
        }
    }

    #[test]
    fn backoff_ceiling_grows_with_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        };
        // Full jitter draws from [0, ceiling]; sample repeatedly to observe
        // that attempt 3's ceiling (4s) can exceed attempt 1's (1s).
        let max_seen = (0..200)
            .map(|_| policy.backoff(3))
            .max()
            .unwrap_or_default();
        assert!(max_seen > Duration::from_secs(1));
    }

    #[test]
    fn retry_allowance_matches_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn holds_lease_requires_owner_and_liveness() {
        let mut j = job();
        let now = Utc::now();
        j.status = JobStatus::Leased;
        j.lease_owner = Some("worker-1".into());
        j.lease_expires_at = Some(now + ChronoDuration::seconds(10));
        assert!(j.holds_lease("worker-1", now));
        assert!(!j.holds_lease("worker-2", now));
        assert!(!j.holds_lease("worker-1", now + ChronoDuration::seconds(11)));
    }
}
