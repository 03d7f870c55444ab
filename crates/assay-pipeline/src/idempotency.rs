//! Idempotency guard for submission finalization.
//!
//! Deduplicates submission requests by a caller-supplied key. The record
//! write is atomic with assessment creation (a single store call), so a
//! crash can never leave an orphaned record pointing at nothing.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use assay_core::AssessmentId;

use crate::assessment::Assessment;
use crate::error::Result;
use crate::store::{CreateOutcome, PipelineStore};

/// Default lifetime of an idempotency record.
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Maps a caller key to the assessment it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    /// Caller-supplied key.
    pub key: String,
    /// The assessment this key produced.
    pub assessment_id: AssessmentId,
    /// Fingerprint of the submission payload the key was first seen with.
    pub fingerprint: String,
    /// When the record was written.
    pub recorded_at: DateTime<Utc>,
    /// Lifetime after which the key may be reused.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl IdempotencyRecord {
    /// Creates a record with the default TTL.
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        assessment_id: AssessmentId,
        fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            assessment_id,
            fingerprint: fingerprint.into(),
            recorded_at: Utc::now(),
            ttl: DEFAULT_RECORD_TTL,
        }
    }

    /// Returns true if the record has outlived its TTL at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let ttl = ChronoDuration::from_std(self.ttl).unwrap_or(ChronoDuration::MAX);
        now >= self.recorded_at + ttl
    }
}

/// Outcome of admitting a submission through the guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A new assessment was created.
    Created(AssessmentId),
    /// The key was seen before with an identical fingerprint; no new work
    /// was created and the prior assessment is returned.
    Replayed(AssessmentId),
    /// The key was seen before with a different fingerprint.
    Conflict,
}

impl Admission {
    /// The assessment ID admitted, if the submission was not a conflict.
    #[must_use]
    pub const fn assessment_id(&self) -> Option<AssessmentId> {
        match self {
            Self::Created(id) | Self::Replayed(id) => Some(*id),
            Self::Conflict => None,
        }
    }
}

/// Computes the canonical fingerprint of a submission payload.
///
/// SHA-256 over the serialized bytes, hex-encoded. Two requests with the
/// same key must hash to the same fingerprint to count as a replay.
#[must_use]
pub fn fingerprint(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Admits or replays submissions keyed by caller-supplied idempotency keys.
pub struct IdempotencyGuard {
    store: Arc<dyn PipelineStore>,
}

impl IdempotencyGuard {
    /// Creates a guard over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    /// Admits a submission.
    ///
    /// The assessment passed in is only persisted when the key is unseen.
    /// A concurrent admit with the same key is resolved by the store's
    /// atomic create: exactly one caller observes `Created`, every other
    /// caller observes `Replayed` (or `Conflict` on fingerprint mismatch).
    ///
    /// # Errors
    ///
    /// Returns storage errors; key reuse itself is reported through the
    /// [`Admission`] value, not an error.
    #[tracing::instrument(skip(self, assessment), fields(key = key))]
    pub async fn admit(
        &self,
        key: &str,
        fp: &str,
        assessment: &Assessment,
    ) -> Result<Admission> {
        if let Some(existing) = self.store.find_idempotency_record(key).await? {
            return Ok(Self::resolve(&existing, fp));
        }

        let record = IdempotencyRecord::new(key, assessment.id, fp);
        match self
            .store
            .create_assessment(assessment, Some(&record))
            .await?
        {
            CreateOutcome::Created => Ok(Admission::Created(assessment.id)),
            // Lost the race to a concurrent admit with the same key.
            CreateOutcome::KeyExists(existing) => Ok(Self::resolve(&existing, fp)),
        }
    }

    fn resolve(existing: &IdempotencyRecord, fp: &str) -> Admission {
        if existing.fingerprint == fp {
            tracing::info!(
                assessment_id = %existing.assessment_id,
                "replaying prior submission"
            );
            Admission::Replayed(existing.assessment_id)
        } else {
            tracing::warn!(
                assessment_id = %existing.assessment_id,
                "idempotency key reused with a different payload"
            );
            Admission::Conflict
        }
    }
}
