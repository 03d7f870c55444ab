//! Append-only audit events for pipeline activity.
//!
//! Every state-changing component emits a typed event describing what
//! happened. Terminal assessments are frozen, so late activity (duplicate
//! completions, exhausted webhooks) is visible here rather than as silent
//! mutation.
//!
//! ## Idempotency
//!
//! Events carry a deterministic `idempotency_key` derived from the event's
//! identity (assessment, stage, attempt, kind). Duplicate processing of the
//! same logical step produces envelopes with the same key, which a durable
//! sink can deduplicate on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use assay_core::{AssessmentId, EventId};

use crate::job::{JobErrorKind, Stage};

/// What happened, with the data a consumer needs to act on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EventKind {
    /// A submission was finalized and async stages were enqueued.
    SubmissionFinalized {
        /// Inline rule score percentage.
        rule_pct: f64,
        /// Stages enqueued.
        stages: Vec<Stage>,
    },
    /// A stage attempt succeeded.
    StageSucceeded {
        /// The stage.
        stage: Stage,
        /// The attempt that succeeded (failed attempts before it).
        attempts: u32,
    },
    /// A stage attempt failed and a retry was scheduled.
    StageRetryScheduled {
        /// The stage.
        stage: Stage,
        /// Failed attempts so far.
        attempts: u32,
        /// Failure classification.
        error_kind: JobErrorKind,
    },
    /// A stage exhausted its retries or failed permanently.
    StageDeadLettered {
        /// The stage.
        stage: Stage,
        /// Failed attempts.
        attempts: u32,
    },
    /// Fusion produced the final summary.
    FusionCompleted {
        /// Whether any stage contributed fallback data.
        degraded: bool,
    },
    /// A webhook delivery reached a terminal state.
    WebhookSettled {
        /// Target URL.
        url: String,
        /// Whether a 2xx was recorded.
        delivered: bool,
        /// Attempts made.
        attempts: u32,
    },
}

impl EventKind {
    /// Short label for the event kind.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::SubmissionFinalized { .. } => "submission_finalized",
            Self::StageSucceeded { .. } => "stage_succeeded",
            Self::StageRetryScheduled { .. } => "stage_retry_scheduled",
            Self::StageDeadLettered { .. } => "stage_dead_lettered",
            Self::FusionCompleted { .. } => "fusion_completed",
            Self::WebhookSettled { .. } => "webhook_settled",
        }
    }
}

/// One audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEvent {
    /// Unique event identifier (ULID, sorts chronologically).
    pub id: EventId,
    /// Owning assessment.
    pub assessment_id: AssessmentId,
    /// Event payload.
    #[serde(flatten)]
    pub kind: EventKind,
    /// Deterministic key for the logical step this event describes.
    pub idempotency_key: String,
    /// When the event was recorded.
    pub time: DateTime<Utc>,
}

impl PipelineEvent {
    /// Creates an event for an assessment.
    #[must_use]
    pub fn new(assessment_id: AssessmentId, kind: EventKind) -> Self {
        let idempotency_key = match &kind {
            EventKind::SubmissionFinalized { .. } => {
                format!("{assessment_id}/submission")
            }
            EventKind::StageSucceeded { stage, attempts }
            | EventKind::StageDeadLettered { stage, attempts } => {
                format!("{assessment_id}/{stage}/{attempts}/{}", kind.as_label())
            }
            EventKind::StageRetryScheduled {
                stage, attempts, ..
            } => format!("{assessment_id}/{stage}/{attempts}/retry"),
            EventKind::FusionCompleted { .. } => format!("{assessment_id}/fusion"),
            EventKind::WebhookSettled { url, .. } => format!("{assessment_id}/webhook/{url}"),
        };
        Self {
            id: EventId::generate(),
            assessment_id,
            kind,
            idempotency_key,
            time: Utc::now(),
        }
    }
}

/// A sink for audit events emitted by pipeline components.
pub trait EventSink: Send + Sync {
    /// Records an event for later persistence.
    fn push(&self, event: PipelineEvent);
}

/// In-memory outbox for collecting audit events.
#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    events: std::sync::Mutex<Vec<PipelineEvent>>,
}

impl InMemoryOutbox {
    /// Creates a new empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all collected events in insertion order.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Drains the outbox, returning all events in insertion order.
    #[must_use]
    pub fn drain(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default()
    }
}

impl EventSink for InMemoryOutbox {
    fn push(&self, event: PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// A sink that logs events through `tracing` and otherwise drops them.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn push(&self, event: PipelineEvent) {
        tracing::info!(
            assessment_id = %event.assessment_id,
            event = event.kind.as_label(),
            idempotency_key = %event.idempotency_key,
            "pipeline event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_logical_steps_share_an_idempotency_key() {
        let id = AssessmentId::generate();
        let a = PipelineEvent::new(
            id,
            EventKind::StageSucceeded {
                stage: Stage::Retrieve,
                attempts: 1,
            },
        );
        let b = PipelineEvent::new(
            id,
            EventKind::StageSucceeded {
                stage: Stage::Retrieve,
                attempts: 1,
            },
        );
        assert_eq!(a.idempotency_key, b.idempotency_key);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn outbox_collects_in_order() {
        let outbox = InMemoryOutbox::new();
        let id = AssessmentId::generate();
        outbox.push(PipelineEvent::new(
            id,
            EventKind::FusionCompleted { degraded: false },
        ));
        outbox.push(PipelineEvent::new(
            id,
            EventKind::WebhookSettled {
                url: "http://example.test".into(),
                delivered: true,
                attempts: 1,
            },
        ));
        let events = outbox.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind.as_label(), "fusion_completed");
        assert!(outbox.events().is_empty());
    }
}
