//! Webhook notification with an independent retry loop.
//!
//! When fusion completes, one delivery record is enqueued per registered
//! target. Delivery is best-effort and fully decoupled from pipeline state:
//! a failed delivery retries on its own backoff schedule and, once
//! exhausted, is surfaced only through the status/ops surface. Nothing here
//! ever mutates the assessment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use assay_core::{AssessmentId, DeliveryId};

use crate::artifact::RecommendationItem;
use crate::error::Result;
use crate::events::{EventKind, EventSink, PipelineEvent};
use crate::job::RetryPolicy;
use crate::metrics::PipelineMetrics;
use crate::store::PipelineStore;

/// Default cap on delivery attempts per target.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Delivery lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting for the next attempt.
    Pending,
    /// A 2xx response was recorded.
    Delivered,
    /// Attempts exhausted; visible on the ops surface only.
    Exhausted,
}

impl DeliveryStatus {
    /// Returns true if no further attempts will be made.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Exhausted)
    }
}

/// Per (assessment, target URL) delivery attempt log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDelivery {
    /// Unique delivery identifier.
    pub id: DeliveryId,
    /// Owning assessment.
    pub assessment_id: AssessmentId,
    /// Target URL.
    pub url: String,
    /// Delivery state.
    pub status: DeliveryStatus,
    /// Attempts made so far.
    pub attempts: u32,
    /// Cap on attempts.
    pub max_attempts: u32,
    /// Response code from the most recent attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_response_code: Option<u16>,
    /// Error from the most recent attempt, if it produced no response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the next attempt is due.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// When the delivery record was created.
    pub created_at: DateTime<Utc>,
}

impl WebhookDelivery {
    /// Creates a pending delivery due immediately.
    #[must_use]
    pub fn new(assessment_id: AssessmentId, url: impl Into<String>, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: DeliveryId::generate(),
            assessment_id,
            url: url.into(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            max_attempts,
            last_response_code: None,
            last_error: None,
            next_attempt_at: Some(now),
            created_at: now,
        }
    }

    /// Returns true if an attempt is due at `now`.
    #[must_use]
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending && self.next_attempt_at.is_none_or(|t| t <= now)
    }
}

/// Payload pushed to webhook targets when an assessment completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// The completed assessment.
    pub assessment_id: AssessmentId,
    /// Terminal status label.
    pub status: String,
    /// Whether the result was produced with fallbacks.
    pub degraded: bool,
    /// Narrative summary.
    pub summary: String,
    /// Ranked recommendation items.
    pub recommendation_items: Vec<RecommendationItem>,
    /// When the summary was generated.
    pub generated_at: DateTime<Utc>,
}

/// Result of one delivery attempt.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    /// The target responded with the given status code.
    Responded(u16),
    /// The request failed before any response (timeout, connect error).
    Failed(String),
}

/// Transport abstraction for pushing webhook payloads.
///
/// Implementations target HTTP in production and a recording fake in tests.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// Attempts to deliver the payload to the target URL.
    async fn deliver(&self, url: &str, payload: &WebhookPayload) -> AttemptOutcome;
}

/// HTTP transport backed by `reqwest` with bounded timeouts.
pub struct HttpWebhookTransport {
    client: reqwest::Client,
}

impl HttpWebhookTransport {
    /// Creates a transport with the given per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(request_timeout)
            .build()
            .map_err(|e| crate::error::Error::storage(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    async fn deliver(&self, url: &str, payload: &WebhookPayload) -> AttemptOutcome {
        match self.client.post(url).json(payload).send().await {
            Ok(response) => AttemptOutcome::Responded(response.status().as_u16()),
            Err(e) => AttemptOutcome::Failed(e.to_string()),
        }
    }
}

/// Pushes completion notifications with bounded, independent retries.
pub struct WebhookNotifier {
    store: Arc<dyn PipelineStore>,
    transport: Arc<dyn WebhookTransport>,
    policy: RetryPolicy,
    events: Arc<dyn EventSink>,
    metrics: PipelineMetrics,
}

impl WebhookNotifier {
    /// Creates a notifier with the given retry policy.
    ///
    /// The policy's `max_attempts` caps deliveries per target; the backoff
    /// curve is shared with stage retries.
    #[must_use]
    pub fn new(
        store: Arc<dyn PipelineStore>,
        transport: Arc<dyn WebhookTransport>,
        policy: RetryPolicy,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            transport,
            policy,
            events,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Enqueues one pending delivery per registered target.
    ///
    /// Idempotent: re-enqueueing for the same assessment leaves existing
    /// delivery records untouched.
    #[tracing::instrument(skip(self), fields(assessment_id = %assessment_id))]
    pub async fn enqueue_for(&self, assessment_id: AssessmentId) -> Result<()> {
        for url in self.store.webhook_targets(&assessment_id).await? {
            let delivery =
                WebhookDelivery::new(assessment_id, url, self.policy.max_attempts);
            self.store.upsert_delivery(&delivery).await?;
        }
        Ok(())
    }

    /// Attempts every due delivery once, scheduling retries as needed.
    ///
    /// Returns the number of deliveries attempted. The webhook payload is
    /// rebuilt from the persisted fusion summary on every attempt, so a
    /// retried delivery always carries the final (frozen) result.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.due_deliveries(now).await?;
        let mut attempted = 0;
        for delivery in due {
            if let Some(payload) = self.build_payload(&delivery.assessment_id).await? {
                self.attempt(delivery, &payload).await?;
                attempted += 1;
            }
        }
        Ok(attempted)
    }

    async fn build_payload(&self, id: &AssessmentId) -> Result<Option<WebhookPayload>> {
        let Some(assessment) = self.store.get_assessment(id).await? else {
            return Ok(None);
        };
        let Some(summary) = self.store.get_fusion_summary(id).await? else {
            return Ok(None);
        };
        Ok(Some(WebhookPayload {
            assessment_id: *id,
            status: assessment.status.as_label().to_string(),
            degraded: summary.degraded,
            summary: summary.summary,
            recommendation_items: summary.recommendations,
            generated_at: summary.generated_at,
        }))
    }

    #[tracing::instrument(
        skip(self, delivery, payload),
        fields(assessment_id = %delivery.assessment_id, url = %delivery.url, attempt = delivery.attempts + 1)
    )]
    async fn attempt(&self, mut delivery: WebhookDelivery, payload: &WebhookPayload) -> Result<()> {
        let outcome = self.transport.deliver(&delivery.url, payload).await;
        delivery.attempts += 1;
        self.metrics.record_webhook_attempt();

        let delivered = match outcome {
            AttemptOutcome::Responded(code) => {
                delivery.last_response_code = Some(code);
                delivery.last_error = None;
                (200..300).contains(&code)
            }
            AttemptOutcome::Failed(message) => {
                delivery.last_response_code = None;
                delivery.last_error = Some(message);
                false
            }
        };

        if delivered {
            delivery.status = DeliveryStatus::Delivered;
            delivery.next_attempt_at = None;
            self.events.push(PipelineEvent::new(
                delivery.assessment_id,
                EventKind::WebhookSettled {
                    url: delivery.url.clone(),
                    delivered: true,
                    attempts: delivery.attempts,
                },
            ));
            tracing::info!(code = delivery.last_response_code, "webhook delivered");
        } else if delivery.attempts >= delivery.max_attempts {
            delivery.status = DeliveryStatus::Exhausted;
            delivery.next_attempt_at = None;
            self.metrics.record_webhook_exhausted();
            self.events.push(PipelineEvent::new(
                delivery.assessment_id,
                EventKind::WebhookSettled {
                    url: delivery.url.clone(),
                    delivered: false,
                    attempts: delivery.attempts,
                },
            ));
            tracing::warn!(
                attempts = delivery.attempts,
                "webhook delivery exhausted; visible on ops surface only"
            );
        } else {
            let backoff = self.policy.backoff(delivery.attempts);
            delivery.next_attempt_at = Some(
                Utc::now()
                    + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::zero()),
            );
            tracing::info!(
                attempts = delivery.attempts,
                backoff_ms = backoff.as_millis() as u64,
                "webhook attempt failed, retry scheduled"
            );
        }

        self.store.upsert_delivery(&delivery).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_due_only_while_pending() {
        let mut d = WebhookDelivery::new(AssessmentId::generate(), "http://example.test", 5);
        let now = Utc::now();
        assert!(d.is_due_at(now));
        d.status = DeliveryStatus::Delivered;
        assert!(!d.is_due_at(now));
    }

    #[test]
    fn delivery_waits_for_next_attempt_time() {
        let mut d = WebhookDelivery::new(AssessmentId::generate(), "http://example.test", 5);
        let now = Utc::now();
        d.next_attempt_at = Some(now + chrono::Duration::seconds(10));
        assert!(!d.is_due_at(now));
        assert!(d.is_due_at(now + chrono::Duration::seconds(11)));
    }
}
