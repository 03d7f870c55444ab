//! Submission finalization.
//!
//! Finalization is the pipeline's front door: it admits the request through
//! the idempotency guard, validates the snapshot, runs the rule scorer
//! inline, persists the assessment, and enqueues the parallel async stages.
//! Only a validation failure aborts here; everything downstream degrades
//! instead of failing.

use std::sync::Arc;

use serde::Serialize;

use assay_core::AssessmentId;

use crate::assessment::{Assessment, AssessmentStatus};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::events::{EventKind, EventSink, PipelineEvent};
use crate::idempotency::{fingerprint, Admission, IdempotencyGuard};
use crate::job::{JobPayload, Stage};
use crate::scoring::score_rules;
use crate::snapshot::{ItemKind, ResponseSet, Snapshot};
use crate::store::{CreateOutcome, PipelineStore};

/// A finalization request.
#[derive(Debug, Clone)]
pub struct SubmissionRequest {
    /// Owning learner reference.
    pub owner: String,
    /// Frozen question/track bundle from the snapshot provider.
    pub snapshot: Snapshot,
    /// Locked response set.
    pub responses: ResponseSet,
    /// Caller-supplied idempotency key.
    pub idempotency_key: Option<String>,
    /// Webhook target to notify on completion.
    pub webhook_url: Option<String>,
}

/// What finalization produced.
#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    /// The admitted assessment.
    pub assessment_id: AssessmentId,
    /// True when an identical prior submission was replayed; no new work
    /// was created.
    pub replayed: bool,
    /// Inline rule score percentage (0 for replays; read the artifact).
    pub rule_pct: f64,
    /// Stages enqueued for this submission.
    pub stages_queued: Vec<Stage>,
}

/// Canonical serialization used to fingerprint a submission.
#[derive(Serialize)]
struct FingerprintInput<'a> {
    owner: &'a str,
    snapshot: &'a Snapshot,
    responses: &'a ResponseSet,
}

/// Finalizes submissions and dispatches the async pipeline.
pub struct SubmissionService {
    store: Arc<dyn PipelineStore>,
    guard: IdempotencyGuard,
    events: Arc<dyn EventSink>,
    config: PipelineConfig,
}

impl SubmissionService {
    /// Creates a service over the given store.
    #[must_use]
    pub fn new(
        store: Arc<dyn PipelineStore>,
        events: Arc<dyn EventSink>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            guard: IdempotencyGuard::new(Arc::clone(&store)),
            store,
            events,
            config,
        }
    }

    /// Finalizes a submission.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSnapshot`] when the snapshot fails validation; the
    ///   assessment fails outright and nothing is enqueued
    /// - [`Error::IdempotencyConflict`] when the key was seen with a
    ///   different payload; no state changes
    #[tracing::instrument(skip(self, request), fields(owner = %request.owner))]
    pub async fn submit(&self, request: SubmissionRequest) -> Result<SubmissionOutcome> {
        // Validation happens before any persistence; a malformed snapshot
        // means there is nothing sound to enqueue.
        request.snapshot.validate()?;

        let mut assessment = Assessment::new(
            request.owner.clone(),
            request.snapshot.clone(),
            request.responses.clone(),
        );
        if let Some(key) = &request.idempotency_key {
            assessment = assessment.with_idempotency_key(key.clone());
        }
        assessment.transition_to(AssessmentStatus::AwaitingAsync)?;

        let rules = score_rules(assessment.id, &request.snapshot, &request.responses)?;
        let rule_pct = rules.percentage();

        let admitted = match &request.idempotency_key {
            Some(key) => {
                let input = FingerprintInput {
                    owner: &request.owner,
                    snapshot: &request.snapshot,
                    responses: &request.responses,
                };
                let bytes = serde_json::to_vec(&input).map_err(|e| Error::Serialization {
                    message: format!("failed to fingerprint submission: {e}"),
                })?;
                self.guard
                    .admit(key, &fingerprint(&bytes), &assessment)
                    .await?
            }
            None => match self.store.create_assessment(&assessment, None).await? {
                CreateOutcome::Created => Admission::Created(assessment.id),
                CreateOutcome::KeyExists(record) => Admission::Replayed(record.assessment_id),
            },
        };

        let assessment_id = match admitted {
            Admission::Created(id) => id,
            Admission::Replayed(id) => {
                return Ok(SubmissionOutcome {
                    assessment_id: id,
                    replayed: true,
                    rule_pct: 0.0,
                    stages_queued: Vec::new(),
                });
            }
            Admission::Conflict => {
                return Err(Error::IdempotencyConflict {
                    key: request
                        .idempotency_key
                        .clone()
                        .unwrap_or_default(),
                })
            }
        };

        self.store.put_rule_scores(&rules).await?;

        if let Some(url) = &request.webhook_url {
            self.store.add_webhook_target(&assessment_id, url).await?;
        }

        let essay_items: Vec<_> = request
            .snapshot
            .items_of_kind(ItemKind::Essay)
            .map(|i| i.item_id)
            .collect();

        // Both async stages are enqueued unconditionally so the fusion join
        // always observes the same pair of predecessors; an assessment with
        // no open-ended items completes its essay stage vacuously.
        let payloads = [
            JobPayload::EssayScore {
                item_ids: essay_items,
            },
            JobPayload::Retrieve {
                track_slug: request.snapshot.track.slug.clone(),
                top_k: self.config.top_k,
            },
            JobPayload::Fuse,
        ];
        let mut stages_queued = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let job = self.store.enqueue(assessment_id, payload).await?;
            stages_queued.push(job.stage);
        }

        self.events.push(PipelineEvent::new(
            assessment_id,
            EventKind::SubmissionFinalized {
                rule_pct,
                stages: stages_queued.clone(),
            },
        ));
        tracing::info!(
            assessment_id = %assessment_id,
            rule_pct,
            stages = ?stages_queued,
            "submission finalized"
        );

        Ok(SubmissionOutcome {
            assessment_id,
            replayed: false,
            rule_pct,
            stages_queued,
        })
    }

    /// Registers an additional webhook target for an assessment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AssessmentNotFound`] for unknown assessments.
    pub async fn register_webhook(&self, assessment_id: AssessmentId, url: &str) -> Result<()> {
        if self.store.get_assessment(&assessment_id).await?.is_none() {
            return Err(Error::AssessmentNotFound { assessment_id });
        }
        self.store.add_webhook_target(&assessment_id, url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryOutbox;
    use crate::snapshot::{ItemRule, SnapshotItem, TrackRef};
    use crate::store::memory::InMemoryStore;
    use assay_core::ItemId;

    fn service() -> (SubmissionService, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let events = Arc::new(InMemoryOutbox::new());
        let service = SubmissionService::new(
            store.clone(),
            events,
            PipelineConfig::default(),
        );
        (service, store)
    }

    fn request(key: Option<&str>) -> SubmissionRequest {
        let choice = SnapshotItem {
            item_id: ItemId::generate(),
            kind: ItemKind::Choice,
            prompt: "Pick one.".into(),
            weight: 1.0,
            tags: vec![],
            rule: ItemRule::CorrectOption {
                correct: "A".into(),
                options: vec!["A".into(), "B".into()],
            },
        };
        let answer = (choice.item_id, "A".to_string());
        SubmissionRequest {
            owner: "learner-1".into(),
            snapshot: Snapshot::new(
                TrackRef::new("backend-engineer", "Backend Engineer"),
                vec![choice],
            ),
            responses: ResponseSet::from_pairs([answer]),
            idempotency_key: key.map(str::to_string),
            webhook_url: None,
        }
    }

    #[tokio::test]
    async fn submit_enqueues_all_three_stages() {
        let (service, store) = service();
        let outcome = service.submit(request(None)).await.unwrap();
        assert!(!outcome.replayed);
        assert_eq!(
            outcome.stages_queued,
            vec![Stage::EssayScore, Stage::Retrieve, Stage::Fuse]
        );
        assert!((outcome.rule_pct - 100.0).abs() < f64::EPSILON);

        let jobs = store.jobs_for(&outcome.assessment_id).await.unwrap();
        assert_eq!(jobs.len(), 3);
        assert!(store
            .get_rule_scores(&outcome.assessment_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn replay_creates_no_second_assessment_or_jobs() {
        let (service, store) = service();
        let first = service.submit(request(Some("K1"))).await.unwrap();
        let second = service.submit(request(Some("K1"))).await.unwrap();

        assert!(second.replayed);
        assert_eq!(second.assessment_id, first.assessment_id);
        assert!(second.stages_queued.is_empty());
        assert_eq!(store.assessment_count().unwrap(), 1);
        assert_eq!(store.jobs_for(&first.assessment_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn conflicting_payload_with_same_key_is_rejected() {
        let (service, _store) = service();
        service.submit(request(Some("K1"))).await.unwrap();

        let mut conflicting = request(Some("K1"));
        conflicting.owner = "learner-2".into();
        let result = service.submit(conflicting).await;
        assert!(matches!(result, Err(Error::IdempotencyConflict { .. })));
    }

    #[tokio::test]
    async fn invalid_snapshot_aborts_before_any_state() {
        let (service, store) = service();
        let mut bad = request(None);
        bad.snapshot.items.clear();
        let result = service.submit(bad).await;
        assert!(matches!(result, Err(Error::InvalidSnapshot { .. })));
        assert_eq!(store.assessment_count().unwrap(), 0);
    }
}
