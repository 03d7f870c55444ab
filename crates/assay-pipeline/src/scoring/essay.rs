//! Asynchronous essay scoring against the external scorer.
//!
//! The worker leases `essay_score` jobs, builds a deterministic prompt per
//! open-ended item, and calls the external scorer with a bounded timeout.
//! Numeric policy: a rubric value outside [0, 1] is clamped and the item is
//! flagged `suspect` rather than failing the whole stage.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use assay_core::ItemId;

use crate::artifact::{EssayItemScore, EssayScoreSet, RubricScores};
use crate::job::{JobError, JobPayload, Stage, StageJob};
use crate::snapshot::{ItemKind, ItemRule};
use crate::store::PipelineStore;
use crate::worker::{StageHandler, StageOutcome};

/// Failure classification reported by a scorer implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScorerError {
    /// Timeout, rate limit, or a malformed response; worth retrying.
    #[error("transient scorer error: {0}")]
    Transient(String),
    /// Auth failure or content policy rejection; retrying cannot help.
    #[error("permanent scorer error: {0}")]
    Permanent(String),
}

/// One scoring request for one open-ended item.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRequest {
    /// Rubric text from the snapshot.
    pub rubric: String,
    /// Deterministic prompt built from rubric, question, and answer.
    pub prompt: String,
    /// The learner's answer.
    pub answer: String,
}

/// Structured rubric response from the scorer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredRubric {
    /// Rubric dimensions as returned (may be out of range; callers clamp).
    #[serde(flatten)]
    pub scores: RubricScores,
    /// Identifier of the model that produced the scores.
    #[serde(default)]
    pub model: String,
}

/// External essay scorer contract.
#[async_trait]
pub trait EssayScorer: Send + Sync {
    /// Scores one item, returning the three rubric dimensions.
    async fn score(&self, request: &ScoreRequest) -> Result<ScoredRubric, ScorerError>;
}

/// Builds the deterministic prompt sent to the scorer.
///
/// Fixed section ordering so the same (rubric, question, answer) triple
/// always produces byte-identical input.
#[must_use]
pub fn build_prompt(rubric: &str, question: &str, answer: &str) -> String {
    format!(
        "Score the answer against the rubric.\n\
         Rubric:\n{rubric}\n\
         Question:\n{question}\n\
         Answer:\n{answer}\n\
         Return clarity, accuracy, and coherence, each between 0 and 1."
    )
}

/// HTTP scorer client with bounded timeouts.
pub struct HttpEssayScorer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpEssayScorer {
    /// Creates a client for the given scoring endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(request_timeout)
            .build()
            .map_err(|e| {
                crate::error::Error::storage(format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl EssayScorer for HttpEssayScorer {
    async fn score(&self, request: &ScoreRequest) -> Result<ScoredRubric, ScorerError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ScorerError::Transient(format!("scorer request timed out: {e}"))
                } else {
                    ScorerError::Transient(format!("scorer request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<ScoredRubric>()
                .await
                .map_err(|e| ScorerError::Transient(format!("malformed scorer response: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        // 401/403 mean a credential or policy rejection that a retry cannot
        // fix; 429 and 5xx are worth feeding back into the retry schedule.
        if status.as_u16() == 401 || status.as_u16() == 403 {
            Err(ScorerError::Permanent(format!(
                "scorer rejected the request (status={status}): {body}"
            )))
        } else {
            Err(ScorerError::Transient(format!(
                "scorer unavailable (status={status}): {body}"
            )))
        }
    }
}

/// Scorer fake that always returns the same rubric values.
#[derive(Debug, Clone)]
pub struct FixedScorer {
    /// The rubric returned for every request.
    pub scores: RubricScores,
    /// Model name stamped on results.
    pub model: String,
}

impl FixedScorer {
    /// Creates a fake scorer returning the given dimensions.
    #[must_use]
    pub fn new(clarity: f64, accuracy: f64, coherence: f64) -> Self {
        Self {
            scores: RubricScores {
                clarity,
                accuracy,
                coherence,
            },
            model: "fixed".to_string(),
        }
    }
}

#[async_trait]
impl EssayScorer for FixedScorer {
    async fn score(&self, _request: &ScoreRequest) -> Result<ScoredRubric, ScorerError> {
        Ok(ScoredRubric {
            scores: self.scores,
            model: self.model.clone(),
        })
    }
}

/// Scorer fake that always fails with a configurable error.
#[derive(Debug, Clone)]
pub struct FailingScorer {
    error: ScorerError,
}

impl FailingScorer {
    /// Creates a fake that always times out (transient).
    #[must_use]
    pub fn transient() -> Self {
        Self {
            error: ScorerError::Transient("simulated timeout".to_string()),
        }
    }

    /// Creates a fake that always rejects (permanent).
    #[must_use]
    pub fn permanent() -> Self {
        Self {
            error: ScorerError::Permanent("simulated policy rejection".to_string()),
        }
    }
}

#[async_trait]
impl EssayScorer for FailingScorer {
    async fn score(&self, _request: &ScoreRequest) -> Result<ScoredRubric, ScorerError> {
        Err(self.error.clone())
    }
}

/// Concurrent in-flight scorer calls per job.
const MAX_IN_FLIGHT_SCORES: usize = 4;

/// Handler for `essay_score` stage jobs.
pub struct EssayScoringHandler {
    store: Arc<dyn PipelineStore>,
    scorer: Arc<dyn EssayScorer>,
    call_timeout: Duration,
}

impl EssayScoringHandler {
    /// Creates a handler using the given scorer and per-call timeout.
    #[must_use]
    pub fn new(
        store: Arc<dyn PipelineStore>,
        scorer: Arc<dyn EssayScorer>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            scorer,
            call_timeout,
        }
    }

    async fn score_with_timeout(
        &self,
        request: &ScoreRequest,
    ) -> Result<ScoredRubric, ScorerError> {
        match tokio::time::timeout(self.call_timeout, self.scorer.score(request)).await {
            Ok(result) => result,
            Err(_) => Err(ScorerError::Transient(format!(
                "scorer call exceeded {}ms",
                self.call_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl StageHandler for EssayScoringHandler {
    fn stage(&self) -> Stage {
        Stage::EssayScore
    }

    #[tracing::instrument(skip(self, job), fields(assessment_id = %job.assessment_id, attempt = job.attempts + 1))]
    async fn handle(&self, job: &StageJob) -> StageOutcome {
        let JobPayload::EssayScore { item_ids } = &job.payload else {
            return StageOutcome::Failed(JobError::permanent("essay job carries a foreign payload"));
        };

        let assessment = match self.store.get_assessment(&job.assessment_id).await {
            Ok(Some(assessment)) => assessment,
            Ok(None) => {
                return StageOutcome::Failed(JobError::permanent("assessment no longer exists"))
            }
            Err(e) => return StageOutcome::Failed(JobError::transient(e.to_string())),
        };

        let mut items: Vec<EssayItemScore> = Vec::new();
        let mut failed_items: Vec<ItemId> = Vec::new();
        let mut permanent_failure: Option<String> = None;
        let mut model = String::new();

        let mut requests: Vec<(ItemId, f64, ScoreRequest)> = Vec::new();
        for item_id in item_ids {
            let Some(item) = assessment
                .snapshot
                .items
                .iter()
                .find(|i| i.item_id == *item_id && i.kind == ItemKind::Essay)
            else {
                failed_items.push(*item_id);
                continue;
            };
            let ItemRule::Rubric { text: rubric } = &item.rule else {
                failed_items.push(*item_id);
                continue;
            };
            let Some(answer) = assessment.responses.answer_for(*item_id) else {
                // No answer to score; the item simply contributes nothing.
                continue;
            };
            requests.push((
                *item_id,
                item.weight,
                ScoreRequest {
                    rubric: rubric.clone(),
                    prompt: build_prompt(rubric, &item.prompt, answer),
                    answer: answer.to_string(),
                },
            ));
        }

        // Items are scored with bounded concurrency; the scorer is the slow
        // collaborator here and each call is independent.
        let scored: Vec<_> = stream::iter(requests)
            .map(|(item_id, weight, request)| async move {
                let started = Instant::now();
                let result = self.score_with_timeout(&request).await;
                (item_id, weight, started.elapsed(), result)
            })
            .buffer_unordered(MAX_IN_FLIGHT_SCORES)
            .collect()
            .await;

        for (item_id, weight, elapsed, result) in scored {
            match result {
                Ok(scored) => {
                    let (clamped, suspect) = scored.scores.clamped();
                    if suspect {
                        tracing::warn!(item_id = %item_id, "scorer returned out-of-range rubric values, clamped");
                    }
                    model = scored.model;
                    items.push(EssayItemScore {
                        item_id,
                        scores: clamped,
                        suspect,
                        weight,
                        latency_ms: elapsed.as_millis() as u64,
                    });
                }
                Err(ScorerError::Transient(message)) => {
                    tracing::warn!(item_id = %item_id, error = %message, "transient scorer failure");
                    failed_items.push(item_id);
                }
                Err(ScorerError::Permanent(message)) => {
                    tracing::error!(item_id = %item_id, error = %message, "permanent scorer failure");
                    failed_items.push(item_id);
                    permanent_failure = Some(message);
                }
            }
        }

        let attempted = items.len() + failed_items.len();
        if attempted > 0 && items.is_empty() {
            // Nothing scored at all: fail the attempt so the retry manager
            // (or dead-letter routing) takes over.
            return match permanent_failure {
                Some(message) => StageOutcome::Failed(JobError::permanent(message)),
                None => StageOutcome::Failed(JobError::transient("all essay items failed to score")),
            };
        }

        let partial = !failed_items.is_empty();
        let set = EssayScoreSet {
            assessment_id: job.assessment_id,
            items,
            failed_items,
            model,
            scored_at: Utc::now(),
        };

        if let Err(e) = self.store.put_essay_scores(&set).await {
            return StageOutcome::Failed(JobError::transient(e.to_string()));
        }
        if partial {
            // Some items scored, some did not: the stage completes with what
            // it has and the assessment is labeled degraded for this stage.
            if let Err(e) = self
                .store
                .mark_stage_degraded(&job.assessment_id, Stage::EssayScore)
                .await
            {
                return StageOutcome::Failed(JobError::transient(e.to_string()));
            }
        }

        StageOutcome::Completed {
            result_ref: "essay_scores".to_string(),
        }
    }
}
