//! Catalog retrieval against the external content index.
//!
//! The worker leases `retrieve` jobs, builds a query from track tags,
//! profile-derived signals, and (when already available) essay insights,
//! then asks the index for the top-K entries. An empty result set is a
//! valid outcome and triggers the static per-track fallback; index
//! timeouts feed the retry schedule instead. Retrieval failure must never
//! block fusion indefinitely: once this job is terminal (succeeded or
//! dead-lettered) the join can proceed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::artifact::{RecommendationItem, RecommendationSet};
use crate::job::{JobError, JobPayload, Stage, StageJob};
use crate::store::PipelineStore;
use crate::worker::{StageHandler, StageOutcome};

/// Default number of entries requested from the index.
pub const DEFAULT_TOP_K: usize = 8;

/// Rubric mean below which an essay item counts as a weak area.
const WEAK_AREA_THRESHOLD: f64 = 0.6;

/// Fixed similarity stamped on static fallback entries.
const FALLBACK_SIMILARITY: f64 = 0.5;

/// One entry returned by the content index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexHit {
    /// Catalog entry identifier.
    pub id: String,
    /// Entry title.
    pub title: String,
    /// Source snippet for provenance.
    pub snippet: String,
    /// Similarity in [0, 1], higher is closer.
    pub similarity: f64,
}

/// Failure reported by an index implementation.
///
/// The index contract only distinguishes transient failures; an empty
/// result list is a valid response, not an error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("transient index error: {0}")]
pub struct IndexError(pub String);

/// External content index contract.
#[async_trait]
pub trait ContentIndex: Send + Sync {
    /// Queries the index for the `top_k` entries closest to `terms`.
    async fn query(&self, terms: &[String], top_k: usize) -> Result<Vec<IndexHit>, IndexError>;
}

/// HTTP index client with bounded timeouts.
pub struct HttpContentIndex {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct IndexQuery<'a> {
    terms: &'a [String],
    top_k: usize,
}

impl HttpContentIndex {
    /// Creates a client for the given index endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(1))
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
impl ContentIndex for HttpContentIndex {
    async fn query(&self, terms: &[String], top_k: usize) -> Result<Vec<IndexHit>, IndexError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&IndexQuery { terms, top_k })
            .send()
            .await
            .map_err(|e| IndexError(format!("index request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IndexError(format!("index unavailable (status={status})")));
        }
        response
            .json::<Vec<IndexHit>>()
            .await
            .map_err(|e| IndexError(format!("malformed index response: {e}")))
    }
}

/// Index fake returning a fixed hit list.
#[derive(Debug, Clone, Default)]
pub struct FixedIndex {
    /// Hits returned for every query.
    pub hits: Vec<IndexHit>,
}

impl FixedIndex {
    /// Creates a fake index with `count` generated hits.
    #[must_use]
    pub fn with_hits(count: usize) -> Self {
        let hits = (0..count)
            .map(|i| IndexHit {
                id: format!("entry-{i}"),
                title: format!("Catalog entry {i}"),
                snippet: format!("snippet {i}"),
                similarity: 0.9 - (i as f64) * 0.05,
            })
            .collect();
        Self { hits }
    }
}

#[async_trait]
impl ContentIndex for FixedIndex {
    async fn query(&self, _terms: &[String], top_k: usize) -> Result<Vec<IndexHit>, IndexError> {
        Ok(self.hits.iter().take(top_k).cloned().collect())
    }
}

/// Index fake that always fails with a transient error.
#[derive(Debug, Clone, Default)]
pub struct UnavailableIndex;

#[async_trait]
impl ContentIndex for UnavailableIndex {
    async fn query(&self, _terms: &[String], _top_k: usize) -> Result<Vec<IndexHit>, IndexError> {
        Err(IndexError("simulated index outage".to_string()))
    }
}

/// Static per-track lookup used when the index yields nothing.
///
/// Entries are deliberately foundation-level: with no similarity signal
/// available, generic fundamentals beat a wrong specific guess.
#[must_use]
pub fn fallback_for_track(track_slug: &str, top_k: usize) -> Vec<RecommendationItem> {
    let titles: &[&str] = match track_slug {
        "backend-engineer" => &[
            "API design fundamentals",
            "Relational databases and SQL",
            "HTTP and REST in practice",
            "Testing server-side code",
        ],
        "frontend-engineer" => &[
            "JavaScript fundamentals",
            "Component-driven UI development",
            "CSS layout essentials",
        ],
        "data-analyst" => &[
            "SQL for analysis",
            "Statistics fundamentals",
            "Data visualization essentials",
        ],
        _ => &["Programming fundamentals", "Problem solving for engineers"],
    };

    titles
        .iter()
        .take(top_k)
        .enumerate()
        .map(|(i, title)| RecommendationItem {
            rank: (i + 1) as u32,
            entry_id: format!("fallback/{track_slug}/{i}"),
            title: (*title).to_string(),
            similarity: FALLBACK_SIMILARITY,
            snippet: format!("curated fallback entry for {track_slug}"),
        })
        .collect()
}

/// Handler for `retrieve` stage jobs.
pub struct RetrievalHandler {
    store: Arc<dyn PipelineStore>,
    index: Arc<dyn ContentIndex>,
    call_timeout: Duration,
}

impl RetrievalHandler {
    /// Creates a handler using the given index and per-call timeout.
    #[must_use]
    pub fn new(
        store: Arc<dyn PipelineStore>,
        index: Arc<dyn ContentIndex>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            index,
            call_timeout,
        }
    }

    /// Builds query terms from track tags, weak rule-score areas, and — when
    /// the essay artifact already exists — weakly scored essay topics.
    ///
    /// Essay insights are opportunistic only: this stage runs fully parallel
    /// to essay scoring and never waits for it.
    async fn build_terms(&self, job: &StageJob, track_slug: &str) -> Vec<String> {
        let mut terms: Vec<String> = vec![track_slug.replace('-', " ")];

        if let Ok(Some(assessment)) = self.store.get_assessment(&job.assessment_id).await {
            for tag in &assessment.snapshot.track.tags {
                push_unique(&mut terms, tag);
            }

            if let Ok(Some(rules)) = self.store.get_rule_scores(&job.assessment_id).await {
                for tag in rules.weak_area_tags(WEAK_AREA_THRESHOLD) {
                    push_unique(&mut terms, &tag);
                }
            }

            if let Ok(Some(essays)) = self.store.get_essay_scores(&job.assessment_id).await {
                for scored in &essays.items {
                    if scored.scores.mean() < WEAK_AREA_THRESHOLD {
                        if let Some(item) = assessment
                            .snapshot
                            .items
                            .iter()
                            .find(|i| i.item_id == scored.item_id)
                        {
                            for tag in &item.tags {
                                push_unique(&mut terms, tag);
                            }
                        }
                    }
                }
            }
        }

        terms
    }
}

fn push_unique(terms: &mut Vec<String>, term: &str) {
    if !term.is_empty() && !terms.iter().any(|t| t == term) {
        terms.push(term.to_string());
    }
}

#[async_trait]
impl StageHandler for RetrievalHandler {
    fn stage(&self) -> Stage {
        Stage::Retrieve
    }

    #[tracing::instrument(skip(self, job), fields(assessment_id = %job.assessment_id, attempt = job.attempts + 1))]
    async fn handle(&self, job: &StageJob) -> StageOutcome {
        let JobPayload::Retrieve { track_slug, top_k } = &job.payload else {
            return StageOutcome::Failed(JobError::permanent(
                "retrieve job carries a foreign payload",
            ));
        };

        let terms = self.build_terms(job, track_slug).await;

        let query = tokio::time::timeout(self.call_timeout, self.index.query(&terms, *top_k));
        let hits = match query.await {
            Ok(Ok(hits)) => hits,
            Ok(Err(IndexError(message))) => {
                tracing::warn!(error = %message, "index query failed");
                return StageOutcome::Failed(JobError::transient(message));
            }
            Err(_) => {
                return StageOutcome::Failed(JobError::transient(format!(
                    "index query exceeded {}ms",
                    self.call_timeout.as_millis()
                )));
            }
        };

        let (items, degraded) = if hits.is_empty() {
            tracing::info!(track = %track_slug, "index returned no entries, using static fallback");
            (fallback_for_track(track_slug, *top_k), true)
        } else {
            let mut ranked: Vec<IndexHit> = hits;
            ranked.sort_by(|a, b| {
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let items = ranked
                .into_iter()
                .take(*top_k)
                .enumerate()
                .map(|(i, hit)| RecommendationItem {
                    rank: (i + 1) as u32,
                    entry_id: hit.id,
                    title: hit.title,
                    similarity: hit.similarity,
                    snippet: hit.snippet,
                })
                .collect();
            (items, false)
        };

        let set = RecommendationSet {
            assessment_id: job.assessment_id,
            items,
            query_terms: terms,
            degraded,
            generated_at: Utc::now(),
        };

        if let Err(e) = self.store.put_recommendations(&set).await {
            return StageOutcome::Failed(JobError::transient(e.to_string()));
        }
        if degraded {
            if let Err(e) = self
                .store
                .mark_stage_degraded(&job.assessment_id, Stage::Retrieve)
                .await
            {
                return StageOutcome::Failed(JobError::transient(e.to_string()));
            }
        }

        StageOutcome::Completed {
            result_ref: "recommendations".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_respects_top_k_and_ranks() {
        let items = fallback_for_track("backend-engineer", 2);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].rank, 1);
        assert_eq!(items[1].rank, 2);
        assert!(items.iter().all(|i| (i.similarity - 0.5).abs() < f64::EPSILON));
    }

    #[test]
    fn unknown_track_gets_generic_fallback() {
        let items = fallback_for_track("quantum-plumber", 8);
        assert!(!items.is_empty());
    }

    #[tokio::test]
    async fn fixed_index_truncates_to_top_k() {
        let index = FixedIndex::with_hits(10);
        let hits = index.query(&["backend".into()], 3).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits[0].similarity >= hits[2].similarity);
    }
}
