//! # assay-pipeline
//!
//! Asynchronous multi-stage evaluation pipeline for submitted assessments.
//!
//! This crate implements the evaluation domain, providing:
//!
//! - **Submission Finalization**: Idempotent admission with inline rule scoring
//! - **Parallel Stages**: Essay scoring and catalog retrieval against
//!   unreliable external collaborators
//! - **Fan-in Fusion**: A join that produces one explainable result and is
//!   the single writer of terminal assessment state
//! - **Bounded Retries**: Exponential backoff with jitter, dead-lettering,
//!   and degraded fallbacks
//! - **Progress & Delivery**: Stage-weighted status projection and
//!   at-least-once webhook notification
//!
//! ## Guarantees
//!
//! - **Exactly-once terminal transition**: Duplicate stage completions and
//!   concurrent fusion triggers elect exactly one winner
//! - **At-least-once processing**: Leases expire and work is re-handed out;
//!   every stage effect is idempotent
//! - **Bounded termination**: A stage whose collaborator never answers
//!   dead-letters after its attempt budget and never blocks fusion
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use assay_pipeline::config::PipelineConfig;
//! use assay_pipeline::events::TracingSink;
//! use assay_pipeline::snapshot::{ResponseSet, Snapshot, TrackRef};
//! use assay_pipeline::store::memory::InMemoryStore;
//! use assay_pipeline::submission::{SubmissionRequest, SubmissionService};
//!
//! # async fn run() -> assay_pipeline::error::Result<()> {
//! let store = Arc::new(InMemoryStore::new());
//! let service = SubmissionService::new(
//!     store,
//!     Arc::new(TracingSink),
//!     PipelineConfig::default(),
//! );
//!
//! let outcome = service
//!     .submit(SubmissionRequest {
//!         owner: "learner-1".into(),
//!         snapshot: Snapshot::new(
//!             TrackRef::new("backend-engineer", "Backend Engineer"),
//!             vec![],
//!         ),
//!         responses: ResponseSet::default(),
//!         idempotency_key: Some("K1".into()),
//!         webhook_url: None,
//!     })
//!     .await?;
//! println!("admitted {}", outcome.assessment_id);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod artifact;
pub mod assessment;
pub mod config;
pub mod error;
pub mod events;
pub mod fusion;
pub mod idempotency;
pub mod job;
pub mod metrics;
pub mod retrieval;
pub mod scoring;
pub mod snapshot;
pub mod status;
pub mod store;
pub mod submission;
pub mod webhook;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::artifact::{
        EssayScoreSet, FusionSummary, RecommendationSet, RubricScores, RuleScoreSet,
    };
    pub use crate::assessment::{Assessment, AssessmentStatus};
    pub use crate::config::PipelineConfig;
    pub use crate::error::{Error, Result};
    pub use crate::events::{EventSink, InMemoryOutbox, PipelineEvent};
    pub use crate::fusion::{FusionCoordinator, FusionOutcome, JoinState};
    pub use crate::idempotency::{Admission, IdempotencyGuard};
    pub use crate::job::{JobError, JobPayload, JobStatus, RetryPolicy, Stage, StageJob};
    pub use crate::retrieval::{ContentIndex, IndexHit};
    pub use crate::scoring::essay::{EssayScorer, ScoreRequest, ScoredRubric};
    pub use crate::snapshot::{ItemKind, ResponseSet, Snapshot, TrackRef};
    pub use crate::status::{ResultView, StatusAggregator, StatusReport};
    pub use crate::store::{CasResult, PipelineStore, TerminalWrite};
    pub use crate::submission::{SubmissionRequest, SubmissionService};
    pub use crate::webhook::{WebhookNotifier, WebhookTransport};
    pub use crate::worker::{StageHandler, StageOutcome, WorkerPool};
}
