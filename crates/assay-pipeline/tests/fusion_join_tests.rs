//! Fan-in correctness tests: fusion ordering, interleavings, and the
//! exactly-once terminal transition, driven by hand without the worker pool.

use std::sync::Arc;
use std::time::Duration;

use assay_core::AssessmentId;
use assay_pipeline::assessment::AssessmentStatus;
use assay_pipeline::config::PipelineConfig;
use assay_pipeline::events::InMemoryOutbox;
use assay_pipeline::fusion::{FusionCoordinator, FusionOutcome, JoinState};
use assay_pipeline::job::Stage;
use assay_pipeline::retrieval::{FixedIndex, RetrievalHandler};
use assay_pipeline::scoring::essay::{EssayScoringHandler, FixedScorer};
use assay_pipeline::snapshot::{ItemKind, ItemRule, ResponseSet, Snapshot, SnapshotItem, TrackRef};
use assay_pipeline::status::StatusAggregator;
use assay_pipeline::store::memory::InMemoryStore;
use assay_pipeline::store::{PipelineStore, TerminalWrite};
use assay_pipeline::submission::{SubmissionRequest, SubmissionService};
use assay_pipeline::worker::{StageHandler, StageOutcome};

const WORKER: &str = "test-worker";
const LEASE: Duration = Duration::from_secs(30);

struct Fixture {
    store: Arc<InMemoryStore>,
    essay: EssayScoringHandler,
    retrieval: RetrievalHandler,
    coordinator: FusionCoordinator,
    aggregator: StatusAggregator,
    assessment_id: AssessmentId,
}

async fn fixture() -> Fixture {
    let store = Arc::new(InMemoryStore::new());
    let events = Arc::new(InMemoryOutbox::new());
    let service = SubmissionService::new(store.clone(), events, PipelineConfig::default());

    let choice = SnapshotItem {
        item_id: assay_core::ItemId::generate(),
        kind: ItemKind::Choice,
        prompt: "Pick one.".into(),
        weight: 1.0,
        tags: vec![],
        rule: ItemRule::CorrectOption {
            correct: "A".into(),
            options: vec!["A".into(), "B".into()],
        },
    };
    let essay_item = SnapshotItem {
        item_id: assay_core::ItemId::generate(),
        kind: ItemKind::Essay,
        prompt: "Explain eventual consistency.".into(),
        weight: 1.0,
        tags: vec![],
        rule: ItemRule::Rubric {
            text: "clarity, accuracy, coherence".into(),
        },
    };
    let responses = ResponseSet::from_pairs([
        (choice.item_id, "A".to_string()),
        (essay_item.item_id, "Replicas converge over time.".to_string()),
    ]);

    let outcome = service
        .submit(SubmissionRequest {
            owner: "learner-1".into(),
            snapshot: Snapshot::new(
                TrackRef::new("backend-engineer", "Backend Engineer"),
                vec![choice, essay_item],
            ),
            responses,
            idempotency_key: None,
            webhook_url: None,
        })
        .await
        .unwrap();

    Fixture {
        essay: EssayScoringHandler::new(
            store.clone(),
            Arc::new(FixedScorer::new(0.8, 0.8, 0.8)),
            Duration::from_secs(1),
        ),
        retrieval: RetrievalHandler::new(
            store.clone(),
            Arc::new(FixedIndex::with_hits(8)),
            Duration::from_secs(1),
        ),
        coordinator: FusionCoordinator::new(store.clone()),
        aggregator: StatusAggregator::new(store.clone()),
        store,
        assessment_id: outcome.assessment_id,
    }
}

impl Fixture {
    /// Leases, handles, and completes one stage job end to end.
    async fn run_stage(&self, handler: &dyn StageHandler) {
        let job = self
            .store
            .lease(handler.stage(), WORKER, LEASE)
            .await
            .unwrap()
            .expect("stage job must be leasable");
        match handler.handle(&job).await {
            StageOutcome::Completed { result_ref } => {
                let cas = self
                    .store
                    .complete_job(&job.id, WORKER, &result_ref)
                    .await
                    .unwrap();
                assert!(cas.is_success());
            }
            other => panic!("stage {} did not complete: {other:?}", handler.stage()),
        }
    }

    async fn progress(&self) -> f64 {
        self.aggregator
            .get_status(self.assessment_id)
            .await
            .unwrap()
            .progress
    }

    async fn final_state(&self) -> (AssessmentStatus, bool, f64) {
        let report = self.aggregator.get_status(self.assessment_id).await.unwrap();
        let summary = self
            .store
            .get_fusion_summary(&self.assessment_id)
            .await
            .unwrap()
            .expect("fused assessment has a summary");
        (report.status, report.degraded, summary.breakdown.overall_pct)
    }
}

#[tokio::test]
async fn fusion_never_runs_before_both_stages_are_terminal() {
    let f = fixture().await;

    // Neither stage terminal.
    match f.coordinator.fuse(f.assessment_id).await.unwrap() {
        FusionOutcome::NotReady(join) => assert_eq!(join, JoinState::WaitingBoth),
        FusionOutcome::Fused { .. } => panic!("fused with no terminal predecessor"),
    }

    // Only retrieval terminal.
    f.run_stage(&f.retrieval).await;
    match f.coordinator.fuse(f.assessment_id).await.unwrap() {
        FusionOutcome::NotReady(join) => assert_eq!(join, JoinState::WaitingEssay),
        FusionOutcome::Fused { .. } => panic!("fused with essay stage in flight"),
    }

    // Both terminal.
    f.run_stage(&f.essay).await;
    match f.coordinator.fuse(f.assessment_id).await.unwrap() {
        FusionOutcome::Fused { write, .. } => assert!(write.is_applied()),
        FusionOutcome::NotReady(join) => panic!("join stuck at {join:?}"),
    }
}

#[tokio::test]
async fn progress_climbs_monotonically_essay_first() {
    let f = fixture().await;
    assert_eq!(f.progress().await, 20.0);

    f.run_stage(&f.essay).await;
    assert_eq!(f.progress().await, 50.0);

    f.run_stage(&f.retrieval).await;
    assert_eq!(f.progress().await, 80.0);

    f.coordinator.fuse(f.assessment_id).await.unwrap();
    assert_eq!(f.progress().await, 100.0);
}

#[tokio::test]
async fn progress_climbs_monotonically_retrieval_first() {
    let f = fixture().await;
    assert_eq!(f.progress().await, 20.0);

    f.run_stage(&f.retrieval).await;
    assert_eq!(f.progress().await, 50.0);

    f.run_stage(&f.essay).await;
    assert_eq!(f.progress().await, 80.0);

    f.coordinator.fuse(f.assessment_id).await.unwrap();
    assert_eq!(f.progress().await, 100.0);
}

#[tokio::test]
async fn completion_order_does_not_change_the_final_state() {
    let essay_first = {
        let f = fixture().await;
        f.run_stage(&f.essay).await;
        f.run_stage(&f.retrieval).await;
        f.coordinator.fuse(f.assessment_id).await.unwrap();
        f.final_state().await
    };

    let retrieval_first = {
        let f = fixture().await;
        f.run_stage(&f.retrieval).await;
        f.run_stage(&f.essay).await;
        f.coordinator.fuse(f.assessment_id).await.unwrap();
        f.final_state().await
    };

    assert_eq!(essay_first.0, retrieval_first.0);
    assert_eq!(essay_first.1, retrieval_first.1);
    assert!((essay_first.2 - retrieval_first.2).abs() < 1e-9);
}

#[tokio::test]
async fn concurrent_triggers_elect_exactly_one_terminal_writer() {
    let f = fixture().await;
    f.run_stage(&f.essay).await;
    f.run_stage(&f.retrieval).await;

    let coordinator = Arc::new(FusionCoordinator::new(f.store.clone()));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let coordinator = Arc::clone(&coordinator);
        let id = f.assessment_id;
        handles.push(tokio::spawn(async move {
            coordinator.fuse(id).await.unwrap()
        }));
    }

    let mut applied = 0;
    for handle in handles {
        if let FusionOutcome::Fused { write, .. } = handle.await.unwrap() {
            if matches!(write, TerminalWrite::Applied) {
                applied += 1;
            }
        } else {
            panic!("join was satisfied; every trigger must observe Fused");
        }
    }
    assert_eq!(applied, 1, "exactly one trigger performs the terminal write");

    let assessment = f
        .store
        .get_assessment(&f.assessment_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(assessment.status, AssessmentStatus::Completed);
}

#[tokio::test]
async fn refused_duplicate_stage_completion_does_not_double_count() {
    let f = fixture().await;

    // Simulate at-least-once delivery: the first worker's lease expires and
    // a second worker re-processes the same retrieval job.
    let job = f
        .store
        .lease(Stage::Retrieve, "crashed-worker", Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    let outcome = f.retrieval.handle(&job).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let reclaimed = f
        .store
        .lease(Stage::Retrieve, WORKER, LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.id, job.id);
    match f.retrieval.handle(&reclaimed).await {
        StageOutcome::Completed { result_ref } => {
            let cas = f
                .store
                .complete_job(&reclaimed.id, WORKER, &result_ref)
                .await
                .unwrap();
            assert!(cas.is_success());
        }
        other => panic!("retrieval re-run did not complete: {other:?}"),
    }

    // The crashed worker's stale completion bounces off the lease check.
    if let StageOutcome::Completed { result_ref } = outcome {
        let stale = f
            .store
            .complete_job(&job.id, "crashed-worker", &result_ref)
            .await
            .unwrap();
        assert!(!stale.is_success());
    }

    f.run_stage(&f.essay).await;
    match f.coordinator.fuse(f.assessment_id).await.unwrap() {
        FusionOutcome::Fused { write, .. } => assert!(write.is_applied()),
        FusionOutcome::NotReady(join) => panic!("join stuck at {join:?}"),
    }
}
