//! Worker pool runtime.
//!
//! A pool of stateless workers per stage kind, each pulling leased work from
//! the job store. Workers block only on the remote collaborator call and on
//! the lease-acquisition poll; all other pipeline logic is non-blocking.
//!
//! Stage completion is communicated through StageJob state transitions, not
//! callbacks: after an upstream stage reaches a terminal state its worker
//! pokes the fusion join by leasing the assessment's `fuse` job directly.
//! The fuse worker loop doubles as the crash-recovery sweep, re-leasing any
//! fuse job whose trigger was lost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use assay_core::AssessmentId;

use crate::config::PipelineConfig;
use crate::events::{EventKind, EventSink, PipelineEvent};
use crate::fusion::FusionHandler;
use crate::job::{JobError, Stage, StageJob};
use crate::metrics::PipelineMetrics;
use crate::retrieval::{ContentIndex, RetrievalHandler};
use crate::scoring::essay::{EssayScorer, EssayScoringHandler};
use crate::store::{CasResult, FailOutcome, PipelineStore};
use crate::webhook::{WebhookNotifier, WebhookTransport};

/// Result of one stage attempt, produced by a handler.
#[derive(Debug)]
pub enum StageOutcome {
    /// The attempt succeeded; complete the job with this artifact pointer.
    Completed {
        /// Pointer to the produced artifact.
        result_ref: String,
    },
    /// The attempt failed; route through the retry/dead-letter manager.
    Failed(JobError),
    /// The job cannot make progress yet; release it without consuming an
    /// attempt (used by the fusion join).
    NotReady {
        /// Delay before the job becomes lease-able again.
        retry_in: Duration,
    },
}

/// Processes leased jobs for one stage.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// The stage this handler processes.
    fn stage(&self) -> Stage;

    /// Processes one leased job.
    ///
    /// Implementations must be idempotent: the same job may be handed out
    /// again after a lease expiry.
    async fn handle(&self, job: &StageJob) -> StageOutcome;
}

/// One stage worker: a lease loop with heartbeats around a handler.
struct StageWorker {
    store: Arc<dyn PipelineStore>,
    handler: Arc<dyn StageHandler>,
    /// Fusion handler used to poke the join after upstream completion;
    /// `None` for the fuse worker itself.
    fuse_trigger: Option<Arc<FusionHandler>>,
    events: Arc<dyn EventSink>,
    metrics: PipelineMetrics,
    config: PipelineConfig,
    worker_id: String,
}

impl StageWorker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let stage = self.handler.stage();
        tracing::info!(worker_id = %self.worker_id, stage = %stage, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self
                .store
                .lease(stage, &self.worker_id, self.config.lease_duration)
                .await
            {
                Ok(Some(job)) => {
                    self.process(job).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(worker_id = %self.worker_id, error = %e, "lease poll failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        tracing::info!(worker_id = %self.worker_id, stage = %stage, "worker stopped");
    }

    /// Runs the handler under a heartbeat, then applies its outcome.
    async fn process(&self, job: StageJob) {
        let stage = job.stage;
        self.metrics.record_lease(stage.as_label());
        let started = Instant::now();

        let outcome = {
            let mut work = std::pin::pin!(self.handler.handle(&job));
            let mut beats = tokio::time::interval(self.config.heartbeat_interval);
            beats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            beats.tick().await; // first tick is immediate
            loop {
                tokio::select! {
                    outcome = &mut work => break outcome,
                    _ = beats.tick() => {
                        let result = self
                            .store
                            .heartbeat(&job.id, &self.worker_id, self.config.lease_duration)
                            .await;
                        if !matches!(result, Ok(CasResult::Success)) {
                            tracing::warn!(job_id = %job.id, "heartbeat rejected, lease lost");
                        }
                    }
                }
            }
        };

        match outcome {
            StageOutcome::Completed { result_ref } => {
                match self
                    .store
                    .complete_job(&job.id, &self.worker_id, &result_ref)
                    .await
                {
                    Ok(CasResult::Success) => {
                        self.metrics.record_outcome(stage.as_label(), "succeeded");
                        self.metrics
                            .observe_stage_duration(stage.as_label(), started.elapsed().as_secs_f64());
                        self.events.push(PipelineEvent::new(
                            job.assessment_id,
                            EventKind::StageSucceeded {
                                stage,
                                attempts: job.attempts,
                            },
                        ));
                        self.trigger_fusion(job.assessment_id).await;
                    }
                    Ok(other) => {
                        // Lease expired mid-flight or a duplicate finished
                        // first; effects are idempotent, so drop the result.
                        tracing::warn!(job_id = %job.id, result = ?other, "completion rejected");
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job.id, error = %e, "completion failed");
                    }
                }
            }
            StageOutcome::Failed(error) => {
                let error_kind = error.kind;
                match self.store.fail_job(&job.id, &self.worker_id, error).await {
                    Ok(FailOutcome::Retried { next_run_at }) => {
                        self.metrics.record_retry(stage.as_label());
                        self.metrics.record_outcome(stage.as_label(), "retried");
                        self.events.push(PipelineEvent::new(
                            job.assessment_id,
                            EventKind::StageRetryScheduled {
                                stage,
                                attempts: job.attempts + 1,
                                error_kind,
                            },
                        ));
                        tracing::info!(job_id = %job.id, %next_run_at, "retry scheduled");
                    }
                    Ok(FailOutcome::DeadLettered) => {
                        self.metrics.record_dead_letter(stage.as_label());
                        self.metrics.record_outcome(stage.as_label(), "dead_letter");
                        self.events.push(PipelineEvent::new(
                            job.assessment_id,
                            EventKind::StageDeadLettered {
                                stage,
                                attempts: job.attempts + 1,
                            },
                        ));
                        tracing::warn!(job_id = %job.id, "job dead-lettered");
                        // A dead letter is terminal; the join may now be
                        // satisfied.
                        self.trigger_fusion(job.assessment_id).await;
                    }
                    Ok(other) => {
                        tracing::warn!(job_id = %job.id, result = ?other, "failure report rejected");
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job.id, error = %e, "failure report failed");
                    }
                }
            }
            StageOutcome::NotReady { retry_in } => {
                if let Err(e) = self
                    .store
                    .release_job(&job.id, &self.worker_id, retry_in)
                    .await
                {
                    tracing::error!(job_id = %job.id, error = %e, "release failed");
                }
            }
        }
    }

    /// Pokes the fusion join for this assessment.
    ///
    /// Best-effort: if the targeted lease is unavailable (another trigger
    /// holds it, or the job is already terminal) the fuse worker loop will
    /// pick it up on its next poll.
    async fn trigger_fusion(&self, assessment_id: AssessmentId) {
        let Some(fusion) = &self.fuse_trigger else {
            return;
        };

        let fuse_job = match self.store.get_job(&assessment_id, Stage::Fuse).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "fusion trigger lookup failed");
                return;
            }
        };
        let leased = match self
            .store
            .lease_job(&fuse_job.id, &self.worker_id, self.config.lease_duration)
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "fusion trigger lease failed");
                return;
            }
        };

        // Fusion holds no remote calls, so the trigger path skips the
        // heartbeat machinery.
        match fusion.handle(&leased).await {
            StageOutcome::Completed { result_ref } => {
                match self
                    .store
                    .complete_job(&leased.id, &self.worker_id, &result_ref)
                    .await
                {
                    Ok(CasResult::Success) => {
                        self.metrics.record_outcome(Stage::Fuse.as_label(), "succeeded");
                        self.events.push(PipelineEvent::new(
                            assessment_id,
                            EventKind::StageSucceeded {
                                stage: Stage::Fuse,
                                attempts: leased.attempts,
                            },
                        ));
                    }
                    Ok(other) => {
                        tracing::warn!(result = ?other, "fusion completion rejected");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "fusion completion failed");
                    }
                }
            }
            StageOutcome::NotReady { retry_in } => {
                let _ = self
                    .store
                    .release_job(&leased.id, &self.worker_id, retry_in)
                    .await;
            }
            StageOutcome::Failed(error) => {
                let _ = self.store.fail_job(&leased.id, &self.worker_id, error).await;
            }
        }
    }
}

/// The running worker pool.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawns stage workers, the fusion sweep, and the webhook loop.
    #[must_use]
    pub fn spawn(
        store: Arc<dyn PipelineStore>,
        scorer: Arc<dyn EssayScorer>,
        index: Arc<dyn ContentIndex>,
        transport: Arc<dyn WebhookTransport>,
        events: Arc<dyn EventSink>,
        config: PipelineConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = PipelineMetrics::new();

        let notifier = Arc::new(WebhookNotifier::new(
            Arc::clone(&store),
            transport,
            config.webhook_retry(),
            Arc::clone(&events),
        ));
        let fusion = Arc::new(FusionHandler::new(
            Arc::clone(&store),
            Arc::clone(&notifier),
            Arc::clone(&events),
            config.fusion_retry_delay,
        ));
        let essay: Arc<dyn StageHandler> = Arc::new(EssayScoringHandler::new(
            Arc::clone(&store),
            scorer,
            config.essay_timeout,
        ));
        let retrieval: Arc<dyn StageHandler> = Arc::new(RetrievalHandler::new(
            Arc::clone(&store),
            index,
            config.index_timeout,
        ));

        let mut handles = Vec::new();
        let stages: [(Arc<dyn StageHandler>, Option<Arc<FusionHandler>>, &str); 3] = [
            (essay, Some(Arc::clone(&fusion)), "essay"),
            (retrieval, Some(Arc::clone(&fusion)), "retrieval"),
            (Arc::clone(&fusion) as Arc<dyn StageHandler>, None, "fuse"),
        ];

        for (handler, fuse_trigger, name) in stages {
            for i in 0..config.workers_per_stage.max(1) {
                let worker = StageWorker {
                    store: Arc::clone(&store),
                    handler: Arc::clone(&handler),
                    fuse_trigger: fuse_trigger.clone(),
                    events: Arc::clone(&events),
                    metrics: metrics.clone(),
                    config: config.clone(),
                    worker_id: format!("{name}-{i}"),
                };
                handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
            }
        }

        handles.push(tokio::spawn(webhook_loop(
            notifier,
            config.poll_interval,
            shutdown_rx,
        )));

        Self {
            handles,
            shutdown_tx,
        }
    }

    /// Signals shutdown and waits for every worker to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn webhook_loop(
    notifier: Arc<WebhookNotifier>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        if let Err(e) = notifier.run_due(chrono::Utc::now()).await {
            tracing::warn!(error = %e, "webhook pass failed");
        }
        tokio::select! {
            _ = shutdown.changed() => {}
            () = tokio::time::sleep(poll_interval) => {}
        }
    }
}
