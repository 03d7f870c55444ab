//! Assay pipeline worker service.
//!
//! Development runner: wires the in-memory store to the HTTP scorer and
//! index clients and runs the full worker pool until interrupted. A
//! production deployment replaces the store with an implementation backed
//! by a transactional database and runs this loop per replica.
//!
//! ## Environment
//!
//! - `ASSAY_SCORER_URL`: essay scorer endpoint (required)
//! - `ASSAY_INDEX_URL`: content index endpoint (required)
//! - `ASSAY_LOG_FORMAT`: `json` or `pretty` (default `pretty`)
//! - `ASSAY_*`: see [`PipelineConfig::from_env`]

use std::process::ExitCode;
use std::sync::Arc;

use assay_core::observability::{init_logging, LogFormat};
use assay_pipeline::config::PipelineConfig;
use assay_pipeline::events::TracingSink;
use assay_pipeline::retrieval::HttpContentIndex;
use assay_pipeline::scoring::essay::HttpEssayScorer;
use assay_pipeline::store::memory::InMemoryStore;
use assay_pipeline::webhook::HttpWebhookTransport;
use assay_pipeline::worker::WorkerPool;

fn required_env(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => {
            eprintln!("missing required environment variable {name}");
            None
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let format = match std::env::var("ASSAY_LOG_FORMAT").as_deref() {
        Ok("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    };
    init_logging(format);

    let Some(scorer_url) = required_env("ASSAY_SCORER_URL") else {
        return ExitCode::FAILURE;
    };
    let Some(index_url) = required_env("ASSAY_INDEX_URL") else {
        return ExitCode::FAILURE;
    };

    let config = PipelineConfig::from_env();
    tracing::info!(
        workers_per_stage = config.workers_per_stage,
        max_attempts = config.retry.max_attempts,
        "starting assay worker"
    );

    let scorer = match HttpEssayScorer::new(scorer_url, config.essay_timeout) {
        Ok(scorer) => Arc::new(scorer),
        Err(e) => {
            tracing::error!(error = %e, "failed to build scorer client");
            return ExitCode::FAILURE;
        }
    };
    let index = match HttpContentIndex::new(index_url, config.index_timeout) {
        Ok(index) => Arc::new(index),
        Err(e) => {
            tracing::error!(error = %e, "failed to build index client");
            return ExitCode::FAILURE;
        }
    };
    let transport = match HttpWebhookTransport::new(std::time::Duration::from_secs(5)) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            tracing::error!(error = %e, "failed to build webhook transport");
            return ExitCode::FAILURE;
        }
    };

    let store = Arc::new(InMemoryStore::with_policy(config.retry));
    let pool = WorkerPool::spawn(
        store,
        scorer,
        index,
        transport,
        Arc::new(TracingSink),
        config,
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
    pool.shutdown().await;

    ExitCode::SUCCESS
}
