//! Observability infrastructure for Assay.
//!
//! Structured logging with consistent spans across all pipeline components.
//! This module provides initialization helpers and span constructors so
//! workers and services log with the same shape.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `assay_pipeline=debug`)
///
/// # Example
///
/// ```rust
/// use assay_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for pipeline stage operations with standard fields.
///
/// # Example
///
/// ```rust
/// use assay_core::observability::stage_span;
///
/// let span = stage_span("essay_score", "01ARZ3NDEKTSV4RRFFQ69G5FAV");
/// let _guard = span.enter();
/// // ... process the stage
/// ```
#[must_use]
pub fn stage_span(stage: &str, assessment_id: &str) -> Span {
    tracing::info_span!(
        "stage",
        stage = stage,
        assessment_id = assessment_id,
    )
}
