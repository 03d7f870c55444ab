//! Error types for the evaluation pipeline.

use assay_core::AssessmentId;

/// The result type used throughout assay-pipeline.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The question/track snapshot or response set is malformed.
    ///
    /// Raised during submission finalization, before any job is enqueued;
    /// this is the only error that fails an assessment outright.
    #[error("invalid snapshot: {message}")]
    InvalidSnapshot {
        /// Description of what made the snapshot unusable.
        message: String,
    },

    /// A submission reused an idempotency key with a different payload.
    #[error("idempotency conflict for key '{key}'")]
    IdempotencyConflict {
        /// The caller-supplied idempotency key.
        key: String,
    },

    /// An assessment was not found.
    #[error("assessment not found: {assessment_id}")]
    AssessmentNotFound {
        /// The assessment ID that was looked up.
        assessment_id: AssessmentId,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from assay-core.
    #[error("core error: {0}")]
    Core(#[from] assay_core::Error),
}

impl Error {
    /// Creates a new invalid-snapshot error.
    #[must_use]
    pub fn invalid_snapshot(message: impl Into<String>) -> Self {
        Self::InvalidSnapshot {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn invalid_snapshot_display() {
        let err = Error::invalid_snapshot("choice item has no options");
        assert!(err.to_string().contains("invalid snapshot"));
        assert!(err.to_string().contains("no options"));
    }

    #[test]
    fn idempotency_conflict_display() {
        let err = Error::IdempotencyConflict { key: "K1".into() };
        assert!(err.to_string().contains("K1"));
    }

    #[test]
    fn state_transition_error_display() {
        let err = Error::InvalidStateTransition {
            from: "queued".into(),
            to: "succeeded".into(),
            reason: "job must be leased first".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("queued"));
        assert!(msg.contains("succeeded"));
        assert!(msg.contains("leased first"));
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "row missing");
        let err = Error::storage_with_source("failed to load job", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
    }
}
