//! # assay-core
//!
//! Core abstractions for the Assay assessment evaluation pipeline.
//!
//! This crate provides the foundational types used across all Assay components:
//!
//! - **Identifiers**: Strongly-typed IDs for assessments, stage jobs, and deliveries
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Structured logging initialization helpers
//!
//! ## Crate Boundary
//!
//! `assay-core` is the **only** crate allowed to define shared primitives.
//! The pipeline engine builds on top of these and never redefines them.
//!
//! ## Example
//!
//! ```rust
//! use assay_core::prelude::*;
//!
//! let assessment_id = AssessmentId::generate();
//! let job_id = JobId::generate();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

pub use error::{Error, Result};
pub use id::{AssessmentId, DeliveryId, EventId, ItemId, JobId};

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use assay_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{AssessmentId, DeliveryId, EventId, ItemId, JobId};
    pub use crate::observability::{init_logging, LogFormat};
}
