//! Strongly-typed identifiers for Assay entities.
//!
//! All identifiers in Assay are:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **Lexicographically sortable**: ULIDs encode creation time and sort naturally
//! - **Globally unique**: No coordination required for generation
//!
//! # Example
//!
//! ```rust
//! use assay_core::id::{AssessmentId, JobId};
//!
//! let assessment = AssessmentId::generate();
//! let job = JobId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: AssessmentId = job;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a new unique identifier.
            ///
            /// Uses ULID generation which is:
            /// - Lexicographically sortable by creation time
            /// - Globally unique without coordination
            /// - URL-safe and case-insensitive
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Creates an identifier from a raw ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the creation timestamp encoded in the ID.
            #[must_use]
            pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                let ms = self.0.timestamp_ms();
                chrono::DateTime::from_timestamp_millis(ms as i64).unwrap_or_else(chrono::Utc::now)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Ulid::from_string(s)
                    .map(Self)
                    .map_err(|e| Error::InvalidId {
                        message: format!(concat!("invalid ", $label, " ID '{}': {}"), s, e),
                    })
            }
        }
    };
}

define_id!(
    /// A unique identifier for an assessment.
    ///
    /// The assessment is the aggregate root of the evaluation pipeline; every
    /// stage job, artifact, and webhook delivery is scoped to one assessment.
    AssessmentId,
    "assessment"
);

define_id!(
    /// A unique identifier for a stage job.
    ///
    /// Stage jobs are the durable unit of pipeline work, one per
    /// (assessment, stage) pair.
    JobId,
    "job"
);

define_id!(
    /// A unique identifier for a webhook delivery attempt log.
    DeliveryId,
    "delivery"
);

define_id!(
    /// A unique identifier for a question item within a snapshot.
    ItemId,
    "item"
);

define_id!(
    /// A unique identifier for an audit event.
    EventId,
    "event"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let a = AssessmentId::generate();
        let b = AssessmentId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn ids_round_trip_through_strings() {
        let id = JobId::generate();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn invalid_id_string_is_rejected() {
        let result: Result<AssessmentId> = "not-a-ulid".parse();
        assert!(matches!(result, Err(Error::InvalidId { .. })));
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = DeliveryId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }

    #[test]
    fn ids_sort_by_creation_order() {
        let earlier = EventId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let later = EventId::generate();
        assert!(earlier < later);
    }
}
