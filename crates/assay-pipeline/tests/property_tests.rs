//! Property-based tests for pipeline invariants.
//!
//! These tests use proptest to verify invariants hold across randomly
//! generated inputs: backoff bounds, state machine soundness, and
//! fingerprint stability.

use std::time::Duration;

use proptest::prelude::*;

use assay_pipeline::assessment::AssessmentStatus;
use assay_pipeline::idempotency::fingerprint;
use assay_pipeline::job::{JobStatus, RetryPolicy};

fn arb_job_status() -> impl Strategy<Value = JobStatus> {
    prop::sample::select(vec![
        JobStatus::Queued,
        JobStatus::Leased,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::DeadLetter,
    ])
}

fn arb_assessment_status() -> impl Strategy<Value = AssessmentStatus> {
    prop::sample::select(vec![
        AssessmentStatus::InProgress,
        AssessmentStatus::AwaitingAsync,
        AssessmentStatus::Completed,
        AssessmentStatus::Failed,
    ])
}

proptest! {
    /// The computed backoff never exceeds the configured cap, for any
    /// attempt count and any (base, cap) pair.
    #[test]
    fn backoff_never_exceeds_cap(
        attempts in 1u32..64,
        base_ms in 1u64..5_000,
        cap_ms in 1u64..120_000,
    ) {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(cap_ms),
        };
        let delay = policy.backoff(attempts);
        prop_assert!(delay <= policy.max_delay);
    }

    /// Retry allowance is exact: permitted strictly below the budget,
    /// refused at and beyond it.
    #[test]
    fn retry_allowance_is_exact(max_attempts in 1u32..10, attempts in 0u32..20) {
        let policy = RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        };
        prop_assert_eq!(policy.allows_retry(attempts), attempts < max_attempts);
    }

    /// Terminal job states admit no outgoing transitions; non-terminal
    /// states admit at least one.
    #[test]
    fn job_state_machine_terminality(from in arb_job_status(), to in arb_job_status()) {
        if from.is_terminal() {
            prop_assert!(!from.can_transition_to(to));
        }
        if !from.is_terminal() {
            let has_exit = [
                JobStatus::Queued,
                JobStatus::Leased,
                JobStatus::Succeeded,
                JobStatus::Failed,
                JobStatus::DeadLetter,
            ]
            .into_iter()
            .any(|target| from.can_transition_to(target));
            prop_assert!(has_exit);
        }
    }

    /// A job can never move from one terminal state to another.
    #[test]
    fn no_transitions_between_terminal_job_states(from in arb_job_status(), to in arb_job_status()) {
        if from.is_terminal() && to.is_terminal() {
            prop_assert!(!from.can_transition_to(to));
        }
    }

    /// Terminal assessment states are frozen.
    #[test]
    fn assessment_state_machine_terminality(
        from in arb_assessment_status(),
        to in arb_assessment_status(),
    ) {
        if from.is_terminal() {
            prop_assert!(!from.can_transition_to(to));
        }
    }

    /// Fingerprints are a pure function of the payload bytes.
    #[test]
    fn fingerprint_is_stable_and_sensitive(payload in prop::collection::vec(any::<u8>(), 0..512)) {
        let a = fingerprint(&payload);
        let b = fingerprint(&payload);
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a.len(), 64);

        let mut mutated = payload.clone();
        mutated.push(0xFF);
        prop_assert_ne!(a, fingerprint(&mutated));
    }
}
