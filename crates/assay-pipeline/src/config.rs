//! Pipeline runtime configuration.
//!
//! Defaults match the collaborator latency contracts: essay scoring is slow
//! (sub-10s p95), retrieval is fast (sub-1.5s average), and both feed the
//! shared retry schedule on timeout.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::RetryPolicy;
use crate::retrieval::DEFAULT_TOP_K;
use crate::webhook::DEFAULT_MAX_DELIVERY_ATTEMPTS;

/// Tunable knobs for the worker runtime and stage handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    /// Retry policy for stage jobs.
    pub retry: RetryPolicy,
    /// How long a lease lasts before it can be reclaimed.
    #[serde(with = "humantime_serde")]
    pub lease_duration: Duration,
    /// How often a worker extends its lease while processing.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Idle poll interval when no work is lease-able.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Per-call timeout for the external essay scorer.
    #[serde(with = "humantime_serde")]
    pub essay_timeout: Duration,
    /// Per-call timeout for the external content index.
    #[serde(with = "humantime_serde")]
    pub index_timeout: Duration,
    /// Delay before re-checking an unsatisfied fusion join.
    #[serde(with = "humantime_serde")]
    pub fusion_retry_delay: Duration,
    /// Entries requested from the content index.
    pub top_k: usize,
    /// Worker tasks per stage kind.
    pub workers_per_stage: usize,
    /// Cap on webhook delivery attempts per target.
    pub webhook_max_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            lease_duration: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            poll_interval: Duration::from_millis(200),
            essay_timeout: Duration::from_secs(10),
            index_timeout: Duration::from_millis(1500),
            fusion_retry_delay: Duration::from_millis(200),
            top_k: DEFAULT_TOP_K,
            workers_per_stage: 2,
            webhook_max_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
        }
    }
}

impl PipelineConfig {
    /// Loads overrides from `ASSAY_*` environment variables on top of the
    /// defaults.
    ///
    /// Unknown or malformed values fall back to the default rather than
    /// failing startup.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_u64("ASSAY_LEASE_SECS") {
            config.lease_duration = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("ASSAY_ESSAY_TIMEOUT_SECS") {
            config.essay_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("ASSAY_INDEX_TIMEOUT_MS") {
            config.index_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("ASSAY_MAX_ATTEMPTS") {
            config.retry.max_attempts = v as u32;
        }
        if let Some(v) = env_u64("ASSAY_TOP_K") {
            config.top_k = v as usize;
        }
        if let Some(v) = env_u64("ASSAY_WORKERS_PER_STAGE") {
            config.workers_per_stage = (v as usize).max(1);
        }
        config
    }

    /// Retry policy used for webhook deliveries: same backoff curve, but
    /// capped at the webhook attempt limit.
    #[must_use]
    pub fn webhook_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.webhook_max_attempts,
            ..self.retry
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_collaborator_contracts() {
        let config = PipelineConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.essay_timeout, Duration::from_secs(10));
        assert_eq!(config.index_timeout, Duration::from_millis(1500));
        assert_eq!(config.top_k, 8);
    }

    #[test]
    fn webhook_retry_caps_attempts_independently() {
        let config = PipelineConfig::default();
        let policy = config.webhook_retry();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, config.retry.base_delay);
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = PipelineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.top_k, config.top_k);
        assert_eq!(parsed.lease_duration, config.lease_duration);
    }
}
