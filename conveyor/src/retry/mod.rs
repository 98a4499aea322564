//! Failure classification and backoff scheduling for job retries.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// System-wide default retry budget per job.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Whether a stage failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Expected to succeed on retry (network, rate limits, timeouts).
    Transient,
    /// Will not succeed regardless of retry count (malformed input,
    /// validation failures).
    Permanent,
}

/// Failure reasons that classify as permanent. Matched as lowercase
/// substrings of the stage's failure reason.
const PERMANENT_MARKERS: &[&str] = &[
    "validation",
    "malformed",
    "invalid",
    "not found",
    "unsupported",
    "schema",
];

/// Classifies stage failures and computes backoff schedules.
///
/// Construction follows the builder pattern; defaults give exponential
/// backoff from 1s capped at 30s with full jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay for the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap applied to the exponential delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Whether to apply full jitter to computed delays.
    pub jitter: bool,
    /// Default retry budget for jobs without a per-job override.
    pub default_max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter: true,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the default retry budget.
    #[must_use]
    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    /// Classifies a stage failure reason as transient or permanent.
    ///
    /// The matcher uses a closed vocabulary of lowercase substrings.
    /// Unrecognized reasons default to transient. The per-job retry
    /// budget bounds this, so an unknown failure cannot retry forever.
    #[must_use]
    pub fn classify(&self, reason: &str) -> FailureKind {
        let lowered = reason.to_lowercase();
        if PERMANENT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            FailureKind::Permanent
        } else {
            FailureKind::Transient
        }
    }

    /// Computes the requeue delay before retry number `retry_count`
    /// (1-based): exponential in the retry count, capped, with bounded
    /// random jitter to avoid thundering-herd requeue storms.
    #[must_use]
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(32);
        let raw = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let capped = raw.min(self.max_delay_ms);

        let jittered = if self.jitter && capped > 0 {
            rand::thread_rng().gen_range(0..=capped)
        } else {
            capped
        };

        Duration::from_millis(jittered)
    }
}
