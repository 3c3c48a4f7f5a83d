//! Retry policy and exponential backoff arithmetic.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::core::classifier::ErrorKind;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Immutable retry policy, passed per call.
///
/// Attempts are numbered `1..=max_attempts`. The delay slept after a retryable
/// failure of attempt `k` is `base_delay * 2^(k-1)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    retryable_kinds: BTreeSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            retryable_kinds: ErrorKind::DEFAULT_TRANSIENT.into_iter().collect(),
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        retryable_kinds: impl IntoIterator<Item = ErrorKind>,
    ) -> Result<Self> {
        if max_attempts == 0 {
            bail!("max_attempts must be >= 1");
        }
        Ok(Self {
            max_attempts,
            base_delay,
            retryable_kinds: retryable_kinds.into_iter().collect(),
        })
    }

    /// Policy that never retries: the first failure of any kind propagates.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            retryable_kinds: BTreeSet::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn retryable_kinds(&self) -> &BTreeSet<ErrorKind> {
        &self.retryable_kinds
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable_kinds.contains(&kind)
    }

    /// Delay to sleep after attempt `attempt` (1-indexed) fails, before the next one.
    ///
    /// Saturates at `Duration::MAX` rather than overflowing.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        if exponent >= u32::BITS {
            return if self.base_delay.is_zero() {
                Duration::ZERO
            } else {
                Duration::MAX
            };
        }
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// The full backoff schedule: one delay per retry the policy could perform.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts)
            .map(|attempt| self.delay_after(attempt))
            .collect()
    }
}
