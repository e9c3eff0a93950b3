//! Retry decisions for failed stage attempts.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::document::Stage;
use crate::error::ErrorKind;

/// What the runner should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt of the same stage after the delay.
    RetryAfter(Duration),
    /// Non-retryable failure: reject the document.
    Fail,
    /// Retryable failure, but the attempt budget is spent.
    Escalate,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random, in `[0, 1)`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 0.99),
        }
    }

    /// A policy without jitter, for predictable delays.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Decides what happens after attempt number `attempts_so_far` of `stage`
    /// failed with `kind`.
    pub fn decide(&self, stage: Stage, kind: ErrorKind, attempts_so_far: u32) -> RetryDecision {
        if !kind.is_retryable() {
            return RetryDecision::Fail;
        }
        if attempts_so_far >= self.max_attempts {
            log::debug!(
                "Retry budget spent for {} after {} attempt(s)",
                stage,
                attempts_so_far
            );
            return RetryDecision::Escalate;
        }
        RetryDecision::RetryAfter(self.delay_for(attempts_so_far))
    }

    /// Capped exponential delay before the attempt following `attempts_so_far`:
    /// base, 2×base, 4×base... then jittered and capped again.
    pub fn delay_for(&self, attempts_so_far: u32) -> Duration {
        let exponent = attempts_so_far.saturating_sub(1).min(31);
        let backoff = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter <= 0.0 || backoff.is_zero() {
            return backoff;
        }

        let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        backoff.mul_f64(factor).min(self.max_delay)
    }
}
