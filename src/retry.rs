//! Bounded retry with randomized exponential backoff.
//!
//! Wraps every embedding and summarization call. Transient provider errors
//! (rate limits, server errors) sleep for a random duration in
//! `[0, min(max_delay, base_delay * 2^attempt)]` and try again; fatal errors
//! and exhausted budgets become [`Error::Provider`] tagged with the phase.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Phase, ProviderError, Result};

/// Retry budget for capability calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff ceiling of the first retry.
    pub base_delay_ms: u64,
    /// Backoff ceiling cap.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay_ms: 500,
            max_delay_ms: 20_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps; handy in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::invalid("retry.max_attempts", "must be > 0"));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(Error::invalid(
                "retry.base_delay_ms",
                "must not exceed retry.max_delay_ms",
            ));
        }
        Ok(())
    }

    /// Backoff ceiling before retry number `attempt` (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Randomized delay ("full jitter") before retry number `attempt`.
    pub fn backoff(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.random_range(0..=ceiling))
    }

    /// Run `op` until it succeeds, fails fatally, or the budget is spent.
    pub fn run<T>(
        &self,
        phase: Phase,
        mut op: impl FnMut() -> std::result::Result<T, ProviderError>,
    ) -> Result<T> {
        let attempts = self.max_attempts.max(1);
        let mut rng = rand::rng();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = self.backoff(attempt - 1, &mut rng);
                    warn!(
                        %phase,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient provider error, backing off"
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
                Err(source) => {
                    return Err(Error::Provider {
                        phase,
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }
}
