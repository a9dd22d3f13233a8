//! Bounded retries for invocations.
//!
//! Throttling and malformed responses draw from separate budgets. A throttled
//! call waits long; a malformed one is retried quickly a couple of times.
//! Everything else is returned to the caller on the first failure.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::TransportError;
use crate::config::TransportConfig;

/// Exponential backoff for one failure class.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed, not counting the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add up to half of `base_delay` of random delay.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }
        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct TransportRetry {
    pub throttle: RetryPolicy,
    pub malformed: RetryPolicy,
}

impl TransportRetry {
    pub fn from_config(config: &TransportConfig) -> Self {
        let throttle_base = Duration::from_millis(config.throttle_base_delay_ms);
        let malformed_base = Duration::from_millis(config.malformed_delay_ms);
        Self {
            throttle: RetryPolicy {
                max_retries: config.throttle_retries,
                base_delay: throttle_base,
                max_delay: throttle_base.saturating_mul(8),
                jitter: true,
            },
            malformed: RetryPolicy {
                max_retries: config.malformed_retries,
                base_delay: malformed_base,
                max_delay: malformed_base,
                jitter: false,
            },
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        let policy = RetryPolicy {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        };
        Self {
            throttle: policy.clone(),
            malformed: policy,
        }
    }

    /// Run `operation` until it succeeds, fails for good, or a budget runs out.
    ///
    /// `operation` receives the 0-indexed attempt number. An exhausted
    /// throttling budget is reported as [`TransportError::RateLimited`].
    pub async fn run<F, Fut, T>(
        &self,
        function_name: &str,
        token: &CancellationToken,
        operation: F,
    ) -> Result<T, TransportError>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut throttled = 0u32;
        let mut malformed = 0u32;
        let mut attempt = 0u32;

        loop {
            if token.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let delay = match &err {
                TransportError::Throttled { .. } => {
                    if throttled >= self.throttle.max_retries {
                        return Err(TransportError::RateLimited {
                            function: function_name.to_string(),
                        });
                    }
                    let delay = self.throttle.delay_for_attempt(throttled);
                    throttled += 1;
                    delay
                }
                e if e.is_malformed() => {
                    if malformed >= self.malformed.max_retries {
                        return Err(err);
                    }
                    let delay = self.malformed.delay_for_attempt(malformed);
                    malformed += 1;
                    delay
                }
                _ => return Err(err),
            };

            attempt += 1;
            warn!(
                function = function_name,
                attempt,
                throttled,
                malformed,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying invocation after transient error"
            );
            tokio::select! {
                _ = token.cancelled() => return Err(TransportError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
