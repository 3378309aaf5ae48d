//! Budget-aware execution of token-costed work with retry and backoff.
//!
//! Each call to [`RateLimiter::run`] moves through:
//!
//! ```text
//! Idle -> WaitingForBudget -> Executing -> Success
//!               ^                 |
//!               |                 +-- rate limited --> RetryBackoff --+
//!               +-----------------------------------------------------+
//!                                 |
//!                                 +-- other error --> Failed
//! WaitingForBudget -- max_wait --> TimedOut
//! ```
//!
//! Budget is reserved optimistically under the tracker's lock before the work
//! runs, so concurrent callers sharing one limiter cannot both claim the same
//! headroom.

use super::metrics::{ExecutionStats, Metrics};
use super::window::UsageWindowTracker;
use crate::config::ProviderProfile;
use crate::error::{ExecutorError, WorkError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Longest single sleep while waiting for budget.
pub const WAIT_POLL_MAX: Duration = Duration::from_secs(5);

/// Shortest single sleep while waiting for budget.
pub const WAIT_POLL_MIN: Duration = Duration::from_millis(50);

/// Rate-limited executor for one provider profile.
///
/// Construct one per pipeline (or per provider) and share it by `Arc`.
pub struct RateLimiter {
    profile: ProviderProfile,
    effective_limit: u64,
    tracker: UsageWindowTracker,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    /// Create a limiter, validating the profile.
    pub fn new(profile: ProviderProfile) -> anyhow::Result<Self> {
        profile.validate()?;
        let effective_limit = profile.effective_limit();

        tracing::debug!(
            "Rate limiter '{}': {} TPM x {:.2} margin = {} effective",
            profile.name,
            profile.tokens_per_minute,
            profile.safety_margin,
            effective_limit
        );

        Ok(Self {
            profile,
            effective_limit,
            tracker: UsageWindowTracker::new(),
            metrics: Metrics::new(),
        })
    }

    /// Provider profile in force.
    pub fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    /// Usable tokens per rolling minute.
    pub fn effective_limit(&self) -> u64 {
        self.effective_limit
    }

    /// Underlying usage ledger.
    pub fn tracker(&self) -> &UsageWindowTracker {
        &self.tracker
    }

    /// Shared counters.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Tokens used in the trailing window.
    pub fn current_usage(&self) -> u64 {
        self.tracker.current_usage()
    }

    /// Current usage as a fraction of the effective limit.
    pub fn usage_ratio(&self) -> f64 {
        self.current_usage() as f64 / self.effective_limit as f64
    }

    /// Snapshot of execution statistics.
    pub fn get_stats(&self) -> ExecutionStats {
        self.metrics.snapshot()
    }

    /// Delay before retry number `attempt + 1` (0-based `attempt`).
    ///
    /// `retry_base_delay * 2^attempt`, capped at `max_wait`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(30) as i32);
        self.profile
            .retry_base_delay()
            .mul_f64(factor)
            .min(self.profile.max_wait())
    }

    /// Wait until `tokens` fit in the window without recording them.
    ///
    /// Returns the time waited (zero when they already fit), or
    /// [`ExecutorError::RateLimitTimeout`] once `max_wait` has elapsed.
    pub async fn wait_for_budget(&self, tokens: u64) -> Result<Duration, ExecutorError> {
        self.wait_inner(tokens, false).await
    }

    async fn wait_inner(&self, tokens: u64, reserve: bool) -> Result<Duration, ExecutorError> {
        let start = Instant::now();
        let max_wait = self.profile.max_wait();
        let limit = self.effective_limit;

        loop {
            let admitted = if reserve {
                self.tracker.try_reserve(tokens, limit)
            } else {
                self.tracker.fits(tokens, limit)
            };
            if admitted {
                return Ok(start.elapsed());
            }

            let waited = start.elapsed();
            let usage = self.tracker.current_usage();
            if waited >= max_wait {
                tracing::warn!(
                    "Gave up waiting for {} tokens after {:.1?} (usage {}/{})",
                    tokens,
                    waited,
                    usage,
                    limit
                );
                return Err(ExecutorError::RateLimitTimeout {
                    needed: tokens,
                    usage,
                    limit,
                    waited,
                });
            }

            let until_free = self
                .tracker
                .time_until_available(tokens, limit)
                .unwrap_or(WAIT_POLL_MAX);
            let sleep_for = until_free
                .clamp(WAIT_POLL_MIN, WAIT_POLL_MAX)
                .min(max_wait - waited);

            tracing::info!(
                "Waiting {:.1?} for budget: usage {}/{} tokens, need {}",
                sleep_for,
                usage,
                limit,
                tokens
            );
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Run `work` once budget for `estimated_tokens` is available.
    ///
    /// `work` is called again for every retry, so it must be safe to repeat.
    pub async fn run<T, F, Fut>(&self, mut work: F, estimated_tokens: u64) -> Result<T, ExecutorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, WorkError>>,
    {
        let request_limit = self.profile.max_tokens_per_request;
        if estimated_tokens > request_limit {
            self.metrics.add_failure();
            return Err(ExecutorError::RequestTooLarge {
                estimated: estimated_tokens,
                limit: request_limit,
            });
        }

        let max_attempts = self.profile.max_retries.max(1);
        let mut attempt: u32 = 0;

        loop {
            let waited = match self.wait_inner(estimated_tokens, true).await {
                Ok(waited) => waited,
                Err(e) => {
                    self.metrics.add_failure();
                    return Err(e);
                }
            };
            self.metrics.add_wait(waited);
            if !waited.is_zero() {
                self.metrics.add_throttled();
            }

            self.metrics.add_request();
            match work().await {
                Ok(value) => {
                    self.metrics.add_tokens(estimated_tokens);
                    return Ok(value);
                }
                Err(err) if err.is_rate_limited() => {
                    self.metrics.add_throttled();
                    attempt += 1;

                    if attempt >= max_attempts {
                        self.metrics.add_failure();
                        tracing::error!(
                            "Still rate limited after {} attempts: {}",
                            attempt,
                            err
                        );
                        return Err(ExecutorError::RateLimitExceeded {
                            attempts: attempt,
                            last: err,
                        });
                    }

                    let delay = self.backoff_delay(attempt - 1);
                    self.metrics.add_retry();
                    tracing::warn!(
                        "Rate limited (attempt {}/{}), retrying in {:.1?}: {}",
                        attempt,
                        max_attempts,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.metrics.add_failure();
                    return Err(ExecutorError::StageExecution(err));
                }
            }
        }
    }
}
