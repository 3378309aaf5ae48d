//! Execution statistics for the rate-limited executor.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Counters shared by every caller of one executor.
#[derive(Debug)]
pub struct Metrics {
    /// Work invocations started
    pub total_requests: AtomicU64,

    /// Invocations that waited for budget or were rate limited by the service
    pub throttled_requests: AtomicU64,

    /// Backoff retries issued after a rate-limit signal
    pub rate_limit_retries: AtomicU64,

    /// Executions that ended in an error
    pub failed_requests: AtomicU64,

    /// Estimated tokens of successful executions
    pub tokens_processed: AtomicU64,

    /// Time spent waiting for budget (microseconds)
    pub total_wait_us: AtomicU64,

    /// Longest single wait for budget (microseconds)
    pub max_wait_us: AtomicU64,

    start_time: Option<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            throttled_requests: AtomicU64::new(0),
            rate_limit_retries: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            tokens_processed: AtomicU64::new(0),
            total_wait_us: AtomicU64::new(0),
            max_wait_us: AtomicU64::new(0),
            start_time: None,
        }
    }
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    /// Record a started work invocation.
    pub fn add_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a throttled invocation.
    pub fn add_throttled(&self) {
        self.throttled_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a backoff retry.
    pub fn add_retry(&self) {
        self.rate_limit_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed execution.
    pub fn add_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record tokens of a successful execution.
    pub fn add_tokens(&self, tokens: u64) {
        self.tokens_processed.fetch_add(tokens, Ordering::Relaxed);
    }

    /// Record time spent waiting for budget.
    pub fn add_wait(&self, waited: Duration) {
        let us = waited.as_micros() as u64;
        self.total_wait_us.fetch_add(us, Ordering::Relaxed);
        self.max_wait_us.fetch_max(us, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get tokens processed per minute of wall time.
    pub fn tokens_per_minute(&self) -> f64 {
        let tokens = self.tokens_processed.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            tokens as f64 * 60.0 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current counters.
    pub fn snapshot(&self) -> ExecutionStats {
        ExecutionStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            throttled_requests: self.throttled_requests.load(Ordering::Relaxed),
            rate_limit_retries: self.rate_limit_retries.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            tokens_processed: self.tokens_processed.load(Ordering::Relaxed),
            total_wait: Duration::from_micros(self.total_wait_us.load(Ordering::Relaxed)),
            max_wait: Duration::from_micros(self.max_wait_us.load(Ordering::Relaxed)),
            elapsed: self.elapsed(),
            tokens_per_minute: self.tokens_per_minute(),
        }
    }
}

/// Read-only snapshot of execution statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionStats {
    pub total_requests: u64,
    pub throttled_requests: u64,
    pub rate_limit_retries: u64,
    pub failed_requests: u64,
    pub tokens_processed: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub total_wait: Duration,
    #[serde(serialize_with = "serialize_duration")]
    pub max_wait: Duration,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    /// Observed throughput over the whole run, not the rolling window
    pub tokens_per_minute: f64,
}

impl ExecutionStats {
    /// Save stats to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Stats saved to {}", path);
        Ok(())
    }

    /// Fraction of requests that were throttled.
    pub fn throttle_rate(&self) -> f64 {
        if self.total_requests > 0 {
            self.throttled_requests as f64 / self.total_requests as f64
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for ExecutionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Requests: {} | Throttled: {} ({:.0}%) | Retries: {} | Failures: {} | \
             Tokens: {} @ {:.0}/min | Wait: {:.1}s total, {:.1}s max | Elapsed: {:.1}s",
            self.total_requests,
            self.throttled_requests,
            self.throttle_rate() * 100.0,
            self.rate_limit_retries,
            self.failed_requests,
            self.tokens_processed,
            self.tokens_per_minute,
            self.total_wait.as_secs_f64(),
            self.max_wait.as_secs_f64(),
            self.elapsed.as_secs_f64(),
        )
    }
}
