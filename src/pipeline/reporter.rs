//! Periodic progress logging while a pipeline runs.

use crate::limiter::RateLimiter;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;

/// Logs executor stats and window usage on a fixed interval.
pub struct StatsReporter {
    limiter: Arc<RateLimiter>,
    interval_secs: u64,
    total_stages: usize,
    completed: Arc<AtomicUsize>,
}

impl StatsReporter {
    /// Create a reporter; `completed` is advanced by the scheduler.
    pub fn new(
        limiter: Arc<RateLimiter>,
        interval_secs: u64,
        total_stages: usize,
        completed: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            limiter,
            interval_secs,
            total_stages,
            completed,
        }
    }

    fn progress(&self) -> f64 {
        if self.total_stages > 0 {
            self.completed.load(Ordering::Relaxed) as f64 / self.total_stages as f64 * 100.0
        } else {
            0.0
        }
    }

    /// Report until a message (or hangup) arrives on `shutdown`.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::info!(
                        "[{:.1}%] window {}/{} tokens | {}",
                        self.progress(),
                        self.limiter.current_usage(),
                        self.limiter.effective_limit(),
                        self.limiter.get_stats()
                    );
                }
                _ = shutdown.recv() => {
                    tracing::info!("Final: {}", self.limiter.get_stats());
                    break;
                }
            }
        }
    }
}
