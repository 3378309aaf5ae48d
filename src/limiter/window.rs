//! Sliding-window ledger of token consumption.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Length of the rolling window the provider meters usage over.
pub const USAGE_WINDOW: Duration = Duration::from_secs(60);

/// One recorded consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageEvent {
    /// When the tokens were reserved
    pub at: Instant,
    /// Tokens reserved
    pub tokens: u64,
}

/// Trailing-window usage tracker.
///
/// The ledger is kept in timestamp order and guarded by a single lock; every
/// read evicts expired entries before summing. An event recorded at `t` stops
/// counting at exactly `t + window`.
#[derive(Debug)]
pub struct UsageWindowTracker {
    window: Duration,
    ledger: Mutex<VecDeque<UsageEvent>>,
}

impl Default for UsageWindowTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageWindowTracker {
    /// Create a tracker over the standard 60 second window.
    pub fn new() -> Self {
        Self::with_window(USAGE_WINDOW)
    }

    /// Create a tracker over a custom window.
    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            ledger: Mutex::new(VecDeque::new()),
        }
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<UsageEvent>> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn evict(&self, ledger: &mut VecDeque<UsageEvent>, now: Instant) {
        while let Some(front) = ledger.front() {
            if now.saturating_duration_since(front.at) >= self.window {
                ledger.pop_front();
            } else {
                break;
            }
        }
    }

    fn insert(ledger: &mut VecDeque<UsageEvent>, event: UsageEvent) {
        match ledger.back() {
            Some(back) if back.at > event.at => {
                let pos = ledger.partition_point(|e| e.at <= event.at);
                ledger.insert(pos, event);
            }
            _ => ledger.push_back(event),
        }
    }

    /// Record `tokens` consumed now.
    pub fn record(&self, tokens: u64) {
        self.record_at(tokens, Instant::now());
    }

    /// Record `tokens` consumed at `at`.
    pub fn record_at(&self, tokens: u64, at: Instant) {
        let mut ledger = self.lock();
        self.evict(&mut ledger, Instant::now());
        Self::insert(&mut ledger, UsageEvent { at, tokens });
    }

    /// Tokens consumed within the trailing window.
    pub fn current_usage(&self) -> u64 {
        self.current_usage_at(Instant::now())
    }

    /// Tokens consumed within the window ending at `now`.
    pub fn current_usage_at(&self, now: Instant) -> u64 {
        let mut ledger = self.lock();
        self.evict(&mut ledger, now);
        ledger.iter().map(|e| e.tokens).sum()
    }

    /// Remaining budget against `effective_limit`, never negative.
    pub fn available(&self, effective_limit: u64) -> u64 {
        effective_limit.saturating_sub(self.current_usage())
    }

    /// Whether `tokens` more would stay within `effective_limit` right now.
    pub fn fits(&self, tokens: u64, effective_limit: u64) -> bool {
        self.current_usage().saturating_add(tokens) <= effective_limit
    }

    /// Atomically check the budget and record `tokens` if it fits.
    pub fn try_reserve(&self, tokens: u64, effective_limit: u64) -> bool {
        let now = Instant::now();
        let mut ledger = self.lock();
        self.evict(&mut ledger, now);
        let usage: u64 = ledger.iter().map(|e| e.tokens).sum();
        if usage.saturating_add(tokens) > effective_limit {
            return false;
        }
        Self::insert(&mut ledger, UsageEvent { at: now, tokens });
        true
    }

    /// How long until `needed` tokens fit under `effective_limit`.
    ///
    /// Returns `Some(Duration::ZERO)` when they already fit and `None` when they
    /// never can (`needed > effective_limit`).
    pub fn time_until_available(&self, needed: u64, effective_limit: u64) -> Option<Duration> {
        if needed > effective_limit {
            return None;
        }

        let now = Instant::now();
        let mut ledger = self.lock();
        self.evict(&mut ledger, now);

        let mut usage: u64 = ledger.iter().map(|e| e.tokens).sum();
        if usage + needed <= effective_limit {
            return Some(Duration::ZERO);
        }

        for event in ledger.iter() {
            usage -= event.tokens;
            if usage + needed <= effective_limit {
                let expires = event.at + self.window;
                return Some(expires.saturating_duration_since(now));
            }
        }
        // Unreachable in practice: an empty ledger always fits
        Some(self.window)
    }

    /// Number of live events in the ledger.
    pub fn len(&self) -> usize {
        let mut ledger = self.lock();
        self.evict(&mut ledger, Instant::now());
        ledger.len()
    }

    /// Whether the ledger holds no live events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every recorded event.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_event_evicted_after_window() {
        let tracker = UsageWindowTracker::new();
        tracker.record(1000);
        assert_eq!(tracker.current_usage(), 1000);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(tracker.current_usage(), 1000);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(tracker.current_usage(), 0);
        assert!(tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_only_expired_entries() {
        let tracker = UsageWindowTracker::new();
        tracker.record(100);
        tokio::time::advance(Duration::from_secs(30)).await;
        tracker.record(200);
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(tracker.current_usage(), 200);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_explicit_timestamps() {
        let tracker = UsageWindowTracker::new();
        let t0 = Instant::now();
        tracker.record_at(1000, t0);

        assert_eq!(tracker.current_usage_at(t0 + Duration::from_secs(10)), 1000);
        assert_eq!(tracker.current_usage_at(t0 + Duration::from_secs(61)), 0);
    }

    #[test]
    fn test_out_of_order_record_kept_sorted() {
        let tracker = UsageWindowTracker::new();
        let t0 = Instant::now();
        tracker.record_at(10, t0 + Duration::from_secs(5));
        tracker.record_at(20, t0);

        // The older event expires first even though it was recorded second
        assert_eq!(tracker.current_usage_at(t0 + Duration::from_secs(62)), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_available_never_negative() {
        let tracker = UsageWindowTracker::new();
        tracker.record(5_000);
        assert_eq!(tracker.available(1_000), 0);
        assert_eq!(tracker.available(8_000), 3_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_reserve() {
        let tracker = UsageWindowTracker::new();
        assert!(tracker.try_reserve(600, 1_000));
        assert!(!tracker.try_reserve(500, 1_000));
        assert!(tracker.try_reserve(400, 1_000));
        assert_eq!(tracker.current_usage(), 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_until_available() {
        let tracker = UsageWindowTracker::new();
        tracker.record(600);
        tokio::time::advance(Duration::from_secs(20)).await;
        tracker.record(300);

        assert_eq!(tracker.time_until_available(100, 1_000), Some(Duration::ZERO));
        // Needs the first event (expires in 40s) to age out
        assert_eq!(tracker.time_until_available(500, 1_000), Some(Duration::from_secs(40)));
        // Needs both events gone; the second expires in 60s
        assert_eq!(tracker.time_until_available(1_000, 1_000), Some(Duration::from_secs(60)));
        assert_eq!(tracker.time_until_available(1_001, 1_000), None);
    }

    #[test]
    fn test_concurrent_recording() {
        let tracker = Arc::new(UsageWindowTracker::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        tracker.record(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.current_usage(), 8_000);
    }
}
