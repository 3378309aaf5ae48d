//! TPM-aware execution: a sliding-window usage ledger plus the executor that
//! gates work on it.

mod executor;
mod metrics;
mod window;

pub use executor::{RateLimiter, WAIT_POLL_MAX, WAIT_POLL_MIN};
pub use metrics::{ExecutionStats, Metrics};
pub use window::{UsageEvent, UsageWindowTracker, USAGE_WINDOW};
