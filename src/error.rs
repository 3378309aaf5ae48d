//! Error taxonomy for rate-limited execution.
//!
//! Work functions classify their own failures with [`WorkErrorKind`]; the
//! executor only ever inspects that tag, never the message text.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Closed set of failure categories a work function can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkErrorKind {
    /// The external service signalled a transient rate limit; safe to retry.
    RateLimited,
    /// Anything else; never retried.
    Fatal,
}

impl fmt::Display for WorkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkErrorKind::RateLimited => write!(f, "rate limited"),
            WorkErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Failure raised by a unit of work, tagged with its category.
#[derive(Debug)]
pub struct WorkError {
    kind: WorkErrorKind,
    source: anyhow::Error,
}

impl WorkError {
    /// Tag an error as a transient rate-limit signal.
    pub fn rate_limited(source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: WorkErrorKind::RateLimited,
            source: source.into(),
        }
    }

    /// Tag an error as non-retryable.
    pub fn fatal(source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: WorkErrorKind::Fatal,
            source: source.into(),
        }
    }

    /// Build a rate-limit signal from a message.
    pub fn rate_limited_msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self::rate_limited(anyhow::Error::msg(message))
    }

    /// Build a fatal error from a message.
    pub fn fatal_msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self::fatal(anyhow::Error::msg(message))
    }

    /// Category of this failure.
    pub fn kind(&self) -> WorkErrorKind {
        self.kind
    }

    /// Whether the executor may retry after this failure.
    pub fn is_rate_limited(&self) -> bool {
        self.kind == WorkErrorKind::RateLimited
    }

    /// Underlying error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.source
    }
}

impl fmt::Display for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.source, self.kind)
    }
}

impl std::error::Error for WorkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let inner: &(dyn std::error::Error + Send + Sync + 'static) = self.source.as_ref();
        Some(inner)
    }
}

impl From<anyhow::Error> for WorkError {
    fn from(err: anyhow::Error) -> Self {
        Self::fatal(err)
    }
}

/// Classified failure of a rate-limited execution.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The unit's estimate exceeds the per-request ceiling; re-chunk smaller.
    #[error("request of ~{estimated} tokens exceeds the per-request ceiling of {limit}")]
    RequestTooLarge { estimated: u64, limit: u64 },

    /// Budget did not free up within `max_wait`.
    #[error("no budget for {needed} tokens after waiting {waited:.1?} (usage {usage}/{limit})")]
    RateLimitTimeout {
        needed: u64,
        usage: u64,
        limit: u64,
        waited: Duration,
    },

    /// The work kept signalling a rate limit until retries ran out.
    #[error("rate limited on all {attempts} attempts: {last}")]
    RateLimitExceeded {
        attempts: u32,
        #[source]
        last: WorkError,
    },

    /// The work failed for a reason other than rate limiting.
    #[error("stage execution failed: {0}")]
    StageExecution(#[source] WorkError),
}

impl ExecutorError {
    /// Whether the caller may resubmit (possibly with a smaller batch).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutorError::RateLimitTimeout { .. } | ExecutorError::RateLimitExceeded { .. }
        )
    }

    /// Short machine-readable category.
    pub fn category(&self) -> &'static str {
        match self {
            ExecutorError::RequestTooLarge { .. } => "request_too_large",
            ExecutorError::RateLimitTimeout { .. } => "rate_limit_timeout",
            ExecutorError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            ExecutorError::StageExecution(_) => "stage_execution",
        }
    }
}
