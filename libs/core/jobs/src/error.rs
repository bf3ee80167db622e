//! Error types for job execution.

use std::time::Duration;
use thiserror::Error;

/// Error observed by awaiters of a job, or raised by blocking primitives.
///
/// Cloneable, because a single job outcome is handed to every awaiter.
/// Timeouts and interruptions are distinct variants so callers can tell
/// an expired wait from an explicit cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The job was cancelled before or while running.
    #[error("job '{0}' was cancelled")]
    Cancelled(String),

    /// A blocking wait was interrupted by a forced cancellation.
    #[error("interrupted while waiting: {0}")]
    Interrupted(String),

    /// A blocking wait elapsed without being released.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// The scheduler was shut down before the job could run.
    #[error("job '{0}' rejected: job manager is shut down")]
    Rejected(String),

    /// Awaiting the job would block on the caller's own execution permit.
    #[error("deadlock detected: awaiting job '{0}' which requires the execution permit held by the caller")]
    Deadlock(String),

    /// The job failed; the failure was swallowed by its exception handling.
    #[error("job '{0}' completed without a value")]
    NoValue(String),

    /// The job body returned an error.
    #[error("job failed: {0}")]
    Failed(String),

    /// The job body panicked.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// The execution trigger is invalid, e.g. a malformed cron expression.
    #[error("invalid execution trigger: {0}")]
    InvalidTrigger(String),

    /// Transaction could not be committed.
    #[error("transaction failed: {0}")]
    Transaction(String),
}

impl JobError {
    /// Create a failure from anything displayable.
    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self::Failed(error.to_string())
    }

    /// Whether this error stems from cancellation (soft or forced).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, JobError::Cancelled(_) | JobError::Interrupted(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, JobError::TimedOut(_))
    }

    pub fn is_interruption(&self) -> bool {
        matches!(self, JobError::Interrupted(_))
    }
}
