//! Job lifecycle states.

use strum::{AsRefStr, Display};

/// Lifecycle state of a job.
///
/// ```text
/// SCHEDULED ─▶ PENDING ─▶ WAITING_FOR_PERMIT ─▶ RUNNING ─▶ DONE
///                 ▲                              │  ▲
///                 └──── next periodic round ─────┘  │
///                                                ▼  │
///                               WAITING_FOR_BLOCKING_CONDITION
/// ```
///
/// `REJECTED` is the terminal state of jobs submitted after shutdown.
/// Cancellation is an attribute of the job, not a state: a cancelled job
/// simply reaches `DONE` sooner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Accepted by the job manager.
    Scheduled,
    /// Waiting for its trigger to fire.
    Pending,
    /// Competing for a permit of its execution semaphore.
    WaitingForPermit,
    Running,
    /// Suspended on a blocking condition, permit released.
    WaitingForBlockingCondition,
    Done,
    /// Never executed because the job manager was shut down.
    Rejected,
}

impl JobState {
    /// Whether the state is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Rejected)
    }
}
