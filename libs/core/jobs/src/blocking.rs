//! Blocking conditions: gates jobs can suspend on.

use crate::context::JobContext;
use crate::error::JobError;
use crate::state::JobState;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::trace;

/// A binary gate. While it is blocking, waiters are suspended.
///
/// A job waiting on a condition gives up its semaphore permit for the
/// duration of the wait, so other jobs of its group can run, and competes
/// for it again before returning. This holds for every exit path: release,
/// timeout and interruption.
///
/// # Example
///
/// ```rust,ignore
/// let condition = manager.new_blocking_condition("reply-received", true);
///
/// // in a job
/// condition.wait_for_timeout(&ctx, Duration::from_secs(5)).await?;
///
/// // elsewhere
/// condition.set_blocking(false);
/// ```
#[derive(Clone)]
pub struct BlockingCondition {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    blocking: watch::Sender<bool>,
}

impl BlockingCondition {
    pub fn new(name: impl Into<String>, blocking: bool) -> Self {
        let (blocking, _) = watch::channel(blocking);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                blocking,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_blocking(&self) -> bool {
        *self.inner.blocking.borrow()
    }

    /// Arm or release the gate. Releasing wakes all waiters.
    pub fn set_blocking(&self, blocking: bool) {
        self.inner.blocking.send_if_modified(|current| {
            let changed = *current != blocking;
            *current = blocking;
            changed
        });
        trace!(condition = %self.inner.name, blocking, "Blocking condition changed");
    }

    /// Wait until released; interruptible.
    pub async fn wait_for(&self, ctx: &JobContext) -> Result<(), JobError> {
        self.wait_for_with_hints(ctx, None, std::iter::empty::<String>()).await
    }

    /// Wait until released, failing with [`JobError::TimedOut`] after `timeout`.
    pub async fn wait_for_timeout(&self, ctx: &JobContext, timeout: Duration) -> Result<(), JobError> {
        self.wait_for_with_hints(ctx, Some(timeout), std::iter::empty::<String>()).await
    }

    /// Wait until released, carrying `hints` on the job for the duration of
    /// the wait. The hints are removed on every exit path.
    pub async fn wait_for_with_hints<I, S>(
        &self,
        ctx: &JobContext,
        timeout: Option<Duration>,
        hints: I,
    ) -> Result<(), JobError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.is_blocking() {
            return Ok(());
        }

        let _hints = ctx.scoped_execution_hints(hints);
        let released_permit = ctx.release_permit();
        ctx.handle().set_state(JobState::WaitingForBlockingCondition);

        let outcome = tokio::select! {
            biased;
            _ = ctx.interrupted() => Err(JobError::Interrupted(format!(
                "blocking condition '{}'",
                self.inner.name
            ))),
            _ = self.released() => Ok(()),
            _ = sleep_or_forever(timeout) => Err(JobError::TimedOut(timeout.unwrap_or_default())),
        };

        if released_permit {
            ctx.reacquire_permit().await;
        }
        ctx.handle().set_state(JobState::Running);
        outcome
    }

    /// Wait outside of any job.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<(), JobError> {
        tokio::select! {
            _ = self.released() => Ok(()),
            _ = sleep_or_forever(timeout) => Err(JobError::TimedOut(timeout.unwrap_or_default())),
        }
    }

    async fn released(&self) {
        let mut rx = self.inner.blocking.subscribe();
        let _ = rx.wait_for(|blocking| !*blocking).await;
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

impl fmt::Debug for BlockingCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingCondition")
            .field("name", &self.inner.name)
            .field("blocking", &self.is_blocking())
            .finish()
    }
}
