//! The handle a running job receives.

use crate::error::JobError;
use crate::future::{JobFuture, JobHandle};
use crate::manager::JobManager;
use crate::run_context::RunContext;
use crate::semaphore::{QueuePosition, SemaphorePermit};
use crate::state::JobState;
use crate::sync::lock;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Execution context passed to every job body.
///
/// This is the explicit "current job": it exposes the job's cancellation
/// status, its execution hints, the permit it holds and the [`RunContext`]
/// it runs with. Valid for the dynamic extent of the job.
#[derive(Clone)]
pub struct JobContext {
    handle: JobHandle,
    permit: Arc<Mutex<Option<SemaphorePermit>>>,
    run_context: RunContext,
    manager: JobManager,
}

impl JobContext {
    pub(crate) fn new(
        handle: JobHandle,
        permit: Option<SemaphorePermit>,
        run_context: RunContext,
        manager: JobManager,
    ) -> Self {
        Self {
            handle,
            permit: Arc::new(Mutex::new(permit)),
            run_context,
            manager,
        }
    }

    pub fn id(&self) -> Uuid {
        self.handle.id()
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Handle of the executing job.
    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    pub fn run_context(&self) -> &RunContext {
        &self.run_context
    }

    /// Job manager the job was scheduled on.
    pub fn manager(&self) -> &JobManager {
        &self.manager
    }

    /// Whether the job was cancelled; long-running bodies should poll this.
    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// Whether the job was cancelled with interruption.
    pub fn is_interrupted(&self) -> bool {
        self.handle.interrupt_token().is_cancelled()
    }

    /// Completes once the job is cancelled.
    pub async fn cancelled(&self) {
        self.handle.cancel_token().cancelled().await
    }

    /// Completes once the job is cancelled with interruption.
    pub async fn interrupted(&self) {
        self.handle.interrupt_token().cancelled().await
    }

    /// Sleep, failing with [`JobError::Interrupted`] on forced cancellation.
    pub async fn sleep(&self, duration: Duration) -> Result<(), JobError> {
        self.interruptible(tokio::time::sleep(duration)).await
    }

    /// Run a future, abandoning it on forced cancellation.
    pub async fn interruptible<F: Future>(&self, future: F) -> Result<F::Output, JobError> {
        tokio::select! {
            biased;
            _ = self.interrupted() => Err(JobError::Interrupted(self.name().to_string())),
            output = future => Ok(output),
        }
    }

    pub fn add_execution_hint(&self, hint: impl Into<String>) -> bool {
        self.handle.add_execution_hint(hint)
    }

    pub fn remove_execution_hint(&self, hint: &str) -> bool {
        self.handle.remove_execution_hint(hint)
    }

    pub fn has_execution_hint(&self, hint: &str) -> bool {
        self.handle.has_execution_hint(hint)
    }

    /// Add hints for the lifetime of the returned guard.
    ///
    /// Only hints that were absent are removed again when the guard drops.
    pub fn scoped_execution_hints<I, S>(&self, hints: I) -> ExecutionHintGuard
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let added = hints
            .into_iter()
            .map(Into::into)
            .filter(|hint: &String| self.handle.add_execution_hint(hint.clone()))
            .collect();
        ExecutionHintGuard {
            handle: self.handle.clone(),
            added,
        }
    }

    /// Whether the job currently holds its semaphore permit.
    pub fn holds_permit(&self) -> bool {
        lock(&self.permit).is_some()
    }

    /// Wait for another job and return its value.
    ///
    /// Fails with [`JobError::Deadlock`] if the other job needs the permit
    /// this job holds, and with [`JobError::Interrupted`] on forced
    /// cancellation of this job.
    pub async fn await_job<T: Clone>(&self, future: &JobFuture<T>) -> Result<T, JobError> {
        self.assert_not_same_semaphore(future.handle())?;
        self.interruptible(future.await_done_and_get()).await?
    }

    fn assert_not_same_semaphore(&self, other: &JobHandle) -> Result<(), JobError> {
        if other.is_done() {
            return Ok(());
        }
        match (self.handle.semaphore(), other.semaphore()) {
            (Some(mine), Some(theirs)) if mine == theirs && mine.is_permit_owner(self.id()) => {
                Err(JobError::Deadlock(other.name().to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Give up the permit, e.g. while blocked. Returns whether one was held.
    pub(crate) fn release_permit(&self) -> bool {
        lock(&self.permit).take().is_some()
    }

    /// Queue for the permit again, ahead of jobs that never started.
    pub(crate) async fn reacquire_permit(&self) {
        if let Some(semaphore) = self.handle.semaphore() {
            self.handle.set_state(JobState::WaitingForPermit);
            let permit = semaphore.acquire(self.id(), QueuePosition::Head).await;
            *lock(&self.permit) = Some(permit);
        }
    }
}

/// Removes the hints it added when dropped.
pub struct ExecutionHintGuard {
    handle: JobHandle,
    added: Vec<String>,
}

impl Drop for ExecutionHintGuard {
    fn drop(&mut self) {
        for hint in &self.added {
            self.handle.remove_execution_hint(hint);
        }
    }
}
