//! Handles to scheduled jobs.

use crate::error::JobError;
use crate::input::JobInput;
use crate::semaphore::ExecutionSemaphore;
use crate::state::JobState;
use crate::sync::lock;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

type DoneCallback = Box<dyn FnOnce(&JobHandle) + Send>;

pub(crate) struct JobRecord {
    id: Uuid,
    name: String,
    created_at: DateTime<Utc>,
    periodic: bool,
    semaphore: Option<ExecutionSemaphore>,
    hints: Mutex<HashSet<String>>,
    state: watch::Sender<JobState>,
    cancelled: AtomicBool,
    /// Fires on any cancellation
    cancel_token: CancellationToken,
    /// Fires on forced cancellation only
    interrupt_token: CancellationToken,
    callbacks: Mutex<Vec<DoneCallback>>,
}

/// Type-erased handle to a scheduled job.
///
/// Used for filtering, cancelling and awaiting jobs regardless of the type of
/// value they produce.
#[derive(Clone)]
pub struct JobHandle {
    record: Arc<JobRecord>,
}

impl JobHandle {
    pub(crate) fn new(input: &JobInput) -> Self {
        let (state, _) = watch::channel(JobState::Scheduled);
        Self {
            record: Arc::new(JobRecord {
                id: Uuid::new_v4(),
                name: input.name.clone(),
                created_at: Utc::now(),
                periodic: input.trigger.is_periodic(),
                semaphore: input.semaphore.clone(),
                hints: Mutex::new(input.execution_hints.clone()),
                state,
                cancelled: AtomicBool::new(false),
                cancel_token: CancellationToken::new(),
                interrupt_token: CancellationToken::new(),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.record.created_at
    }

    pub fn is_periodic(&self) -> bool {
        self.record.periodic
    }

    pub fn semaphore(&self) -> Option<&ExecutionSemaphore> {
        self.record.semaphore.as_ref()
    }

    pub fn state(&self) -> JobState {
        *self.record.state.borrow()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.record.cancelled.load(Ordering::SeqCst)
    }

    /// Whether the job is suspended on a blocking condition.
    pub fn is_blocked(&self) -> bool {
        self.state() == JobState::WaitingForBlockingCondition
    }

    pub fn execution_hints(&self) -> HashSet<String> {
        lock(&self.record.hints).clone()
    }

    pub fn has_execution_hint(&self, hint: &str) -> bool {
        lock(&self.record.hints).contains(hint)
    }

    /// Add an execution hint; `false` if it was already present.
    pub fn add_execution_hint(&self, hint: impl Into<String>) -> bool {
        lock(&self.record.hints).insert(hint.into())
    }

    /// Remove an execution hint; `false` if it was absent.
    pub fn remove_execution_hint(&self, hint: &str) -> bool {
        lock(&self.record.hints).remove(hint)
    }

    /// Cancel the job.
    ///
    /// A job that has not started yet never runs. A running job sees
    /// [`JobContext::is_cancelled`](crate::JobContext::is_cancelled); with
    /// `interrupt`, its blocking waits additionally fail with
    /// [`JobError::Interrupted`]. Periodic jobs run no further rounds.
    ///
    /// Returns `false` if the job was already done or cancelled.
    pub fn cancel(&self, interrupt: bool) -> bool {
        if self.is_done() {
            return false;
        }
        let first = !self.record.cancelled.swap(true, Ordering::SeqCst);
        self.record.cancel_token.cancel();
        if interrupt {
            self.record.interrupt_token.cancel();
        }
        if first {
            debug!(job = %self.record.name, id = %self.record.id, interrupt, "Job cancelled");
        }
        first
    }

    /// Wait until the job is done (or rejected).
    pub async fn await_done(&self) {
        let mut rx = self.record.state.subscribe();
        let _ = rx.wait_for(|state| state.is_terminal()).await;
    }

    /// Wait until the job is done, failing with [`JobError::TimedOut`].
    pub async fn await_done_timeout(&self, timeout: Duration) -> Result<(), JobError> {
        tokio::time::timeout(timeout, self.await_done())
            .await
            .map_err(|_| JobError::TimedOut(timeout))
    }

    /// Register a callback run once the job is done. Runs immediately if the
    /// job already is.
    pub fn when_done(&self, callback: impl FnOnce(&JobHandle) + Send + 'static) {
        {
            let mut callbacks = lock(&self.record.callbacks);
            if !self.is_done() {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback(self);
    }

    pub(crate) fn set_state(&self, state: JobState) {
        self.record.state.send_if_modified(|current| {
            if current.is_terminal() || *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    pub(crate) fn finish(&self, state: JobState) {
        let callbacks = {
            let mut callbacks = lock(&self.record.callbacks);
            self.set_state(state);
            std::mem::take(&mut *callbacks)
        };
        for callback in callbacks {
            callback(self);
        }
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.record.cancel_token
    }

    pub(crate) fn interrupt_token(&self) -> &CancellationToken {
        &self.record.interrupt_token
    }
}

impl PartialEq for JobHandle {
    fn eq(&self, other: &Self) -> bool {
        self.record.id == other.record.id
    }
}

impl Eq for JobHandle {}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.record.id)
            .field("name", &self.record.name)
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Handle to a scheduled job producing a `T`.
///
/// Dereferences to [`JobHandle`] for state, hints and cancellation.
pub struct JobFuture<T> {
    handle: JobHandle,
    result: Arc<Mutex<Option<Result<T, JobError>>>>,
}

impl<T> Clone for JobFuture<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            result: Arc::clone(&self.result),
        }
    }
}

impl<T> JobFuture<T> {
    pub(crate) fn new(handle: JobHandle) -> Self {
        Self {
            handle,
            result: Arc::new(Mutex::new(None)),
        }
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    /// Wait for the job and take its value. Later calls get [`JobError::NoValue`].
    pub async fn await_done_and_take(&self) -> Result<T, JobError> {
        self.handle.await_done().await;
        lock(&self.result)
            .take()
            .unwrap_or_else(|| Err(JobError::NoValue(self.handle.name().to_string())))
    }

    pub(crate) fn complete(&self, outcome: Result<T, JobError>, state: JobState) {
        *lock(&self.result) = Some(outcome);
        self.handle.finish(state);
    }
}

impl<T: Clone> JobFuture<T> {
    /// Wait for the job and return its value or failure.
    pub async fn await_done_and_get(&self) -> Result<T, JobError> {
        self.handle.await_done().await;
        self.outcome()
    }

    /// Like [`await_done_and_get`](Self::await_done_and_get), bounded by `timeout`.
    pub async fn await_done_and_get_timeout(&self, timeout: Duration) -> Result<T, JobError> {
        self.handle.await_done_timeout(timeout).await?;
        self.outcome()
    }

    fn outcome(&self) -> Result<T, JobError> {
        lock(&self.result)
            .clone()
            .unwrap_or_else(|| Err(JobError::NoValue(self.handle.name().to_string())))
    }
}

impl<T> Deref for JobFuture<T> {
    type Target = JobHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<T> fmt::Debug for JobFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.handle, f)
    }
}
