//! The job manager: schedules, tracks, cancels and awaits jobs.

use crate::blocking::BlockingCondition;
use crate::context::JobContext;
use crate::error::JobError;
use crate::filter::JobFilter;
use crate::future::{JobFuture, JobHandle};
use crate::input::{ExceptionHandling, JobInput};
use crate::metrics::{JobMetrics, JobOutcome};
use crate::semaphore::{QueuePosition, SemaphorePermit};
use crate::state::JobState;
use crate::sync::lock;
use crate::transaction::{Transaction, TransactionScope};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Schedules jobs onto the tokio runtime and keeps track of unfinished ones.
///
/// Cloning yields another handle to the same manager. Must be used from
/// within a tokio runtime.
///
/// # Example
///
/// ```rust,ignore
/// let manager = JobManager::new("app");
/// let future = manager.schedule(
///     |ctx| async move { Ok(format!("hello from {}", ctx.name())) },
///     JobInput::new("greeter"),
/// );
/// assert_eq!(future.await_done_and_get().await?, "hello from greeter");
/// ```
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    jobs: Mutex<HashMap<Uuid, JobHandle>>,
    shutdown: AtomicBool,
    metrics: JobMetrics,
}

impl JobManager {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(Inner {
                metrics: JobMetrics::new(name.clone()),
                name,
                jobs: Mutex::new(HashMap::new()),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Schedule a one-shot job.
    pub fn schedule<T, F, Fut>(&self, task: F, input: JobInput) -> JobFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, JobError>> + Send + 'static,
    {
        let mut task = Some(task);
        self.submit(input, move |ctx| -> BoxFuture<'static, Result<T, JobError>> {
            match task.take() {
                Some(task) => Box::pin(task(ctx)),
                None => Box::pin(async { Err(JobError::Failed("one-shot job ran twice".to_string())) }),
            }
        })
    }

    /// Schedule a job that runs once per round of its trigger's schedule.
    pub fn schedule_periodic<F, Fut>(&self, mut task: F, input: JobInput) -> JobFuture<()>
    where
        F: FnMut(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.submit(input, move |ctx| -> BoxFuture<'static, Result<(), JobError>> {
            Box::pin(task(ctx))
        })
    }

    fn submit<T, B>(&self, input: JobInput, body: B) -> JobFuture<T>
    where
        T: Send + 'static,
        B: FnMut(JobContext) -> BoxFuture<'static, Result<T, JobError>> + Send + 'static,
    {
        let handle = JobHandle::new(&input);
        let future = JobFuture::new(handle.clone());

        if self.is_shutdown() {
            debug!(job = %input.name, "Job rejected, job manager is shut down");
            self.inner.metrics.job_rejected();
            future.complete(Err(JobError::Rejected(input.name.clone())), JobState::Rejected);
            return future;
        }

        self.register(&handle);
        self.inner.metrics.job_scheduled();
        if self.is_shutdown() {
            handle.cancel(true);
        }

        let runner = Runner {
            manager: self.clone(),
            input,
            future: future.clone(),
            body,
        };
        tokio::spawn(runner.run());
        future
    }

    /// Unfinished jobs accepted by `filter`.
    pub fn get_futures(&self, filter: &JobFilter) -> Vec<JobHandle> {
        lock(&self.inner.jobs)
            .values()
            .filter(|job| filter.accept(job))
            .cloned()
            .collect()
    }

    /// Cancel all jobs accepted by `filter`. Returns whether any job was cancelled.
    pub fn cancel(&self, filter: &JobFilter, interrupt: bool) -> bool {
        let mut cancelled = false;
        for job in self.get_futures(filter) {
            cancelled |= job.cancel(interrupt);
        }
        cancelled
    }

    /// Whether no unfinished job matches `filter`.
    pub fn is_done(&self, filter: &JobFilter) -> bool {
        self.get_futures(filter).iter().all(|job| job.is_done())
    }

    /// Wait until every job currently accepted by `filter` is done.
    pub async fn await_done(&self, filter: &JobFilter, timeout: Option<Duration>) -> Result<(), JobError> {
        let jobs = self.get_futures(filter);
        let all_done = join_all(jobs.iter().map(|job| job.await_done()));
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, all_done)
                .await
                .map(|_| ())
                .map_err(|_| JobError::TimedOut(timeout)),
            None => {
                all_done.await;
                Ok(())
            }
        }
    }

    /// Create a blocking condition.
    pub fn new_blocking_condition(&self, name: impl Into<String>, blocking: bool) -> BlockingCondition {
        BlockingCondition::new(name, blocking)
    }

    /// Interrupt and cancel every job and reject all later submissions.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let active = self.active_count();
        info!(manager = %self.inner.name, active_jobs = active, "Shutting down job manager");
        self.cancel(&JobFilter::All, true);
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Number of unfinished jobs.
    pub fn active_count(&self) -> usize {
        lock(&self.inner.jobs).len()
    }

    fn register(&self, handle: &JobHandle) {
        let mut jobs = lock(&self.inner.jobs);
        jobs.insert(handle.id(), handle.clone());
        self.inner.metrics.active_jobs(jobs.len());
    }

    fn unregister(&self, id: Uuid) {
        let mut jobs = lock(&self.inner.jobs);
        jobs.remove(&id);
        self.inner.metrics.active_jobs(jobs.len());
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new("default")
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("name", &self.inner.name)
            .field("active_jobs", &self.active_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Drives one job through its lifecycle.
struct Runner<T, B> {
    manager: JobManager,
    input: JobInput,
    future: JobFuture<T>,
    body: B,
}

impl<T, B> Runner<T, B>
where
    T: Send + 'static,
    B: FnMut(JobContext) -> BoxFuture<'static, Result<T, JobError>> + Send + 'static,
{
    async fn run(mut self) {
        let handle = self.future.handle().clone();
        let started = Instant::now();

        let outcome = self.run_rounds(&handle).await;
        let outcome = match outcome {
            _ if handle.is_cancelled() => Err(JobError::Cancelled(handle.name().to_string())),
            outcome => outcome,
        };

        let label = match &outcome {
            Ok(_) => JobOutcome::Success,
            Err(e) if e.is_cancellation() => JobOutcome::Cancelled,
            Err(_) => JobOutcome::Failed,
        };
        self.manager.inner.metrics.job_finished(label, started.elapsed());

        self.future.complete(outcome, JobState::Done);
        self.manager.unregister(handle.id());
    }

    async fn run_rounds(&mut self, handle: &JobHandle) -> Result<T, JobError> {
        let name = handle.name().to_string();
        let Some(mut fire_at) = self.input.trigger.first_fire(Instant::now()) else {
            debug!(job = %name, "Trigger never fires, job completes without running");
            return Err(JobError::NoValue(name));
        };
        let mut completed_rounds: u64 = 0;

        loop {
            if fire_at > Instant::now() {
                handle.set_state(JobState::Pending);
                tokio::select! {
                    _ = handle.cancel_token().cancelled() => return Err(JobError::Cancelled(name)),
                    _ = tokio::time::sleep_until(fire_at) => {}
                }
            }
            if handle.is_cancelled() {
                return Err(JobError::Cancelled(name));
            }

            let permit = match self.input.semaphore.clone() {
                Some(semaphore) => {
                    handle.set_state(JobState::WaitingForPermit);
                    tokio::select! {
                        _ = handle.cancel_token().cancelled() => return Err(JobError::Cancelled(name)),
                        permit = semaphore.acquire(handle.id(), QueuePosition::Tail) => Some(permit),
                    }
                }
                None => None,
            };

            handle.set_state(JobState::Running);
            let round_started = Instant::now();
            let result = self.run_round(handle, permit).await;
            completed_rounds += 1;

            let result = match result {
                Ok(value) => Ok(value),
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    if self.handle_failure(&name, &e) {
                        return Err(e);
                    }
                    Err(JobError::NoValue(name.clone()))
                }
            };

            if !handle.is_periodic() || handle.is_cancelled() {
                return result;
            }
            match self
                .input
                .trigger
                .next_fire(completed_rounds, round_started, Instant::now())
            {
                Some(next) => fire_at = next,
                None => return result,
            }
        }
    }

    async fn run_round(&mut self, handle: &JobHandle, permit: Option<SemaphorePermit>) -> Result<T, JobError> {
        let base = self.input.run_context.clone();
        let transaction = match base.transaction_scope() {
            TransactionScope::RequiresNew => Some(Transaction::new()),
            TransactionScope::Required => None,
        };
        let run_context = match &transaction {
            Some(tx) => base.with_transaction(tx.clone()),
            None => base,
        };

        let ctx = JobContext::new(handle.clone(), permit, run_context, self.manager.clone());
        let body = (self.body)(ctx.clone());
        let result = match AssertUnwindSafe(body).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(job = %handle.name(), panic = %message, "Job panicked");
                Err(JobError::Panicked(message))
            }
        };

        let result = match (transaction, result) {
            (Some(tx), Ok(value)) if tx.is_active() => tx.commit().await.map(|_| value),
            (Some(tx), Err(e)) => {
                tx.rollback().await;
                Err(e)
            }
            (_, result) => result,
        };

        ctx.release_permit();
        result
    }

    /// Apply the job's exception handling. Returns whether to propagate.
    fn handle_failure(&self, name: &str, error: &JobError) -> bool {
        match &self.input.exception_handling {
            ExceptionHandling::Propagate => {
                warn!(job = %name, error = %error, "Job failed");
                true
            }
            ExceptionHandling::Swallow => {
                warn!(job = %name, error = %error, "Job failed, error swallowed");
                false
            }
            ExceptionHandling::Custom { handler, propagate } => {
                handler(name, error);
                *propagate
            }
        }
    }
}
