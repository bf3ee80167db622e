//! Execution semaphores: serialization groups for jobs.
//!
//! A job scheduled with an [`ExecutionSemaphore`] must obtain one of its
//! permits before it runs. Waiters are served strictly FIFO, except that a
//! job returning from a blocking condition re-enters at the head of the queue
//! so it resumes before jobs that never started.
//!
//! Ownership is tracked by job id. A permit is held by a job, not by the worker
//! thread currently executing it.

use crate::sync::lock;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::trace;
use uuid::Uuid;

/// Where a waiting job is placed in the semaphore's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePosition {
    /// Served before every other waiter (resuming jobs).
    Head,
    /// Served after every other waiter (new jobs).
    Tail,
}

/// Counting semaphore limiting how many jobs of a group run at once.
///
/// Cloning yields another handle to the same semaphore; identity is the
/// semaphore's id.
#[derive(Clone)]
pub struct ExecutionSemaphore {
    inner: Arc<Inner>,
}

struct Inner {
    id: Uuid,
    name: String,
    state: Mutex<State>,
}

struct State {
    permits: usize,
    holders: HashSet<Uuid>,
    queue: VecDeque<Waiter>,
}

struct Waiter {
    job: Uuid,
    tx: oneshot::Sender<SemaphorePermit>,
}

impl ExecutionSemaphore {
    /// Create a semaphore with the given number of permits.
    pub fn new(permits: usize) -> Self {
        Self::named(format!("semaphore-{}", Uuid::new_v4()), permits)
    }

    /// Create a named semaphore with the given number of permits.
    pub fn named(name: impl Into<String>, permits: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                name: name.into(),
                state: Mutex::new(State {
                    permits,
                    holders: HashSet::new(),
                    queue: VecDeque::new(),
                }),
            }),
        }
    }

    /// Create a mutex: a semaphore with a single permit.
    pub fn mutex() -> Self {
        Self::new(1)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current number of permits.
    pub fn permits(&self) -> usize {
        lock(&self.inner.state).permits
    }

    /// Whether this semaphore has exactly one permit.
    pub fn is_mutex(&self) -> bool {
        self.permits() == 1
    }

    /// Change the number of permits. Raising the count admits waiters
    /// immediately; lowering it takes effect as holders release.
    pub fn set_permits(&self, permits: usize) {
        let grants = {
            let mut state = lock(&self.inner.state);
            state.permits = permits;
            self.collect_grants(&mut state)
        };
        Self::hand_over(grants);
    }

    /// Whether the given job currently holds a permit.
    pub fn is_permit_owner(&self, job: Uuid) -> bool {
        lock(&self.inner.state).holders.contains(&job)
    }

    /// Number of jobs currently holding a permit.
    pub fn holder_count(&self) -> usize {
        lock(&self.inner.state).holders.len()
    }

    /// Number of jobs waiting for a permit.
    pub fn waiting_count(&self) -> usize {
        lock(&self.inner.state)
            .queue
            .iter()
            .filter(|w| !w.tx.is_closed())
            .count()
    }

    /// Wait for a permit on behalf of `job`.
    ///
    /// Dropping the returned future before it completes withdraws the job
    /// from the queue; a permit granted concurrently is released again.
    pub(crate) async fn acquire(&self, job: Uuid, position: QueuePosition) -> SemaphorePermit {
        loop {
            let rx = {
                let mut state = lock(&self.inner.state);
                state.queue.retain(|w| !w.tx.is_closed());

                let first_in_line = state.queue.is_empty() || position == QueuePosition::Head;
                if state.holders.len() < state.permits && first_in_line {
                    state.holders.insert(job);
                    trace!(semaphore = %self.inner.name, job = %job, "Permit acquired");
                    return SemaphorePermit::new(self.clone(), job);
                }

                let (tx, rx) = oneshot::channel();
                let waiter = Waiter { job, tx };
                match position {
                    QueuePosition::Head => state.queue.push_front(waiter),
                    QueuePosition::Tail => state.queue.push_back(waiter),
                }
                trace!(
                    semaphore = %self.inner.name,
                    job = %job,
                    waiting = state.queue.len(),
                    "Waiting for permit"
                );
                rx
            };

            if let Ok(permit) = rx.await {
                return permit;
            }
        }
    }

    fn release(&self, job: Uuid) {
        let grants = {
            let mut state = lock(&self.inner.state);
            state.holders.remove(&job);
            trace!(semaphore = %self.inner.name, job = %job, "Permit released");
            self.collect_grants(&mut state)
        };
        Self::hand_over(grants);
    }

    fn collect_grants(&self, state: &mut State) -> Vec<(oneshot::Sender<SemaphorePermit>, SemaphorePermit)> {
        let mut grants = Vec::new();
        while state.holders.len() < state.permits {
            let Some(waiter) = state.queue.pop_front() else {
                break;
            };
            if waiter.tx.is_closed() {
                continue;
            }
            state.holders.insert(waiter.job);
            grants.push((waiter.tx, SemaphorePermit::new(self.clone(), waiter.job)));
        }
        grants
    }

    // Runs without the state lock: a refused permit is dropped here, which
    // re-enters `release`.
    fn hand_over(grants: Vec<(oneshot::Sender<SemaphorePermit>, SemaphorePermit)>) {
        for (tx, permit) in grants {
            if let Err(refused) = tx.send(permit) {
                drop(refused);
            }
        }
    }
}

impl PartialEq for ExecutionSemaphore {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ExecutionSemaphore {}

impl fmt::Debug for ExecutionSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("ExecutionSemaphore")
            .field("name", &self.inner.name)
            .field("permits", &state.permits)
            .field("holders", &state.holders.len())
            .field("waiting", &state.queue.len())
            .finish()
    }
}

/// A permit held by a job. Released on drop.
pub struct SemaphorePermit {
    semaphore: ExecutionSemaphore,
    job: Uuid,
}

impl SemaphorePermit {
    fn new(semaphore: ExecutionSemaphore, job: Uuid) -> Self {
        Self { semaphore, job }
    }

    pub fn semaphore(&self) -> &ExecutionSemaphore {
        &self.semaphore
    }

    pub fn job(&self) -> Uuid {
        self.job
    }
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        self.semaphore.release(self.job);
    }
}

impl fmt::Debug for SemaphorePermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphorePermit")
            .field("semaphore", &self.semaphore.name())
            .field("job", &self.job)
            .finish()
    }
}
