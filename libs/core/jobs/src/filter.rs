//! Predicates selecting jobs.

use crate::future::JobHandle;
use crate::semaphore::ExecutionSemaphore;
use crate::state::JobState;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Selects jobs by id, name, execution hint, semaphore, state or blocked
/// status. Filters compose with [`and`](Self::and), [`or`](Self::or) and
/// [`not`](Self::not).
///
/// ```rust,ignore
/// // every unfinished job tagged with the request's id
/// let filter = JobFilter::hint(&reply_id).and(JobFilter::state(JobState::Done).not());
/// manager.cancel(&filter, true);
/// ```
#[derive(Clone)]
pub enum JobFilter {
    All,
    Id(Uuid),
    Name(String),
    ExecutionHint(String),
    Semaphore(Uuid),
    State(JobState),
    Blocked,
    Cancelled,
    Periodic,
    And(Vec<JobFilter>),
    Or(Vec<JobFilter>),
    Not(Box<JobFilter>),
    Custom(Arc<dyn Fn(&JobHandle) -> bool + Send + Sync>),
}

impl JobFilter {
    pub fn id(id: Uuid) -> Self {
        JobFilter::Id(id)
    }

    pub fn name(name: impl Into<String>) -> Self {
        JobFilter::Name(name.into())
    }

    pub fn hint(hint: impl Into<String>) -> Self {
        JobFilter::ExecutionHint(hint.into())
    }

    pub fn semaphore(semaphore: &ExecutionSemaphore) -> Self {
        JobFilter::Semaphore(semaphore.id())
    }

    pub fn state(state: JobState) -> Self {
        JobFilter::State(state)
    }

    /// Jobs that are neither done nor rejected.
    pub fn not_done() -> Self {
        JobFilter::Custom(Arc::new(|job| !job.is_done()))
    }

    pub fn custom(predicate: impl Fn(&JobHandle) -> bool + Send + Sync + 'static) -> Self {
        JobFilter::Custom(Arc::new(predicate))
    }

    pub fn and(self, other: JobFilter) -> Self {
        match self {
            JobFilter::And(mut filters) => {
                filters.push(other);
                JobFilter::And(filters)
            }
            this => JobFilter::And(vec![this, other]),
        }
    }

    pub fn or(self, other: JobFilter) -> Self {
        match self {
            JobFilter::Or(mut filters) => {
                filters.push(other);
                JobFilter::Or(filters)
            }
            this => JobFilter::Or(vec![this, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        JobFilter::Not(Box::new(self))
    }

    pub fn accept(&self, job: &JobHandle) -> bool {
        match self {
            JobFilter::All => true,
            JobFilter::Id(id) => job.id() == *id,
            JobFilter::Name(name) => job.name() == name,
            JobFilter::ExecutionHint(hint) => job.has_execution_hint(hint),
            JobFilter::Semaphore(id) => job.semaphore().is_some_and(|s| s.id() == *id),
            JobFilter::State(state) => job.state() == *state,
            JobFilter::Blocked => job.is_blocked(),
            JobFilter::Cancelled => job.is_cancelled(),
            JobFilter::Periodic => job.is_periodic(),
            JobFilter::And(filters) => filters.iter().all(|f| f.accept(job)),
            JobFilter::Or(filters) => filters.iter().any(|f| f.accept(job)),
            JobFilter::Not(filter) => !filter.accept(job),
            JobFilter::Custom(predicate) => predicate(job),
        }
    }
}

impl fmt::Debug for JobFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFilter::All => write!(f, "All"),
            JobFilter::Id(id) => write!(f, "Id({id})"),
            JobFilter::Name(name) => write!(f, "Name({name})"),
            JobFilter::ExecutionHint(hint) => write!(f, "ExecutionHint({hint})"),
            JobFilter::Semaphore(id) => write!(f, "Semaphore({id})"),
            JobFilter::State(state) => write!(f, "State({state})"),
            JobFilter::Blocked => write!(f, "Blocked"),
            JobFilter::Cancelled => write!(f, "Cancelled"),
            JobFilter::Periodic => write!(f, "Periodic"),
            JobFilter::And(filters) => f.debug_tuple("And").field(filters).finish(),
            JobFilter::Or(filters) => f.debug_tuple("Or").field(filters).finish(),
            JobFilter::Not(filter) => f.debug_tuple("Not").field(filter).finish(),
            JobFilter::Custom(_) => write!(f, "Custom"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::JobInput;

    fn job(name: &str, hints: &[&str]) -> JobHandle {
        let mut input = JobInput::new(name);
        for hint in hints {
            input = input.with_execution_hint(*hint);
        }
        JobHandle::new(&input)
    }

    #[test]
    fn test_hint_and_name() {
        let a = job("consumer", &["mom-1", "reply-1"]);
        let b = job("consumer", &["mom-1"]);

        let filter = JobFilter::hint("mom-1").and(JobFilter::hint("reply-1"));
        assert!(filter.accept(&a));
        assert!(!filter.accept(&b));

        assert!(JobFilter::name("consumer").accept(&b));
        assert!(!JobFilter::name("producer").accept(&b));
    }

    #[test]
    fn test_or_and_not() {
        let a = job("a", &[]);
        let b = job("b", &[]);
        let either = JobFilter::id(a.id()).or(JobFilter::id(b.id()));
        assert!(either.accept(&a));
        assert!(either.accept(&b));
        assert!(!either.clone().not().accept(&a));
    }

    #[test]
    fn test_runtime_hint_changes_are_visible() {
        let a = job("a", &[]);
        let filter = JobFilter::hint("late");
        assert!(!filter.accept(&a));
        a.add_execution_hint("late");
        assert!(filter.accept(&a));
    }

    #[test]
    fn test_semaphore_and_state() {
        let mutex = ExecutionSemaphore::mutex();
        let a = JobHandle::new(&JobInput::new("a").with_semaphore(mutex.clone()));
        assert!(JobFilter::semaphore(&mutex).accept(&a));
        assert!(JobFilter::state(JobState::Scheduled).accept(&a));
        assert!(JobFilter::not_done().accept(&a));
        assert!(!JobFilter::Blocked.accept(&a));
    }
}
