//! Job submission input.

use crate::error::JobError;
use crate::run_context::RunContext;
use crate::semaphore::ExecutionSemaphore;
use crate::trigger::ExecutionTrigger;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Callback receiving a job failure.
pub type ErrorHandler = Arc<dyn Fn(&str, &JobError) + Send + Sync>;

/// What happens to an error returned by a job.
#[derive(Clone, Default)]
pub enum ExceptionHandling {
    /// Log the failure and hand it to awaiters.
    #[default]
    Propagate,

    /// Log the failure only. Periodic jobs keep running; awaiters of the
    /// job's value get [`JobError::NoValue`].
    Swallow,

    /// Pass the failure to `handler`; hand it to awaiters if `propagate`.
    Custom {
        handler: ErrorHandler,
        propagate: bool,
    },
}

impl ExceptionHandling {
    /// Custom handler whose failures still reach awaiters.
    pub fn custom(handler: impl Fn(&str, &JobError) + Send + Sync + 'static) -> Self {
        ExceptionHandling::Custom {
            handler: Arc::new(handler),
            propagate: true,
        }
    }
}

impl fmt::Debug for ExceptionHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionHandling::Propagate => write!(f, "Propagate"),
            ExceptionHandling::Swallow => write!(f, "Swallow"),
            ExceptionHandling::Custom { propagate, .. } => f
                .debug_struct("Custom")
                .field("propagate", propagate)
                .finish_non_exhaustive(),
        }
    }
}

/// Describes how a job is to be executed.
///
/// # Example
///
/// ```rust,ignore
/// let input = JobInput::new("sync-accounts")
///     .with_execution_hint("tenant:acme")
///     .with_semaphore(mutex.clone())
///     .with_trigger(ExecutionTrigger::new().with_start_in(Duration::from_secs(1)));
/// ```
#[derive(Debug, Clone)]
pub struct JobInput {
    /// Job name, for logging and filtering
    pub name: String,

    /// Initial execution hints
    pub execution_hints: HashSet<String>,

    /// Serialization group
    pub semaphore: Option<ExecutionSemaphore>,

    pub trigger: ExecutionTrigger,

    pub exception_handling: ExceptionHandling,

    pub run_context: RunContext,
}

impl Default for JobInput {
    fn default() -> Self {
        Self {
            name: "job".to_string(),
            execution_hints: HashSet::new(),
            semaphore: None,
            trigger: ExecutionTrigger::default(),
            exception_handling: ExceptionHandling::default(),
            run_context: RunContext::default(),
        }
    }
}

impl JobInput {
    /// Create an input for a job with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the job name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add an execution hint.
    pub fn with_execution_hint(mut self, hint: impl Into<String>) -> Self {
        self.execution_hints.insert(hint.into());
        self
    }

    /// Run in the given serialization group.
    pub fn with_semaphore(mut self, semaphore: ExecutionSemaphore) -> Self {
        self.semaphore = Some(semaphore);
        self
    }

    /// Set the execution trigger.
    pub fn with_trigger(mut self, trigger: ExecutionTrigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Set the exception handling.
    pub fn with_exception_handling(mut self, handling: ExceptionHandling) -> Self {
        self.exception_handling = handling;
        self
    }

    /// Set the run context.
    pub fn with_run_context(mut self, run_context: RunContext) -> Self {
        self.run_context = run_context;
        self
    }
}
