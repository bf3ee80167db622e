//! Asynchronous job scheduler.
//!
//! Jobs are futures scheduled onto the tokio runtime together with a
//! [`JobInput`] describing how they run:
//! - **Execution semaphores** bound how many jobs of a group run at once.
//!   A semaphore with one permit is a mutex.
//! - **Blocking conditions** let a running job suspend. The job gives its
//!   permit back while suspended so other jobs of its group can proceed.
//! - **Execution hints** are string tags attached to jobs. They are used to
//!   select jobs for cancellation and awaiting via [`JobFilter`].
//! - **Triggers** delay a job or run it periodically (fixed delay, fixed
//!   rate or cron).
//!
//! # Lifecycle
//!
//! ```text
//!                    ┌─────────────┐
//!  schedule() ──────▶│  SCHEDULED  │
//!                    └──────┬──────┘
//!                           │ trigger fires later
//!                    ┌──────▼──────┐
//!                    │   PENDING   │
//!                    └──────┬──────┘
//!                           │ semaphore set
//!                 ┌─────────▼──────────┐
//!                 │ WAITING_FOR_PERMIT │◀────────────────┐
//!                 └─────────┬──────────┘                 │ released
//!                    ┌──────▼──────┐      wait   ┌───────┴─────────────────────┐
//!                    │   RUNNING   │────────────▶│ WAITING_FOR_BLOCKING_COND.  │
//!                    └──────┬──────┘             └─────────────────────────────┘
//!                           │
//!                    ┌──────▼──────┐
//!                    │    DONE     │        (REJECTED: manager shut down)
//!                    └─────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use jobs::{ExecutionSemaphore, JobInput, JobManager};
//!
//! let manager = JobManager::new("app");
//! let mutex = ExecutionSemaphore::mutex();
//!
//! let future = manager.schedule(
//!     |ctx| async move {
//!         ctx.sleep(Duration::from_millis(10)).await?;
//!         Ok(42)
//!     },
//!     JobInput::new("answer").with_semaphore(mutex.clone()),
//! );
//!
//! assert_eq!(future.await_done_and_get().await?, 42);
//! ```

mod blocking;
mod context;
mod error;
mod filter;
mod future;
mod input;
mod manager;
pub mod metrics;
mod run_context;
mod semaphore;
mod state;
mod sync;
mod transaction;
mod trigger;

pub use blocking::BlockingCondition;
pub use context::{ExecutionHintGuard, JobContext};
pub use error::JobError;
pub use filter::JobFilter;
pub use future::{JobFuture, JobHandle};
pub use input::{ErrorHandler, ExceptionHandling, JobInput};
pub use manager::JobManager;
pub use run_context::RunContext;
pub use semaphore::{ExecutionSemaphore, QueuePosition, SemaphorePermit};
pub use state::JobState;
pub use transaction::{Transaction, TransactionMember, TransactionScope, TransactionState};
pub use trigger::{CronSchedule, ExecutionTrigger, Schedule};
