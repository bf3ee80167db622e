//! Job scheduler metrics.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Outcome label of a finished job.
#[derive(Debug, Clone, Copy)]
pub enum JobOutcome {
    Success,
    Failed,
    Cancelled,
}

impl JobOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Success => "success",
            JobOutcome::Failed => "failed",
            JobOutcome::Cancelled => "cancelled",
        }
    }
}

/// Job manager metrics helper
#[derive(Debug, Clone)]
pub struct JobMetrics {
    /// Manager name for labeling
    manager: String,
}

impl JobMetrics {
    pub fn new(manager: impl Into<String>) -> Self {
        Self {
            manager: manager.into(),
        }
    }

    pub fn job_scheduled(&self) {
        counter!("jobs_scheduled_total", "manager" => self.manager.clone()).increment(1);
    }

    pub fn job_rejected(&self) {
        counter!("jobs_rejected_total", "manager" => self.manager.clone()).increment(1);
    }

    pub fn job_finished(&self, outcome: JobOutcome, duration: Duration) {
        counter!(
            "jobs_completed_total",
            "manager" => self.manager.clone(),
            "status" => outcome.as_str()
        )
        .increment(1);

        histogram!("job_duration_seconds", "manager" => self.manager.clone())
            .record(duration.as_secs_f64());
    }

    pub fn active_jobs(&self, count: usize) {
        gauge!("jobs_active", "manager" => self.manager.clone()).set(count as f64);
    }
}
