//! Execution triggers: when, and how often, a job runs.

use crate::error::JobError;
use chrono::{DateTime, Utc};
use croner::Cron;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Repetition schedule of a job.
#[derive(Debug, Clone, Default)]
pub enum Schedule {
    /// Run a single time.
    #[default]
    Once,

    /// Run repeatedly, waiting `interval` after each round completes.
    ///
    /// `rounds` bounds the total number of executions (`None` = forever).
    FixedDelay {
        interval: Duration,
        rounds: Option<u64>,
    },

    /// Run repeatedly, starting a round every `interval` measured from the
    /// previous round's start. A late round starts immediately.
    FixedRate {
        interval: Duration,
        rounds: Option<u64>,
    },

    /// Run at the instants matching a cron expression (UTC).
    Cron(CronSchedule),
}

impl Schedule {
    /// Fixed delay schedule running forever.
    pub fn fixed_delay(interval: Duration) -> Self {
        Schedule::FixedDelay {
            interval,
            rounds: None,
        }
    }

    /// Fixed rate schedule running forever.
    pub fn fixed_rate(interval: Duration) -> Self {
        Schedule::FixedRate {
            interval,
            rounds: None,
        }
    }

    /// Cron schedule; seconds field optional.
    pub fn cron(expression: &str) -> Result<Self, JobError> {
        CronSchedule::parse(expression).map(Schedule::Cron)
    }

    pub fn is_periodic(&self) -> bool {
        !matches!(self, Schedule::Once)
    }

    fn rounds(&self) -> Option<u64> {
        match self {
            Schedule::Once => Some(1),
            Schedule::FixedDelay { rounds, .. } | Schedule::FixedRate { rounds, .. } => *rounds,
            Schedule::Cron(_) => None,
        }
    }
}

/// Parsed cron expression.
#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    cron: Arc<Cron>,
}

impl CronSchedule {
    /// Parse a cron expression (5 or 6 fields).
    pub fn parse(expression: &str) -> Result<Self, JobError> {
        let cron = Cron::new(expression)
            .with_seconds_optional()
            .parse()
            .map_err(|e| JobError::InvalidTrigger(format!("'{expression}': {e}")))?;
        Ok(Self {
            expression: expression.to_string(),
            cron: Arc::new(cron),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next matching instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron.find_next_occurrence(&after, false).ok()
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}

/// Describes when a job fires.
///
/// # Example
///
/// ```rust,ignore
/// let trigger = ExecutionTrigger::new()
///     .with_start_in(Duration::from_secs(5))
///     .with_schedule(Schedule::fixed_delay(Duration::from_secs(60)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ExecutionTrigger {
    /// Delay before the first round
    pub start_in: Option<Duration>,

    /// Wall-clock instant of the first round
    pub start_at: Option<DateTime<Utc>>,

    /// No round starts after this instant
    pub end_at: Option<DateTime<Utc>>,

    pub schedule: Schedule,
}

impl ExecutionTrigger {
    /// Trigger that fires once, immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay the first round.
    pub fn with_start_in(mut self, delay: Duration) -> Self {
        self.start_in = Some(delay);
        self
    }

    /// Start the first round at a wall-clock instant.
    pub fn with_start_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_at = Some(at);
        self
    }

    /// Stop repeating after the given instant.
    pub fn with_end_at(mut self, at: DateTime<Utc>) -> Self {
        self.end_at = Some(at);
        self
    }

    /// Set the repetition schedule.
    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn is_periodic(&self) -> bool {
        self.schedule.is_periodic()
    }

    /// Instant of the first round, or `None` if the trigger never fires.
    pub(crate) fn first_fire(&self, now: Instant) -> Option<Instant> {
        let wall_now = Utc::now();
        let mut fire = now;

        if let Some(delay) = self.start_in {
            fire = fire.max(now + delay);
        }
        if let Some(at) = self.start_at {
            fire = fire.max(now + until(wall_now, at));
        }
        if let Schedule::Cron(cron) = &self.schedule {
            let earliest = wall_now + chrono_duration(fire - now);
            let next = cron.next_after(earliest)?;
            fire = now + until(wall_now, next);
        }
        self.within_end(now, wall_now, fire)
    }

    /// Instant of the round after `completed` rounds, or `None` if done.
    pub(crate) fn next_fire(
        &self,
        completed: u64,
        last_start: Instant,
        now: Instant,
    ) -> Option<Instant> {
        if let Some(rounds) = self.schedule.rounds() {
            if completed >= rounds {
                return None;
            }
        }

        let wall_now = Utc::now();
        let fire = match &self.schedule {
            Schedule::Once => return None,
            Schedule::FixedDelay { interval, .. } => now + *interval,
            Schedule::FixedRate { interval, .. } => (last_start + *interval).max(now),
            Schedule::Cron(cron) => {
                let next = cron.next_after(wall_now)?;
                now + until(wall_now, next)
            }
        };
        self.within_end(now, wall_now, fire)
    }

    fn within_end(&self, now: Instant, wall_now: DateTime<Utc>, fire: Instant) -> Option<Instant> {
        match self.end_at {
            Some(end) if wall_now + chrono_duration(fire - now) > end => None,
            _ => Some(fire),
        }
    }
}

fn until(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
