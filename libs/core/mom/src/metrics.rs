//! Messaging metrics.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Metrics of one MOM instance.
#[derive(Debug, Clone)]
pub struct MomMetrics {
    /// Symbolic name for labeling
    mom: String,
}

impl MomMetrics {
    pub fn new(mom: impl Into<String>) -> Self {
        Self { mom: mom.into() }
    }

    pub fn message_published(&self, destination: &str) {
        counter!(
            "mom_messages_published_total",
            "mom" => self.mom.clone(),
            "destination" => destination.to_string()
        )
        .increment(1);
    }

    pub fn message_received(&self, destination: &str) {
        counter!(
            "mom_messages_received_total",
            "mom" => self.mom.clone(),
            "destination" => destination.to_string()
        )
        .increment(1);
    }

    pub fn message_failed(&self, destination: &str, category: &str) {
        counter!(
            "mom_messages_failed_total",
            "mom" => self.mom.clone(),
            "destination" => destination.to_string(),
            "category" => category.to_string()
        )
        .increment(1);
    }

    pub fn request_completed(&self, duration: Duration) {
        histogram!("mom_request_reply_duration_seconds", "mom" => self.mom.clone())
            .record(duration.as_secs_f64());
    }

    pub fn request_timed_out(&self) {
        counter!("mom_request_reply_timeouts_total", "mom" => self.mom.clone()).increment(1);
    }

    pub fn reconnected(&self) {
        counter!("mom_reconnects_total", "mom" => self.mom.clone()).increment(1);
    }

    pub fn active_subscriptions(&self, count: usize) {
        gauge!("mom_subscriptions_active", "mom" => self.mom.clone()).set(count as f64);
    }
}
