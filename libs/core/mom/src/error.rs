//! Error types for messaging.

use core_config::ConfigError;
use jobs::JobError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{AsRefStr, Display};
use thiserror::Error;

/// Error categories determine how a failure is treated.
///
/// - **Configuration**: setup is wrong, fatal and never retried
/// - **Transport**: connection or session failure, retried per the retry policy
/// - **Timeout** / **Interruption**: a blocking wait ended early, kept apart
///   so callers can tell them from each other
/// - **Remote**: a reply handler failed on the other side
/// - **Processing**: local marshalling or handler failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    Transport,
    Timeout,
    Interruption,
    Remote,
    Processing,
}

impl ErrorCategory {
    /// Whether reconnecting and trying again can help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transport)
    }
}

/// Errors raised at the broker boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("session closed")]
    SessionClosed,

    #[error("consumer closed")]
    ConsumerClosed,

    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("transaction failed: {0}")]
    Transaction(String),
}

impl TransportError {
    /// Errors after which the connection must be replaced.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TransportError::Unavailable(_)
                | TransportError::ConnectionLost(_)
                | TransportError::ConnectionClosed
                | TransportError::SessionClosed
                | TransportError::ConsumerClosed
        )
    }
}

/// A reply handler failure as transported back to the requester.
///
/// Only the error kind and its top-level message cross the wire. Source
/// chains and anything after the first line are dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("remote {kind} error: {message}")]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Strip an error down to what may be sent to another process.
    pub fn sanitized(error: &MomError) -> Self {
        let message = match error {
            MomError::Remote(remote) => remote.message.clone(),
            MomError::Processing(message) => message.clone(),
            other => other.to_string(),
        };
        let first_line = message.lines().next().unwrap_or_default().to_string();
        Self::new(error.kind(), first_line)
    }
}

/// Messaging error type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MomError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("marshalling error: {0}")]
    Marshalling(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("'request-reply' messaging is not enabled for this MOM")]
    RequestReplyDisabled,

    #[error(transparent)]
    Remote(RemoteError),

    #[error("processing error: {0}")]
    Processing(String),
}

impl MomError {
    pub fn config(message: impl Into<String>) -> Self {
        MomError::Config(message.into())
    }

    pub fn processing(message: impl Into<String>) -> Self {
        MomError::Processing(message.into())
    }

    pub fn marshalling(message: impl std::fmt::Display) -> Self {
        MomError::Marshalling(message.to_string())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            MomError::Config(_) | MomError::RequestReplyDisabled => ErrorCategory::Configuration,
            MomError::Transport(_) => ErrorCategory::Transport,
            MomError::TimedOut(_) => ErrorCategory::Timeout,
            MomError::Interrupted(_) => ErrorCategory::Interruption,
            MomError::Remote(_) => ErrorCategory::Remote,
            MomError::Marshalling(_) | MomError::Encryption(_) | MomError::Processing(_) => {
                ErrorCategory::Processing
            }
        }
    }

    /// Stable name of the variant, carried in failure replies.
    pub fn kind(&self) -> &'static str {
        match self {
            MomError::Config(_) => "config",
            MomError::Transport(_) => "transport",
            MomError::Marshalling(_) => "marshalling",
            MomError::Encryption(_) => "encryption",
            MomError::TimedOut(_) => "timed_out",
            MomError::Interrupted(_) => "interrupted",
            MomError::RequestReplyDisabled => "request_reply_disabled",
            MomError::Remote(_) => "remote",
            MomError::Processing(_) => "processing",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, MomError::TimedOut(_))
    }

    pub fn is_interruption(&self) -> bool {
        matches!(self, MomError::Interrupted(_))
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, MomError::Transport(e) if e.is_connection_error())
    }
}

impl From<ConfigError> for MomError {
    fn from(error: ConfigError) -> Self {
        MomError::Config(error.to_string())
    }
}

impl From<JobError> for MomError {
    fn from(error: JobError) -> Self {
        match error {
            JobError::TimedOut(timeout) => MomError::TimedOut(timeout),
            JobError::Interrupted(what) => MomError::Interrupted(what),
            JobError::Cancelled(job) => MomError::Interrupted(format!("job '{job}' was cancelled")),
            other => MomError::Processing(other.to_string()),
        }
    }
}

impl From<MomError> for JobError {
    fn from(error: MomError) -> Self {
        match error {
            MomError::TimedOut(timeout) => JobError::TimedOut(timeout),
            MomError::Interrupted(what) => JobError::Interrupted(what),
            other => JobError::Failed(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for MomError {
    fn from(error: serde_json::Error) -> Self {
        MomError::Marshalling(error.to_string())
    }
}
