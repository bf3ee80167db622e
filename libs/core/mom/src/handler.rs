//! Hook observing every message crossing the broker boundary.

use crate::destination::DestinationRef;
use crate::transport::TransportMessage;
use std::fmt;
use tracing::debug;

/// Sees each message right before it is sent and right after it is received,
/// before it is decoded.
///
/// Configured with the `mom.message_handler` environment key. The default is
/// [`LogMessageHandler`].
pub trait MessageHandler: Send + Sync + fmt::Debug {
    fn handle_outgoing(&self, destination: &DestinationRef, message: &TransportMessage);

    fn handle_incoming(&self, destination: &DestinationRef, message: &TransportMessage);
}

/// Logs message metadata at debug level; bodies are never logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMessageHandler;

impl MessageHandler for LogMessageHandler {
    fn handle_outgoing(&self, destination: &DestinationRef, message: &TransportMessage) {
        debug!(
            destination = %destination,
            message_id = %message.id,
            correlation_id = message.correlation_id.as_deref(),
            body_len = message.body.len(),
            properties = message.properties.len(),
            "Sending message"
        );
    }

    fn handle_incoming(&self, destination: &DestinationRef, message: &TransportMessage) {
        debug!(
            destination = %destination,
            message_id = %message.id,
            correlation_id = message.correlation_id.as_deref(),
            redelivered = message.redelivered,
            body_len = message.body.len(),
            "Received message"
        );
    }
}
