//! Broker transport boundary.
//!
//! The MOM implementor talks to a broker only through these traits, the same
//! shape a JMS-style client exposes: a factory producing connections, sessions
//! (optionally transacted) that send and create consumers, and consumers that
//! receive with a timeout.
//!
//! [`memory::MemoryBroker`] is the shipped implementation.

pub mod memory;

use crate::destination::DestinationRef;
use crate::error::TransportError;
use crate::marshaller::WireBody;
use crate::selector::Properties;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Default JMS priority.
pub const DEFAULT_PRIORITY: u8 = 4;

/// User name and password handed to the connection factory.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// A message as the broker sees it.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub id: String,
    pub body: WireBody,
    pub properties: Properties,
    pub correlation_id: Option<String>,
    pub reply_to: Option<DestinationRef>,
    pub timestamp: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub priority: u8,
    pub redelivered: bool,
    pub delivery_count: u32,
}

impl TransportMessage {
    pub fn new(body: WireBody) -> Self {
        Self {
            id: format!("ID:{}", Uuid::new_v4()),
            body,
            properties: Properties::new(),
            correlation_id: None,
            reply_to: None,
            timestamp: Utc::now(),
            expires_at: None,
            priority: DEFAULT_PRIORITY,
            redelivered: false,
            delivery_count: 1,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Expire `ttl` after the message timestamp.
    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.timestamp.checked_add_signed(ttl));
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

/// Creates broker connections.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + fmt::Debug {
    async fn create_connection(
        &self,
        client_id: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError>;
}

/// A live connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn id(&self) -> Uuid;

    fn client_id(&self) -> &str;

    async fn create_session(&self, transacted: bool) -> Result<Arc<dyn BrokerSession>, TransportError>;

    /// Whether the connection can no longer be used, because it was closed
    /// or the broker dropped it.
    fn is_closed(&self) -> bool;

    async fn close(&self);
}

/// A unit of work on a connection.
///
/// Sends and receives of a transacted session become effective on
/// [`commit`](Self::commit); [`rollback`](Self::rollback) discards the sends
/// and makes received messages available again.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    fn is_transacted(&self) -> bool;

    async fn send(&self, destination: &DestinationRef, message: TransportMessage) -> Result<(), TransportError>;

    /// Consumer on `destination`. A `durable_name` on a topic makes the
    /// subscription survive detaching.
    async fn create_consumer(
        &self,
        destination: &DestinationRef,
        selector: Option<&str>,
        durable_name: Option<&str>,
    ) -> Result<Box<dyn BrokerConsumer>, TransportError>;

    /// Queue that lives until this session closes.
    async fn create_temporary_queue(&self) -> Result<DestinationRef, TransportError>;

    /// Discard a durable subscription and its backlog.
    async fn unsubscribe(&self, durable_name: &str) -> Result<(), TransportError>;

    async fn commit(&self) -> Result<(), TransportError>;

    async fn rollback(&self) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Receives messages from a destination.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Next message, or `None` if none arrived within `timeout`.
    async fn receive(&self, timeout: Duration) -> Result<Option<TransportMessage>, TransportError>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_to_live() {
        let message = TransportMessage::new(WireBody::Empty).with_time_to_live(Duration::from_millis(1));
        assert!(!message.is_expired(message.timestamp));
        assert!(message.is_expired(message.timestamp + chrono::Duration::milliseconds(2)));

        let forever = TransportMessage::new(WireBody::Empty);
        assert!(!forever.is_expired(Utc::now() + chrono::Duration::days(365)));
    }

    #[test]
    fn test_credentials_hide_password() {
        let credentials = Credentials {
            user: "scott".into(),
            password: "tiger".into(),
        };
        assert!(!format!("{credentials:?}").contains("tiger"));
    }
}
