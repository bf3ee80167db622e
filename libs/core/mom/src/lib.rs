//! Message-oriented middleware on top of a pluggable broker transport.
//!
//! A [`Mom`] offers two patterns:
//! - **Publish/subscribe**: [`Mom::publish`] sends a value to a queue or
//!   topic, [`Mom::subscribe`] handles every message received there. A queue
//!   message reaches exactly one subscriber, a topic message every
//!   subscriber active when it was sent.
//! - **Request/reply**: [`Mom::request`] sends a value and waits for the
//!   answer produced by a [`Mom::reply`] handler. A requester that gives up
//!   tells the replier to interrupt its handler.
//!
//! Handlers run as jobs of the [`jobs`] crate. Acknowledgement modes decide
//! whether messages are handled concurrently, one after another, or inside
//! a transaction that rolls back into redelivery when the handler fails.
//!
//! Values travel through a [`Marshaller`] (text, bytes, JSON, or object
//! with type information) and optionally an [`Encrypter`], both chosen per
//! destination. The broker is reached through a [`ConnectionFactory`];
//! [`MemoryBroker`] is an in-process implementation.
//!
//! # Example
//!
//! ```ignore
//! use mom::{BiDestination, Mom, MomEnvironment, MemoryBroker, PublishInput, SubscribeInput};
//!
//! let mom = Mom::init(
//!     MomEnvironment::new().with_connection_factory(Arc::new(MemoryBroker::new())),
//!     JobManager::new("app"),
//! )
//! .await?;
//!
//! let echo = BiDestination::<String, String>::queue("echo");
//! mom.reply(&echo, |message, _ctx| async move {
//!     Ok(message.transfer_object().to_uppercase())
//! }, SubscribeInput::new())
//! .await?;
//!
//! let answer = mom
//!     .request(&echo, &"hello".to_string(), PublishInput::new().with_request_reply_timeout(Duration::from_secs(5)))
//!     .await?;
//! assert_eq!(answer, "HELLO");
//! ```

mod codec;
pub mod config;
mod connection;
mod destination;
mod encrypter;
pub mod environment;
mod error;
mod handler;
mod marshaller;
mod message;
pub mod metrics;
mod mom;
mod registry;
mod request_reply;
mod selector;
mod subscription;
mod sync;
mod transaction;
pub mod transport;

pub use config::{BackoffStrategy, RetryPolicy};
pub use destination::{BiDestination, Destination, DestinationRef, DestinationType, ResolveMethod};
pub use encrypter::{AesGcmEncrypter, Encrypter};
pub use environment::{EnvValue, MomEnvironment, NamingContext};
pub use error::{ErrorCategory, MomError, RemoteError, TransportError};
pub use handler::{LogMessageHandler, MessageHandler};
pub use marshaller::{
    marshaller_by_name, BytesMarshaller, JsonMarshaller, Marshaller, ObjectMarshaller, TextMarshaller, WireBody,
};
pub use message::{
    is_reserved_property, AcknowledgementMode, Message, PublishInput, SubscribeInput, PROP_CALLER_CORRELATION_ID,
    PROP_MARSHALLER_CONTEXT, PROP_REPLY_SUCCESS,
};
pub use mom::{Mom, DEFAULT_RECEIVE_TIMEOUT};
pub use registry::Registration;
pub use request_reply::{DEFAULT_CANCELLATION_TOPIC, REPLY_ID_PREFIX};
pub use selector::{Properties, Selector};
pub use subscription::{Subscription, SubscriptionStats};
pub use transport::memory::{MemoryBroker, MemoryBrokerConfig, QueueRetention, TEMPORARY_QUEUE_PREFIX};
pub use transport::{BrokerConnection, BrokerConsumer, BrokerSession, ConnectionFactory, Credentials, TransportMessage};
