//! Messages as seen by handlers, and the options of publish and subscribe.

use crate::destination::DestinationRef;
use crate::selector::Properties;
use crate::transport::TransportMessage;
use chrono::{DateTime, Utc};
use jobs::{JobContext, RunContext};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use strum::{AsRefStr, Display};

/// Property carrying the marshaller context as JSON.
pub const PROP_MARSHALLER_CONTEXT: &str = "x-mom-marshaller-context";

/// Property of a reply telling whether the request handler succeeded.
pub const PROP_REPLY_SUCCESS: &str = "x-mom-reply-success";

/// Property of a request carrying the requester's own correlation id.
pub const PROP_CALLER_CORRELATION_ID: &str = "x-mom-caller-correlation-id";

/// Whether a property name is reserved for the MOM itself.
pub fn is_reserved_property(name: &str) -> bool {
    name.starts_with("x-mom-")
}

/// A received message.
///
/// Cheap to clone. Handlers get it as argument; code further down the call
/// chain can get it back from the job's run context with
/// [`Message::current`].
pub struct Message<T> {
    inner: Arc<MessageData<T>>,
}

struct MessageData<T> {
    transfer_object: T,
    destination: DestinationRef,
    properties: Properties,
    correlation_id: Option<String>,
    caller_correlation_id: Option<String>,
    reply_to: Option<DestinationRef>,
    timestamp: DateTime<Utc>,
    redelivered: bool,
    adapter: Weak<TransportMessage>,
}

impl<T> Message<T> {
    pub(crate) fn new(transfer_object: T, destination: DestinationRef, adapter: &Arc<TransportMessage>) -> Self {
        let properties = adapter
            .properties
            .iter()
            .filter(|(name, _)| !is_reserved_property(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let caller_correlation_id = adapter
            .property(PROP_CALLER_CORRELATION_ID)
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            inner: Arc::new(MessageData {
                transfer_object,
                destination,
                properties,
                correlation_id: adapter.correlation_id.clone(),
                caller_correlation_id,
                reply_to: adapter.reply_to.clone(),
                timestamp: adapter.timestamp,
                redelivered: adapter.redelivered,
                adapter: Arc::downgrade(adapter),
            }),
        }
    }

    pub fn transfer_object(&self) -> &T {
        &self.inner.transfer_object
    }

    /// Destination the message was received from.
    pub fn destination(&self) -> &DestinationRef {
        &self.inner.destination
    }

    /// User properties; reserved properties are not included.
    pub fn properties(&self) -> &Properties {
        &self.inner.properties
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.inner.properties.get(name)
    }

    /// Correlation id, also the ambient correlation id while the message is
    /// handled. For requests this is the id generated for the request.
    pub fn correlation_id(&self) -> Option<&str> {
        self.inner.correlation_id.as_deref()
    }

    /// Correlation id the requester had when it sent a request.
    pub fn caller_correlation_id(&self) -> Option<&str> {
        self.inner.caller_correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&DestinationRef> {
        self.inner.reply_to.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.inner.timestamp
    }

    pub fn is_redelivered(&self) -> bool {
        self.inner.redelivered
    }

    /// The underlying transport message, while it is being handled.
    pub fn adapter_message(&self) -> Option<Arc<TransportMessage>> {
        self.inner.adapter.upgrade()
    }
}

impl<T: Send + Sync + 'static> Message<T> {
    /// The message handled by the job owning `ctx`, if it carries a `T`.
    pub fn current(ctx: &JobContext) -> Option<Message<T>> {
        ctx.run_context()
            .extension::<Message<T>>()
            .map(|message| Message::clone(&message))
    }
}

impl<T> Clone for Message<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("destination", &self.inner.destination)
            .field("correlation_id", &self.inner.correlation_id)
            .field("transfer_object", &self.inner.transfer_object)
            .field("properties", &self.inner.properties)
            .finish()
    }
}

/// Options of a publish or request.
///
/// ```rust,ignore
/// let input = PublishInput::new()
///     .with_property("tenant", "acme")
///     .with_time_to_live(Duration::from_secs(30))
///     .with_job_context(&ctx);
/// ```
#[derive(Clone, Default)]
pub struct PublishInput {
    pub properties: Properties,

    /// Drop the message if not delivered within this time
    pub time_to_live: Option<Duration>,

    /// 0 (lowest) to 9 (highest); broker default if unset
    pub priority: Option<u8>,

    /// Stage the send in the run context's transaction
    pub transactional: bool,

    /// Maximal time `request` waits for the reply; unbounded if unset
    pub request_reply_timeout: Option<Duration>,

    /// Reply destination to announce on a plain publish
    pub reply_to: Option<DestinationRef>,

    /// Correlation id and transaction of the publisher
    pub run_context: RunContext,

    /// Job the publisher runs in. A `request` from within a job suspends
    /// the job interruptibly and releases its semaphore permit while waiting.
    pub job_context: Option<JobContext>,
}

impl PublishInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority.min(9));
        self
    }

    pub fn with_transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    pub fn with_request_reply_timeout(mut self, timeout: Duration) -> Self {
        self.request_reply_timeout = Some(timeout);
        self
    }

    pub fn with_reply_to(mut self, destination: impl Into<DestinationRef>) -> Self {
        self.reply_to = Some(destination.into());
        self
    }

    pub fn with_run_context(mut self, run_context: RunContext) -> Self {
        self.run_context = run_context;
        self
    }

    /// Publish on behalf of a running job, with its run context.
    pub fn with_job_context(mut self, ctx: &JobContext) -> Self {
        self.run_context = ctx.run_context().clone();
        self.job_context = Some(ctx.clone());
        self
    }
}

impl fmt::Debug for PublishInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishInput")
            .field("properties", &self.properties)
            .field("time_to_live", &self.time_to_live)
            .field("priority", &self.priority)
            .field("transactional", &self.transactional)
            .field("request_reply_timeout", &self.request_reply_timeout)
            .field("reply_to", &self.reply_to)
            .field("run_context", &self.run_context)
            .field("job", &self.job_context.as_ref().map(|ctx| ctx.name().to_string()))
            .finish()
    }
}

/// How received messages are acknowledged and handed to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum AcknowledgementMode {
    /// Acknowledge on receipt and handle each message in its own job,
    /// concurrently up to `max_concurrent_consumer_jobs`.
    #[default]
    Auto,

    /// Acknowledge on receipt and handle one message at a time, in order.
    /// Disposing waits for the message being handled.
    AutoSingleThreaded,

    /// Handle one message at a time in a transaction. The message is
    /// acknowledged on commit and delivered again on rollback.
    Transacted,
}

/// Options of a subscribe or reply.
#[derive(Debug, Clone, Default)]
pub struct SubscribeInput {
    pub acknowledgement_mode: AcknowledgementMode,

    /// Bound for concurrent handler jobs in `Auto` mode; unbounded if unset
    pub max_concurrent_consumer_jobs: Option<usize>,

    /// Only receive messages whose properties match
    pub selector: Option<String>,

    /// Makes a topic subscription durable under this name
    pub durable_subscription_name: Option<String>,

    /// Base run context of the handler jobs
    pub run_context: RunContext,
}

impl SubscribeInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_acknowledgement_mode(mut self, mode: AcknowledgementMode) -> Self {
        self.acknowledgement_mode = mode;
        self
    }

    pub fn with_max_concurrent_consumer_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_consumer_jobs = Some(max.max(1));
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_durable_subscription_name(mut self, name: impl Into<String>) -> Self {
        self.durable_subscription_name = Some(name.into());
        self
    }

    pub fn with_run_context(mut self, run_context: RunContext) -> Self {
        self.run_context = run_context;
        self
    }

    /// Concurrency bound of the handler jobs.
    pub(crate) fn concurrency(&self) -> Option<usize> {
        match self.acknowledgement_mode {
            AcknowledgementMode::Auto => self.max_concurrent_consumer_jobs,
            AcknowledgementMode::AutoSingleThreaded | AcknowledgementMode::Transacted => Some(1),
        }
    }
}
