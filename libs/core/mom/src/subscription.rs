//! Subscriptions: a consumer loop job per subscription, dispatching each
//! received message as a handler job.

use crate::codec::Codec;
use crate::destination::DestinationRef;
use crate::error::{MomError, RemoteError, TransportError};
use crate::marshaller::WireBody;
use crate::message::{AcknowledgementMode, SubscribeInput, PROP_REPLY_SUCCESS};
use crate::mom::MomInner;
use crate::selector::Selector;
use crate::sync::lock;
use crate::transaction::SessionMember;
use crate::transport::{BrokerConsumer, BrokerSession, TransportMessage};
use futures::future::BoxFuture;
use jobs::{JobContext, JobError, JobHandle, RunContext, TransactionScope};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Body of a handler job. Request handlers produce the reply to send.
pub(crate) type HandlerJob =
    Box<dyn FnOnce(JobContext) -> BoxFuture<'static, Result<Option<TransportMessage>, MomError>> + Send>;

/// Decodes a received message and builds the run context and body of its
/// handler job.
pub(crate) type Prepare = Box<
    dyn Fn(&Codec, &DestinationRef, &Arc<TransportMessage>, RunContext) -> Result<(RunContext, HandlerJob), MomError>
        + Send
        + Sync,
>;

/// What a subscription does with its messages.
pub(crate) enum Listener {
    Publish(Prepare),
    Request(Prepare),
}

impl Listener {
    fn kind(&self) -> &'static str {
        match self {
            Listener::Publish(_) => "subscription",
            Listener::Request(_) => "replier",
        }
    }
}

/// Reply carrying the outcome of a request handler.
///
/// A failure is reduced to a [`RemoteError`], and only sent as body if the
/// marshaller round-trips structured values. Otherwise the body stays empty
/// so no error text leaves the process.
pub(crate) fn reply_message<Rep: Serialize>(codec: &Codec, outcome: Result<Rep, MomError>) -> TransportMessage {
    let error = match outcome.and_then(|value| codec.encode(&value)) {
        Ok(reply) => return reply.with_property(PROP_REPLY_SUCCESS, true),
        Err(error) => error,
    };
    failure_reply(codec, &error)
}

pub(crate) fn failure_reply(codec: &Codec, error: &MomError) -> TransportMessage {
    let body = if codec.marshaller().preserves_types() {
        codec.encode(&RemoteError::sanitized(error)).ok()
    } else {
        None
    };
    body.unwrap_or_else(|| TransportMessage::new(WireBody::Empty))
        .with_property(PROP_REPLY_SUCCESS, false)
}

/// Receive counters of a subscription.
///
/// `received_messages`, `received_non_null_messages` and `received_errors`
/// count since the consumer was last (re)opened; they are reset when the
/// subscription recovers from a broker failure. `reconnects` counts over
/// the lifetime of the subscription.
#[derive(Debug, Default)]
pub struct SubscriptionStats {
    received_messages: AtomicU64,
    received_non_null_messages: AtomicU64,
    received_errors: AtomicU64,
    reconnects: AtomicU64,
}

impl SubscriptionStats {
    /// Completed receive calls, with or without a message.
    pub fn received_messages(&self) -> u64 {
        self.received_messages.load(Ordering::Relaxed)
    }

    pub fn received_non_null_messages(&self) -> u64 {
        self.received_non_null_messages.load(Ordering::Relaxed)
    }

    pub fn received_errors(&self) -> u64 {
        self.received_errors.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    fn record_receive(&self, got_message: bool) {
        self.received_messages.fetch_add(1, Ordering::Relaxed);
        if got_message {
            self.received_non_null_messages.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_error(&self) {
        self.received_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_reconnect(&self) {
        self.received_messages.store(0, Ordering::Relaxed);
        self.received_non_null_messages.store(0, Ordering::Relaxed);
        self.received_errors.store(0, Ordering::Relaxed);
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle to a subscription. Cloning yields another handle to the same one.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

struct SubscriptionInner {
    id: Uuid,
    destination: DestinationRef,
    mode: AcknowledgementMode,
    durable_name: Option<String>,
    stats: SubscriptionStats,
    worker: Mutex<Option<JobHandle>>,
    disposed: AtomicBool,
    mom: Weak<MomInner>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn destination(&self) -> &DestinationRef {
        &self.inner.destination
    }

    pub fn acknowledgement_mode(&self) -> AcknowledgementMode {
        self.inner.mode
    }

    pub fn durable_subscription_name(&self) -> Option<&str> {
        self.inner.durable_name.as_deref()
    }

    pub fn stats(&self) -> &SubscriptionStats {
        &self.inner.stats
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Stop receiving and release the consumer. Idempotent.
    ///
    /// Returns once the consumer loop has ended; with
    /// [`AcknowledgementMode::AutoSingleThreaded`] and
    /// [`AcknowledgementMode::Transacted`] this includes the handler
    /// currently running.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let worker = lock(&self.inner.worker).clone();
        if let Some(worker) = worker {
            worker.cancel(false);
            worker.await_done().await;
        }
        if let Some(mom) = self.inner.mom.upgrade() {
            mom.remove_subscription(self.inner.id);
        }
        debug!(subscription = %self.inner.id, destination = %self.inner.destination, "Subscription disposed");
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("destination", &self.inner.destination)
            .field("mode", &self.inner.mode)
            .field("durable_name", &self.inner.durable_name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Subscribe `listener` to `destination`.
///
/// The consumer is attached before this returns, so a topic subscription
/// sees every message published afterwards. If the broker is unreachable
/// the subscription still starts and keeps trying in the background.
pub(crate) async fn start(
    mom: &Arc<MomInner>,
    destination: DestinationRef,
    listener: Listener,
    input: SubscribeInput,
) -> Result<Subscription, MomError> {
    mom.ensure_alive()?;
    let resolved = mom.resolve(&destination)?;
    if let Some(selector) = &input.selector {
        Selector::parse(selector).map_err(|e| MomError::config(e.to_string()))?;
    }
    if input.durable_subscription_name.is_some() && !resolved.is_topic() {
        return Err(MomError::config(format!(
            "durable subscriptions need a topic, '{resolved}' is a queue"
        )));
    }

    let initial = match open(mom, &resolved, &input).await {
        Ok(consumer) => Some(consumer),
        Err(e) if e.is_connection_error() => {
            warn!(destination = %resolved, error = %e, "Broker unreachable, subscription keeps trying in the background");
            None
        }
        Err(e) => return Err(MomError::config(e.to_string())),
    };

    let id = Uuid::new_v4();
    let capacity = match (input.acknowledgement_mode, input.concurrency()) {
        (AcknowledgementMode::Auto, Some(permits)) => Some(Arc::new(Semaphore::new(permits.max(1)))),
        _ => None,
    };
    let inner = Arc::new(SubscriptionInner {
        id,
        destination: destination.clone(),
        mode: input.acknowledgement_mode,
        durable_name: input.durable_subscription_name.clone(),
        stats: SubscriptionStats::default(),
        worker: Mutex::new(None),
        disposed: AtomicBool::new(false),
        mom: Arc::downgrade(mom),
    });

    let kind = listener.kind();
    let consumer_loop = ConsumerLoop {
        mom: Arc::clone(mom),
        subscription: Arc::clone(&inner),
        listener,
        resolved: resolved.clone(),
        input,
        capacity,
    };
    let worker = mom.manager.schedule(
        move |ctx| consumer_loop.run(ctx, initial),
        mom.job_input(format!("mom.{kind}.consumer {resolved}")),
    );
    *lock(&inner.worker) = Some(worker.handle().clone());

    let subscription = Subscription { inner };
    info!(
        subscription = %id,
        destination = %resolved,
        mode = %subscription.acknowledgement_mode(),
        kind,
        "Subscribed"
    );
    Ok(subscription)
}

struct OpenConsumer {
    connection_id: Uuid,
    session: Arc<dyn BrokerSession>,
    consumer: Box<dyn BrokerConsumer>,
}

impl OpenConsumer {
    async fn close(self) {
        self.consumer.close().await;
        self.session.close().await;
    }
}

async fn open(mom: &MomInner, destination: &DestinationRef, input: &SubscribeInput) -> Result<OpenConsumer, TransportError> {
    let transacted = input.acknowledgement_mode == AcknowledgementMode::Transacted;
    let (connection_id, session) = mom.connection.create_session(transacted).await?;
    match session
        .create_consumer(
            destination,
            input.selector.as_deref(),
            input.durable_subscription_name.as_deref(),
        )
        .await
    {
        Ok(consumer) => Ok(OpenConsumer {
            connection_id,
            session,
            consumer,
        }),
        Err(e) => {
            session.close().await;
            if e.is_connection_error() {
                mom.connection.invalidate(connection_id).await;
            }
            Err(e)
        }
    }
}

struct ConsumerLoop {
    mom: Arc<MomInner>,
    subscription: Arc<SubscriptionInner>,
    listener: Listener,
    resolved: DestinationRef,
    input: SubscribeInput,
    /// Handler jobs of an [`AcknowledgementMode::Auto`] subscription that
    /// may be in flight. A permit is taken before each receive, so messages
    /// stay on the broker while the handlers are busy.
    capacity: Option<Arc<Semaphore>>,
}

impl ConsumerLoop {
    async fn run(self, ctx: JobContext, initial: Option<OpenConsumer>) -> Result<(), JobError> {
        let backoff = self.mom.connection.policy().session_backoff();
        let mut pending = initial;
        let mut failures: u32 = 0;

        while !ctx.is_cancelled() {
            let consumer = match pending.take() {
                Some(consumer) => consumer,
                None => match open(&self.mom, &self.resolved, &self.input).await {
                    Ok(consumer) => consumer,
                    Err(e) => {
                        self.subscription.stats.record_error();
                        if failures == 0 {
                            warn!(destination = %self.resolved, error = %e, "Could not open consumer, retrying");
                        }
                        failures += 1;
                        pause(&ctx, backoff.delay(failures - 1)).await;
                        continue;
                    }
                },
            };

            if failures > 0 {
                info!(destination = %self.resolved, "Connection recovered after {} errors", failures);
                self.subscription.stats.record_reconnect();
                failures = 0;
            }

            let connection_id = consumer.connection_id;
            let outcome = self.receive(&ctx, &consumer).await;
            consumer.close().await;
            if let Err(e) = outcome {
                if e.is_connection_error() {
                    self.mom.connection.invalidate(connection_id).await;
                }
                warn!(destination = %self.resolved, error = %e, "Consumer failed, reopening");
                failures += 1;
                pause(&ctx, backoff.delay(failures - 1)).await;
            }
        }

        if let Some(consumer) = pending {
            consumer.close().await;
        }
        debug!(destination = %self.resolved, "Consumer loop ended");
        Ok(())
    }

    /// Receive until cancelled (`Ok`) or until the consumer fails.
    async fn receive(&self, ctx: &JobContext, consumer: &OpenConsumer) -> Result<(), TransportError> {
        loop {
            let permit = match &self.capacity {
                Some(capacity) => tokio::select! {
                    biased;
                    _ = ctx.cancelled() => return Ok(()),
                    permit = Arc::clone(capacity).acquire_owned() => permit.ok(),
                },
                None => None,
            };
            let received = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Ok(()),
                received = consumer.consumer.receive(self.mom.receive_timeout) => received,
            };
            match received {
                Ok(None) => self.subscription.stats.record_receive(false),
                Ok(Some(message)) => {
                    self.subscription.stats.record_receive(true);
                    self.dispatch(ctx, consumer, message, permit).await;
                }
                Err(e) => {
                    self.subscription.stats.record_error();
                    return Err(e);
                }
            }
        }
    }

    async fn dispatch(
        &self,
        ctx: &JobContext,
        consumer: &OpenConsumer,
        message: TransportMessage,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let message = Arc::new(message);
        let destination = &self.subscription.destination;
        self.mom.message_handler.handle_incoming(&self.resolved, &message);
        self.mom.metrics.message_received(self.resolved.name());

        let transacted = self.subscription.mode == AcknowledgementMode::Transacted;
        let run_context = match &message.correlation_id {
            Some(correlation_id) => self.input.run_context.clone().with_correlation_id(correlation_id),
            None => self.input.run_context.clone().without_correlation_id(),
        };
        let run_context = if transacted {
            run_context.with_transaction_scope(TransactionScope::RequiresNew)
        } else {
            run_context
        };

        let codec = self.mom.codec(destination);
        let (prepare, is_request) = match &self.listener {
            Listener::Publish(prepare) => (prepare, false),
            Listener::Request(prepare) => (prepare, true),
        };
        let (run_context, job) = match prepare(&codec, destination, &message, run_context) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(destination = %self.resolved, message_id = %message.id, error = %e, "Could not read message");
                self.mom.metrics.message_failed(self.resolved.name(), e.category().as_ref());
                if transacted {
                    // unreadable messages are discarded, not redelivered
                    if let Err(e) = consumer.session.commit().await {
                        warn!(destination = %self.resolved, error = %e, "Could not discard unreadable message");
                    }
                }
                if is_request {
                    if let Err(e) = send_reply(&self.mom, &message, failure_reply(&codec, &e)).await {
                        warn!(destination = %self.resolved, error = %e, "Could not send failure reply");
                    }
                }
                return;
            }
        };

        let mut job_input = self
            .mom
            .job_input(format!("mom.{} {}", self.listener.kind(), self.resolved))
            .with_run_context(run_context);
        if is_request {
            if let Some(correlation_id) = &message.correlation_id {
                job_input = job_input.with_execution_hint(correlation_id.clone());
            }
        }

        let handled = HandledMessage {
            mom: Arc::clone(&self.mom),
            message: Arc::clone(&message),
            destination: self.resolved.clone(),
            member: transacted.then(|| {
                (
                    format!("mom.consumer.{}", self.subscription.id),
                    Arc::clone(&consumer.session),
                )
            }),
            _permit: permit,
        };
        let future = self
            .mom
            .manager
            .schedule(move |ctx| handled.run(ctx, job), job_input);

        if self.subscription.mode != AcknowledgementMode::Auto {
            // one message at a time: the next receive waits for this handler
            if let Err(e) = ctx.await_job(&future).await {
                debug!(destination = %self.resolved, error = %e, "Handler job ended without success");
            }
        }
    }
}

/// What a handler job needs besides its body.
struct HandledMessage {
    mom: Arc<MomInner>,
    message: Arc<TransportMessage>,
    destination: DestinationRef,
    /// Member id and session of a transacted consumer
    member: Option<(String, Arc<dyn BrokerSession>)>,
    /// Returned to the subscription when the handler job ends
    _permit: Option<OwnedSemaphorePermit>,
}

impl HandledMessage {
    async fn run(self, ctx: JobContext, job: HandlerJob) -> Result<(), JobError> {
        if let Some((member_id, session)) = self.member {
            let transaction = ctx
                .run_context()
                .transaction()
                .cloned()
                .ok_or_else(|| JobError::Transaction("transacted handler without transaction".to_string()))?;
            transaction
                .register_member_if_absent(&member_id, || SessionMember::new(member_id.clone(), session, false))?
                .mark_used();
        }

        match job(ctx.clone()).await {
            Ok(Some(_)) if ctx.is_cancelled() => {
                debug!(
                    correlation_id = self.message.correlation_id.as_deref(),
                    "Request cancelled, reply suppressed"
                );
                Ok(())
            }
            Ok(Some(reply)) => Ok(send_reply(&self.mom, &self.message, reply).await?),
            Ok(None) => Ok(()),
            Err(e) => {
                self.mom
                    .metrics
                    .message_failed(self.destination.name(), e.category().as_ref());
                error!(destination = %self.destination, error = %e, "Message handler failed");
                Err(e.into())
            }
        }
    }
}

async fn pause(ctx: &JobContext, delay: Duration) {
    tokio::select! {
        _ = ctx.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

async fn send_reply(mom: &MomInner, request: &TransportMessage, mut reply: TransportMessage) -> Result<(), MomError> {
    let Some(reply_to) = request.reply_to.clone() else {
        warn!(message_id = %request.id, "Request has no reply destination, reply dropped");
        return Ok(());
    };
    reply.correlation_id = request.correlation_id.clone();
    mom.send(&reply_to, reply).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshaller::{JsonMarshaller, TextMarshaller};

    #[test]
    fn test_failure_reply_hides_message_from_text_marshaller() {
        let codec = Codec::new(Arc::new(TextMarshaller), None);
        let reply = failure_reply(&codec, &MomError::processing("secret internals"));

        assert_eq!(reply.body, WireBody::Empty);
        assert_eq!(reply.property(PROP_REPLY_SUCCESS), Some(&serde_json::Value::Bool(false)));
    }

    #[test]
    fn test_failure_reply_carries_sanitized_error() {
        let codec = Codec::new(Arc::new(JsonMarshaller), None);
        let reply = failure_reply(&codec, &MomError::processing("bad order\nat frame 3"));

        let remote: RemoteError = codec.decode(&reply).unwrap();
        assert_eq!(remote, RemoteError::new("processing", "bad order"));
    }

    #[test]
    fn test_success_reply() {
        let codec = Codec::new(Arc::new(JsonMarshaller), None);
        let reply = reply_message(&codec, Ok::<_, MomError>(42));

        assert_eq!(reply.property(PROP_REPLY_SUCCESS), Some(&serde_json::Value::Bool(true)));
        assert_eq!(codec.decode::<i32>(&reply).unwrap(), 42);
    }

    #[test]
    fn test_stats_reset_on_reconnect() {
        let stats = SubscriptionStats::default();
        stats.record_receive(true);
        stats.record_receive(false);
        stats.record_error();
        assert_eq!(
            (stats.received_messages(), stats.received_non_null_messages(), stats.received_errors()),
            (2, 1, 1)
        );

        stats.record_reconnect();
        assert_eq!(stats.received_messages(), 0);
        assert_eq!(stats.received_errors(), 0);
        assert_eq!(stats.reconnects(), 1);
    }
}
