//! Request/reply over plain messaging.
//!
//! ```text
//!  requester                         broker                      replier
//!  ─────────                         ──────                      ───────
//!  request() ── request job ──▶ temporary queue + consumer
//!     │                          send(destination, reply_to) ──▶ handler job
//!     │ wait on blocking                                         (hint: reply id)
//!     │ condition                ◀── reply(correlation id) ───── returns
//!     ▼ released when the job got the reply
//!
//!  on timeout or interruption (also when the request future is dropped):
//!     cancel request job, publish notice(reply id) on the cancellation
//!     topic ──▶ every MOM interrupts its handler jobs hinted with the id
//! ```
//!
//! Each request gets a fresh correlation id, the reply id. It is the
//! correlation id the replier's handler runs with; the requester's own
//! correlation id travels in a separate property.

use crate::codec::Codec;
use crate::destination::{Destination, DestinationRef};
use crate::error::{MomError, RemoteError};
use crate::message::{Message, PublishInput, SubscribeInput, PROP_CALLER_CORRELATION_ID, PROP_REPLY_SUCCESS};
use crate::mom::MomInner;
use crate::subscription::{self, HandlerJob, Listener, Subscription};
use crate::sync::lock;
use crate::transport::{BrokerSession, TransportMessage};
use futures::future::BoxFuture;
use jobs::{JobContext, JobError, JobFilter, JobHandle, RunContext};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Topic cancellation notices are published on unless configured otherwise.
pub const DEFAULT_CANCELLATION_TOPIC: &str = "mom.requestreply.cancellation";

/// Prefix of the correlation ids generated for requests.
pub const REPLY_ID_PREFIX: &str = "mom.requestreply.uid-";

type ReplySlot = Arc<Mutex<Option<Result<TransportMessage, MomError>>>>;

pub(crate) async fn request<Req, Rep>(
    mom: &Arc<MomInner>,
    destination: &DestinationRef,
    payload: &Req,
    input: PublishInput,
) -> Result<Rep, MomError>
where
    Req: Serialize,
    Rep: DeserializeOwned,
{
    mom.ensure_alive()?;
    let cancellation_topic = mom.cancellation_topic.clone().ok_or(MomError::RequestReplyDisabled)?;
    if input.transactional {
        return Err(MomError::config("request-reply cannot be transactional"));
    }

    let resolved = mom.resolve(destination)?;
    let codec = mom.codec(destination);
    let reply_id = format!("{REPLY_ID_PREFIX}{}", Uuid::new_v4());
    let mut message = mom.outgoing(&codec, payload, &input)?;
    message.correlation_id = Some(reply_id.clone());
    if let Some(caller) = input.run_context.correlation_id() {
        message
            .properties
            .insert(PROP_CALLER_CORRELATION_ID.to_string(), Value::from(caller));
    }

    let released = mom.manager.new_blocking_condition(reply_id.clone(), true);
    let slot: ReplySlot = Arc::new(Mutex::new(None));
    let exchange = Exchange {
        mom: Arc::clone(mom),
        destination: resolved.clone(),
        reply_id: reply_id.clone(),
        slot: Arc::clone(&slot),
    };
    let job = mom.manager.schedule(
        move |ctx| exchange.run(ctx, message),
        mom.job_input(format!("mom.request {resolved}")),
    );
    {
        let released = released.clone();
        job.when_done(move |_| released.set_blocking(false));
    }
    let mut pending = PendingRequest {
        mom: Arc::clone(mom),
        topic: cancellation_topic,
        reply_id: reply_id.clone(),
        job: job.handle().clone(),
        armed: true,
    };

    let started = Instant::now();
    let waited = match &input.job_context {
        Some(ctx) => {
            released
                .wait_for_with_hints(ctx, input.request_reply_timeout, [reply_id.clone()])
                .await
        }
        None => released.wait(input.request_reply_timeout).await,
    };
    if let Err(e) = waited {
        debug!(destination = %resolved, reply_id = %reply_id, error = %e, "Request abandoned, cancelling");
        if e.is_timeout() {
            mom.metrics.request_timed_out();
        }
        pending.abandon();
        job.await_done().await;
        return Err(e.into());
    }
    pending.armed = false;

    let reply = lock(&slot)
        .take()
        .unwrap_or_else(|| Err(MomError::Interrupted(format!("request {reply_id} was cancelled"))))?;
    mom.metrics.request_completed(started.elapsed());
    read_reply(&codec, &reply)
}

/// Turn a reply into the handler's result or its failure.
fn read_reply<Rep: DeserializeOwned>(codec: &Codec, reply: &TransportMessage) -> Result<Rep, MomError> {
    match reply.property(PROP_REPLY_SUCCESS) {
        Some(Value::Bool(false)) if codec.marshaller().preserves_types() && !reply.body.is_empty() => {
            Err(MomError::Remote(codec.decode::<RemoteError>(reply)?))
        }
        Some(Value::Bool(false)) => Err(MomError::processing("remote request failed")),
        _ => codec.decode(reply),
    }
}

/// A request still waiting for its reply.
///
/// Abandoned when the wait fails, or when the request future is dropped
/// before it completes.
struct PendingRequest {
    mom: Arc<MomInner>,
    topic: DestinationRef,
    reply_id: String,
    job: JobHandle,
    armed: bool,
}

impl PendingRequest {
    /// Stop the request job and tell repliers to give up. Runs once.
    fn abandon(&mut self) {
        if !std::mem::replace(&mut self.armed, false) {
            return;
        }
        self.job.cancel(true);

        // a dropped request may outlive the runtime it was polled on
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(reply_id = %self.reply_id, "No runtime left, cancellation notice not published");
            return;
        }
        let notifier = Arc::clone(&self.mom);
        let notice_topic = self.topic.clone();
        let notice_id = self.reply_id.clone();
        self.mom.manager.schedule(
            move |_ctx| async move {
                publish_cancellation(&notifier, &notice_topic, &notice_id)
                    .await
                    .map_err(JobError::from)
            },
            self.mom.job_input(format!("mom.request.cancel {}", self.reply_id)),
        );
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if self.armed {
            debug!(reply_id = %self.reply_id, "Request dropped before its reply, cancelling");
            self.abandon();
        }
    }
}

async fn publish_cancellation(mom: &MomInner, topic: &DestinationRef, reply_id: &str) -> Result<(), MomError> {
    let resolved = mom.resolve(topic)?;
    let mut notice = mom.codec(topic).encode(&())?;
    notice.correlation_id = Some(reply_id.to_string());
    mom.send(&resolved, notice).await?;
    debug!(reply_id, topic = %resolved, "Cancellation notice published");
    Ok(())
}

/// Listen for cancellation notices and interrupt the handler jobs they name.
pub(crate) async fn subscribe_cancellation(
    mom: &Arc<MomInner>,
    topic: &DestinationRef,
) -> Result<Subscription, MomError> {
    let manager = mom.manager.clone();
    let destination: Destination<()> = topic.clone().into();

    let prepare = Box::new(
        move |codec: &Codec,
              destination: &DestinationRef,
              message: &Arc<TransportMessage>,
              run_context: RunContext|
              -> Result<(RunContext, HandlerJob), MomError> {
            codec.decode::<()>(message)?;
            let notice = Message::new((), destination.clone(), message);
            let manager = manager.clone();
            let job: HandlerJob = Box::new(
                move |_ctx: JobContext| -> BoxFuture<'static, Result<Option<TransportMessage>, MomError>> {
                    Box::pin(async move {
                        if let Some(reply_id) = notice.correlation_id() {
                            if manager.cancel(&JobFilter::hint(reply_id), true) {
                                info!(reply_id, "Request handler interrupted by cancellation notice");
                            }
                        }
                        Ok(None)
                    })
                },
            );
            Ok((run_context, job))
        },
    );

    subscription::start(
        mom,
        destination.destination_ref().clone(),
        Listener::Publish(prepare),
        SubscribeInput::new(),
    )
    .await
}

/// The request job: sends the request and waits for its reply.
struct Exchange {
    mom: Arc<MomInner>,
    destination: DestinationRef,
    reply_id: String,
    slot: ReplySlot,
}

impl Exchange {
    async fn run(self, ctx: JobContext, message: TransportMessage) -> Result<(), JobError> {
        let outcome = match self.mom.connection.create_session(false).await {
            Ok((_, session)) => {
                let outcome = self.round_trip(&ctx, session.as_ref(), message).await;
                session.close().await;
                outcome
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = &outcome {
            if !e.is_interruption() {
                warn!(destination = %self.destination, reply_id = %self.reply_id, error = %e, "Request failed");
            }
        }
        *lock(&self.slot) = Some(outcome);
        Ok(())
    }

    async fn round_trip(
        &self,
        ctx: &JobContext,
        session: &dyn BrokerSession,
        mut message: TransportMessage,
    ) -> Result<TransportMessage, MomError> {
        let reply_to = session.create_temporary_queue().await?;
        let consumer = session.create_consumer(&reply_to, None, None).await?;
        message.reply_to = Some(reply_to);

        self.mom.message_handler.handle_outgoing(&self.destination, &message);
        session.send(&self.destination, message).await?;
        self.mom.metrics.message_published(self.destination.name());

        loop {
            let received = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    return Err(MomError::Interrupted(format!("request {} was cancelled", self.reply_id)));
                }
                received = consumer.receive(self.mom.receive_timeout) => received?,
            };
            match received {
                Some(reply) if reply.correlation_id.as_deref() == Some(self.reply_id.as_str()) => {
                    self.mom.message_handler.handle_incoming(&self.destination, &reply);
                    return Ok(reply);
                }
                Some(other) => {
                    debug!(reply_id = %self.reply_id, other = other.correlation_id.as_deref(), "Ignoring unrelated reply");
                }
                None => {}
            }
        }
    }
}
