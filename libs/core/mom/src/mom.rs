//! The MOM implementor: publish/subscribe and request/reply over one broker
//! connection, with handlers running as jobs.

use crate::codec::Codec;
use crate::config::RetryPolicy;
use crate::connection::ConnectionWrapper;
use crate::destination::{BiDestination, Destination, DestinationRef, DestinationType, ResolveMethod};
use crate::encrypter::Encrypter;
use crate::environment::{self, EnvValue, MomEnvironment, NamingContext};
use crate::error::MomError;
use crate::handler::{LogMessageHandler, MessageHandler};
use crate::marshaller::{marshaller_by_name, Marshaller, ObjectMarshaller};
use crate::message::{is_reserved_property, Message, PublishInput, SubscribeInput};
use crate::metrics::MomMetrics;
use crate::registry::{Registration, Registry};
use crate::request_reply::{self, DEFAULT_CANCELLATION_TOPIC};
use crate::subscription::{self, reply_message, HandlerJob, Listener, Subscription};
use crate::sync::lock;
use crate::transaction::{publish_member_id, SessionMember};
use crate::transport::{ConnectionFactory, Credentials, TransportMessage};
use futures::future::BoxFuture;
use jobs::{JobContext, JobFilter, JobInput, JobManager, RunContext};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long one receive call of a consumer waits for a message.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `destroy` waits for the jobs of the MOM to finish.
const DESTROY_TIMEOUT: Duration = Duration::from_secs(10);

/// Message-oriented middleware on top of a broker transport.
///
/// Cloning yields another handle to the same instance. Message handlers run
/// as jobs on the [`JobManager`] given to [`Mom::init`]; every job carries
/// the instance's [`uid`](Mom::uid) as execution hint.
///
/// ```rust,ignore
/// let broker = MemoryBroker::new();
/// let mom = Mom::init(
///     MomEnvironment::new().with_connection_factory(Arc::new(broker)),
///     JobManager::new("app"),
/// )
/// .await?;
///
/// let orders = mom.new_destination::<Order>("orders", DestinationType::Queue, ResolveMethod::Define)?;
/// let subscription = mom
///     .subscribe(&orders, |message, _ctx| async move {
///         info!(order = ?message.transfer_object(), "Order received");
///         Ok(())
///     }, SubscribeInput::new())
///     .await?;
/// mom.publish(&orders, &order, PublishInput::new()).await?;
/// ```
#[derive(Clone)]
pub struct Mom {
    inner: Arc<MomInner>,
}

pub(crate) struct MomInner {
    uid: String,
    name: String,
    pub(crate) manager: JobManager,
    pub(crate) connection: ConnectionWrapper,
    pub(crate) message_handler: Arc<dyn MessageHandler>,
    pub(crate) metrics: MomMetrics,
    pub(crate) receive_timeout: Duration,
    /// Set if request-reply is enabled
    pub(crate) cancellation_topic: Option<DestinationRef>,
    default_marshaller: Arc<dyn Marshaller>,
    marshallers: Registry<dyn Marshaller>,
    encrypters: Registry<dyn Encrypter>,
    environment: MomEnvironment,
    naming: NamingContext,
    resolved: Mutex<HashMap<DestinationRef, DestinationRef>>,
    subscriptions: Mutex<Vec<Subscription>>,
    cancellation: Mutex<Option<Subscription>>,
    destroyed: AtomicBool,
}

impl Mom {
    /// Configure from `environment` and connect.
    pub async fn init(environment: MomEnvironment, manager: JobManager) -> Result<Self, MomError> {
        let uid = Uuid::new_v4().to_string();
        let name = environment
            .get_str(environment::SYMBOLIC_NAME)?
            .unwrap_or("mom")
            .to_string();
        let naming = environment.naming().clone();

        let factory = connection_factory(&environment, &naming)?;
        let default_marshaller = default_marshaller(&environment)?;
        let message_handler: Arc<dyn MessageHandler> = match environment.get(environment::MESSAGE_HANDLER) {
            None => Arc::new(LogMessageHandler),
            Some(EnvValue::MessageHandler(handler)) => Arc::clone(handler),
            Some(other) => {
                return Err(MomError::config(format!(
                    "'{}' must be a message handler, got {other:?}",
                    environment::MESSAGE_HANDLER
                )))
            }
        };

        let client_id = match environment.get_str(environment::CLIENT_ID)? {
            Some(client_id) => client_id.to_string(),
            None => format!("{name} ({uid})"),
        };
        let credentials = environment
            .get_str(environment::SECURITY_PRINCIPAL)?
            .map(|user| -> Result<Credentials, MomError> {
                Ok(Credentials {
                    user: user.to_string(),
                    password: environment
                        .get_str(environment::SECURITY_CREDENTIALS)?
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .transpose()?;

        let policy = retry_policy(&environment)?;
        let receive_timeout = environment
            .parse::<u64>(environment::RECEIVE_TIMEOUT_MILLIS)?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RECEIVE_TIMEOUT);
        let cancellation_topic = match environment.parse_bool(environment::REQUEST_REPLY_ENABLED)? {
            Some(false) => None,
            _ => Some(cancellation_topic(&environment)?),
        };

        let metrics = MomMetrics::new(&name);
        let connection = ConnectionWrapper::new(factory, client_id, credentials, policy, metrics.clone());
        connection.connection().await?;

        let inner = Arc::new(MomInner {
            uid,
            name,
            manager,
            connection,
            message_handler,
            metrics,
            receive_timeout,
            cancellation_topic: cancellation_topic.clone(),
            default_marshaller,
            marshallers: Registry::new(),
            encrypters: Registry::new(),
            environment,
            naming,
            resolved: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            cancellation: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });

        if let Some(topic) = &cancellation_topic {
            let subscription = request_reply::subscribe_cancellation(&inner, topic).await?;
            *lock(&inner.cancellation) = Some(subscription);
        }

        info!(
            mom = %inner.name,
            uid = %inner.uid,
            client_id = inner.connection.client_id(),
            marshaller = inner.default_marshaller.name(),
            request_reply = cancellation_topic.is_some(),
            "MOM initialized"
        );
        Ok(Self { inner })
    }

    pub fn uid(&self) -> &str {
        &self.inner.uid
    }

    pub fn symbolic_name(&self) -> &str {
        &self.inner.name
    }

    pub fn client_id(&self) -> &str {
        self.inner.connection.client_id()
    }

    pub fn job_manager(&self) -> &JobManager {
        &self.inner.manager
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn is_request_reply_enabled(&self) -> bool {
        self.inner.cancellation_topic.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Environment handed to the naming layer: no MOM keys, no blank values.
    pub fn context_environment(&self) -> BTreeMap<String, String> {
        self.inner.environment.context_environment()
    }

    /// A typed destination. JNDI destinations are looked up right away.
    pub fn new_destination<T>(
        &self,
        name: impl Into<String>,
        kind: DestinationType,
        resolve: ResolveMethod,
    ) -> Result<Destination<T>, MomError> {
        let destination = DestinationRef::new(name, kind, resolve);
        self.inner.resolve(&destination)?;
        Ok(destination.into())
    }

    /// A typed request/reply destination.
    pub fn new_bi_destination<Req, Rep>(
        &self,
        name: impl Into<String>,
        kind: DestinationType,
        resolve: ResolveMethod,
    ) -> Result<BiDestination<Req, Rep>, MomError> {
        let destination = DestinationRef::new(name, kind, resolve);
        self.inner.resolve(&destination)?;
        Ok(destination.into())
    }

    /// Use `marshaller` for `destination` until the registration is disposed.
    pub fn register_marshaller(&self, destination: &DestinationRef, marshaller: Arc<dyn Marshaller>) -> Registration {
        debug!(destination = %destination, marshaller = marshaller.name(), "Marshaller registered");
        self.inner.marshallers.register(destination, marshaller)
    }

    /// Encrypt messages of `destination` until the registration is disposed.
    pub fn register_encrypter(&self, destination: &DestinationRef, encrypter: Arc<dyn Encrypter>) -> Registration {
        debug!(destination = %destination, "Encrypter registered");
        self.inner.encrypters.register(destination, encrypter)
    }

    /// Send `payload` to `destination`.
    ///
    /// With `transactional`, the message is staged in the transaction of the
    /// input's run context and sent when that transaction commits.
    pub async fn publish<T: Serialize>(
        &self,
        destination: &Destination<T>,
        payload: &T,
        input: PublishInput,
    ) -> Result<(), MomError> {
        self.inner.ensure_alive()?;
        let resolved = self.inner.resolve(destination)?;
        let codec = self.inner.codec(destination);
        let message = self.inner.outgoing(&codec, payload, &input)?;

        if !input.transactional {
            return self.inner.send(&resolved, message).await;
        }

        let transaction = input
            .run_context
            .transaction()
            .filter(|transaction| transaction.is_active())
            .ok_or_else(|| MomError::config("transactional publish needs an active transaction in the run context"))?;
        let member_id = publish_member_id(&self.inner.uid);
        let member = match transaction.member_as::<SessionMember>(&member_id) {
            Some(member) => member,
            None => {
                let (_, session) = self.inner.connection.create_session(true).await?;
                let staged = Arc::clone(&session);
                let member = transaction
                    .register_member_if_absent(&member_id, || SessionMember::new(member_id.clone(), staged, true))?;
                if !Arc::ptr_eq(member.session(), &session) {
                    session.close().await;
                }
                member
            }
        };

        self.inner.message_handler.handle_outgoing(&resolved, &message);
        member.session().send(&resolved, message).await?;
        member.mark_used();
        self.inner.metrics.message_published(resolved.name());
        debug!(destination = %resolved, transaction = %transaction.id(), "Message staged in transaction");
        Ok(())
    }

    /// Receive the messages of `destination` with `handler`.
    ///
    /// The handler runs as a job per message. Its run context carries the
    /// message's correlation id and the message itself (see
    /// [`Message::current`]). A failing handler is logged; the subscription
    /// keeps receiving.
    pub async fn subscribe<T, F, Fut>(
        &self,
        destination: &Destination<T>,
        handler: F,
        input: SubscribeInput,
    ) -> Result<Subscription, MomError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(Message<T>, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MomError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let prepare = Box::new(
            move |codec: &Codec,
                  destination: &DestinationRef,
                  message: &Arc<TransportMessage>,
                  run_context: RunContext|
                  -> Result<(RunContext, HandlerJob), MomError> {
                let message = Message::new(codec.decode::<T>(message)?, destination.clone(), message);
                let run_context = run_context.with_extension(message.clone());
                let handler = Arc::clone(&handler);
                let job: HandlerJob = Box::new(
                    move |ctx: JobContext| -> BoxFuture<'static, Result<Option<TransportMessage>, MomError>> {
                        Box::pin(async move { handler(message, ctx).await.map(|()| None) })
                    },
                );
                Ok((run_context, job))
            },
        );

        let subscription = subscription::start(
            &self.inner,
            destination.destination_ref().clone(),
            Listener::Publish(prepare),
            input,
        )
        .await?;
        self.inner.add_subscription(subscription.clone());
        Ok(subscription)
    }

    /// Send `payload` and wait for the reply.
    ///
    /// Waits at most `request_reply_timeout` if set. When the wait ends
    /// without reply, through timeout or interruption of the input's job, the
    /// repliers are told to cancel their handlers. Dropping the returned
    /// future before it completes does the same.
    ///
    /// Cancelling the caller's job only interrupts the wait if that job was
    /// passed with [`PublishInput::with_job_context`]. Without it the request
    /// waits for the reply or the timeout regardless of the caller's job.
    pub async fn request<Req, Rep>(
        &self,
        destination: &BiDestination<Req, Rep>,
        payload: &Req,
        input: PublishInput,
    ) -> Result<Rep, MomError>
    where
        Req: Serialize,
        Rep: DeserializeOwned,
    {
        request_reply::request(&self.inner, destination, payload, input).await
    }

    /// Answer the requests sent to `destination` with `handler`.
    ///
    /// A failing handler is answered with a failure reply holding only the
    /// error kind and first message line, and only if the marshaller keeps
    /// structured values; with text and bytes marshallers the requester gets
    /// a generic error.
    pub async fn reply<Req, Rep, F, Fut>(
        &self,
        destination: &BiDestination<Req, Rep>,
        handler: F,
        input: SubscribeInput,
    ) -> Result<Subscription, MomError>
    where
        Req: DeserializeOwned + Send + Sync + 'static,
        Rep: Serialize + Send + 'static,
        F: Fn(Message<Req>, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rep, MomError>> + Send + 'static,
    {
        if !self.is_request_reply_enabled() {
            return Err(MomError::RequestReplyDisabled);
        }

        let handler = Arc::new(handler);
        let prepare = Box::new(
            move |codec: &Codec,
                  destination: &DestinationRef,
                  message: &Arc<TransportMessage>,
                  run_context: RunContext|
                  -> Result<(RunContext, HandlerJob), MomError> {
                let message = Message::new(codec.decode::<Req>(message)?, destination.clone(), message);
                let run_context = run_context.with_extension(message.clone());
                let handler = Arc::clone(&handler);
                let codec = codec.clone();
                let job: HandlerJob = Box::new(
                    move |ctx: JobContext| -> BoxFuture<'static, Result<Option<TransportMessage>, MomError>> {
                        Box::pin(async move {
                            let outcome = handler(message, ctx).await;
                            if let Err(e) = &outcome {
                                warn!(error = %e, "Request handler failed");
                            }
                            Ok(Some(reply_message(&codec, outcome)))
                        })
                    },
                );
                Ok((run_context, job))
            },
        );

        let subscription = subscription::start(
            &self.inner,
            destination.destination_ref().clone(),
            Listener::Request(prepare),
            input,
        )
        .await?;
        self.inner.add_subscription(subscription.clone());
        Ok(subscription)
    }

    /// Discard the durable subscription `name` and its backlog. Active
    /// subscriptions under that name are disposed first.
    pub async fn cancel_durable_subscription(&self, name: &str) -> Result<(), MomError> {
        self.inner.ensure_alive()?;
        let active: Vec<Subscription> = self
            .get_subscriptions()
            .into_iter()
            .filter(|subscription| subscription.durable_subscription_name() == Some(name))
            .collect();
        for subscription in active {
            subscription.dispose().await;
        }

        let (_, session) = self.inner.connection.create_session(false).await?;
        let outcome = session.unsubscribe(name).await;
        session.close().await;
        outcome?;
        info!(durable = name, "Durable subscription cancelled");
        Ok(())
    }

    /// Active subscriptions, without the internal cancellation listener.
    pub fn get_subscriptions(&self) -> Vec<Subscription> {
        lock(&self.inner.subscriptions).clone()
    }

    /// Dispose all subscriptions, cancel the remaining jobs of this MOM and
    /// disconnect. Idempotent; afterwards every operation fails.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(mom = %self.inner.name, uid = %self.inner.uid, "Destroying MOM");

        let subscriptions = std::mem::take(&mut *lock(&self.inner.subscriptions));
        let cancellation = lock(&self.inner.cancellation).take();
        for subscription in subscriptions.iter().chain(cancellation.iter()) {
            subscription.dispose().await;
        }
        self.inner.metrics.active_subscriptions(0);

        let filter = JobFilter::hint(self.inner.uid.clone());
        self.inner.manager.cancel(&filter, false);
        self.inner.connection.close().await;
        if let Err(e) = self.inner.manager.await_done(&filter, Some(DESTROY_TIMEOUT)).await {
            warn!(mom = %self.inner.name, error = %e, "Jobs still running after destroy");
        }

        self.inner.marshallers.clear();
        self.inner.encrypters.clear();
        lock(&self.inner.resolved).clear();
        info!(mom = %self.inner.name, "MOM destroyed");
    }
}

impl fmt::Debug for Mom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mom")
            .field("name", &self.inner.name)
            .field("uid", &self.inner.uid)
            .field("connected", &self.is_connected())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl MomInner {
    pub(crate) fn ensure_alive(&self) -> Result<(), MomError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(MomError::config(format!("MOM '{}' has been destroyed", self.name)));
        }
        Ok(())
    }

    /// Job input tagged with this MOM's uid.
    pub(crate) fn job_input(&self, name: impl Into<String>) -> JobInput {
        JobInput::new(name).with_execution_hint(self.uid.clone())
    }

    /// Broker destination of a client reference.
    pub(crate) fn resolve(&self, destination: &DestinationRef) -> Result<DestinationRef, MomError> {
        if destination.name().trim().is_empty() {
            return Err(MomError::config("destination name must not be empty"));
        }
        if destination.resolve_method() == ResolveMethod::Define {
            return Ok(destination.clone());
        }
        if let Some(resolved) = lock(&self.resolved).get(destination) {
            return Ok(resolved.clone());
        }

        let resolved = match self.naming.lookup(destination.name())? {
            EnvValue::Destination(bound) if bound.kind() != destination.kind() => {
                return Err(MomError::config(format!(
                    "'{}' is bound to a {}, expected a {}",
                    destination.name(),
                    bound.kind(),
                    destination.kind()
                )))
            }
            EnvValue::Destination(bound) if bound.resolve_method() == ResolveMethod::Define => bound,
            EnvValue::Destination(bound) => {
                return Err(MomError::config(format!(
                    "'{}' is bound to another naming reference '{bound}'",
                    destination.name()
                )))
            }
            EnvValue::String(name) => DestinationRef::new(name, destination.kind(), ResolveMethod::Define),
            other => {
                return Err(MomError::config(format!(
                    "'{}' is not bound to a destination, got {other:?}",
                    destination.name()
                )))
            }
        };
        debug!(name = destination.name(), resolved = %resolved, "Destination resolved");
        lock(&self.resolved).insert(destination.clone(), resolved.clone());
        Ok(resolved)
    }

    /// Marshaller and encrypter currently registered for `destination`.
    pub(crate) fn codec(&self, destination: &DestinationRef) -> Codec {
        let marshaller = self
            .marshallers
            .resolve(destination)
            .unwrap_or_else(|| Arc::clone(&self.default_marshaller));
        Codec::new(marshaller, self.encrypters.resolve(destination))
    }

    /// Encode `payload` and apply the publish options.
    pub(crate) fn outgoing<T: Serialize>(
        &self,
        codec: &Codec,
        payload: &T,
        input: &PublishInput,
    ) -> Result<TransportMessage, MomError> {
        let mut message = codec.encode(payload)?;
        for (name, value) in &input.properties {
            if is_reserved_property(name) {
                return Err(MomError::config(format!("property '{name}' is reserved")));
            }
            message.properties.insert(name.clone(), Value::clone(value));
        }
        if let Some(ttl) = input.time_to_live {
            message = message.with_time_to_live(ttl);
        }
        if let Some(priority) = input.priority {
            message.priority = priority;
        }
        message.correlation_id = input.run_context.correlation_id().map(str::to_string);
        message.reply_to = input
            .reply_to
            .as_ref()
            .map(|reply_to| self.resolve(reply_to))
            .transpose()?;
        Ok(message)
    }

    /// Send to a resolved destination on the shared connection.
    pub(crate) async fn send(&self, destination: &DestinationRef, message: TransportMessage) -> Result<(), MomError> {
        self.message_handler.handle_outgoing(destination, &message);
        self.connection.send(destination, message).await?;
        self.metrics.message_published(destination.name());
        Ok(())
    }

    fn add_subscription(&self, subscription: Subscription) {
        let mut subscriptions = lock(&self.subscriptions);
        subscriptions.push(subscription);
        self.metrics.active_subscriptions(subscriptions.len());
    }

    pub(crate) fn remove_subscription(&self, id: Uuid) {
        let mut subscriptions = lock(&self.subscriptions);
        subscriptions.retain(|subscription| subscription.id() != id);
        self.metrics.active_subscriptions(subscriptions.len());
    }
}

fn connection_factory(environment: &MomEnvironment, naming: &NamingContext) -> Result<Arc<dyn ConnectionFactory>, MomError> {
    let bound = match environment.get(environment::CONNECTION_FACTORY) {
        Some(EnvValue::ConnectionFactory(factory)) => return Ok(Arc::clone(factory)),
        Some(EnvValue::String(name)) if !name.trim().is_empty() => naming.lookup(name.trim())?,
        Some(EnvValue::String(_)) | None => {
            return Err(MomError::config(format!(
                "no connection factory configured ('{}')",
                environment::CONNECTION_FACTORY
            )))
        }
        Some(other) => other.clone(),
    };
    match bound {
        EnvValue::ConnectionFactory(factory) => Ok(factory),
        other => Err(MomError::config(format!(
            "'{}' must be a connection factory, got {other:?}",
            environment::CONNECTION_FACTORY
        ))),
    }
}

fn default_marshaller(environment: &MomEnvironment) -> Result<Arc<dyn Marshaller>, MomError> {
    match environment.get(environment::MARSHALLER) {
        Some(EnvValue::Marshaller(marshaller)) => Ok(Arc::clone(marshaller)),
        Some(EnvValue::String(name)) if !name.trim().is_empty() => marshaller_by_name(name),
        Some(EnvValue::String(_)) | None => Ok(Arc::new(ObjectMarshaller)),
        Some(other) => Err(MomError::config(format!(
            "'{}' must be a marshaller, got {other:?}",
            environment::MARSHALLER
        ))),
    }
}

fn retry_policy(environment: &MomEnvironment) -> Result<RetryPolicy, MomError> {
    let mut policy = RetryPolicy::default();
    if let Some(count) = environment.parse::<u32>(environment::CONNECTION_RETRY_COUNT)? {
        policy = policy.with_connection_retry_count(count);
    }
    if let Some(millis) = environment.parse::<u64>(environment::CONNECTION_RETRY_INTERVAL_MILLIS)? {
        policy = policy.with_connection_retry_interval(Duration::from_millis(millis));
    }
    if let Some(millis) = environment.parse::<u64>(environment::SESSION_RETRY_INTERVAL_MILLIS)? {
        policy = policy.with_session_retry_interval(Duration::from_millis(millis));
    }
    Ok(policy)
}

fn cancellation_topic(environment: &MomEnvironment) -> Result<DestinationRef, MomError> {
    match environment.get(environment::REQUEST_REPLY_CANCELLATION_TOPIC) {
        Some(EnvValue::Destination(topic)) => Ok(topic.clone()),
        Some(EnvValue::String(uri)) if !uri.trim().is_empty() => DestinationRef::parse(uri.trim(), DestinationType::Topic),
        Some(EnvValue::String(_)) | None => Ok(DestinationRef::topic(DEFAULT_CANCELLATION_TOPIC)),
        Some(other) => Err(MomError::config(format!(
            "'{}' must be a destination, got {other:?}",
            environment::REQUEST_REPLY_CANCELLATION_TOPIC
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryBroker;

    fn environment(broker: &MemoryBroker) -> MomEnvironment {
        MomEnvironment::new()
            .with(environment::SYMBOLIC_NAME, "test")
            .with_connection_factory(Arc::new(broker.clone()))
    }

    #[test]
    fn test_cancellation_topic_from_uri() {
        let environment = MomEnvironment::new().with(environment::REQUEST_REPLY_CANCELLATION_TOPIC, "define:///ops.cancel");
        let topic = cancellation_topic(&environment).unwrap();
        assert_eq!(topic, DestinationRef::topic("ops.cancel"));

        assert_eq!(
            cancellation_topic(&MomEnvironment::new()).unwrap(),
            DestinationRef::topic(DEFAULT_CANCELLATION_TOPIC)
        );
    }

    #[test]
    fn test_unknown_marshaller_is_config_error() {
        let environment = MomEnvironment::new().with(environment::MARSHALLER, "yaml");
        assert!(matches!(default_marshaller(&environment), Err(MomError::Config(_))));
    }

    #[test]
    fn test_retry_policy_from_environment() {
        let environment = MomEnvironment::new()
            .with(environment::CONNECTION_RETRY_COUNT, "2")
            .with(environment::CONNECTION_RETRY_INTERVAL_MILLIS, "10");
        let policy = retry_policy(&environment).unwrap();
        assert_eq!(policy.connection_retry_count, 2);
        assert_eq!(policy.connection_retry_interval, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_client_id_defaults_to_name_and_uid() {
        let broker = MemoryBroker::new();
        let mom = Mom::init(environment(&broker), JobManager::new("test")).await.unwrap();

        assert_eq!(mom.client_id(), format!("test ({})", mom.uid()));
        assert!(mom.is_connected());
        mom.destroy().await;
    }

    #[tokio::test]
    async fn test_jndi_resolution() {
        let broker = MemoryBroker::new();
        let naming = NamingContext::new();
        naming.bind("jms/orders", DestinationRef::queue("orders.v1"));
        naming.bind("jms/audit", "audit.v1");
        let mom = Mom::init(environment(&broker).with_naming_context(naming), JobManager::new("test"))
            .await
            .unwrap();

        let orders = DestinationRef::new("jms/orders", DestinationType::Queue, ResolveMethod::Jndi);
        assert_eq!(mom.inner.resolve(&orders).unwrap().name(), "orders.v1");

        let audit = DestinationRef::new("jms/audit", DestinationType::Topic, ResolveMethod::Jndi);
        assert_eq!(mom.inner.resolve(&audit).unwrap(), DestinationRef::topic("audit.v1"));

        let wrong_kind = mom.new_destination::<String>("jms/orders", DestinationType::Topic, ResolveMethod::Jndi);
        assert!(matches!(wrong_kind, Err(MomError::Config(_))));

        let missing = mom.new_destination::<String>("jms/missing", DestinationType::Queue, ResolveMethod::Jndi);
        assert!(matches!(missing, Err(MomError::Config(_))));
        mom.destroy().await;
    }

    #[tokio::test]
    async fn test_connection_factory_from_naming_context() {
        let broker = MemoryBroker::new();
        let naming = NamingContext::new();
        naming.bind("jms/factory", Arc::new(broker.clone()) as Arc<dyn ConnectionFactory>);
        let environment = MomEnvironment::new()
            .with(environment::CONNECTION_FACTORY, "jms/factory")
            .with_naming_context(naming);

        let mom = Mom::init(environment, JobManager::new("test")).await.unwrap();
        assert!(mom.is_connected());
        mom.destroy().await;
    }

    #[tokio::test]
    async fn test_missing_connection_factory() {
        let error = Mom::init(MomEnvironment::new(), JobManager::new("test")).await.unwrap_err();
        assert!(matches!(error, MomError::Config(_)));
    }

    #[tokio::test]
    async fn test_reserved_property_rejected() {
        let broker = MemoryBroker::new();
        let mom = Mom::init(environment(&broker), JobManager::new("test")).await.unwrap();
        let queue = mom
            .new_destination::<String>("q", DestinationType::Queue, ResolveMethod::Define)
            .unwrap();

        let input = PublishInput::new().with_property("x-mom-reply-success", true);
        let error = mom.publish(&queue, &"hi".to_string(), input).await.unwrap_err();
        assert!(matches!(error, MomError::Config(_)));
        mom.destroy().await;
    }
}
