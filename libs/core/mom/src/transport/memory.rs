//! In-process broker.
//!
//! Implements the transport traits over shared in-memory state, with the
//! delivery semantics of a JMS broker:
//!
//! - queues: competing consumers, each message taken by exactly one of them,
//!   consumers with a selector only take matching messages
//! - topics: every attached subscriber gets its own copy, filtered by its
//!   selector when published; nothing published before attaching
//! - durable topic subscriptions keep collecting while detached, until
//!   unsubscribed
//! - expired messages are dropped silently
//! - transacted sessions stage sends until commit and put received messages
//!   back on rollback
//! - temporary queues are deleted when their session closes
//!
//! [`MemoryBroker::set_available`] simulates an outage: existing connections
//! are lost and new ones are refused until the broker is back.

use super::{BrokerConnection, BrokerConsumer, BrokerSession, ConnectionFactory, Credentials, TransportMessage};
use crate::destination::{DestinationRef, DestinationType};
use crate::error::TransportError;
use crate::selector::Selector;
use crate::sync::lock;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Name prefix of temporary queues.
pub const TEMPORARY_QUEUE_PREFIX: &str = "temporary.";

/// What happens to messages sent to a queue nobody ever consumed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueRetention {
    /// Keep them until a consumer arrives.
    #[default]
    Retain,
    /// Drop them.
    RequireConsumer,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBrokerConfig {
    pub queue_retention: QueueRetention,

    /// If set, connections must present these credentials
    pub credentials: Option<Credentials>,
}

impl MemoryBrokerConfig {
    pub fn with_queue_retention(mut self, retention: QueueRetention) -> Self {
        self.queue_retention = retention;
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            user: user.into(),
            password: password.into(),
        });
        self
    }
}

/// Broker living in this process. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

struct BrokerState {
    config: MemoryBrokerConfig,
    available: AtomicBool,
    /// Bumped on every outage; connections of an older epoch are lost
    epoch: AtomicU64,
    destinations: Mutex<Destinations>,
    changed: Notify,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self::new(MemoryBrokerConfig::default())
    }
}

#[derive(Default)]
struct Destinations {
    queues: HashMap<String, Queue>,
    /// Topic name to the inboxes of its subscribers
    topics: HashMap<String, Vec<Uuid>>,
    inboxes: HashMap<Uuid, Inbox>,
    durables: HashMap<String, Durable>,
}

#[derive(Default)]
struct Queue {
    messages: VecDeque<TransportMessage>,
    had_consumer: bool,
    /// Session owning a temporary queue
    owner: Option<Uuid>,
}

struct Inbox {
    selector: Option<Selector>,
    messages: VecDeque<TransportMessage>,
}

struct Durable {
    topic: String,
    inbox: Uuid,
    selector: Option<String>,
    attached: bool,
}

/// Where a received message came from, to put it back on rollback.
#[derive(Debug, Clone)]
enum Source {
    Queue(String),
    Inbox(Uuid),
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MemoryBrokerConfig) -> Self {
        Self {
            state: Arc::new(BrokerState::new(config)),
        }
    }

    pub fn config(&self) -> &MemoryBrokerConfig {
        &self.state.config
    }

    pub fn is_available(&self) -> bool {
        self.state.available.load(Ordering::SeqCst)
    }

    /// Take the broker down or bring it back.
    ///
    /// Going down drops every connection, non-durable subscription and
    /// temporary queue. Queued messages and durable backlogs survive.
    pub fn set_available(&self, available: bool) {
        let was = self.state.available.swap(available, Ordering::SeqCst);
        if was == available {
            return;
        }
        if available {
            info!("Memory broker available");
            return;
        }

        self.state.epoch.fetch_add(1, Ordering::SeqCst);
        {
            let mut destinations = lock(&self.state.destinations);
            let durable_inboxes: Vec<Uuid> = destinations.durables.values().map(|d| d.inbox).collect();
            destinations.inboxes.retain(|id, _| durable_inboxes.contains(id));
            for subscribers in destinations.topics.values_mut() {
                subscribers.retain(|id| durable_inboxes.contains(id));
            }
            for durable in destinations.durables.values_mut() {
                durable.attached = false;
            }
            destinations.queues.retain(|_, queue| queue.owner.is_none());
        }
        info!("Memory broker unavailable, all connections dropped");
        self.state.changed.notify_waiters();
    }

    /// Number of messages waiting in a queue.
    pub fn queue_depth(&self, name: &str) -> usize {
        lock(&self.state.destinations)
            .queues
            .get(name)
            .map_or(0, |queue| queue.messages.len())
    }

    /// Number of messages waiting for a durable subscription.
    pub fn durable_backlog(&self, name: &str) -> Option<usize> {
        let destinations = lock(&self.state.destinations);
        let durable = destinations.durables.get(name)?;
        destinations.inboxes.get(&durable.inbox).map(|inbox| inbox.messages.len())
    }

    /// Number of subscriptions on a topic, durable ones included.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.state.destinations).topics.get(topic).map_or(0, Vec::len)
    }

    /// Whether a queue exists; temporary queues cease to exist with their session.
    pub fn has_queue(&self, name: &str) -> bool {
        lock(&self.state.destinations).queues.contains_key(name)
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("available", &self.is_available())
            .field("epoch", &self.state.epoch.load(Ordering::SeqCst))
            .finish()
    }
}

impl BrokerState {
    fn new(config: MemoryBrokerConfig) -> Self {
        Self {
            config,
            available: AtomicBool::new(true),
            epoch: AtomicU64::new(0),
            destinations: Mutex::new(Destinations::default()),
            changed: Notify::new(),
        }
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn deliver(&self, destination: &DestinationRef, message: TransportMessage) {
        if message.is_expired(Utc::now()) {
            debug!(destination = %destination, message_id = %message.id, "Dropping expired message");
            return;
        }

        {
            let mut destinations = lock(&self.destinations);
            match destination.kind() {
                DestinationType::Queue => {
                    let name = destination.name();
                    if is_temporary(name) && !destinations.queues.contains_key(name) {
                        debug!(destination = %destination, "Dropping message for deleted temporary queue");
                        return;
                    }
                    let queue = destinations.queues.entry(name.to_string()).or_default();
                    if !queue.had_consumer && self.config.queue_retention == QueueRetention::RequireConsumer {
                        debug!(destination = %destination, "Dropping message, queue never had a consumer");
                        return;
                    }
                    let position = queue
                        .messages
                        .iter()
                        .position(|queued| queued.priority < message.priority)
                        .unwrap_or(queue.messages.len());
                    queue.messages.insert(position, message);
                }
                DestinationType::Topic => {
                    let Destinations { topics, inboxes, .. } = &mut *destinations;
                    for id in topics.get(destination.name()).into_iter().flatten() {
                        if let Some(inbox) = inboxes.get_mut(id) {
                            if inbox.selector.as_ref().is_none_or(|s| s.matches(&message.properties)) {
                                inbox.messages.push_back(message.clone());
                            }
                        }
                    }
                }
            }
        }
        self.changed.notify_waiters();
    }

    fn take(&self, source: &Source, selector: Option<&Selector>) -> Option<TransportMessage> {
        let now = Utc::now();
        let mut destinations = lock(&self.destinations);
        let messages = match source {
            Source::Queue(name) => &mut destinations.queues.get_mut(name)?.messages,
            Source::Inbox(id) => &mut destinations.inboxes.get_mut(id)?.messages,
        };
        messages.retain(|message| !message.is_expired(now));
        let position = messages
            .iter()
            .position(|message| selector.is_none_or(|s| s.matches(&message.properties)))?;
        messages.remove(position)
    }

    /// Put a rolled back message back at the head.
    fn requeue(&self, source: &Source, mut message: TransportMessage) {
        message.redelivered = true;
        message.delivery_count += 1;
        let mut destinations = lock(&self.destinations);
        let messages = match source {
            Source::Queue(name) => destinations.queues.get_mut(name).map(|q| &mut q.messages),
            Source::Inbox(id) => destinations.inboxes.get_mut(id).map(|i| &mut i.messages),
        };
        match messages {
            Some(messages) => messages.push_front(message),
            None => debug!(message_id = %message.id, "Dropping rolled back message, its destination is gone"),
        }
    }

    /// Detach a topic subscriber; durable ones keep their inbox.
    fn detach(&self, inbox: Uuid) {
        let mut destinations = lock(&self.destinations);
        if let Some(durable) = destinations.durables.values_mut().find(|d| d.inbox == inbox) {
            durable.attached = false;
            return;
        }
        destinations.inboxes.remove(&inbox);
        for subscribers in destinations.topics.values_mut() {
            subscribers.retain(|id| *id != inbox);
        }
    }

    fn subscribe_topic(&self, topic: &str, selector: Option<&str>, durable_name: Option<&str>) -> Result<Uuid, TransportError> {
        let parsed = selector.map(Selector::parse).transpose()?;
        let mut destinations = lock(&self.destinations);

        let Some(durable_name) = durable_name else {
            let id = Uuid::new_v4();
            destinations.inboxes.insert(
                id,
                Inbox {
                    selector: parsed,
                    messages: VecDeque::new(),
                },
            );
            destinations.topics.entry(topic.to_string()).or_default().push(id);
            return Ok(id);
        };

        if let Some(durable) = destinations.durables.get_mut(durable_name) {
            if durable.attached {
                return Err(TransportError::InvalidDestination(format!(
                    "durable subscription '{durable_name}' is already active"
                )));
            }
            if durable.topic == topic && durable.selector.as_deref() == selector {
                durable.attached = true;
                return Ok(durable.inbox);
            }
        }

        // new durable, or an existing one changing topic or selector: start over
        if let Some(previous) = destinations.durables.remove(durable_name) {
            remove_inbox(&mut destinations, previous.inbox);
        }
        let id = Uuid::new_v4();
        destinations.inboxes.insert(
            id,
            Inbox {
                selector: parsed,
                messages: VecDeque::new(),
            },
        );
        destinations.topics.entry(topic.to_string()).or_default().push(id);
        destinations.durables.insert(
            durable_name.to_string(),
            Durable {
                topic: topic.to_string(),
                inbox: id,
                selector: selector.map(str::to_string),
                attached: true,
            },
        );
        Ok(id)
    }

    fn unsubscribe(&self, durable_name: &str) -> Result<(), TransportError> {
        let mut destinations = lock(&self.destinations);
        match destinations.durables.get(durable_name) {
            None => {
                debug!(durable = durable_name, "No durable subscription to remove");
                Ok(())
            }
            Some(durable) if durable.attached => Err(TransportError::InvalidDestination(format!(
                "durable subscription '{durable_name}' is still active"
            ))),
            Some(durable) => {
                let inbox = durable.inbox;
                destinations.durables.remove(durable_name);
                remove_inbox(&mut destinations, inbox);
                Ok(())
            }
        }
    }
}

fn remove_inbox(destinations: &mut Destinations, inbox: Uuid) {
    destinations.inboxes.remove(&inbox);
    for subscribers in destinations.topics.values_mut() {
        subscribers.retain(|id| *id != inbox);
    }
}

fn is_temporary(name: &str) -> bool {
    name.starts_with(TEMPORARY_QUEUE_PREFIX)
}

#[async_trait]
impl ConnectionFactory for MemoryBroker {
    async fn create_connection(
        &self,
        client_id: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        if !self.is_available() {
            return Err(TransportError::Unavailable("memory broker is down".to_string()));
        }
        if let Some(expected) = &self.state.config.credentials {
            if credentials != Some(expected) {
                return Err(TransportError::Unavailable(format!(
                    "authentication failed for client '{client_id}'"
                )));
            }
        }

        let connection = MemoryConnection {
            state: Arc::new(ConnectionState {
                broker: Arc::clone(&self.state),
                id: Uuid::new_v4(),
                client_id: client_id.to_string(),
                epoch: self.state.epoch(),
                closed: AtomicBool::new(false),
                sessions: Mutex::new(Vec::new()),
            }),
        };
        debug!(client_id, connection = %connection.state.id, "Connection created");
        Ok(Arc::new(connection))
    }
}

struct ConnectionState {
    broker: Arc<BrokerState>,
    id: Uuid,
    client_id: String,
    epoch: u64,
    closed: AtomicBool,
    sessions: Mutex<Vec<Weak<SessionState>>>,
}

impl ConnectionState {
    fn is_lost(&self) -> bool {
        self.broker.epoch() != self.epoch
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if self.is_lost() {
            return Err(TransportError::ConnectionLost(format!(
                "connection {} dropped by the broker",
                self.id
            )));
        }
        Ok(())
    }
}

struct MemoryConnection {
    state: Arc<ConnectionState>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn id(&self) -> Uuid {
        self.state.id
    }

    fn client_id(&self) -> &str {
        &self.state.client_id
    }

    async fn create_session(&self, transacted: bool) -> Result<Arc<dyn BrokerSession>, TransportError> {
        self.state.ensure_open()?;
        let session = Arc::new(SessionState {
            connection: Arc::clone(&self.state),
            id: Uuid::new_v4(),
            transacted,
            closed: AtomicBool::new(false),
            staged: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        });
        lock(&self.state.sessions).push(Arc::downgrade(&session));
        Ok(Arc::new(MemorySession { state: session }))
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst) || self.state.is_lost()
    }

    async fn close(&self) {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let sessions = std::mem::take(&mut *lock(&self.state.sessions));
        for session in sessions.iter().filter_map(Weak::upgrade) {
            session.close();
        }
        debug!(connection = %self.state.id, "Connection closed");
        self.state.broker.changed.notify_waiters();
    }
}

struct SessionState {
    connection: Arc<ConnectionState>,
    id: Uuid,
    transacted: bool,
    closed: AtomicBool,
    staged: Mutex<Vec<(DestinationRef, TransportMessage)>>,
    received: Mutex<Vec<(Source, TransportMessage)>>,
    /// Topic inboxes of consumers created by this session
    subscribers: Mutex<Vec<Uuid>>,
}

impl SessionState {
    fn broker(&self) -> &BrokerState {
        &self.connection.broker
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::SessionClosed);
        }
        self.connection.ensure_open()
    }

    fn rollback(&self) {
        lock(&self.staged).clear();
        let received = std::mem::take(&mut *lock(&self.received));
        for (source, message) in received.into_iter().rev() {
            self.broker().requeue(&source, message);
        }
        self.broker().changed.notify_waiters();
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // a lost connection's state was already discarded by the broker
        if !self.connection.is_lost() {
            if self.transacted {
                self.rollback();
            }
            for inbox in std::mem::take(&mut *lock(&self.subscribers)) {
                self.broker().detach(inbox);
            }
            lock(&self.broker().destinations)
                .queues
                .retain(|_, queue| queue.owner != Some(self.id));
        }
        self.broker().changed.notify_waiters();
    }
}

struct MemorySession {
    state: Arc<SessionState>,
}

#[async_trait]
impl BrokerSession for MemorySession {
    fn is_transacted(&self) -> bool {
        self.state.transacted
    }

    async fn send(&self, destination: &DestinationRef, message: TransportMessage) -> Result<(), TransportError> {
        self.state.ensure_open()?;
        if self.state.transacted {
            lock(&self.state.staged).push((destination.clone(), message));
        } else {
            self.state.broker().deliver(destination, message);
        }
        Ok(())
    }

    async fn create_consumer(
        &self,
        destination: &DestinationRef,
        selector: Option<&str>,
        durable_name: Option<&str>,
    ) -> Result<Box<dyn BrokerConsumer>, TransportError> {
        self.state.ensure_open()?;
        let broker = self.state.broker();

        let (source, queue_selector) = match destination.kind() {
            DestinationType::Queue => {
                let selector = selector.map(Selector::parse).transpose()?;
                let mut destinations = lock(&broker.destinations);
                let name = destination.name();
                if is_temporary(name) && !destinations.queues.contains_key(name) {
                    return Err(TransportError::InvalidDestination(format!(
                        "temporary queue '{name}' no longer exists"
                    )));
                }
                destinations.queues.entry(name.to_string()).or_default().had_consumer = true;
                (Source::Queue(name.to_string()), selector)
            }
            DestinationType::Topic => {
                let inbox = broker.subscribe_topic(destination.name(), selector, durable_name)?;
                lock(&self.state.subscribers).push(inbox);
                (Source::Inbox(inbox), None)
            }
        };

        debug!(destination = %destination, selector, durable = durable_name, "Consumer created");
        Ok(Box::new(MemoryConsumer {
            session: Arc::clone(&self.state),
            source,
            selector: queue_selector,
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_temporary_queue(&self) -> Result<DestinationRef, TransportError> {
        self.state.ensure_open()?;
        let name = format!("{TEMPORARY_QUEUE_PREFIX}{}", Uuid::new_v4());
        lock(&self.state.broker().destinations).queues.insert(
            name.clone(),
            Queue {
                messages: VecDeque::new(),
                had_consumer: true,
                owner: Some(self.state.id),
            },
        );
        Ok(DestinationRef::queue(name))
    }

    async fn unsubscribe(&self, durable_name: &str) -> Result<(), TransportError> {
        self.state.ensure_open()?;
        self.state.broker().unsubscribe(durable_name)
    }

    async fn commit(&self) -> Result<(), TransportError> {
        self.state.ensure_open()?;
        if !self.state.transacted {
            return Err(TransportError::Transaction("session is not transacted".to_string()));
        }
        let staged = std::mem::take(&mut *lock(&self.state.staged));
        lock(&self.state.received).clear();
        for (destination, message) in staged {
            self.state.broker().deliver(&destination, message);
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        self.state.ensure_open()?;
        if !self.state.transacted {
            return Err(TransportError::Transaction("session is not transacted".to_string()));
        }
        self.state.rollback();
        Ok(())
    }

    async fn close(&self) {
        self.state.close();
        lock(&self.state.connection.sessions)
            .retain(|session| session.strong_count() > 0 && !std::ptr::eq(session.as_ptr(), Arc::as_ptr(&self.state)));
    }
}

struct MemoryConsumer {
    session: Arc<SessionState>,
    source: Source,
    selector: Option<Selector>,
    closed: AtomicBool,
}

impl MemoryConsumer {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConsumerClosed);
        }
        self.session.ensure_open()
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn receive(&self, timeout: Duration) -> Result<Option<TransportMessage>, TransportError> {
        let deadline = Instant::now() + timeout;
        let broker = self.session.broker();

        loop {
            // register interest before looking, so no notification is missed
            let changed = broker.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            self.ensure_open()?;
            if let Some(message) = broker.take(&self.source, self.selector.as_ref()) {
                if self.session.transacted {
                    lock(&self.session.received).push((self.source.clone(), message.clone()));
                }
                return Ok(Some(message));
            }

            tokio::select! {
                _ = &mut changed => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Source::Inbox(inbox) = self.source {
            if !self.session.connection.is_lost() {
                self.session.broker().detach(inbox);
            }
            lock(&self.session.subscribers).retain(|id| *id != inbox);
        }
        self.session.broker().changed.notify_waiters();
    }
}
