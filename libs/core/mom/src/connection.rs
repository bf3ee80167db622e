//! Shared broker connection with failover.
//!
//! All subscriptions and publishes of one MOM go through a single connection.
//! When a broker operation reports a connection error the connection is
//! invalidated, and the next use connects again through the factory.

use crate::config::RetryPolicy;
use crate::destination::DestinationRef;
use crate::error::{MomError, TransportError};
use crate::metrics::MomMetrics;
use crate::sync::lock;
use crate::transport::{BrokerConnection, BrokerSession, ConnectionFactory, Credentials, TransportMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub(crate) struct ConnectionWrapper {
    factory: Arc<dyn ConnectionFactory>,
    client_id: String,
    credentials: Option<Credentials>,
    policy: RetryPolicy,
    metrics: MomMetrics,

    /// Readers take a snapshot; only `connect` replaces it
    current: RwLock<Option<Arc<dyn BrokerConnection>>>,
    connecting: tokio::sync::Mutex<()>,

    /// Non-transacted session for plain publishes, with its connection id
    producer: Mutex<Option<(Uuid, Arc<dyn BrokerSession>)>>,

    /// Set once a connection was established
    ever_connected: AtomicBool,

    /// Set when the retry budget was exhausted and logged
    failure_logged: AtomicBool,
    closed: AtomicBool,
}

impl ConnectionWrapper {
    pub(crate) fn new(
        factory: Arc<dyn ConnectionFactory>,
        client_id: impl Into<String>,
        credentials: Option<Credentials>,
        policy: RetryPolicy,
        metrics: MomMetrics,
    ) -> Self {
        Self {
            factory,
            client_id: client_id.into(),
            credentials,
            policy,
            metrics,
            current: RwLock::new(None),
            connecting: tokio::sync::Mutex::new(()),
            producer: Mutex::new(None),
            ever_connected: AtomicBool::new(false),
            failure_logged: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn client_id(&self) -> &str {
        &self.client_id
    }

    pub(crate) fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn snapshot(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.current
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .filter(|connection| !connection.is_closed())
    }

    pub(crate) fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.snapshot().is_some()
    }

    /// The live connection, connecting first if there is none.
    pub(crate) async fn connection(&self) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if let Some(connection) = self.snapshot() {
            return Ok(connection);
        }

        let _connecting = self.connecting.lock().await;
        // another caller may have connected meanwhile
        if let Some(connection) = self.snapshot() {
            return Ok(connection);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let connection = self.connect().await?;
        *self.current.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Arc::clone(&connection));
        Ok(connection)
    }

    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let backoff = self.policy.connection_backoff();
        let mut attempt = 0;

        loop {
            match self
                .factory
                .create_connection(&self.client_id, self.credentials.as_ref())
                .await
            {
                Ok(connection) => {
                    if self.ever_connected.swap(true, Ordering::SeqCst) {
                        info!(client_id = %self.client_id, connection = %connection.id(), "Reconnected to broker");
                        self.metrics.reconnected();
                    } else {
                        info!(client_id = %self.client_id, connection = %connection.id(), "Connected to broker");
                    }
                    self.failure_logged.store(false, Ordering::SeqCst);
                    return Ok(connection);
                }
                Err(e) if attempt < self.policy.connection_retry_count => {
                    debug!(
                        client_id = %self.client_id,
                        attempt = attempt + 1,
                        error = %e,
                        "Connection attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    if !self.failure_logged.swap(true, Ordering::SeqCst) {
                        error!(
                            client_id = %self.client_id,
                            attempts = attempt + 1,
                            error = %e,
                            "Could not connect to broker, retry budget exhausted"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Drop the connection with `connection_id` if it still is the current one.
    pub(crate) async fn invalidate(&self, connection_id: Uuid) {
        let stale = {
            let mut current = self.current.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            match current.as_ref() {
                Some(connection) if connection.id() == connection_id => current.take(),
                _ => None,
            }
        };
        if let Some(connection) = stale {
            warn!(client_id = %self.client_id, connection = %connection_id, "Connection invalidated");
            lock(&self.producer).take();
            connection.close().await;
        }
    }

    /// New session on the current connection, with the id of that connection.
    pub(crate) async fn create_session(
        &self,
        transacted: bool,
    ) -> Result<(Uuid, Arc<dyn BrokerSession>), TransportError> {
        let connection = self.connection().await?;
        match connection.create_session(transacted).await {
            Ok(session) => Ok((connection.id(), session)),
            Err(e) => {
                if e.is_connection_error() {
                    self.invalidate(connection.id()).await;
                }
                Err(e)
            }
        }
    }

    async fn producer(&self) -> Result<(Uuid, Arc<dyn BrokerSession>), TransportError> {
        let connection = self.connection().await?;
        if let Some((id, session)) = lock(&self.producer).as_ref() {
            if *id == connection.id() {
                return Ok((*id, Arc::clone(session)));
            }
        }

        let session = connection.create_session(false).await?;
        *lock(&self.producer) = Some((connection.id(), Arc::clone(&session)));
        Ok((connection.id(), session))
    }

    /// Send on the shared producer session. A connection error is retried
    /// once on a fresh connection.
    pub(crate) async fn send(&self, destination: &DestinationRef, message: TransportMessage) -> Result<(), MomError> {
        let mut retried = false;
        loop {
            let outcome = match self.producer().await {
                Ok((connection_id, session)) => session
                    .send(destination, message.clone())
                    .await
                    .map_err(|e| (Some(connection_id), e)),
                Err(e) => Err((None, e)),
            };

            match outcome {
                Ok(()) => return Ok(()),
                Err((connection_id, e)) if e.is_connection_error() && !retried => {
                    debug!(destination = %destination, error = %e, "Send failed, retrying on a fresh connection");
                    if let Some(connection_id) = connection_id {
                        self.invalidate(connection_id).await;
                    }
                    retried = true;
                }
                Err((_, e)) => return Err(e.into()),
            }
        }
    }

    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _connecting = self.connecting.lock().await;
        let producer = lock(&self.producer).take();
        if let Some((_, session)) = producer {
            session.close().await;
        }
        let current = self
            .current
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(connection) = current {
            connection.close().await;
            info!(client_id = %self.client_id, "Disconnected from broker");
        }
    }
}
