//! MOM environment: the key-value configuration a [`Mom`](crate::Mom) is
//! initialized with, and the naming context destinations are looked up in.

use crate::destination::DestinationRef;
use crate::error::MomError;
use crate::handler::MessageHandler;
use crate::marshaller::Marshaller;
use crate::sync::lock;
use crate::transport::ConnectionFactory;
use core_config::{env_optional, parse_bool, parse_property, ConfigError, FromEnv};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

pub const SYMBOLIC_NAME: &str = "mom.symbolic_name";
pub const CONNECTION_FACTORY: &str = "mom.connection_factory";
pub const MARSHALLER: &str = "mom.marshaller";
pub const CLIENT_ID: &str = "mom.client_id";
pub const CONNECTION_RETRY_COUNT: &str = "mom.connection_retry_count";
pub const CONNECTION_RETRY_INTERVAL_MILLIS: &str = "mom.connection_retry_interval_millis";
pub const SESSION_RETRY_INTERVAL_MILLIS: &str = "mom.session_retry_interval_millis";
pub const REQUEST_REPLY_ENABLED: &str = "mom.request_reply.enabled";
pub const REQUEST_REPLY_CANCELLATION_TOPIC: &str = "mom.request_reply.cancellation_topic";
pub const RECEIVE_TIMEOUT_MILLIS: &str = "mom.receive_timeout_millis";
pub const MESSAGE_HANDLER: &str = "mom.message_handler";

/// Naming keys, passed on to the naming context.
pub const PROVIDER_URL: &str = "naming.provider_url";
pub const SECURITY_PRINCIPAL: &str = "naming.security_principal";
pub const SECURITY_CREDENTIALS: &str = "naming.security_credentials";

/// Variables read by [`MomEnvironment::from_env`], with their keys.
const ENV_VARS: &[(&str, &str)] = &[
    ("MOM_SYMBOLIC_NAME", SYMBOLIC_NAME),
    ("MOM_CONNECTION_FACTORY", CONNECTION_FACTORY),
    ("MOM_MARSHALLER", MARSHALLER),
    ("MOM_CLIENT_ID", CLIENT_ID),
    ("MOM_CONNECTION_RETRY_COUNT", CONNECTION_RETRY_COUNT),
    ("MOM_CONNECTION_RETRY_INTERVAL_MILLIS", CONNECTION_RETRY_INTERVAL_MILLIS),
    ("MOM_SESSION_RETRY_INTERVAL_MILLIS", SESSION_RETRY_INTERVAL_MILLIS),
    ("MOM_REQUEST_REPLY_ENABLED", REQUEST_REPLY_ENABLED),
    ("MOM_REQUEST_REPLY_CANCELLATION_TOPIC", REQUEST_REPLY_CANCELLATION_TOPIC),
    ("MOM_RECEIVE_TIMEOUT_MILLIS", RECEIVE_TIMEOUT_MILLIS),
    ("MOM_PROVIDER_URL", PROVIDER_URL),
    ("MOM_SECURITY_PRINCIPAL", SECURITY_PRINCIPAL),
    ("MOM_SECURITY_CREDENTIALS", SECURITY_CREDENTIALS),
];

/// A value of the environment: either a string or a pre-built object.
#[derive(Clone)]
pub enum EnvValue {
    String(String),
    ConnectionFactory(Arc<dyn ConnectionFactory>),
    Marshaller(Arc<dyn Marshaller>),
    Destination(DestinationRef),
    MessageHandler(Arc<dyn MessageHandler>),
}

impl EnvValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            EnvValue::String(value) => Some(value),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            EnvValue::String(_) => "string",
            EnvValue::ConnectionFactory(_) => "connection factory",
            EnvValue::Marshaller(_) => "marshaller",
            EnvValue::Destination(_) => "destination",
            EnvValue::MessageHandler(_) => "message handler",
        }
    }
}

impl fmt::Debug for EnvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvValue::String(value) => write!(f, "{value:?}"),
            EnvValue::ConnectionFactory(factory) => write!(f, "{factory:?}"),
            EnvValue::Marshaller(marshaller) => write!(f, "Marshaller({})", marshaller.name()),
            EnvValue::Destination(destination) => write!(f, "Destination({destination})"),
            EnvValue::MessageHandler(handler) => write!(f, "{handler:?}"),
        }
    }
}

impl From<&str> for EnvValue {
    fn from(value: &str) -> Self {
        EnvValue::String(value.to_string())
    }
}

impl From<String> for EnvValue {
    fn from(value: String) -> Self {
        EnvValue::String(value)
    }
}

impl From<Arc<dyn ConnectionFactory>> for EnvValue {
    fn from(value: Arc<dyn ConnectionFactory>) -> Self {
        EnvValue::ConnectionFactory(value)
    }
}

impl From<Arc<dyn Marshaller>> for EnvValue {
    fn from(value: Arc<dyn Marshaller>) -> Self {
        EnvValue::Marshaller(value)
    }
}

impl From<DestinationRef> for EnvValue {
    fn from(value: DestinationRef) -> Self {
        EnvValue::Destination(value)
    }
}

impl From<Arc<dyn MessageHandler>> for EnvValue {
    fn from(value: Arc<dyn MessageHandler>) -> Self {
        EnvValue::MessageHandler(value)
    }
}

/// Names bound to objects, the directory JNDI-resolved destinations and
/// connection factories are looked up in. Cloning shares the bindings.
#[derive(Clone, Default)]
pub struct NamingContext {
    bindings: Arc<Mutex<HashMap<String, EnvValue>>>,
}

impl NamingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, name: impl Into<String>, value: impl Into<EnvValue>) {
        lock(&self.bindings).insert(name.into(), value.into());
    }

    pub fn unbind(&self, name: &str) -> bool {
        lock(&self.bindings).remove(name).is_some()
    }

    pub fn lookup(&self, name: &str) -> Result<EnvValue, MomError> {
        lock(&self.bindings)
            .get(name)
            .cloned()
            .ok_or_else(|| MomError::config(format!("name '{name}' is not bound in the naming context")))
    }
}

impl fmt::Debug for NamingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = lock(&self.bindings).keys().cloned().collect();
        names.sort();
        f.debug_struct("NamingContext").field("names", &names).finish()
    }
}

/// Configuration of one MOM instance.
///
/// ```rust,ignore
/// let broker = MemoryBroker::new();
/// let environment = MomEnvironment::new()
///     .with(SYMBOLIC_NAME, "orders")
///     .with_connection_factory(Arc::new(broker))
///     .with(MARSHALLER, "json");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MomEnvironment {
    values: BTreeMap<String, EnvValue>,
    naming: NamingContext,
}

impl MomEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<EnvValue>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn with_connection_factory(self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.with(CONNECTION_FACTORY, factory)
    }

    pub fn with_marshaller(self, marshaller: Arc<dyn Marshaller>) -> Self {
        self.with(MARSHALLER, marshaller)
    }

    pub fn with_naming_context(mut self, naming: NamingContext) -> Self {
        self.naming = naming;
        self
    }

    pub fn naming(&self) -> &NamingContext {
        &self.naming
    }

    pub fn get(&self, key: &str) -> Option<&EnvValue> {
        self.values.get(key)
    }

    /// String value of `key`. Blank strings count as unset.
    pub fn get_str(&self, key: &str) -> Result<Option<&str>, MomError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(EnvValue::String(value)) if value.trim().is_empty() => Ok(None),
            Some(EnvValue::String(value)) => Ok(Some(value.trim())),
            Some(other) => Err(MomError::config(format!(
                "'{key}' must be a string, got a {}",
                other.type_name()
            ))),
        }
    }

    pub fn parse<T>(&self, key: &str) -> Result<Option<T>, MomError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        Ok(self
            .get_str(key)?
            .map(|raw| parse_property::<T>(key, raw))
            .transpose()?)
    }

    pub fn parse_bool(&self, key: &str) -> Result<Option<bool>, MomError> {
        Ok(self.get_str(key)?.map(|raw| parse_bool(key, raw)).transpose()?)
    }

    /// String entries without MOM keys and without blank values, the
    /// environment handed to the naming layer.
    pub fn context_environment(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .filter(|(key, _)| !key.starts_with("mom."))
            .filter_map(|(key, value)| match value {
                EnvValue::String(value) if !value.trim().is_empty() => Some((key.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }
}

impl FromEnv for MomEnvironment {
    fn from_env() -> Result<Self, ConfigError> {
        let environment = ENV_VARS
            .iter()
            .filter_map(|(var, key)| env_optional(var).map(|value| (*key, value)))
            .fold(MomEnvironment::new(), |environment, (key, value)| environment.with(key, value));

        // Fail early on malformed numbers and flags.
        for key in [
            CONNECTION_RETRY_COUNT,
            CONNECTION_RETRY_INTERVAL_MILLIS,
            SESSION_RETRY_INTERVAL_MILLIS,
            RECEIVE_TIMEOUT_MILLIS,
        ] {
            if let Some(EnvValue::String(raw)) = environment.get(key) {
                parse_property::<u64>(key, raw)?;
            }
        }
        if let Some(EnvValue::String(raw)) = environment.get(REQUEST_REPLY_ENABLED) {
            parse_bool(REQUEST_REPLY_ENABLED, raw)?;
        }
        Ok(environment)
    }
}
