//! Destinations: named queues and topics.

use crate::error::MomError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Deref;
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumString};

/// Point-to-point queue or publish/subscribe topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DestinationType {
    Queue,
    Topic,
}

/// How a destination reference becomes a broker destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum ResolveMethod {
    /// Defined ad hoc by the client from its name
    #[default]
    Define,
    /// Looked up by name in the naming context
    Jndi,
}

/// Untyped destination reference.
///
/// Two references are equal if name and type match, regardless of how they
/// are resolved or what parameters they carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationRef {
    name: String,
    kind: DestinationType,
    resolve: ResolveMethod,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    parameters: BTreeMap<String, String>,
}

impl DestinationRef {
    pub fn new(name: impl Into<String>, kind: DestinationType, resolve: ResolveMethod) -> Self {
        Self {
            name: name.into(),
            kind,
            resolve,
            parameters: BTreeMap::new(),
        }
    }

    pub fn queue(name: impl Into<String>) -> Self {
        Self::new(name, DestinationType::Queue, ResolveMethod::Define)
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(name, DestinationType::Topic, ResolveMethod::Define)
    }

    /// Parse `define:///name` or `jndi:///name`, optionally followed by
    /// `?key=value&...` parameters.
    pub fn parse(uri: &str, kind: DestinationType) -> Result<Self, MomError> {
        let (scheme, rest) = uri
            .split_once(":///")
            .ok_or_else(|| MomError::config(format!("invalid destination '{uri}': expected '<define|jndi>:///<name>'")))?;
        let resolve = ResolveMethod::from_str(scheme)
            .map_err(|_| MomError::config(format!("invalid destination '{uri}': unknown resolve method '{scheme}'")))?;

        let (name, query) = match rest.split_once('?') {
            Some((name, query)) => (name, Some(query)),
            None => (rest, None),
        };
        if name.trim().is_empty() {
            return Err(MomError::config(format!("invalid destination '{uri}': missing name")));
        }

        let mut destination = Self::new(name, kind, resolve);
        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            destination.parameters.insert(key.to_string(), value.to_string());
        }
        Ok(destination)
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DestinationType {
        self.kind
    }

    pub fn resolve_method(&self) -> ResolveMethod {
        self.resolve
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn is_queue(&self) -> bool {
        self.kind == DestinationType::Queue
    }

    pub fn is_topic(&self) -> bool {
        self.kind == DestinationType::Topic
    }
}

impl PartialEq for DestinationRef {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.kind == other.kind
    }
}

impl Eq for DestinationRef {}

impl Hash for DestinationRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.kind.hash(state);
    }
}

impl fmt::Display for DestinationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Destination whose messages carry a `T`.
pub struct Destination<T> {
    inner: DestinationRef,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Destination<T> {
    pub fn new(name: impl Into<String>, kind: DestinationType, resolve: ResolveMethod) -> Self {
        DestinationRef::new(name, kind, resolve).into()
    }

    pub fn queue(name: impl Into<String>) -> Self {
        DestinationRef::queue(name).into()
    }

    pub fn topic(name: impl Into<String>) -> Self {
        DestinationRef::topic(name).into()
    }

    pub fn destination_ref(&self) -> &DestinationRef {
        &self.inner
    }
}

impl<T> From<DestinationRef> for Destination<T> {
    fn from(inner: DestinationRef) -> Self {
        Self {
            inner,
            _payload: PhantomData,
        }
    }
}

impl<T> From<Destination<T>> for DestinationRef {
    fn from(destination: Destination<T>) -> Self {
        destination.inner
    }
}

/// Destination for request/reply: requests carry a `Req`, replies a `Rep`.
pub struct BiDestination<Req, Rep> {
    inner: DestinationRef,
    _payload: PhantomData<fn(Req) -> Rep>,
}

impl<Req, Rep> BiDestination<Req, Rep> {
    pub fn new(name: impl Into<String>, kind: DestinationType, resolve: ResolveMethod) -> Self {
        DestinationRef::new(name, kind, resolve).into()
    }

    pub fn queue(name: impl Into<String>) -> Self {
        DestinationRef::queue(name).into()
    }

    pub fn topic(name: impl Into<String>) -> Self {
        DestinationRef::topic(name).into()
    }

    pub fn destination_ref(&self) -> &DestinationRef {
        &self.inner
    }
}

impl<Req, Rep> From<DestinationRef> for BiDestination<Req, Rep> {
    fn from(inner: DestinationRef) -> Self {
        Self {
            inner,
            _payload: PhantomData,
        }
    }
}

impl<Req, Rep> From<BiDestination<Req, Rep>> for DestinationRef {
    fn from(destination: BiDestination<Req, Rep>) -> Self {
        destination.inner
    }
}

macro_rules! impl_destination_traits {
    ($ty:ident < $($param:ident),+ >) => {
        impl<$($param),+> Clone for $ty<$($param),+> {
            fn clone(&self) -> Self {
                self.inner.clone().into()
            }
        }

        impl<$($param),+> PartialEq for $ty<$($param),+> {
            fn eq(&self, other: &Self) -> bool {
                self.inner == other.inner
            }
        }

        impl<$($param),+> Eq for $ty<$($param),+> {}

        impl<$($param),+> Hash for $ty<$($param),+> {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.inner.hash(state);
            }
        }

        impl<$($param),+> Deref for $ty<$($param),+> {
            type Target = DestinationRef;

            fn deref(&self) -> &DestinationRef {
                &self.inner
            }
        }

        impl<$($param),+> fmt::Debug for $ty<$($param),+> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(&self.inner, f)
            }
        }

        impl<$($param),+> fmt::Display for $ty<$($param),+> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.inner, f)
            }
        }
    };
}

impl_destination_traits!(Destination<T>);
impl_destination_traits!(BiDestination<Req, Rep>);
