//! Per-destination registrations of marshallers and encrypters.

use crate::destination::DestinationRef;
use crate::sync::lock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Entries<V> = Arc<Mutex<HashMap<DestinationRef, Vec<(u64, Arc<V>)>>>>;

/// Registrations keyed by destination. The latest registration wins;
/// disposing it brings back the one before.
pub(crate) struct Registry<V: ?Sized> {
    entries: Entries<V>,
    next_id: AtomicU64,
}

impl<V: ?Sized + Send + Sync + 'static> Registry<V> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn register(&self, destination: &DestinationRef, value: Arc<V>) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.entries)
            .entry(destination.clone())
            .or_default()
            .push((id, value));

        let entries = Arc::clone(&self.entries);
        let destination = destination.clone();
        Registration::new(move || {
            let mut entries = lock(&entries);
            if let Some(registered) = entries.get_mut(&destination) {
                registered.retain(|(registered_id, _)| *registered_id != id);
                if registered.is_empty() {
                    entries.remove(&destination);
                }
            }
        })
    }

    pub(crate) fn resolve(&self, destination: &DestinationRef) -> Option<Arc<V>> {
        lock(&self.entries)
            .get(destination)
            .and_then(|registered| registered.last())
            .map(|(_, value)| Arc::clone(value))
    }

    pub(crate) fn clear(&self) {
        lock(&self.entries).clear();
    }
}

type Disposer = Box<dyn FnOnce() + Send>;

/// Handle to a registration. Dropping it keeps the registration in place.
pub struct Registration {
    dispose: Mutex<Option<Disposer>>,
}

impl Registration {
    fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose: Mutex::new(Some(Box::new(dispose))),
        }
    }

    /// Undo the registration. Idempotent.
    pub fn dispose(&self) {
        if let Some(dispose) = lock(&self.dispose).take() {
            dispose();
        }
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.dispose).is_none()
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshaller::{JsonMarshaller, Marshaller, TextMarshaller};

    #[test]
    fn test_dispose_restores_previous() {
        let registry: Registry<dyn Marshaller> = Registry::new();
        let queue = DestinationRef::queue("q");
        assert!(registry.resolve(&queue).is_none());

        let json = registry.register(&queue, Arc::new(JsonMarshaller));
        let text = registry.register(&queue, Arc::new(TextMarshaller));
        assert_eq!(registry.resolve(&queue).unwrap().name(), "text");

        text.dispose();
        assert_eq!(registry.resolve(&queue).unwrap().name(), "json");

        json.dispose();
        json.dispose();
        assert!(json.is_disposed());
        assert!(registry.resolve(&queue).is_none());
    }

    #[test]
    fn test_disposing_older_registration_keeps_newer() {
        let registry: Registry<dyn Marshaller> = Registry::new();
        let topic = DestinationRef::topic("t");

        let first = registry.register(&topic, Arc::new(JsonMarshaller));
        let _second = registry.register(&topic, Arc::new(TextMarshaller));
        first.dispose();
        assert_eq!(registry.resolve(&topic).unwrap().name(), "text");
    }
}
