//! Subscriber registry: message and lifecycle handlers owned by a client.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use shoplink_protocol::Envelope;

use crate::client::ClientEvent;

/// Called once per inbound message.
pub type MessageHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Called once per connection state transition.
pub type LifecycleHandler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Handle returned by every registration; pass it to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Which messages a handler wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Every message
    All,
    /// Messages whose `type` equals this
    Type(String),
}

impl Filter {
    fn matches(&self, kind: &str) -> bool {
        match self {
            Self::All => true,
            Self::Type(t) => t == kind,
        }
    }
}

enum Entry {
    Message(Filter, MessageHandler),
    Lifecycle(LifecycleHandler),
}

/// Maps subscription ids to handlers.
///
/// Lookups hand back cloned `Arc`s so callers can release the registry lock
/// before invoking anything; handlers are then free to subscribe or
/// unsubscribe from inside a callback.
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: u64,
    entries: HashMap<SubscriptionId, Entry>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_message(&mut self, filter: Filter, handler: MessageHandler) -> SubscriptionId {
        let id = self.next_id();
        self.entries.insert(id, Entry::Message(filter, handler));
        id
    }

    pub fn add_lifecycle(&mut self, handler: LifecycleHandler) -> SubscriptionId {
        let id = self.next_id();
        self.entries.insert(id, Entry::Lifecycle(handler));
        id
    }

    /// Returns whether the id was registered.
    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Handlers interested in a message of type `kind`.
    pub fn message_handlers(&self, kind: &str) -> Vec<MessageHandler> {
        self.entries
            .values()
            .filter_map(|entry| match entry {
                Entry::Message(filter, handler) if filter.matches(kind) => Some(handler.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn lifecycle_handlers(&self) -> Vec<LifecycleHandler> {
        self.entries
            .values()
            .filter_map(|entry| match entry {
                Entry::Lifecycle(handler) => Some(handler.clone()),
                Entry::Message(..) => None,
            })
            .collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn next_id(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting() -> (Arc<AtomicUsize>, MessageHandler) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handler: MessageHandler = Arc::new(move |_: &Envelope| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, handler)
    }

    #[test]
    fn type_filter_and_wildcard() {
        let mut registry = SubscriberRegistry::new();
        let (_, all) = counting();
        let (_, stock) = counting();
        registry.add_message(Filter::All, all);
        registry.add_message(Filter::Type("inventory_updated".into()), stock);

        assert_eq!(registry.message_handlers("inventory_updated").len(), 2);
        assert_eq!(registry.message_handlers("order_created").len(), 1);
        assert!(registry.lifecycle_handlers().is_empty());
    }

    #[test]
    fn remove_is_reported_once() {
        let mut registry = SubscriberRegistry::new();
        let (_, handler) = counting();
        let id = registry.add_message(Filter::All, handler);
        let life = registry.add_lifecycle(Arc::new(|_: &ClientEvent| {}));
        assert_ne!(id, life);
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.message_handlers("anything").is_empty());
        assert_eq!(registry.lifecycle_handlers().len(), 1);
    }
}
