//! Event Bus - typed publish/subscribe
//!
//! Shared notification primitive used by the network monitor, the mutation
//! queue, the auth session and the orchestrator's status stream.
//!
//! - Handlers run synchronously, in registration order
//! - A panicking handler is logged and skipped; later handlers still run
//! - `subscribe` returns a `Subscription` handle; call `unsubscribe()` to detach

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: u64,
    handlers: Vec<(u64, Handler<E>)>,
}

/// Lock a std mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Typed publish/subscribe channel
pub struct EventBus<E> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    /// Register a handler. Delivery order follows registration order.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.handlers.push((id, Arc::new(handler)));
        drop(registry);

        let weak: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    lock(&registry).handlers.retain(|(handler_id, _)| *handler_id != id);
                }
            })),
        }
    }

    /// Deliver an event to every current subscriber
    pub fn publish(&self, event: &E) {
        // Snapshot so handlers may subscribe/unsubscribe while being called
        let handlers: Vec<Handler<E>> = lock(&self.registry)
            .handlers
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for (position, handler) in handlers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                log::error!("Event handler #{} panicked; continuing delivery", position);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).handlers.len()
    }
}

impl<E: 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

/// Handle returned by `EventBus::subscribe`
///
/// Dropping the handle keeps the handler registered.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Detach the handler from its bus
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_in_registration_order() {
        let bus: EventBus<u32> = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            bus.subscribe(move |value: &u32| lock(&seen).push(format!("{}:{}", tag, value)));
        }

        bus.publish(&7);

        assert_eq!(
            *lock(&seen),
            vec!["first:7".to_string(), "second:7".to_string(), "third:7".to_string()]
        );
    }

    #[test]
    fn test_unsubscribe_detaches_handler() {
        let bus: EventBus<u32> = EventBus::new();
        let count = Arc::new(Mutex::new(0));

        let counter = count.clone();
        let subscription = bus.subscribe(move |_| *lock(&counter) += 1);
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(&1);
        subscription.unsubscribe();
        bus.publish(&2);

        assert_eq!(*lock(&count), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_panicking_handler_does_not_block_others() {
        let bus: EventBus<&'static str> = EventBus::new();
        let reached = Arc::new(Mutex::new(false));

        bus.subscribe(|_| panic!("listener failure"));
        let flag = reached.clone();
        bus.subscribe(move |_| *lock(&flag) = true);

        bus.publish(&"event");

        assert!(*lock(&reached));
    }

    #[test]
    fn test_unsubscribe_after_bus_dropped() {
        let bus: EventBus<u32> = EventBus::new();
        let subscription = bus.subscribe(|_| {});
        drop(bus);

        // Must not panic
        subscription.unsubscribe();
    }
}
