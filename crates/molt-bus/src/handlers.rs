//! Ordered, append-only subscriber callbacks.

use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

use crate::error::BusError;

/// A subscriber callback.
pub type Handler<T> = Arc<dyn Fn(&T) -> Result<(), BusError> + Send + Sync>;

/// Handlers invoked in registration order for every newly seen item.
///
/// There is no unregistration. A failing handler is logged and counted; it
/// never stops dispatch to the handlers after it.
pub struct HandlerRegistry<T> {
    handlers: RwLock<Vec<Handler<T>>>,
    failures: AtomicU64,
}

impl<T> std::fmt::Debug for HandlerRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.len())
            .field("failures", &self.failures())
            .finish()
    }
}

impl<T> Default for HandlerRegistry<T> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            failures: AtomicU64::new(0),
        }
    }
}

impl<T> HandlerRegistry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler.
    pub fn register<F>(&self, handler: F)
    where
        F: Fn(&T) -> Result<(), BusError> + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Invokes every handler in order. Returns how many succeeded.
    ///
    /// Handlers run on a snapshot, so a handler may register further
    /// handlers without deadlocking; those run from the next dispatch on.
    pub fn dispatch(&self, item: &T) -> usize {
        let snapshot: Vec<Handler<T>> = self.handlers.read().clone();
        let mut ok = 0;
        for (index, handler) in snapshot.iter().enumerate() {
            match handler(item) {
                Ok(()) => ok += 1,
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(handler = index, error = %e, "handler failed");
                }
            }
        }
        ok
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Returns true if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Total handler failures observed.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn dispatch_runs_in_registration_order() {
        let registry = HandlerRegistry::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            registry.register(move |n: &u32| {
                seen.lock().push((tag, *n));
                Ok(())
            });
        }

        assert_eq!(registry.dispatch(&7), 3);
        assert_eq!(
            *seen.lock(),
            vec![("first", 7), ("second", 7), ("third", 7)]
        );
    }

    #[test]
    fn failing_handler_does_not_stop_dispatch() {
        let registry = HandlerRegistry::<u32>::new();
        let calls = Arc::new(AtomicU64::new(0));
        registry.register(|_| Err(BusError::Handler("nope".into())));
        let counter = Arc::clone(&calls);
        registry.register(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(registry.dispatch(&1), 1);
        assert_eq!(registry.dispatch(&2), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.failures(), 2);
    }

    #[test]
    fn empty_registry_dispatches_nothing() {
        let registry = HandlerRegistry::<String>::new();
        assert!(registry.is_empty());
        assert_eq!(registry.dispatch(&"x".to_string()), 0);
    }

    #[test]
    fn handler_may_register_during_dispatch() {
        let registry = Arc::new(HandlerRegistry::<u32>::new());
        let inner = Arc::clone(&registry);
        registry.register(move |_| {
            inner.register(|_| Ok(()));
            Ok(())
        });

        assert_eq!(registry.dispatch(&0), 1);
        assert_eq!(registry.len(), 2);
    }
}
