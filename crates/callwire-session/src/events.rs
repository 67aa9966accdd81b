//! Per-transport publish/subscribe.
//!
//! Every transport owns one [`EventBus`] for its own event type. Handlers
//! are registered per event kind and run in subscription order. A handler
//! that panics is logged and skipped: the remaining handlers still run and
//! the publisher never sees the panic.
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use callwire_session::{BusEvent, EventBus};
//!
//! #[derive(Debug)]
//! enum Ping { Ping }
//!
//! impl BusEvent for Ping {
//!     type Kind = ();
//!     fn kind(&self) -> Self::Kind {}
//! }
//!
//! let bus = EventBus::new();
//! let hits = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&hits);
//! let sub = bus.subscribe((), move |_: &Ping| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! bus.publish(&Ping::Ping);
//! assert!(bus.unsubscribe(sub));
//! bus.publish(&Ping::Ping);
//! assert_eq!(hits.load(Ordering::SeqCst), 1);
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// An event that can travel over an [`EventBus`].
pub trait BusEvent: Send + Sync + 'static {
    /// Discriminant used to register handlers, usually a field-less mirror
    /// of the event enum.
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Returns the kind of this event.
    fn kind(&self) -> Self::Kind;
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Token returned by [`EventBus::subscribe`]; pass it back to
/// [`EventBus::unsubscribe`] to remove exactly that handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription<K> {
    kind: K,
    id: u64,
}

impl<K: Copy> Subscription<K> {
    /// The event kind this subscription listens to.
    pub fn kind(&self) -> K {
        self.kind
    }
}

struct Registry<E: BusEvent> {
    next_id: u64,
    handlers: HashMap<E::Kind, Vec<(u64, Handler<E>)>>,
}

/// Publish/subscribe hub with panic-isolated dispatch.
pub struct EventBus<E: BusEvent> {
    registry: Mutex<Registry<E>>,
}

impl<E: BusEvent> EventBus<E> {
    /// Creates a bus with no handlers.
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                next_id: 1,
                handlers: HashMap::new(),
            }),
        }
    }

    /// Registers a handler for one event kind.
    pub fn subscribe<F>(&self, kind: E::Kind, handler: F) -> Subscription<E::Kind>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut registry = self.registry();
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription { kind, id }
    }

    /// Removes the handler behind `subscription`.
    ///
    /// Returns `false` if it was already removed.
    pub fn unsubscribe(&self, subscription: Subscription<E::Kind>) -> bool {
        let mut registry = self.registry();
        let Some(handlers) = registry.handlers.get_mut(&subscription.kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != subscription.id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            registry.handlers.remove(&subscription.kind);
        }
        removed
    }

    /// Number of handlers currently registered for `kind`.
    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.registry().handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Calls every handler registered for the event's kind, in subscription
    /// order.
    ///
    /// The handler list is snapshotted first, so handlers may subscribe,
    /// unsubscribe or publish from inside a callback; such changes apply to
    /// the next publish. Returns how many handlers completed without
    /// panicking.
    pub fn publish(&self, event: &E) -> usize {
        let kind = event.kind();
        let handlers: Vec<Handler<E>> = match self.registry().handlers.get(&kind) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return 0,
        };

        let mut completed = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => completed += 1,
                Err(panic) => {
                    tracing::error!(
                        ?kind,
                        panic = panic_message(panic.as_ref()),
                        "event handler panicked"
                    );
                }
            }
        }
        completed
    }

    fn registry(&self) -> MutexGuard<'_, Registry<E>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry();
        let mut map = f.debug_map();
        for (kind, handlers) in &registry.handlers {
            map.entry(kind, &handlers.len());
        }
        map.finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
