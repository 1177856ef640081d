//! Typed notification streams with explicit subscriptions.
//!
//! Producers (the sysfs poller, tests) publish on an [`EventBus`]; consumers
//! register a handler and keep the returned [`Subscription`] for as long as
//! they want to be notified. Dropping or [`cancel`](Subscription::cancel)ling
//! the subscription deregisters the handler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::cpu_mask::CoreId;

/// A committed frequency transition of `core`'s frequency domain (kHz).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrequencyChange {
    pub core: CoreId,
    pub old_freq: u32,
    pub new_freq: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyChange {
    Online(CoreId),
    Offline(CoreId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerTransition {
    EnteringSuspend,
    Resumed,
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Fan-out of events of one type to the registered handlers.
pub struct EventBus<E> {
    handlers: Mutex<Vec<(u64, Handler<E>)>>,
    next_id: AtomicU64,
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Registers `handler` until the returned subscription goes away.
    #[must_use = "the handler is deregistered when the subscription is dropped"]
    pub fn subscribe<F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
        E: Send,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, Arc::new(handler)));
        let bus: Weak<dyn Deregister> = Arc::downgrade(self) as Weak<dyn Deregister>;
        Subscription { bus, id }
    }

    /// Delivers `event` to every handler, in registration order.
    pub fn publish(&self, event: &E) {
        // handlers may (un)subscribe, so call them outside the lock
        let handlers: Vec<Handler<E>> = self.lock().iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Handler<E>)>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

trait Deregister: Send + Sync {
    fn deregister(&self, id: u64);
}

impl<E: Send + 'static> Deregister for EventBus<E> {
    fn deregister(&self, id: u64) {
        self.lock().retain(|(handler_id, _)| *handler_id != id);
    }
}

/// Registration handle returned by [`EventBus::subscribe`].
pub struct Subscription {
    bus: Weak<dyn Deregister>,
    id: u64,
}

impl Subscription {
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.deregister(self.id);
        }
    }
}

/// The three streams the governor consumes.
#[derive(Clone)]
pub struct EventSources {
    pub frequency: Arc<EventBus<FrequencyChange>>,
    pub topology: Arc<EventBus<TopologyChange>>,
    pub power: Arc<EventBus<PowerTransition>>,
}

impl EventSources {
    pub fn new() -> Self {
        Self {
            frequency: EventBus::new(),
            topology: EventBus::new(),
            power: EventBus::new(),
        }
    }
}

impl Default for EventSources {
    fn default() -> Self {
        Self::new()
    }
}
