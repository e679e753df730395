//! In-process publish/subscribe bus.
//!
//! Dispatch is synchronous: `publish` runs every subscriber registered for the
//! event's type on the calling thread, in subscription order. A subscriber
//! that needs to do slow work must hand it off to its own task.
//!
//! Delivery is best effort and at most once per current subscriber. Nothing
//! is persisted or replayed.

use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

use crate::models::{Event, EventData, EventType};

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    handler: EventHandler,
}

#[derive(Default)]
struct BusInner {
    subscribers: RwLock<HashMap<EventType, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, event_type: EventType, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscribers
            .write()
            .entry(event_type)
            .or_default()
            .push(Subscriber {
                id,
                handler: Arc::new(handler),
            });
        debug!(event_type = %event_type, subscription = id.0, "Subscriber registered");
        id
    }

    /// Returns false when the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        for list in subscribers.values_mut() {
            if let Some(pos) = list.iter().position(|s| s.id == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Fans `event` out to every subscriber of its type and returns how many
    /// subscribers completed without panicking.
    pub fn publish(&self, event: Event) -> usize {
        // Snapshot so subscribers may (un)subscribe or publish re-entrantly.
        let handlers: Vec<(SubscriptionId, EventHandler)> = {
            let subscribers = self.inner.subscribers.read();
            match subscribers.get(&event.event_type) {
                Some(list) => list.iter().map(|s| (s.id, s.handler.clone())).collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(()) => delivered += 1,
                Err(panic_info) => {
                    error!(
                        event_type = %event.event_type,
                        module = %event.module,
                        subscription = id.0,
                        panic = %panic_message(&panic_info),
                        "Event subscriber panicked"
                    );
                }
            }
        }
        delivered
    }

    pub fn emit(&self, event_type: EventType, module: &str, data: EventData) -> usize {
        self.publish(Event::new(event_type, module, data))
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.inner
            .subscribers
            .read()
            .get(&event_type)
            .map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscribers = self.inner.subscribers.read();
        let total: usize = subscribers.values().map(Vec::len).sum();
        f.debug_struct("EventBus")
            .field("subscriber_count", &total)
            .finish()
    }
}

pub(crate) fn panic_message(panic_info: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
