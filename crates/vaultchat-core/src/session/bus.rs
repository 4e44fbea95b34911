//! Subscriber bus - multicast of session events
//!
//! Observers register callbacks; the controller publishes every event to
//! whichever callbacks are registered at that moment. Subscribers observe a
//! turn, they never own it: removing the last one does not stop processing.
//!
//! Callbacks run on the publisher's task, outside the controller's state
//! lock. A panicking callback is caught and logged so the remaining
//! subscribers and the controller keep going. Observers that do real work
//! should use [`SubscriberBus::subscribe_channel`], which only pushes into
//! an unbounded channel and so never stalls the turn.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::types::SessionEvent;

/// Callback invoked for every published event
pub type EventCallback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Receiver half handed out by [`SubscriberBus::subscribe_channel`]
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// A registered observer
#[derive(Clone)]
enum Subscriber {
    Callback(EventCallback),
    /// Pruned once its receiver is gone
    Channel(mpsc::UnboundedSender<SessionEvent>),
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    // Ordered so delivery follows registration order
    subscribers: Mutex<BTreeMap<u64, Subscriber>>,
}

impl BusInner {
    fn register(self: &Arc<Self>, subscriber: Subscriber) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, subscriber);
        debug!("Subscriber {} registered", id);

        Subscription {
            id,
            bus: Arc::downgrade(self),
        }
    }
}

/// Multicast publish/subscribe channel for [`SessionEvent`]s
#[derive(Clone, Default)]
pub struct SubscriberBus {
    inner: Arc<BusInner>,
}

impl SubscriberBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for every event published from now on
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.register(Subscriber::Callback(Arc::new(callback)))
    }

    /// Register a channel-backed subscriber
    ///
    /// Events are pushed without waiting, so a slow reader never blocks the
    /// publisher. Dropping the receiver unregisters the subscriber on the
    /// next publish.
    pub fn subscribe_channel(&self) -> (Subscription, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.inner.register(Subscriber::Channel(tx)), rx)
    }

    /// Deliver an event to every current subscriber
    pub fn publish(&self, event: &SessionEvent) {
        // Snapshot so callbacks may subscribe/unsubscribe re-entrantly
        let subscribers: Vec<(u64, Subscriber)> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(id, subscriber)| (*id, subscriber.clone()))
            .collect();

        let mut closed = Vec::new();
        for (id, subscriber) in subscribers {
            match subscriber {
                Subscriber::Callback(callback) => {
                    if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                        warn!(
                            "Subscriber {} panicked while handling {}",
                            id,
                            event.event_type()
                        );
                    }
                }
                Subscriber::Channel(tx) => {
                    if tx.send(event.clone()).is_err() {
                        closed.push(id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut registered = self.inner.subscribers.lock();
            for id in closed {
                registered.remove(&id);
                debug!("Subscriber {} dropped its receiver, removed", id);
            }
        }
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

/// Handle returned by [`SubscriberBus::subscribe`]
///
/// Dropping the handle keeps the subscription alive; removal is explicit.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Remove the registration. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        if bus.subscribers.lock().remove(&self.id).is_some() {
            debug!("Subscriber {} removed", self.id);
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}
