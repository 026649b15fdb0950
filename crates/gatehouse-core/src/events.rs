//! Typed one-shot event bus.
//!
//! Authentication lifecycle signals (an external application finished
//! connecting, an application shut down, a transport connection closed) are
//! published here as strongly-typed [`Topic`] values instead of concatenated
//! string routes.  Subscriptions are **one-shot**: a callback fires at most
//! once and is removed from the bus in the same critical section in which
//! its topic is emitted, so two signals for the same topic can never invoke
//! the same callback twice.
//!
//! Every `subscribe_once` returns a [`Subscription`] handle; cancellation is
//! explicit via [`Subscription::cancel`].  Dropping the handle does *not*
//! cancel, which lets a retirement closure own the handle of its sibling
//! subscription and cancel it when the first of the two topics fires.
//!
//! Callbacks are invoked after the bus lock is released, so a callback may
//! freely cancel other subscriptions on the same bus without deadlocking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::identity::{ConnectionId, Identity};

/// A lifecycle signal scoped by identity or connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// The identity completed authentication and is now a registered
    /// external application.
    ExternalApplicationConnected(Identity),
    /// The application with this identity shut down.
    ApplicationClosed(Identity),
    /// The transport connection with this id closed.
    ConnectionClosed(ConnectionId),
}

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscriptions: HashMap<Topic, Vec<(u64, Callback)>>,
}

/// Shared one-shot publish/subscribe bus.
///
/// Cheap to clone; all clones observe the same subscription table.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` to fire on the next emission of `topic`.
    ///
    /// The callback fires at most once; it is removed from the bus before it
    /// is invoked.  Use the returned [`Subscription`] to cancel before the
    /// topic fires.
    pub fn subscribe_once(
        &self,
        topic: Topic,
        callback: impl FnOnce() + Send + 'static,
    ) -> Subscription {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .subscriptions
            .entry(topic)
            .or_default()
            .push((id, Box::new(callback)));
        Subscription {
            inner: Arc::downgrade(&self.inner),
            topic,
            id,
        }
    }

    /// Emits `topic`, firing every one-shot subscription registered for it.
    ///
    /// Subscriptions are removed under the bus lock and invoked after it is
    /// released, in registration order.
    pub fn emit(&self, topic: Topic) {
        let fired: Vec<Callback> = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .subscriptions
                .remove(&topic)
                .unwrap_or_default()
                .into_iter()
                .map(|(_, callback)| callback)
                .collect()
        };
        for callback in fired {
            callback();
        }
    }

    /// Number of live subscriptions across all topics.
    pub fn subscription_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.subscriptions.values().map(Vec::len).sum()
    }
}

/// Cancellable handle to one pending subscription.
///
/// Holds only a weak reference to the bus, so a stashed handle never keeps
/// the bus alive.
pub struct Subscription {
    inner: Weak<Mutex<BusInner>>,
    topic: Topic,
    id: u64,
}

impl Subscription {
    /// Removes the subscription from the bus if it has not fired yet.
    ///
    /// Cancelling a subscription that already fired (or was already
    /// cancelled) is a harmless no-op.
    pub fn cancel(&self) {
        if let Some(bus) = self.inner.upgrade() {
            let mut inner = bus.lock().unwrap();
            if let Some(entries) = inner.subscriptions.get_mut(&self.topic) {
                entries.retain(|(id, _)| *id != self.id);
                if entries.is_empty() {
                    inner.subscriptions.remove(&self.topic);
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
