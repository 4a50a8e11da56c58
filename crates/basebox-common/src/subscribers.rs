//! Closure registry for change notifications.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

/// Handle returned by [`Subscribers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A set of callbacks invoked for every published event.
///
/// Callbacks run on the publishing thread, in subscription order, without
/// any registry lock held, so a callback may subscribe or unsubscribe.
pub struct Subscribers<E> {
    next_id: AtomicU64,
    callbacks: RwLock<Vec<(SubscriptionId, Callback<E>)>>,
}

impl<E> Subscribers<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.write().push((id, Arc::new(callback)));
        trace!(%id, "subscribed");
        id
    }

    /// Removes a subscription. Returns false if `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(sub, _)| *sub != id);
        before != callbacks.len()
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.read().is_empty()
    }

    /// Delivers `event` to every current subscriber.
    pub fn publish(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = self
            .callbacks
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Subscribers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_publish_in_subscription_order() {
        let subscribers: Subscribers<u32> = Subscribers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&seen);
        subscribers.subscribe(move |ev| first.lock().push(("a", *ev)));
        let second = Arc::clone(&seen);
        subscribers.subscribe(move |ev| second.lock().push(("b", *ev)));

        subscribers.publish(&1);
        subscribers.publish(&2);
        assert_eq!(*seen.lock(), vec![("a", 1), ("b", 1), ("a", 2), ("b", 2)]);
    }

    #[test]
    fn test_unsubscribe() {
        let subscribers: Subscribers<u32> = Subscribers::new();
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        let id = subscribers.subscribe(move |_| *counter.lock() += 1);

        subscribers.publish(&0);
        assert!(subscribers.unsubscribe(id));
        assert!(!subscribers.unsubscribe(id));
        subscribers.publish(&0);
        assert_eq!(*count.lock(), 1);
        assert!(subscribers.is_empty());
    }

    #[test]
    fn test_callback_may_subscribe_during_publish() {
        let subscribers: Arc<Subscribers<u32>> = Arc::new(Subscribers::new());
        let inner = Arc::clone(&subscribers);
        subscribers.subscribe(move |_| {
            inner.subscribe(|_| {});
        });

        subscribers.publish(&0);
        assert_eq!(subscribers.len(), 2);
    }
}
