// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Lifecycle notifications for cache observers.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::NodeInfo;

/// Receives add, remove and clear notifications from a [`NodeTracker`](crate::NodeTracker).
///
/// Notifications are delivered synchronously, in registration order, after the tracker
/// has applied the state change and before any waiter of the affected value is woken.
/// The tracker holds no internal lock on its index while an observer runs, so observers
/// may call back into the tracker. Changes made from within a callback are reported once
/// every observer has heard about the current notification.
///
/// A panicking observer is isolated: the panic is logged and the remaining observers
/// are still notified.
pub trait CacheValueObserver<K, V>: Send + Sync {
    /// A constructed value was added to the cache.
    fn on_value_added(&self, node: &NodeInfo<K>, value: &V) {
        _ = (node, value);
    }

    /// A value was evicted by a sweep or removed explicitly.
    fn on_value_removed(&self, node: &NodeInfo<K>, value: &V) {
        _ = (node, value);
    }

    /// The cache was cleared. No per-value removal is reported for a clear.
    fn on_cache_cleared(&self) {}
}

/// A state change waiting to be published to observers.
pub(crate) enum Notification<K, V> {
    Added(NodeInfo<K>, V),
    Removed(NodeInfo<K>, V),
    Cleared,
}

impl<K, V> Notification<K, V> {
    fn name(&self) -> &'static str {
        match self {
            Self::Added(..) => "value_added",
            Self::Removed(..) => "value_removed",
            Self::Cleared => "cache_cleared",
        }
    }
}

type Entry<K, V> = (u64, Arc<dyn CacheValueObserver<K, V>>);

/// Registered observers, in registration order.
///
/// Callers serialize [`dispatch`](Self::dispatch); the tracker does so with its reentrant
/// notification gate, so the only concurrent dispatch is a nested one on the same thread.
pub(crate) struct ObserverSet<K, V> {
    next_id: AtomicU64,
    entries: RwLock<Vec<Entry<K, V>>>,
    queue: Mutex<VecDeque<Notification<K, V>>>,
    draining: AtomicBool,
}

impl<K, V> ObserverSet<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(0),
            entries: RwLock::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        })
    }

    pub(crate) fn connect(self: &Arc<Self>, observer: Arc<dyn CacheValueObserver<K, V>>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push((id, observer));

        let weak: Weak<Self> = Arc::downgrade(self);
        let observers: Weak<dyn Disconnect> = weak;
        Subscription {
            observers: Some(observers),
            id,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Publishes each notification to every observer, isolating observer panics.
    ///
    /// Notifications raised by an observer while a dispatch is running are queued behind
    /// the current one, so every observer sees the same order.
    pub(crate) fn dispatch(&self, notifications: Vec<Notification<K, V>>) {
        if notifications.is_empty() {
            return;
        }

        self.queue.lock().extend(notifications);
        if self.draining.swap(true, Ordering::Acquire) {
            return;
        }

        while let Some(notification) = self.pop() {
            self.deliver(&notification);
        }

        self.draining.store(false, Ordering::Release);
    }

    fn pop(&self) -> Option<Notification<K, V>> {
        self.queue.lock().pop_front()
    }

    fn deliver(&self, notification: &Notification<K, V>) {
        // Observers connected or disconnected from within a callback take effect for the next notification.
        let observers: Vec<_> = self.entries.read().iter().map(|(_, observer)| Arc::clone(observer)).collect();

        for observer in &observers {
            let outcome = catch_unwind(AssertUnwindSafe(|| match notification {
                Notification::Added(node, value) => observer.on_value_added(node, value),
                Notification::Removed(node, value) => observer.on_value_removed(node, value),
                Notification::Cleared => observer.on_cache_cleared(),
            }));

            if let Err(panic) = outcome {
                tracing::error!(
                    cache.notification = notification.name(),
                    cache.panic = panic_message(panic.as_ref()),
                    "cache observer panicked"
                );
            }
        }
    }
}

impl<K, V> Disconnect for ObserverSet<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
    fn disconnect(&self, id: u64) {
        self.entries.write().retain(|(entry, _)| *entry != id);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

trait Disconnect: Send + Sync {
    fn disconnect(&self, id: u64);
}

/// Keeps an observer connected to a tracker.
///
/// Dropping the subscription or calling [`unsubscribe`](Self::unsubscribe) disconnects the
/// observer. Use [`detach`](Self::detach) to keep it connected for the tracker's lifetime.
#[must_use = "dropping a subscription disconnects the observer"]
pub struct Subscription {
    observers: Option<Weak<dyn Disconnect>>,
    id: u64,
}

impl Subscription {
    /// Disconnects the observer.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Leaves the observer connected until the tracker is dropped.
    pub fn detach(mut self) {
        self.observers = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.take().and_then(|weak| weak.upgrade()) {
            observers.disconnect(self.id);
        }
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("attached", &self.observers.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::NodeId;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl CacheValueObserver<&'static str, u32> for Recorder {
        fn on_value_added(&self, node: &NodeInfo<&'static str>, value: &u32) {
            self.events.lock().push(format!("added {}={value}", node.key));
        }

        fn on_value_removed(&self, node: &NodeInfo<&'static str>, value: &u32) {
            self.events.lock().push(format!("removed {}={value}", node.key));
        }

        fn on_cache_cleared(&self) {
            self.events.lock().push("cleared".to_string());
        }
    }

    struct Panicker;

    impl CacheValueObserver<&'static str, u32> for Panicker {
        fn on_value_added(&self, _node: &NodeInfo<&'static str>, _value: &u32) {
            panic!("observer failure");
        }
    }

    /// Reports a removal for every value it sees added, from within the callback.
    struct Echo {
        set: Weak<ObserverSet<&'static str, u32>>,
    }

    impl CacheValueObserver<&'static str, u32> for Echo {
        fn on_value_added(&self, node: &NodeInfo<&'static str>, value: &u32) {
            if let Some(set) = self.set.upgrade() {
                set.dispatch(vec![Notification::Removed(node.clone(), *value)]);
            }
        }
    }

    fn info(key: &'static str) -> NodeInfo<&'static str> {
        NodeInfo {
            id: NodeId::new(1),
            key,
            touched_at: Instant::now(),
            slot: 0,
        }
    }

    #[test]
    fn delivers_in_registration_order() {
        let set = ObserverSet::<&'static str, u32>::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        set.connect(Arc::clone(&first) as _).detach();
        set.connect(Arc::clone(&second) as _).detach();

        set.dispatch(vec![
            Notification::Added(info("a"), 1),
            Notification::Removed(info("a"), 1),
            Notification::Cleared,
        ]);

        let expected = vec!["added a=1", "removed a=1", "cleared"];
        assert_eq!(*first.events.lock(), expected);
        assert_eq!(*second.events.lock(), expected);
    }

    #[test]
    fn panicking_observer_does_not_block_others() {
        let set = ObserverSet::<&'static str, u32>::new();
        let recorder = Arc::new(Recorder::default());
        set.connect(Arc::new(Panicker)).detach();
        set.connect(Arc::clone(&recorder) as _).detach();

        set.dispatch(vec![Notification::Added(info("a"), 1)]);

        assert_eq!(*recorder.events.lock(), vec!["added a=1"]);
    }

    #[test]
    fn nested_notifications_wait_for_the_current_one() {
        let set = ObserverSet::<&'static str, u32>::new();
        let before = Arc::new(Recorder::default());
        let after = Arc::new(Recorder::default());
        set.connect(Arc::clone(&before) as _).detach();
        set.connect(Arc::new(Echo { set: Arc::downgrade(&set) })).detach();
        set.connect(Arc::clone(&after) as _).detach();

        set.dispatch(vec![Notification::Added(info("a"), 1), Notification::Cleared]);

        let expected = vec!["added a=1", "cleared", "removed a=1"];
        assert_eq!(*before.events.lock(), expected);
        assert_eq!(*after.events.lock(), expected);
        assert!(set.queue.lock().is_empty());
        assert!(!set.draining.load(Ordering::SeqCst));
    }

    #[test]
    fn dropping_subscription_disconnects() {
        let set = ObserverSet::<&'static str, u32>::new();
        let recorder = Arc::new(Recorder::default());
        let subscription = set.connect(Arc::clone(&recorder) as _);
        assert_eq!(set.len(), 1);

        drop(subscription);
        assert_eq!(set.len(), 0);

        set.dispatch(vec![Notification::Cleared]);
        assert!(recorder.events.lock().is_empty());
    }

    #[test]
    fn unsubscribe_only_removes_its_own_observer() {
        let set = ObserverSet::<&'static str, u32>::new();
        let kept = set.connect(Arc::new(Recorder::default()));
        let removed = set.connect(Arc::new(Recorder::default()));

        removed.unsubscribe();

        assert_eq!(set.len(), 1);
        assert!(format!("{kept:?}").contains("attached: true"));
    }

    #[test]
    fn subscription_outliving_the_set_is_harmless() {
        let set = ObserverSet::<&'static str, u32>::new();
        let subscription = set.connect(Arc::new(Recorder::default()));

        drop(set);
        drop(subscription);
    }

    #[test]
    fn panic_message_handles_payload_kinds() {
        let static_str: Box<dyn Any + Send> = Box::new("static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(42_u8);

        assert_eq!(panic_message(static_str.as_ref()), "static");
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(other.as_ref()), "<non-string panic payload>");
    }
}
