// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The cache engine: key index, bucket ring and observer dispatch.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::{Mutex, ReentrantMutex};
use tick::Clock;
use tick::runtime::InactiveClock;

use crate::bucket::BucketRing;
use crate::node::{BucketNode, Completion, CompletionGuard, FactoryNode, Node, SharedResult};
use crate::observer::{Notification, ObserverSet};
use crate::statistics::Counters;
use crate::{
    BoxError, CacheSettings, CacheStatistics, CacheValueObserver, Error, NodeId, NodeInfo, NodeValueFactory, PendingValue, Result,
    Subscription, ValueFuture,
};

/// A self-populating cache bounded by entry count and entry age.
///
/// Values are produced on demand by asynchronous factories. Concurrent requests for the
/// same key share a single construction, and every caller waiting on it observes the
/// same value or the same error.
///
/// Resolved values are grouped into time buckets by when they were last touched.
/// [`sweep`](Self::sweep) evicts buckets that have aged past `max_age`, then evicts the
/// least recently touched values while the cache holds more than `capacity` entries,
/// never touching values younger than `min_age`.
///
/// Cloning a tracker is cheap; clones share the same cache.
///
/// # Runtime
///
/// Constructions run on spawned Tokio tasks, so [`get_or_add`](Self::get_or_add) and
/// [`add`](Self::add) must be called within a Tokio runtime with the time driver enabled.
/// A caller that stops waiting does not cancel the construction for anyone else.
///
/// # Examples
///
/// ```
/// use nodecache::{CacheSettings, NodeTracker};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let settings = CacheSettings::new(100, Duration::from_secs(1), Duration::from_secs(60))?;
/// let tracker = NodeTracker::<&str, String>::new(settings);
///
/// let route = tracker
///     .get_or_add("orders", || async { Ok::<_, std::io::Error>("orders-v2".to_string()) })
///     .await?;
///
/// assert_eq!(route, "orders-v2");
/// assert_eq!(tracker.try_get(&"orders").as_deref(), Some("orders-v2"));
/// # Ok(())
/// # }
/// ```
pub struct NodeTracker<K, V> {
    inner: Arc<TrackerInner<K, V>>,
}

/// What a sweep evicted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct SweepReport {
    /// Values untouched for at least `max_age`.
    pub expired: usize,
    /// Values evicted to bring the cache back within its capacity.
    pub displaced: usize,
    /// Nodes left in the index, resolved or not.
    pub remaining: usize,
}

pub(crate) struct TrackerInner<K, V> {
    settings: CacheSettings,
    clock: Clock,
    // Serializes every operation that publishes notifications. Taken before `state` and held
    // across dispatch; reentrant so observers can call back into the tracker.
    gate: ReentrantMutex<()>,
    state: Mutex<TrackerState<K, V>>,
    observers: Arc<ObserverSet<K, V>>,
    counters: Counters,
    next_id: AtomicU64,
}

struct TrackerState<K, V> {
    index: HashMap<K, Node<V>>,
    ring: BucketRing<K>,
    generation: u64,
}

enum Lookup<V> {
    Resolved(V),
    Pending(SharedResult<V>),
    Missing,
}

impl<K, V> NodeTracker<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty tracker that reads time from the system clock.
    #[must_use]
    pub fn new(settings: CacheSettings) -> Self {
        // Only instants are read from the clock, so its timer driver is not needed.
        let (clock, _driver) = InactiveClock::default().activate();
        Self::with_clock(settings, clock)
    }

    /// Creates an empty tracker that reads time from `clock`.
    ///
    /// The first reading of the clock becomes the epoch of the bucket ring. Pass a clock
    /// obtained from `tick::ClockControl` to age a tracker deterministically in tests.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use nodecache::{CacheSettings, NodeTracker};
    /// use tick::ClockControl;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let control = ClockControl::new();
    /// let settings = CacheSettings::new(10, Duration::ZERO, Duration::from_secs(60))?;
    /// let tracker = NodeTracker::<u32, u32>::with_clock(settings, control.to_clock());
    /// tracker.get_or_add(1, || async { Ok::<_, std::io::Error>(1) }).await?;
    ///
    /// control.advance(Duration::from_secs(60));
    /// assert_eq!(tracker.sweep_now().expired, 1);
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn with_clock(settings: CacheSettings, clock: Clock) -> Self {
        let ring = BucketRing::new(clock.instant(), settings.slice_width(), settings.ring_len());

        Self {
            inner: Arc::new(TrackerInner {
                settings,
                clock,
                gate: ReentrantMutex::new(()),
                state: Mutex::new(TrackerState {
                    index: HashMap::new(),
                    ring,
                    generation: 0,
                }),
                observers: ObserverSet::new(),
                counters: Counters::default(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// The settings this tracker was created with.
    #[must_use]
    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    /// Returns the value for `key`, constructing it with `factory` if no node exists.
    ///
    /// If a node for `key` is already resolved, its value is touched and returned. If it is
    /// still being constructed, the returned future waits on that construction and `factory`
    /// is never called. Otherwise a new node is indexed and `factory` runs exactly once, under
    /// the configured creation timeout.
    ///
    /// On failure the node is removed and every waiter receives the same error; nothing is
    /// retried.
    ///
    /// # Panics
    ///
    /// Panics if a construction has to be started outside a Tokio runtime.
    pub fn get_or_add<F, Fut, E>(&self, key: K, factory: F) -> ValueFuture<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let timeout = self.inner.settings.creation_timeout();
        self.add(NodeValueFactory::new(PendingValue::new(key, factory), timeout))
    }

    /// Like [`get_or_add`](Self::get_or_add), with the construction and its timeout supplied
    /// by the caller.
    ///
    /// # Panics
    ///
    /// Panics if a construction has to be started outside a Tokio runtime.
    pub fn add(&self, factory: NodeValueFactory<K, V>) -> ValueFuture<V> {
        let inner = &self.inner;
        let now = inner.clock.instant();
        let mut state = inner.state.lock();

        match state.lookup(factory.key(), now) {
            Lookup::Resolved(value) => {
                inner.counters.hit();
                return ValueFuture::ready(Ok(value));
            }
            Lookup::Pending(value) => {
                inner.counters.hit();
                return ValueFuture::waiting(value);
            }
            Lookup::Missing => inner.counters.miss(),
        }

        let id = NodeId::new(inner.next_id.fetch_add(1, Ordering::Relaxed));
        let generation = state.generation;
        let key = factory.key().clone();
        let timeout = factory.timeout();
        let (completion, value) = Completion::new();
        let guard = CompletionGuard::new(completion.clone());

        let task = tokio::spawn(Arc::clone(inner).construct(key.clone(), id, generation, factory, guard));

        state.index.insert(
            key,
            Node::Unresolved(FactoryNode {
                id,
                generation,
                created_at: now,
                timeout,
                value: value.clone(),
                completion,
                task: task.abort_handle(),
            }),
        );
        drop(state);

        tracing::trace!(cache.node_id = id.get(), cache.timeout = ?timeout, "construction started");
        ValueFuture::waiting(value)
    }

    /// Returns the value for `key` if it is resolved, touching it.
    ///
    /// Never starts a construction and never waits; a node still under construction reads
    /// as absent.
    #[must_use]
    pub fn try_get(&self, key: &K) -> Option<V> {
        let now = self.inner.clock.instant();
        let lookup = self.inner.state.lock().lookup(key, now);

        if let Lookup::Resolved(value) = lookup {
            self.inner.counters.hit();
            Some(value)
        } else {
            self.inner.counters.miss();
            None
        }
    }

    /// Removes the node for `key`. Returns whether a node was removed.
    ///
    /// Removing a resolved node notifies observers. Removing a node still under construction
    /// stops the construction and fails its waiters with [`Error::Removed`].
    pub fn remove(&self, key: &K) -> bool {
        let _gate = self.inner.gate.lock();
        let Some(node) = self.inner.state.lock().detach(key) else {
            return false;
        };

        match node {
            Detached::Resolved(node, value) => {
                self.inner.counters.evicted(1);
                tracing::debug!(cache.node_id = node.id.get(), "value removed");
                self.inner.observers.dispatch(vec![Notification::Removed(node, value)]);
            }
            Detached::Unresolved(node) => {
                tracing::debug!(cache.node_id = node.id.get(), "construction cancelled");
                node.cancel();
            }
        }

        true
    }

    /// Drops every node and notifies observers once.
    ///
    /// No per-value removal is reported. Constructions already in flight still complete for
    /// their waiters, but their values are not added to the cache.
    pub fn clear(&self) {
        let _gate = self.inner.gate.lock();
        let dropped = {
            let mut state = self.inner.state.lock();
            state.generation = state.generation.wrapping_add(1);
            state.ring.clear();
            std::mem::take(&mut state.index)
        };

        tracing::debug!(cache.dropped = dropped.len(), "cache cleared");
        self.inner.observers.dispatch(vec![Notification::Cleared]);
    }

    /// Connects an observer. It stays connected while the returned subscription is alive.
    pub fn connect(&self, observer: Arc<dyn CacheValueObserver<K, V>>) -> Subscription {
        self.inner.observers.connect(observer)
    }

    /// Evicts values untouched since `now - max_age`, then evicts the least recently touched
    /// values older than `min_age` until the cache is within capacity.
    ///
    /// Every eviction is reported to observers.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        self.inner.sweep(now)
    }

    /// [`sweep`](Self::sweep) at the tracker clock's current time.
    pub fn sweep_now(&self) -> SweepReport {
        self.inner.sweep_now()
    }

    /// Number of indexed nodes, resolved or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().index.len()
    }

    /// Returns `true` if no node is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if a node, resolved or not, is indexed under `key`. Does not touch it.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.state.lock().index.contains_key(key)
    }

    /// A snapshot of the tracker's counters.
    #[must_use]
    pub fn statistics(&self) -> CacheStatistics {
        self.inner.counters.snapshot(self.len())
    }

    pub(crate) fn downgrade(&self) -> Weak<TrackerInner<K, V>> {
        Arc::downgrade(&self.inner)
    }
}

impl<K, V> Clone for NodeTracker<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Debug for NodeTracker<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTracker")
            .field("settings", &self.inner.settings)
            .field("clock", &self.inner.clock)
            .finish_non_exhaustive()
    }
}

impl<K, V> TrackerInner<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn construct(self: Arc<Self>, key: K, id: NodeId, generation: u64, factory: NodeValueFactory<K, V>, guard: CompletionGuard<V>) {
        let result = AssertUnwindSafe(factory.create())
            .catch_unwind()
            .await
            .unwrap_or(Err(Error::Abandoned));

        self.complete(key, id, generation, result, guard.completion());
    }

    /// Moves a finished construction into the cache, if its node is still the indexed one,
    /// then notifies observers and finally wakes the waiters.
    fn complete(&self, key: K, id: NodeId, generation: u64, result: Result<V>, completion: &Completion<V>) {
        let gate = self.gate.lock();
        let now = self.clock.instant();
        let mut notifications = Vec::new();

        let indexed = {
            let mut state = self.state.lock();
            let indexed = state.generation == generation && state.holds(&key, id);

            if indexed {
                match &result {
                    Ok(value) => {
                        let node = state.resolve(key, id, value.clone(), now);
                        notifications.push(Notification::Added(node, value.clone()));
                    }
                    Err(_) => {
                        state.index.remove(&key);
                    }
                }
            }

            indexed
        };

        match &result {
            Ok(_) => {
                self.counters.created();
                tracing::debug!(cache.node_id = id.get(), cache.indexed = indexed, "value resolved");
            }
            Err(error) => {
                self.counters.create_fault();
                tracing::warn!(cache.node_id = id.get(), cache.error = %error, "construction failed");
            }
        }

        self.observers.dispatch(notifications);
        drop(gate);

        completion.complete(result);
    }

    pub(crate) fn sweep(&self, now: Instant) -> SweepReport {
        let _gate = self.gate.lock();
        let mut notifications = Vec::new();
        let report = self.state.lock().sweep(now, &self.settings, &mut notifications);

        let evicted = report.expired + report.displaced;
        if evicted > 0 {
            self.counters.evicted(evicted);
            tracing::debug!(
                cache.expired = report.expired,
                cache.displaced = report.displaced,
                cache.remaining = report.remaining,
                "cache swept"
            );
        }

        self.observers.dispatch(notifications);
        report
    }

    pub(crate) fn sweep_now(&self) -> SweepReport {
        self.sweep(self.clock.instant())
    }
}

enum Detached<K, V> {
    Resolved(NodeInfo<K>, V),
    Unresolved(FactoryNode<V>),
}

impl<K, V> TrackerState<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn holds(&self, key: &K, id: NodeId) -> bool {
        self.index.get(key).is_some_and(|node| node.id() == id)
    }

    fn touched_at(&self, key: &K) -> Option<Instant> {
        match self.index.get(key)? {
            Node::Resolved(node) => Some(node.touched_at),
            Node::Unresolved(_) => None,
        }
    }

    /// Finds the node for `key`, touching it if resolved.
    fn lookup(&mut self, key: &K, now: Instant) -> Lookup<V> {
        self.advance(now);

        match self.index.get_mut(key) {
            None => Lookup::Missing,
            Some(Node::Unresolved(node)) => Lookup::Pending(node.value.clone()),
            Some(Node::Resolved(node)) => {
                node.touched_at = node.touched_at.max(now);

                let slot = self.ring.slot_of(node.touched_at);
                if slot != node.slot {
                    self.ring.remove(key, node.slot);
                    node.slot = self.ring.insert(key.clone(), slot);
                    tracing::trace!(cache.node_id = node.id.get(), cache.slot = node.slot, "value rebound");
                }

                Lookup::Resolved(node.value.clone())
            }
        }
    }

    /// Moves the ring cursor to `now`, re-homing keys whose slices left the ring.
    fn advance(&mut self, now: Instant) {
        let displaced = self.ring.advance(now);
        if displaced.is_empty() {
            return;
        }

        let oldest = self.ring.oldest_slot();
        for key in displaced {
            if let Some(Node::Resolved(node)) = self.index.get_mut(&key) {
                node.slot = self.ring.insert(key, oldest);
            }
        }
    }

    fn resolve(&mut self, key: K, id: NodeId, value: V, now: Instant) -> NodeInfo<K> {
        self.advance(now);

        let slot = self.ring.insert(key.clone(), self.ring.slot_of(now));
        let node = BucketNode {
            id,
            value,
            touched_at: now,
            slot,
        };
        let info = node.info(key.clone());

        self.index.insert(key, Node::Resolved(node));
        info
    }

    fn detach(&mut self, key: &K) -> Option<Detached<K, V>> {
        let (key, node) = self.index.remove_entry(key)?;

        Some(match node {
            Node::Resolved(node) => {
                self.ring.remove(&key, node.slot);
                let info = node.info(key);
                Detached::Resolved(info, node.value)
            }
            Node::Unresolved(node) => Detached::Unresolved(node),
        })
    }

    /// Removes a resolved node. Nodes under construction are left alone.
    fn evict(&mut self, key: K) -> Option<Notification<K, V>> {
        let Entry::Occupied(entry) = self.index.entry(key) else {
            return None;
        };

        if !matches!(entry.get(), Node::Resolved(_)) {
            return None;
        }

        let (key, Node::Resolved(node)) = entry.remove_entry() else {
            return None;
        };

        self.ring.remove(&key, node.slot);
        let info = node.info(key);
        Some(Notification::Removed(info, node.value))
    }

    fn sweep(&mut self, now: Instant, settings: &CacheSettings, notifications: &mut Vec<Notification<K, V>>) -> SweepReport {
        self.advance(now);

        let expired = self.expire(now, settings.max_age(), notifications);
        let displaced = self.relieve_pressure(now, settings, notifications);

        SweepReport {
            expired,
            displaced,
            remaining: self.index.len(),
        }
    }

    /// Evicts every value last touched at or before `now - max_age`.
    fn expire(&mut self, now: Instant, max_age: Duration, notifications: &mut Vec<Notification<K, V>>) -> usize {
        let Some(cutoff) = now.checked_sub(max_age) else {
            return 0;
        };

        let before = notifications.len();
        let oldest = self.ring.oldest_slot();

        for slot in self.ring.slots() {
            if self.ring.upper_bound(slot) <= cutoff {
                for key in self.ring.take(slot) {
                    notifications.extend(self.evict(key));
                }
            } else if slot == oldest || self.ring.lower_bound(slot) <= cutoff {
                // The oldest bucket also holds keys re-homed from slices that left the ring.
                let stale: Vec<K> = self
                    .ring
                    .members(slot)
                    .filter(|key| self.touched_at(key).is_some_and(|touched_at| touched_at <= cutoff))
                    .cloned()
                    .collect();

                for key in stale {
                    notifications.extend(self.evict(key));
                }
            } else {
                break;
            }
        }

        notifications.len() - before
    }

    /// Evicts the least recently touched values older than `min_age` while over capacity.
    fn relieve_pressure(&mut self, now: Instant, settings: &CacheSettings, notifications: &mut Vec<Notification<K, V>>) -> usize {
        let capacity = usize::try_from(settings.capacity()).unwrap_or(usize::MAX);
        let min_age = settings.min_age();
        let before = notifications.len();
        let oldest = self.ring.oldest_slot();

        for slot in self.ring.slots() {
            if self.index.len() <= capacity {
                break;
            }

            // Outside the oldest bucket, members were touched no earlier than the slice start.
            if slot != oldest && now.saturating_duration_since(self.ring.lower_bound(slot)) < min_age {
                break;
            }

            let mut candidates: Vec<(Instant, K)> = self
                .ring
                .members(slot)
                .filter_map(|key| Some((self.touched_at(key)?, key.clone())))
                .collect();
            candidates.sort_by_key(|(touched_at, _)| *touched_at);

            for (touched_at, key) in candidates {
                if self.index.len() <= capacity || now.saturating_duration_since(touched_at) < min_age {
                    break;
                }

                notifications.extend(self.evict(key));
            }
        }

        notifications.len() - before
    }
}
