// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end cache scenarios.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use nodecache::{BoxError, CacheSettings, CacheValueObserver, Error, NodeInfo, NodeTracker};
use parking_lot::Mutex;
use tick::ClockControl;

#[derive(Default)]
struct Journal {
    added: AtomicUsize,
    removed: AtomicUsize,
    cleared: AtomicUsize,
}

impl<V> CacheValueObserver<&'static str, V> for Journal {
    fn on_value_added(&self, _node: &NodeInfo<&'static str>, _value: &V) {
        self.added.fetch_add(1, Ordering::SeqCst);
    }

    fn on_value_removed(&self, _node: &NodeInfo<&'static str>, _value: &V) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_cache_cleared(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }
}

struct Removals(Arc<Mutex<Vec<&'static str>>>);

impl CacheValueObserver<&'static str, u32> for Removals {
    fn on_value_removed(&self, node: &NodeInfo<&'static str>, _value: &u32) {
        self.0.lock().push(node.key);
    }
}

#[tokio::test]
async fn min_age_grace_beats_capacity() {
    let control = ClockControl::new();
    let settings = CacheSettings::new(2, Duration::from_secs(1), Duration::from_secs(60)).expect("valid settings");
    let tracker = NodeTracker::<&'static str, u32>::with_clock(settings, control.to_clock());
    let start = control.to_clock().instant();

    for (key, value) in [("a", 1), ("b", 2), ("c", 3)] {
        tracker.get_or_add(key, move || async move { Ok::<_, BoxError>(value) }).await.expect("value");
    }

    let report = tracker.sweep(start + Duration::from_millis(100));
    assert_eq!(report.displaced, 0);
    assert_eq!(tracker.len(), 3);

    let report = tracker.sweep(start + Duration::from_millis(1_100));
    assert_eq!(report.displaced, 1);
    assert_eq!(report.remaining, 2);
    assert_eq!(tracker.len(), 2);
}

#[tokio::test]
async fn concurrent_callers_receive_the_same_instance() {
    let tracker = NodeTracker::<&'static str, Arc<u64>>::new(CacheSettings::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let slow_factory = |calls: Arc<AtomicUsize>| {
        move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, BoxError>(Arc::new(42))
        }
    };

    let first = tracker.get_or_add("x", slow_factory(Arc::clone(&calls)));
    let second = tracker.get_or_add("x", slow_factory(Arc::clone(&calls)));
    let (first, second) = tokio::join!(first, second);

    let (first, second) = (first.expect("value"), second.expect("value"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test(start_paused = true)]
async fn construction_timeout_leaves_nothing_behind() {
    let settings = CacheSettings::builder()
        .creation_timeout(Duration::from_millis(50))
        .build()
        .expect("valid settings");
    let tracker = NodeTracker::<&'static str, String>::new(settings);

    let result = tracker
        .get_or_add("y", || async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, BoxError>("late".to_string())
        })
        .await;

    assert!(matches!(result, Err(ref error) if error.is_timeout()));
    assert!(matches!(result, Err(Error::ConstructionTimedOut(_))));
    assert_eq!(tracker.try_get(&"y"), None);
}

#[tokio::test]
async fn clear_notifies_once_without_removals() {
    let tracker = NodeTracker::<&'static str, u32>::new(CacheSettings::default());
    let journal = Arc::new(Journal::default());
    let _subscription = tracker.connect(Arc::<_>::clone(&journal) as _);

    tracker.get_or_add("z", || async { Ok::<_, BoxError>(26) }).await.expect("value");
    tracker.clear();

    assert_eq!(journal.added.load(Ordering::SeqCst), 1);
    assert_eq!(journal.cleared.load(Ordering::SeqCst), 1);
    assert_eq!(journal.removed.load(Ordering::SeqCst), 0);
    assert_eq!(tracker.try_get(&"z"), None);
}

#[tokio::test]
async fn every_eviction_path_is_reported() {
    let control = ClockControl::new();
    let settings = CacheSettings::new(1, Duration::ZERO, Duration::from_secs(10)).expect("valid settings");
    let tracker = NodeTracker::<&'static str, u32>::with_clock(settings, control.to_clock());
    let removed = Arc::new(Mutex::new(Vec::new()));

    let _subscription = tracker.connect(Arc::new(Removals(Arc::clone(&removed))));

    for (key, value) in [("explicit", 1), ("pressured", 2)] {
        tracker.get_or_add(key, move || async move { Ok::<_, BoxError>(value) }).await.expect("value");
        control.advance(Duration::from_secs(1));
    }
    assert!(tracker.remove(&"explicit"));

    tracker.get_or_add("expiring", || async { Ok::<_, BoxError>(3) }).await.expect("value");
    assert_eq!(tracker.sweep_now().displaced, 1);

    control.advance(Duration::from_secs(10));
    assert_eq!(tracker.sweep_now().expired, 1);

    assert_eq!(*removed.lock(), vec!["explicit", "pressured", "expiring"]);
    assert!(tracker.is_empty());
}
