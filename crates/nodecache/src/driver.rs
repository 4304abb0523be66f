// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Periodic background sweeping.

use std::hash::Hash;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::{CacheSettings, NodeTracker};

const MIN_INTERVAL: Duration = Duration::from_millis(1);
const MAX_DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Sweeps a [`NodeTracker`] on a fixed interval from a Tokio task.
///
/// The driver holds the tracker weakly: once every tracker handle is dropped, the task
/// ends on its next tick. Dropping the driver stops it.
///
/// # Examples
///
/// ```
/// use nodecache::{CacheSettings, NodeTracker, SweepDriver};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let tracker = NodeTracker::<String, u64>::new(CacheSettings::default());
/// let driver = SweepDriver::spawn(&tracker, SweepDriver::default_interval(tracker.settings()));
///
/// assert!(driver.is_running());
/// driver.stop();
/// # }
/// ```
#[derive(Debug)]
#[must_use = "dropping the driver stops sweeping"]
pub struct SweepDriver {
    task: JoinHandle<()>,
}

impl SweepDriver {
    /// Starts sweeping `tracker` every `interval`, clamped to at least one millisecond.
    ///
    /// The first sweep happens one interval after the driver starts.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn<K, V>(tracker: &NodeTracker<K, V>, interval: Duration) -> Self
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let interval = interval.max(MIN_INTERVAL);
        let tracker = tracker.downgrade();

        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticks.tick().await;

                let Some(tracker) = tracker.upgrade() else {
                    tracing::debug!("tracker dropped, sweep driver exiting");
                    break;
                };

                let report = tracker.sweep_now();
                tracing::trace!(
                    cache.expired = report.expired,
                    cache.displaced = report.displaced,
                    cache.remaining = report.remaining,
                    "periodic sweep"
                );
            }
        });

        Self { task }
    }

    /// A sweep interval suited to `settings`: one bucket slice, at most one second.
    #[must_use]
    pub fn default_interval(settings: &CacheSettings) -> Duration {
        settings.slice_width().clamp(MIN_INTERVAL, MAX_DEFAULT_INTERVAL)
    }

    /// Returns `true` until the driver is stopped or its tracker is dropped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops the driver. A sweep already in progress completes.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for SweepDriver {
    fn drop(&mut self) {
        self.task.abort();
    }
}
