// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Lookup and lifecycle counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    creates: AtomicU64,
    create_faults: AtomicU64,
    evictions: AtomicU64,
}

impl Counters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn created(&self) {
        self.creates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn create_fault(&self) {
        self.create_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn evicted(&self, count: usize) {
        self.evictions.fetch_add(u64::try_from(count).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, count: usize) -> CacheStatistics {
        CacheStatistics {
            count: u64::try_from(count).unwrap_or(u64::MAX),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            creates: self.creates.load(Ordering::Relaxed),
            create_faults: self.create_faults.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time view of a tracker's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct CacheStatistics {
    /// Nodes currently indexed, resolved or not.
    pub count: u64,
    /// Lookups served by an existing node, resolved or still constructing.
    pub hits: u64,
    /// Lookups that found no node.
    pub misses: u64,
    /// Constructions that produced a value.
    pub creates: u64,
    /// Constructions that failed, timed out or were abandoned.
    pub create_faults: u64,
    /// Resolved nodes evicted by a sweep or removed explicitly.
    pub evictions: u64,
}

impl CacheStatistics {
    /// Fraction of lookups served by an existing node, or `None` before the first lookup.
    #[must_use]
    #[expect(clippy::cast_precision_loss, reason = "an approximate ratio is all we need")]
    pub fn hit_ratio(&self) -> Option<f64> {
        let lookups = self.hits.saturating_add(self.misses);
        (lookups > 0).then(|| self.hits as f64 / lookups as f64)
    }
}
