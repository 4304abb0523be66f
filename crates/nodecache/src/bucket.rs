// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Ring of time buckets grouping node keys by when they were last touched.
//!
//! Time is cut into slices of fixed width measured from the ring's epoch; slice `n`
//! covers `[epoch + n * width, epoch + (n + 1) * width)`. The ring holds the most recent
//! `len` slices ending at the cursor, bucket `n % len` holding slice `n`. A key sits in
//! the bucket of the slice it was last touched in, or in the oldest resident bucket if
//! that slice has already left the ring.

use std::collections::HashSet;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Bucket<K> {
    slot: u64,
    members: HashSet<K>,
}

#[derive(Debug)]
pub(crate) struct BucketRing<K> {
    buckets: Vec<Bucket<K>>,
    epoch: Instant,
    width: Duration,
    cursor: u64,
}

impl<K> BucketRing<K>
where
    K: Clone + Eq + Hash,
{
    pub(crate) fn new(epoch: Instant, width: Duration, len: usize) -> Self {
        let len = len.max(1);

        Self {
            buckets: (0..len)
                .map(|_| Bucket {
                    slot: 0,
                    members: HashSet::new(),
                })
                .collect(),
            epoch,
            width: width.max(Duration::from_nanos(1)),
            cursor: 0,
        }
    }

    /// The slice `at` falls into. Instants before the epoch map to slice zero.
    pub(crate) fn slot_of(&self, at: Instant) -> u64 {
        let elapsed = at.saturating_duration_since(self.epoch).as_nanos();
        u64::try_from(elapsed / self.width.as_nanos()).unwrap_or(u64::MAX)
    }

    /// Start of slice `slot`.
    pub(crate) fn lower_bound(&self, slot: u64) -> Instant {
        self.instant_at(slot)
    }

    /// End (exclusive) of slice `slot`.
    pub(crate) fn upper_bound(&self, slot: u64) -> Instant {
        self.instant_at(slot.saturating_add(1))
    }

    fn instant_at(&self, slot: u64) -> Instant {
        let nanos = u128::from(slot).saturating_mul(self.width.as_nanos());
        let offset = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
        self.epoch.checked_add(offset).unwrap_or(self.epoch + Duration::from_secs(u64::from(u32::MAX)))
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> u64 {
        self.cursor
    }

    pub(crate) fn oldest_slot(&self) -> u64 {
        (self.cursor + 1).saturating_sub(self.len())
    }

    /// Resident slices, oldest first.
    pub(crate) fn slots(&self) -> impl Iterator<Item = u64> + use<K> {
        self.oldest_slot()..=self.cursor
    }

    fn len(&self) -> u64 {
        u64::try_from(self.buckets.len()).unwrap_or(u64::MAX)
    }

    fn index_of(&self, slot: u64) -> usize {
        // The remainder is below the bucket count, which came from a usize.
        usize::try_from(slot % self.len()).unwrap_or_default()
    }

    /// Moves the cursor forward to the slice containing `now`.
    ///
    /// Returns the keys of buckets whose slices fell out of the ring. They are no longer
    /// members of any bucket; the caller re-homes the ones it still tracks.
    #[must_use]
    pub(crate) fn advance(&mut self, now: Instant) -> Vec<K> {
        let target = self.slot_of(now);
        if target <= self.cursor {
            return Vec::new();
        }

        let first = (self.cursor + 1).max((target + 1).saturating_sub(self.len()));
        let mut displaced = Vec::new();

        for slot in first..=target {
            let index = self.index_of(slot);
            let bucket = &mut self.buckets[index];
            displaced.extend(bucket.members.drain());
            bucket.slot = slot;
        }

        self.cursor = target;
        displaced
    }

    /// Adds `key` to the bucket for `slot`, clamped to the resident slices.
    ///
    /// Returns the slice actually used.
    pub(crate) fn insert(&mut self, key: K, slot: u64) -> u64 {
        let slot = slot.clamp(self.oldest_slot(), self.cursor);
        let index = self.index_of(slot);
        let bucket = &mut self.buckets[index];

        debug_assert!(
            bucket.slot == slot || bucket.members.is_empty(),
            "bucket {index} holds slice {} but slice {slot} was requested",
            bucket.slot
        );

        bucket.slot = slot;
        bucket.members.insert(key);
        slot
    }

    /// Removes `key` from the bucket for `slot`. Returns whether it was a member.
    pub(crate) fn remove(&mut self, key: &K, slot: u64) -> bool {
        let index = self.index_of(slot);
        let bucket = &mut self.buckets[index];
        bucket.slot == slot && bucket.members.remove(key)
    }

    /// Members of the bucket for `slot`.
    pub(crate) fn members(&self, slot: u64) -> impl Iterator<Item = &K> {
        let bucket = &self.buckets[self.index_of(slot)];
        let resident = bucket.slot == slot;
        bucket.members.iter().filter(move |_| resident)
    }

    /// Empties the bucket for `slot`, returning its members.
    pub(crate) fn take(&mut self, slot: u64) -> Vec<K> {
        let index = self.index_of(slot);
        let bucket = &mut self.buckets[index];
        if bucket.slot != slot {
            return Vec::new();
        }
        bucket.members.drain().collect()
    }

    /// Total number of keys across all buckets.
    #[cfg(test)]
    pub(crate) fn member_count(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.members.len()).sum()
    }

    pub(crate) fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.members.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIDTH: Duration = Duration::from_secs(1);

    fn ring(len: usize) -> (BucketRing<&'static str>, Instant) {
        let epoch = Instant::now();
        (BucketRing::new(epoch, WIDTH, len), epoch)
    }

    #[test]
    fn slot_of_counts_whole_slices() {
        let (ring, epoch) = ring(4);

        assert_eq!(ring.slot_of(epoch), 0);
        assert_eq!(ring.slot_of(epoch + Duration::from_millis(999)), 0);
        assert_eq!(ring.slot_of(epoch + Duration::from_secs(1)), 1);
        assert_eq!(ring.slot_of(epoch + Duration::from_millis(7_500)), 7);
    }

    #[test]
    fn bounds_enclose_the_slice() {
        let (ring, epoch) = ring(4);

        assert_eq!(ring.lower_bound(3), epoch + Duration::from_secs(3));
        assert_eq!(ring.upper_bound(3), epoch + Duration::from_secs(4));
    }

    #[test]
    fn insert_and_remove_track_membership() {
        let (mut ring, _) = ring(4);

        assert_eq!(ring.insert("a", 0), 0);
        assert_eq!(ring.members(0).count(), 1);

        assert!(ring.remove(&"a", 0));
        assert!(!ring.remove(&"a", 0));
        assert_eq!(ring.member_count(), 0);
    }

    #[test]
    fn advance_moves_cursor_without_displacing_resident_slices() {
        let (mut ring, epoch) = ring(4);
        ring.insert("a", 0);

        let displaced = ring.advance(epoch + Duration::from_secs(3));

        assert!(displaced.is_empty());
        assert_eq!(ring.cursor(), 3);
        assert_eq!(ring.slots().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(ring.members(0).copied().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn advance_displaces_slices_leaving_the_ring() {
        let (mut ring, epoch) = ring(4);
        ring.insert("a", 0);
        assert!(ring.advance(epoch + Duration::from_secs(1)).is_empty());
        ring.insert("b", 1);

        let displaced = ring.advance(epoch + Duration::from_secs(4));

        assert_eq!(displaced, vec!["a"]);
        assert_eq!(ring.oldest_slot(), 1);
        assert_eq!(ring.members(1).copied().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(ring.members(0).count(), 0);
    }

    #[test]
    fn advance_far_ahead_displaces_everything() {
        let (mut ring, epoch) = ring(3);
        ring.insert("a", 0);

        let mut displaced = ring.advance(epoch + Duration::from_secs(100));
        displaced.sort_unstable();

        assert_eq!(displaced, vec!["a"]);
        assert_eq!(ring.cursor(), 100);
        assert_eq!(ring.slots().collect::<Vec<_>>(), vec![98, 99, 100]);
    }

    #[test]
    fn advance_backwards_is_a_no_op() {
        let (mut ring, epoch) = ring(3);
        assert!(ring.advance(epoch + Duration::from_secs(5)).is_empty());

        assert!(ring.advance(epoch + Duration::from_secs(2)).is_empty());
        assert_eq!(ring.cursor(), 5);
    }

    #[test]
    fn insert_clamps_to_resident_slices() {
        let (mut ring, epoch) = ring(3);
        assert!(ring.advance(epoch + Duration::from_secs(10)).is_empty());

        assert_eq!(ring.insert("old", 2), 8);
        assert_eq!(ring.insert("future", 42), 10);
        assert_eq!(ring.members(8).copied().collect::<Vec<_>>(), vec!["old"]);
    }

    #[test]
    fn take_and_clear_empty_buckets() {
        let (mut ring, epoch) = ring(3);
        ring.insert("a", 0);
        ring.insert("b", 0);
        assert!(ring.advance(epoch + Duration::from_secs(1)).is_empty());
        ring.insert("c", 1);

        let mut taken = ring.take(0);
        taken.sort_unstable();
        assert_eq!(taken, vec!["a", "b"]);
        assert_eq!(ring.member_count(), 1);

        ring.clear();
        assert_eq!(ring.member_count(), 0);
    }

    #[test]
    fn stale_slot_lookups_see_nothing() {
        let (mut ring, epoch) = ring(2);
        ring.insert("a", 0);
        assert_eq!(ring.advance(epoch + Duration::from_secs(2)), vec!["a"]);
        ring.insert("b", 2);

        assert_eq!(ring.members(0).count(), 0);
        assert!(ring.take(0).is_empty());
        assert!(!ring.remove(&"b", 0));
    }
}
