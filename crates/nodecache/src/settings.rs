// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Immutable configuration for a [`NodeTracker`](crate::NodeTracker).

use std::time::Duration;

use crate::SettingsError;

const DEFAULT_CAPACITY: u64 = 10_000;
const DEFAULT_MIN_AGE: Duration = Duration::from_secs(60);
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_BUCKET_COUNT: u32 = 60;
const DEFAULT_CREATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounds applied by a [`NodeTracker`](crate::NodeTracker).
///
/// - `capacity` is the number of entries the tracker keeps before capacity pressure
///   starts evicting the least recently touched ones.
/// - `min_age` is a grace period: capacity pressure never evicts an entry touched
///   more recently than this.
/// - `max_age` is an absolute ceiling: an entry untouched for this long is evicted
///   by the next sweep, regardless of `min_age`.
///
/// A `CacheSettings` value is always valid; invalid combinations are rejected when it is built.
///
/// # Examples
///
/// ```
/// use nodecache::CacheSettings;
/// use std::time::Duration;
///
/// let settings = CacheSettings::builder()
///     .capacity(500)
///     .min_age(Duration::from_secs(5))
///     .max_age(Duration::from_secs(120))
///     .bucket_count(24)
///     .build()?;
///
/// assert_eq!(settings.slice_width(), Duration::from_secs(5));
/// # Ok::<(), nodecache::SettingsError>(())
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheSettings {
    capacity: u64,
    min_age: Duration,
    max_age: Duration,
    bucket_count: u32,
    creation_timeout: Duration,
}

impl CacheSettings {
    /// Creates settings with the given bounds and default bucket count and creation timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if `capacity` is zero, `max_age` is zero, or `min_age` exceeds `max_age`.
    pub fn new(capacity: u64, min_age: Duration, max_age: Duration) -> Result<Self, SettingsError> {
        Self::builder().capacity(capacity).min_age(min_age).max_age(max_age).build()
    }

    /// Creates a builder initialized with the default settings.
    pub fn builder() -> CacheSettingsBuilder {
        CacheSettingsBuilder::default()
    }

    /// Maximum number of resident entries before capacity pressure applies.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Minimum guaranteed residency since the last touch.
    #[must_use]
    pub fn min_age(&self) -> Duration {
        self.min_age
    }

    /// Forced eviction horizon since the last touch.
    #[must_use]
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Number of time slices covering `max_age`.
    #[must_use]
    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// Time allowed for a single value construction.
    #[must_use]
    pub fn creation_timeout(&self) -> Duration {
        self.creation_timeout
    }

    /// Width of one time slice in the eviction ring.
    #[must_use]
    pub fn slice_width(&self) -> Duration {
        (self.max_age / self.bucket_count).max(Duration::from_nanos(1))
    }

    /// Number of buckets in the ring.
    ///
    /// One slice more than `bucket_count` keeps the slice containing `now - max_age`
    /// resident, plus one for the rounding of `slice_width`.
    pub(crate) fn ring_len(&self) -> usize {
        usize::try_from(self.bucket_count).map_or(usize::MAX, |count| count.saturating_add(2))
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            min_age: DEFAULT_MIN_AGE,
            max_age: DEFAULT_MAX_AGE,
            bucket_count: DEFAULT_BUCKET_COUNT,
            creation_timeout: DEFAULT_CREATION_TIMEOUT,
        }
    }
}

/// Builder for [`CacheSettings`].
#[derive(Clone, Debug)]
#[must_use]
pub struct CacheSettingsBuilder {
    settings: CacheSettings,
}

impl Default for CacheSettingsBuilder {
    fn default() -> Self {
        Self {
            settings: CacheSettings::default(),
        }
    }
}

impl CacheSettingsBuilder {
    /// Sets the maximum number of resident entries.
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.settings.capacity = capacity;
        self
    }

    /// Sets the grace period during which capacity pressure cannot evict an entry.
    pub fn min_age(mut self, min_age: Duration) -> Self {
        self.settings.min_age = min_age;
        self
    }

    /// Sets the age after which an untouched entry is always evicted.
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.settings.max_age = max_age;
        self
    }

    /// Sets how many time slices cover `max_age`.
    ///
    /// More buckets give finer eviction granularity at the cost of a longer ring to sweep.
    /// Zero is treated as one.
    pub fn bucket_count(mut self, bucket_count: u32) -> Self {
        self.settings.bucket_count = bucket_count.max(1);
        self
    }

    /// Sets the time budget for each value construction.
    pub fn creation_timeout(mut self, timeout: Duration) -> Self {
        self.settings.creation_timeout = timeout;
        self
    }

    /// Validates and returns the settings.
    ///
    /// # Errors
    ///
    /// Returns an error if `capacity` is zero, `max_age` is zero, `min_age` exceeds `max_age`,
    /// or the creation timeout is zero.
    pub fn build(self) -> Result<CacheSettings, SettingsError> {
        let settings = self.settings;

        if settings.capacity == 0 {
            return Err(SettingsError::ZeroCapacity);
        }

        if settings.max_age.is_zero() {
            return Err(SettingsError::ZeroMaxAge);
        }

        if settings.min_age > settings.max_age {
            return Err(SettingsError::MinAgeExceedsMaxAge {
                min_age: settings.min_age,
                max_age: settings.max_age,
            });
        }

        if settings.creation_timeout.is_zero() {
            return Err(SettingsError::ZeroCreationTimeout);
        }

        Ok(settings)
    }
}
