// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for cache construction and configuration.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// A boxed error produced by a value factory.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An error observed by callers waiting on a cache value.
///
/// The error is cheap to clone: a single failure is shared by every caller that was
/// waiting on the same in-flight construction.
///
/// A lookup miss is never an error. [`NodeTracker::try_get`](crate::NodeTracker::try_get)
/// and [`NodeTracker::remove`](crate::NodeTracker::remove) report misses through their
/// `Option`/`bool` results.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The value factory returned an error.
    #[error("value construction failed")]
    ConstructionFailed(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// The value factory did not complete within the configured creation timeout.
    #[error("value construction timed out after {0:?}")]
    ConstructionTimedOut(Duration),

    /// The node was removed from the cache before its value was constructed.
    #[error("node was removed before its value was constructed")]
    Removed,

    /// The construction task ended without producing a result, e.g. because the factory panicked.
    #[error("value construction was abandoned")]
    Abandoned,
}

impl Error {
    /// Wraps a factory error.
    ///
    /// # Examples
    ///
    /// ```
    /// use nodecache::Error;
    ///
    /// let error = Error::construction_failed("backend unavailable");
    /// assert!(matches!(error, Error::ConstructionFailed(_)));
    /// ```
    pub fn construction_failed(cause: impl Into<BoxError>) -> Self {
        Self::ConstructionFailed(Arc::from(cause.into()))
    }

    /// Returns `true` if construction exceeded its timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConstructionTimedOut(_))
    }
}

/// A specialized [`Result`] type for cache value lookups.
pub type Result<T> = std::result::Result<T, Error>;

/// Rejected [`CacheSettings`](crate::CacheSettings).
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum SettingsError {
    /// The cache must be able to hold at least one entry.
    #[error("capacity must be at least 1")]
    ZeroCapacity,

    /// Entries must be allowed to live for some time.
    #[error("max age must be greater than zero")]
    ZeroMaxAge,

    /// The minimum residency cannot be longer than the forced eviction horizon.
    #[error("min age ({min_age:?}) must not exceed max age ({max_age:?})")]
    MinAgeExceedsMaxAge {
        /// The configured minimum age.
        min_age: Duration,
        /// The configured maximum age.
        max_age: Duration,
    },

    /// Every construction needs a non-zero time budget.
    #[error("creation timeout must be greater than zero")]
    ZeroCreationTimeout,
}
