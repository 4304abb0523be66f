// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Value construction: a key paired with its factory, and the timeout policy that drives it.

use std::fmt::Debug;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, TryFutureExt};

use crate::{BoxError, Error, Result};

type Factory<V> = Box<dyn FnOnce() -> BoxFuture<'static, std::result::Result<V, BoxError>> + Send>;

/// A key paired with the asynchronous producer of its value.
///
/// The producer is not started until the value is constructed by a [`NodeValueFactory`].
pub struct PendingValue<K, V> {
    key: K,
    factory: Factory<V>,
}

impl<K, V> PendingValue<K, V> {
    /// Pairs `key` with `factory`.
    ///
    /// # Examples
    ///
    /// ```
    /// use nodecache::PendingValue;
    ///
    /// let pending = PendingValue::new("config", || async { Ok::<_, std::io::Error>(7_u32) });
    /// assert_eq!(*pending.key(), "config");
    /// ```
    pub fn new<F, Fut, E>(key: K, factory: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self {
            key,
            factory: Box::new(move || factory().map_err(Into::into).boxed()),
        }
    }

    /// The key whose value this produces.
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Debug, V> Debug for PendingValue<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingValue").field("key", &self.key).finish_non_exhaustive()
    }
}

/// Drives a [`PendingValue`] under a timeout.
///
/// The producer is raced against the timeout: the value wins if it arrives first,
/// otherwise the construction fails with [`Error::ConstructionTimedOut`]. A producer
/// error becomes [`Error::ConstructionFailed`].
///
/// # Examples
///
/// ```
/// use nodecache::{NodeValueFactory, PendingValue};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let pending = PendingValue::new("config", || async { Ok::<_, std::io::Error>(7_u32) });
/// let factory = NodeValueFactory::new(pending, Duration::from_secs(1));
///
/// assert_eq!(factory.create().await.ok(), Some(7));
/// # }
/// ```
#[derive(Debug)]
pub struct NodeValueFactory<K, V> {
    pending: PendingValue<K, V>,
    timeout: Duration,
}

impl<K, V> NodeValueFactory<K, V> {
    /// Wraps `pending` with a timeout.
    pub fn new(pending: PendingValue<K, V>, timeout: Duration) -> Self {
        Self { pending, timeout }
    }

    /// The key whose value this produces.
    pub fn key(&self) -> &K {
        self.pending.key()
    }

    /// Time allowed for construction.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Starts the producer and waits for its value or the timeout, whichever comes first.
    ///
    /// Must be awaited within a Tokio runtime with the time driver enabled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConstructionFailed`] if the producer fails and
    /// [`Error::ConstructionTimedOut`] if it does not finish in time.
    pub async fn create(self) -> Result<V> {
        let Self { pending, timeout } = self;

        match tokio::time::timeout(timeout, (pending.factory)()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(cause)) => Err(Error::construction_failed(cause)),
            Err(_elapsed) => Err(Error::ConstructionTimedOut(timeout)),
        }
    }
}
