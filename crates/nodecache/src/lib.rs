// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A self-populating, bounded async cache with single-flight construction.
//!
//! [`NodeTracker`] maps keys to nodes. A node is first *unresolved*, while an asynchronous
//! factory constructs its value, and then *resolved*, holding the value in a time bucket.
//! Concurrent requests for the same key share one construction; every waiter sees the same
//! value or the same error.
//!
//! # Eviction
//!
//! Resolved values are grouped into buckets by the time slice in which they were last
//! touched. Each [`sweep`](NodeTracker::sweep):
//!
//! 1. evicts every value untouched for at least `max_age`, then
//! 2. while the cache holds more than `capacity` nodes, evicts the least recently touched
//!    values that have been idle for at least `min_age`.
//!
//! `max_age` always wins over `min_age`. Sweeps run on demand or periodically through a
//! [`SweepDriver`].
//!
//! # Observers
//!
//! Anything implementing [`CacheValueObserver`] can [`connect`](NodeTracker::connect) to a
//! tracker to learn when values are added, removed or when the cache is cleared.
//! Notifications are delivered before waiters are woken, and a panicking observer does not
//! prevent delivery to the others.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use nodecache::{CacheSettings, NodeTracker};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = CacheSettings::builder()
//!     .capacity(1_000)
//!     .min_age(Duration::from_secs(10))
//!     .max_age(Duration::from_secs(600))
//!     .build()?;
//!
//! let tracker = NodeTracker::<u64, String>::new(settings);
//!
//! let user = tracker
//!     .get_or_add(42, || async { Ok::<_, std::io::Error>("ada".to_string()) })
//!     .await?;
//! assert_eq!(user, "ada");
//!
//! // Joins the resolved node; the factory is never called.
//! let again = tracker
//!     .get_or_add(42, || async { Err::<String, _>(std::io::Error::other("not called")) })
//!     .await?;
//! assert_eq!(again, "ada");
//!
//! let report = tracker.sweep_now();
//! assert_eq!(report.remaining, 1);
//! # Ok(())
//! # }
//! ```

mod bucket;
mod driver;
mod error;
mod node;
mod observer;
mod pending;
mod settings;
mod statistics;
mod tracker;

pub use driver::SweepDriver;
pub use error::{BoxError, Error, Result, SettingsError};
pub use node::{NodeId, NodeInfo, ValueFuture};
pub use observer::{CacheValueObserver, Subscription};
pub use pending::{NodeValueFactory, PendingValue};
pub use settings::{CacheSettings, CacheSettingsBuilder};
pub use statistics::CacheStatistics;
pub use tracker::{NodeTracker, SweepReport};
