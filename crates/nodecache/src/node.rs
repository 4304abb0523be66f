// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cache slots and their lifecycle.
//!
//! A node starts [`Unresolved`](Node::Unresolved) while its value is being constructed and
//! becomes [`Resolved`](Node::Resolved) once the value arrives. Eviction detaches the node
//! from the tracker; values already handed out stay valid.

use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::future::{BoxFuture, Either, Ready, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::{Error, Result};

/// Identity of a node, unique for the lifetime of its tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw identifier.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Describes a resolved node to observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo<K> {
    /// Node identity.
    pub id: NodeId,
    /// Key the node is indexed under.
    pub key: K,
    /// When the node was last added or touched.
    pub touched_at: Instant,
    /// Time slice of the bucket holding the node.
    pub slot: u64,
}

pub(crate) type SharedResult<V> = Shared<BoxFuture<'static, Result<V>>>;

/// One-shot completion shared by the construction task and the node.
///
/// Whoever completes first wins; later completions are ignored.
pub(crate) struct Completion<V> {
    sender: Arc<Mutex<Option<oneshot::Sender<Result<V>>>>>,
}

impl<V> Clone for Completion<V> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
        }
    }
}

impl<V> Completion<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates the completion and the future every waiter subscribes to.
    pub(crate) fn new() -> (Self, SharedResult<V>) {
        let (sender, receiver) = oneshot::channel();
        let shared = receiver
            .map(|received| received.unwrap_or(Err(Error::Abandoned)))
            .boxed()
            .shared();

        (
            Self {
                sender: Arc::new(Mutex::new(Some(sender))),
            },
            shared,
        )
    }

    /// Publishes `result` to all waiters. Returns `false` if already completed.
    pub(crate) fn complete(&self, result: Result<V>) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            return false;
        };

        // Nobody listening is fine, the shared future may have been dropped by every caller.
        _ = sender.send(result);
        true
    }
}

/// Completes with [`Error::Abandoned`] if the construction task is dropped before it finishes.
pub(crate) struct CompletionGuard<V>
where
    V: Clone + Send + Sync + 'static,
{
    completion: Completion<V>,
}

impl<V> CompletionGuard<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(completion: Completion<V>) -> Self {
        Self { completion }
    }

    pub(crate) fn completion(&self) -> &Completion<V> {
        &self.completion
    }
}

impl<V> Drop for CompletionGuard<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.completion.complete(Err(Error::Abandoned));
    }
}

/// A node whose value is still being constructed.
pub(crate) struct FactoryNode<V> {
    pub(crate) id: NodeId,
    pub(crate) generation: u64,
    pub(crate) created_at: Instant,
    pub(crate) timeout: Duration,
    pub(crate) value: SharedResult<V>,
    pub(crate) completion: Completion<V>,
    pub(crate) task: AbortHandle,
}

impl<V> FactoryNode<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Fails all waiters with [`Error::Removed`] and stops the construction.
    pub(crate) fn cancel(self) {
        self.completion.complete(Err(Error::Removed));
        self.task.abort();
    }
}

/// A node holding a materialized value.
#[derive(Debug)]
pub(crate) struct BucketNode<V> {
    pub(crate) id: NodeId,
    pub(crate) value: V,
    pub(crate) touched_at: Instant,
    pub(crate) slot: u64,
}

impl<V> BucketNode<V> {
    pub(crate) fn info<K>(&self, key: K) -> NodeInfo<K> {
        NodeInfo {
            id: self.id,
            key,
            touched_at: self.touched_at,
            slot: self.slot,
        }
    }
}

/// A cache slot.
pub(crate) enum Node<V> {
    Unresolved(FactoryNode<V>),
    Resolved(BucketNode<V>),
}

impl<V> Node<V> {
    pub(crate) fn id(&self) -> NodeId {
        match self {
            Self::Unresolved(node) => node.id,
            Self::Resolved(node) => node.id,
        }
    }
}

impl<V> Debug for Node<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unresolved(node) => f
                .debug_struct("Unresolved")
                .field("id", &node.id)
                .field("generation", &node.generation)
                .field("created_at", &node.created_at)
                .field("timeout", &node.timeout)
                .finish_non_exhaustive(),
            Self::Resolved(node) => f
                .debug_struct("Resolved")
                .field("id", &node.id)
                .field("touched_at", &node.touched_at)
                .field("slot", &node.slot)
                .finish_non_exhaustive(),
        }
    }
}

/// The eventual value of a node.
///
/// Every caller waiting on the same unresolved node polls a clone of the same shared
/// future and observes the same value or the same error. Dropping a `ValueFuture` does
/// not cancel the construction for anyone else.
#[must_use = "futures do nothing unless polled"]
pub struct ValueFuture<V> {
    inner: Either<Ready<Result<V>>, SharedResult<V>>,
}

impl<V> ValueFuture<V> {
    pub(crate) fn ready(result: Result<V>) -> Self {
        Self {
            inner: Either::Left(futures::future::ready(result)),
        }
    }

    pub(crate) fn waiting(shared: SharedResult<V>) -> Self {
        Self {
            inner: Either::Right(shared),
        }
    }
}

impl<V: Clone> Future for ValueFuture<V> {
    type Output = Result<V>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl<V> Debug for ValueFuture<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.inner {
            Either::Left(_) => "ready",
            Either::Right(_) => "waiting",
        };
        f.debug_struct("ValueFuture").field("state", &state).finish()
    }
}
