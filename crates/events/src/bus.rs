//! Keyed publish/subscribe abstraction (mechanics only).
//!
//! A keyed bus fans messages for one key (a job id) out to every live
//! subscriber of that key. It is a best-effort, low-latency convenience layer:
//!
//! - **Lossy**: a subscriber whose buffer is full misses the message
//! - **Producer never blocks**: publishing is a bounded, non-blocking operation
//! - **Per-subscriber FIFO**: each subscriber sees a subsequence of the publish order
//! - **No persistence**: the durable store stays the source of truth
//!
//! Consumers that need the authoritative final state reconcile with the store
//! after their subscription closes or a grace period elapses.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryIter, TryRecvError};
use std::time::Duration;

use thiserror::Error;

/// Bus-level failure.
///
/// Publishing to a key nobody listens to is not an error, and neither is a
/// dropped message. The only failure is process-level: a panic while the
/// registry lock was held.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PubSubError {
    #[error("subscriber registry lock poisoned")]
    Poisoned,
}

/// A subscription to one key of a bus.
///
/// Replayed history (if the bus caches) is buffered before the handle is
/// returned, so the first reads yield it oldest-first. Once the key is
/// unsubscribed, reads drain what is still buffered and then report
/// disconnection.
///
/// ```ignore
/// let subscription = bus.subscribe(&job_id)?;
///
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(state) => forward(state),
///         Err(RecvTimeoutError::Timeout) => continue,  // check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break, // unsubscribed
///     }
/// }
/// ```
///
/// Subscriptions are for single-threaded consumption. A consumer that stops
/// early hands its subscription back through [`KeyedBus::release`].
#[derive(Debug)]
pub struct Subscription<M> {
    id: u64,
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(id: u64, receiver: Receiver<M>) -> Self {
        Self { id, receiver }
    }

    /// Bus-assigned id, unique per bus.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Iterate over what is buffered right now, without blocking.
    pub fn try_iter(&self) -> TryIter<'_, M> {
        self.receiver.try_iter()
    }
}

impl<M> IntoIterator for Subscription<M> {
    type Item = M;
    type IntoIter = std::sync::mpsc::IntoIter<M>;

    /// Blocking iterator ending when the key is unsubscribed.
    fn into_iter(self) -> Self::IntoIter {
        self.receiver.into_iter()
    }
}

/// Keyed pub/sub bus.
///
/// All operations return quickly: `publish` never waits on a consumer and
/// `unsubscribe` cannot fail.
pub trait KeyedBus<K, M>: Send + Sync {
    /// Fan `message` out to the current subscribers of `key`.
    fn publish(&self, key: &K, message: M) -> Result<(), PubSubError>;

    /// Open a new subscription to `key`, pre-filled with any cached history.
    fn subscribe(&self, key: &K) -> Result<Subscription<M>, PubSubError>;

    /// Close every subscription to `key` and forget its history.
    fn unsubscribe(&self, key: &K);

    /// Deregister a single subscription of `key`, leaving others and the
    /// history in place.
    fn release(&self, key: &K, subscription: Subscription<M>);

    /// Whether `key` has cached history (always false without a cache).
    fn has_publisher(&self, key: &K) -> bool;
}

impl<K, M, B> KeyedBus<K, M> for Arc<B>
where
    B: KeyedBus<K, M> + ?Sized,
{
    fn publish(&self, key: &K, message: M) -> Result<(), PubSubError> {
        (**self).publish(key, message)
    }

    fn subscribe(&self, key: &K) -> Result<Subscription<M>, PubSubError> {
        (**self).subscribe(key)
    }

    fn unsubscribe(&self, key: &K) {
        (**self).unsubscribe(key)
    }

    fn release(&self, key: &K, subscription: Subscription<M>) {
        (**self).release(key, subscription)
    }

    fn has_publisher(&self, key: &K) -> bool {
        (**self).has_publisher(key)
    }
}
