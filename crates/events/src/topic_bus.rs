//! In-process keyed broadcaster with a bounded per-key replay cache.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{PoisonError, RwLock};

use tracing::{debug, trace};

use crate::bus::{KeyedBus, PubSubError, Subscription};

/// Minimum channel depth of a subscription. A subscription opened on a
/// longer history is sized to hold its whole replay.
pub const SUBSCRIBER_BUFFER: usize = 10;

struct Subscriber<M> {
    id: u64,
    sender: SyncSender<M>,
}

struct Topic<M> {
    subscribers: Vec<Subscriber<M>>,
    history: VecDeque<M>,
}

impl<M> Default for Topic<M> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
            history: VecDeque::new(),
        }
    }
}

impl<M: Clone> Topic<M> {
    /// Non-blocking send to every subscriber. Returns the ids of subscribers
    /// whose receiving side is gone.
    fn fan_out<K: fmt::Debug>(&self, key: &K, message: &M) -> Vec<u64> {
        let mut gone = Vec::new();
        for subscriber in &self.subscribers {
            match subscriber.sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    trace!(key = ?key, subscriber = subscriber.id, "subscriber buffer full, message dropped");
                }
                Err(TrySendError::Disconnected(_)) => gone.push(subscriber.id),
            }
        }
        gone
    }

    fn forget(&mut self, gone: &[u64]) {
        if !gone.is_empty() {
            self.subscribers.retain(|s| !gone.contains(&s.id));
        }
    }

    fn remember(&mut self, message: M, cache_size: usize) {
        self.history.push_back(message);
        while self.history.len() > cache_size {
            self.history.pop_front();
        }
    }

    fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.history.is_empty()
    }
}

/// Process-wide broadcaster keyed by `K`.
///
/// Per key it keeps the subscriber channels and, when `cache_size > 0`, a ring
/// of the last `cache_size` messages replayed to late subscribers.
///
/// One `RwLock` guards the registry. Without a cache `publish` only needs the
/// read lock. With a cache, `publish` takes the write lock so the cache append
/// and the fan-out are atomic with respect to `subscribe`: a new subscriber
/// either finds a message in its replay or receives it live, never both and
/// never neither. Every critical section is bounded; sends are `try_send`.
pub struct TopicBus<K, M> {
    cache_size: usize,
    next_subscriber: AtomicU64,
    topics: RwLock<HashMap<K, Topic<M>>>,
}

impl<K, M> TopicBus<K, M> {
    pub fn new(cache_size: usize) -> Self {
        Self {
            cache_size,
            next_subscriber: AtomicU64::new(0),
            topics: RwLock::new(HashMap::new()),
        }
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }
}

impl<K, M> fmt::Debug for TopicBus<K, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicBus")
            .field("cache_size", &self.cache_size)
            .finish_non_exhaustive()
    }
}

impl<K, M> TopicBus<K, M>
where
    K: Eq + Hash + Clone + fmt::Debug,
    M: Clone,
{
    pub fn publish(&self, key: &K, message: M) -> Result<(), PubSubError> {
        if self.cache_size == 0 {
            let gone = {
                let topics = self.topics.read().map_err(|_| PubSubError::Poisoned)?;
                match topics.get(key) {
                    Some(topic) => topic.fan_out(key, &message),
                    None => return Ok(()),
                }
            };
            if !gone.is_empty() {
                self.prune(key, &gone);
            }
            return Ok(());
        }

        let mut topics = self.topics.write().map_err(|_| PubSubError::Poisoned)?;
        let topic = topics.entry(key.clone()).or_default();
        let gone = topic.fan_out(key, &message);
        topic.forget(&gone);
        topic.remember(message, self.cache_size);
        Ok(())
    }

    pub fn subscribe(&self, key: &K) -> Result<Subscription<M>, PubSubError> {
        let mut topics = self.topics.write().map_err(|_| PubSubError::Poisoned)?;
        let topic = topics.entry(key.clone()).or_default();

        // Sized by the replay actually held, never by the configured cache.
        let (sender, receiver) = mpsc::sync_channel(SUBSCRIBER_BUFFER.max(topic.history.len()));
        for message in &topic.history {
            let _ = sender.try_send(message.clone());
        }

        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        topic.subscribers.push(Subscriber { id, sender });
        debug!(
            key = ?key,
            subscriber = id,
            replayed = topic.history.len(),
            subscribers = topic.subscribers.len(),
            "subscribed"
        );

        Ok(Subscription::new(id, receiver))
    }

    pub fn unsubscribe(&self, key: &K) {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(topic) = topics.remove(key) {
            debug!(
                key = ?key,
                subscribers = topic.subscribers.len(),
                cached = topic.history.len(),
                "unsubscribed"
            );
        }
    }

    /// Drop one subscription. The topic goes away once it has neither
    /// subscribers nor history.
    pub fn release(&self, key: &K, subscription: Subscription<M>) {
        let id = subscription.id();
        self.prune(key, &[id]);
        debug!(key = ?key, subscriber = id, "released");
    }

    pub fn has_publisher(&self, key: &K) -> bool {
        if self.cache_size == 0 {
            return false;
        }
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics.get(key).is_some_and(|topic| !topic.history.is_empty())
    }

    /// Number of live subscriptions registered for `key`.
    pub fn subscriber_count(&self, key: &K) -> usize {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics.get(key).map_or(0, |topic| topic.subscribers.len())
    }

    /// Number of keys with subscribers or cached history.
    pub fn topic_count(&self) -> usize {
        self.topics.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn prune(&self, key: &K, gone: &[u64]) {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        if let Entry::Occupied(mut entry) = topics.entry(key.clone()) {
            entry.get_mut().forget(gone);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
        trace!(key = ?key, pruned = gone.len(), "dropped closed subscriptions");
    }
}

impl<K, M> KeyedBus<K, M> for TopicBus<K, M>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync,
    M: Clone + Send + Sync,
{
    fn publish(&self, key: &K, message: M) -> Result<(), PubSubError> {
        TopicBus::publish(self, key, message)
    }

    fn subscribe(&self, key: &K) -> Result<Subscription<M>, PubSubError> {
        TopicBus::subscribe(self, key)
    }

    fn unsubscribe(&self, key: &K) {
        TopicBus::unsubscribe(self, key)
    }

    fn release(&self, key: &K, subscription: Subscription<M>) {
        TopicBus::release(self, key, subscription)
    }

    fn has_publisher(&self, key: &K) -> bool {
        TopicBus::has_publisher(self, key)
    }
}
