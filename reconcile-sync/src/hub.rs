//! Per-key subscriber fan-out.
//!
//! Every commit for a key is delivered, in commit order, to each live
//! subscriber of that key. Each subscriber owns an unbounded channel so a
//! slow consumer never drops a commit and never blocks the pipeline.
//! Dropping or closing a [`Subscription`] unregisters it; dead channels are
//! pruned on the next notification.

use crate::store::SynchronizedData;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// A subscriber's handle on one key.
#[derive(Debug)]
pub struct Subscription<T> {
    key: String,
    subscriber_id: String,
    rx: mpsc::UnboundedReceiver<SynchronizedData<T>>,
}

impl<T> Subscription<T> {
    /// The key this subscription follows.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The subscriber's identifier.
    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Waits for the next commit. Returns `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<SynchronizedData<T>> {
        self.rx.recv().await
    }

    /// Returns the next commit if one is already buffered.
    pub fn try_recv(&mut self) -> Option<SynchronizedData<T>> {
        self.rx.try_recv().ok()
    }

    /// Stops receiving. Buffered commits can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Registry of subscribers per key.
#[derive(Debug)]
pub struct SubscriptionHub<T> {
    topics: HashMap<String, HashMap<String, mpsc::UnboundedSender<SynchronizedData<T>>>>,
}

impl<T: Clone> SubscriptionHub<T> {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self {
            topics: HashMap::new(),
        }
    }

    /// Registers a subscriber for a key. Re-subscribing with the same id
    /// replaces (and closes) the previous handle.
    pub fn subscribe(&mut self, key: &str, subscriber_id: &str) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let replaced = self
            .topics
            .entry(key.to_string())
            .or_default()
            .insert(subscriber_id.to_string(), tx);
        if replaced.is_some() {
            debug!("Subscriber {} re-subscribed to key {}", subscriber_id, key);
        }
        Subscription {
            key: key.to_string(),
            subscriber_id: subscriber_id.to_string(),
            rx,
        }
    }

    /// Unregisters a subscriber. Returns whether it was registered.
    pub fn unsubscribe(&mut self, key: &str, subscriber_id: &str) -> bool {
        let Some(subscribers) = self.topics.get_mut(key) else {
            return false;
        };
        let removed = subscribers.remove(subscriber_id).is_some();
        if subscribers.is_empty() {
            self.topics.remove(key);
        }
        removed
    }

    /// Delivers a commit to every live subscriber of `key`. Returns the
    /// number of subscribers reached.
    pub fn notify(&mut self, key: &str, value: &SynchronizedData<T>) -> usize {
        let Some(subscribers) = self.topics.get_mut(key) else {
            return 0;
        };

        subscribers.retain(|id, tx| {
            let delivered = tx.send(value.clone()).is_ok();
            if !delivered {
                debug!("Pruning closed subscriber {} on key {}", id, key);
            }
            delivered
        });

        let reached = subscribers.len();
        if subscribers.is_empty() {
            self.topics.remove(key);
        }
        reached
    }

    /// Ids of the live subscribers of a key.
    pub fn subscribers(&self, key: &str) -> Vec<String> {
        self.topics
            .get(key)
            .map(|subs| {
                subs.iter()
                    .filter(|(_, tx)| !tx.is_closed())
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of live subscriptions across all keys.
    pub fn subscriber_count(&self) -> usize {
        self.topics
            .values()
            .flat_map(HashMap::values)
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

impl<T: Clone> Default for SubscriptionHub<T> {
    fn default() -> Self {
        Self::new()
    }
}
