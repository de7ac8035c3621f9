//! Topic matching and the subscription index
//!
//! Validation and the pure matcher live in [`validation`]; the trie in
//! [`trie`]. [`SubscriptionIndex`] is the thread-safe index the
//! processor queries on every publish: readers run concurrently,
//! writers serialize on the trie lock.

mod trie;
pub mod validation;

pub use trie::SubscriptionTrie;
pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use std::sync::Arc;

use parking_lot::RwLock;

use crate::protocol::QoS;

/// A subscription: one client's interest in one topic filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub client_id: Arc<str>,
    pub filter: Arc<str>,
    /// Requested (granted) QoS; the delivery QoS is the minimum of this
    /// and the publish QoS
    pub qos: QoS,
}

/// Thread-safe subscription index
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    trie: RwLock<SubscriptionTrie>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription; re-subscribing to the same filter replaces
    /// the stored QoS.
    pub fn add(&self, client_id: Arc<str>, filter: Arc<str>, qos: QoS) {
        self.trie.write().insert(Subscription {
            client_id,
            filter,
            qos,
        });
    }

    /// Remove one subscription; absent filters are not an error.
    pub fn remove(&self, filter: &str, client_id: &str) -> bool {
        self.trie.write().remove(filter, client_id)
    }

    /// Remove every subscription held by a client.
    pub fn remove_client(&self, client_id: &str) {
        self.trie.write().remove_client(client_id);
    }

    /// All subscriptions matching a topic. A (client, filter) pair
    /// appears at most once.
    pub fn matches(&self, topic: &str) -> Vec<Subscription> {
        let trie = self.trie.read();
        let mut out = Vec::new();
        trie.matches(topic, |sub| out.push(sub.clone()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_dedups_per_client_and_filter() {
        let index = SubscriptionIndex::new();
        index.add("c".into(), "a/b".into(), QoS::AtMostOnce);
        index.add("c".into(), "a/b".into(), QoS::ExactlyOnce);

        let matches = index.matches("a/b");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].qos, QoS::ExactlyOnce);
    }

    #[test]
    fn overlapping_filters_yield_one_entry_each() {
        let index = SubscriptionIndex::new();
        index.add("c".into(), "a/+".into(), QoS::AtMostOnce);
        index.add("c".into(), "a/#".into(), QoS::AtLeastOnce);

        // Two filters, two entries; the router collapses them per client
        let matches = index.matches("a/b");
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|s| s.client_id.as_ref() == "c"));
    }

    #[test]
    fn remove_client_clears_everything() {
        let index = SubscriptionIndex::new();
        index.add("c".into(), "x".into(), QoS::AtMostOnce);
        index.add("c".into(), "y/#".into(), QoS::AtMostOnce);
        index.remove_client("c");

        assert!(index.matches("x").is_empty());
        assert!(index.matches("y/z").is_empty());
    }
}
