//! Subscription trie
//!
//! A prefix tree keyed by topic level. Filters ending at a node store
//! their subscribers on that node; a trailing `#` stores them in the
//! node's `descendants` slot, which matches every topic at or below it.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

use super::Subscription;

#[derive(Debug, Default)]
struct TrieNode {
    /// Subscribers whose filter ends exactly at this node
    here: Vec<Subscription>,
    /// Subscribers whose filter ends with `#` at this node
    descendants: Vec<Subscription>,
    /// Literal child levels
    children: AHashMap<CompactString, TrieNode>,
    /// Single-level wildcard (+) child
    plus: Option<Box<TrieNode>>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.here.is_empty()
            && self.descendants.is_empty()
            && self.children.is_empty()
            && self.plus.is_none()
    }
}

/// Trie over topic levels mapping filters to subscriber entries
#[derive(Debug, Default)]
pub struct SubscriptionTrie {
    root: TrieNode,
}

impl SubscriptionTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a subscription under its filter. Idempotent per
    /// (client, filter): a re-subscribe replaces the stored QoS.
    pub fn insert(&mut self, subscription: Subscription) {
        let mut node = &mut self.root;
        let mut levels = subscription.filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                upsert(&mut node.descendants, subscription);
                return;
            }

            node = if level == "+" {
                &mut **node.plus.get_or_insert_with(Default::default)
            } else {
                node.children.entry(CompactString::new(level)).or_default()
            };

            if levels.peek().is_none() {
                upsert(&mut node.here, subscription);
                return;
            }
        }
    }

    /// Remove a client's subscription to a filter. Returns whether an
    /// entry was removed; absent filters are not an error.
    pub fn remove(&mut self, filter: &str, client_id: &str) -> bool {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::remove_at(&mut self.root, &levels, client_id)
    }

    fn remove_at(node: &mut TrieNode, levels: &[&str], client_id: &str) -> bool {
        let Some((level, rest)) = levels.split_first() else {
            return false;
        };

        if *level == "#" {
            return remove_entry(&mut node.descendants, client_id);
        }

        let removed = if *level == "+" {
            let Some(child) = node.plus.as_mut() else {
                return false;
            };
            let removed = if rest.is_empty() {
                remove_entry(&mut child.here, client_id)
            } else {
                Self::remove_at(child, rest, client_id)
            };
            if child.is_empty() {
                node.plus = None;
            }
            removed
        } else {
            let Some(child) = node.children.get_mut(*level) else {
                return false;
            };
            let removed = if rest.is_empty() {
                remove_entry(&mut child.here, client_id)
            } else {
                Self::remove_at(child, rest, client_id)
            };
            if child.is_empty() {
                node.children.remove(*level);
            }
            removed
        };

        removed
    }

    /// Remove every subscription of a client, pruning emptied branches
    pub fn remove_client(&mut self, client_id: &str) {
        Self::remove_client_at(&mut self.root, client_id);
    }

    fn remove_client_at(node: &mut TrieNode, client_id: &str) {
        node.here.retain(|s| s.client_id.as_ref() != client_id);
        node.descendants.retain(|s| s.client_id.as_ref() != client_id);

        if let Some(child) = node.plus.as_mut() {
            Self::remove_client_at(child, client_id);
            if child.is_empty() {
                node.plus = None;
            }
        }

        node.children.retain(|_, child| {
            Self::remove_client_at(child, client_id);
            !child.is_empty()
        });
    }

    /// Visit every subscription matching the topic. A given
    /// (client, filter) pair is visited at most once.
    pub fn matches<F>(&self, topic: &str, mut visit: F)
    where
        F: FnMut(&Subscription),
    {
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_at(&self.root, &levels, &mut visit);
    }

    fn matches_at<F>(node: &TrieNode, levels: &[&str], visit: &mut F)
    where
        F: FnMut(&Subscription),
    {
        // A `#` here matches all remaining levels, including none
        for sub in &node.descendants {
            visit(sub);
        }

        let Some((level, rest)) = levels.split_first() else {
            for sub in &node.here {
                visit(sub);
            }
            return;
        };

        // `+` matches exactly one non-empty level
        if !level.is_empty() {
            if let Some(child) = node.plus.as_deref() {
                Self::matches_at(child, rest, visit);
            }
        }

        if let Some(child) = node.children.get(*level) {
            Self::matches_at(child, rest, visit);
        }
    }
}

fn upsert(entries: &mut Vec<Subscription>, subscription: Subscription) {
    if let Some(existing) = entries
        .iter_mut()
        .find(|s| s.client_id == subscription.client_id)
    {
        existing.qos = subscription.qos;
    } else {
        entries.push(subscription);
    }
}

fn remove_entry(entries: &mut Vec<Subscription>, client_id: &str) -> bool {
    let before = entries.len();
    entries.retain(|s| s.client_id.as_ref() != client_id);
    entries.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;

    fn sub(client: &str, filter: &str, qos: QoS) -> Subscription {
        Subscription {
            client_id: client.into(),
            filter: filter.into(),
            qos,
        }
    }

    fn collect(trie: &SubscriptionTrie, topic: &str) -> Vec<(String, QoS)> {
        let mut out = Vec::new();
        trie.matches(topic, |s| out.push((s.client_id.to_string(), s.qos)));
        out.sort();
        out
    }

    #[test]
    fn exact_and_wildcard_matching() {
        let mut trie = SubscriptionTrie::new();
        trie.insert(sub("a", "sport/tennis", QoS::AtMostOnce));
        trie.insert(sub("b", "sport/+", QoS::AtLeastOnce));
        trie.insert(sub("c", "sport/#", QoS::ExactlyOnce));
        trie.insert(sub("d", "#", QoS::AtMostOnce));

        assert_eq!(
            collect(&trie, "sport/tennis"),
            vec![
                ("a".into(), QoS::AtMostOnce),
                ("b".into(), QoS::AtLeastOnce),
                ("c".into(), QoS::ExactlyOnce),
                ("d".into(), QoS::AtMostOnce),
            ]
        );

        // "sport/#" also matches the parent topic
        assert_eq!(
            collect(&trie, "sport"),
            vec![("c".into(), QoS::ExactlyOnce), ("d".into(), QoS::AtMostOnce)]
        );
    }

    #[test]
    fn resubscribe_replaces_qos() {
        let mut trie = SubscriptionTrie::new();
        trie.insert(sub("a", "chat", QoS::AtMostOnce));
        trie.insert(sub("a", "chat", QoS::ExactlyOnce));

        assert_eq!(collect(&trie, "chat"), vec![("a".into(), QoS::ExactlyOnce)]);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut trie = SubscriptionTrie::new();
        trie.insert(sub("a", "x/y", QoS::AtLeastOnce));

        assert!(trie.remove("x/y", "a"));
        assert!(!trie.remove("x/y", "a"));
        assert!(!trie.remove("never/subscribed", "a"));
        assert!(collect(&trie, "x/y").is_empty());
        assert!(trie.root.is_empty());
    }

    #[test]
    fn remove_client_prunes_branches() {
        let mut trie = SubscriptionTrie::new();
        trie.insert(sub("a", "one/+/three", QoS::AtMostOnce));
        trie.insert(sub("a", "deep/nested/filter/#", QoS::AtLeastOnce));
        trie.insert(sub("b", "one/two/three", QoS::AtMostOnce));

        trie.remove_client("a");

        assert_eq!(
            collect(&trie, "one/two/three"),
            vec![("b".into(), QoS::AtMostOnce)]
        );
        assert!(collect(&trie, "deep/nested/filter/x").is_empty());
    }

    #[test]
    fn plus_requires_nonempty_level() {
        let mut trie = SubscriptionTrie::new();
        trie.insert(sub("a", "x/+/z", QoS::AtMostOnce));

        assert_eq!(collect(&trie, "x/y/z"), vec![("a".into(), QoS::AtMostOnce)]);
        assert!(collect(&trie, "x//z").is_empty());
    }

    #[test]
    fn dollar_topics_match_wildcards() {
        let mut trie = SubscriptionTrie::new();
        trie.insert(sub("a", "#", QoS::AtMostOnce));
        trie.insert(sub("b", "+/status", QoS::AtMostOnce));

        assert_eq!(
            collect(&trie, "$SYS/status"),
            vec![("a".into(), QoS::AtMostOnce), ("b".into(), QoS::AtMostOnce)]
        );
    }
}
