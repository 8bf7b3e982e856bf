//! Two-tier subscription registry and fan-out walks.

use std::collections::{HashMap, HashSet};

use crate::transport::ClientHandle;

/// Per-topic subscriber sets: one topic-wide, one per instance.
#[derive(Debug, Default)]
struct TopicSubscribers {
    topic_wide: HashSet<ClientHandle>,
    per_instance: HashMap<String, HashSet<ClientHandle>>,
}

/// Registry of which client is interested in which topic or instance.
///
/// Subscriptions are additive: the protocol declares `unsub` but has no
/// working removal, so entries live as long as the registry. Iteration
/// order within one tier is unspecified.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    topics: HashMap<String, TopicSubscribers>,
}

impl SubscriptionIndex {
    /// An empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client` for a whole topic, or for one instance when
    /// `instance` is given. Re-subscribing at the same tier is a no-op.
    pub fn subscribe(&mut self, topic: &str, instance: Option<&str>, client: ClientHandle) {
        let subscribers = self.topics.entry(topic.to_string()).or_default();
        match instance {
            Some(id) => {
                tracing::info!(topic, id, client = %client, "Subscribed to instance");
                subscribers
                    .per_instance
                    .entry(id.to_string())
                    .or_default()
                    .insert(client);
            }
            None => {
                tracing::info!(topic, client = %client, "Subscribed to topic");
                subscribers.topic_wide.insert(client);
            }
        }
    }

    /// Visit everyone who should see a mutation of `(topic, id)`:
    /// the instance-scoped set first, then every topic-wide subscriber
    /// unconditionally. A client registered in both tiers is visited
    /// twice.
    pub fn fan_out_mutation(
        &self,
        topic: &str,
        id: &str,
        mut deliver: impl FnMut(&ClientHandle),
    ) {
        if let Some(subscribers) = self.topics.get(topic) {
            if let Some(scoped) = subscribers.per_instance.get(id) {
                for client in scoped {
                    deliver(client);
                }
            }
            for client in &subscribers.topic_wide {
                deliver(client);
            }
        }
    }

    /// Visit the topic-wide subscribers of `topic` for a brand-new
    /// instance. A fresh instance cannot have instance-scoped
    /// subscribers yet, so that tier is skipped.
    pub fn fan_out_new_instance(&self, topic: &str, mut deliver: impl FnMut(&ClientHandle)) {
        if let Some(subscribers) = self.topics.get(topic) {
            for client in &subscribers.topic_wide {
                deliver(client);
            }
        }
    }
}
