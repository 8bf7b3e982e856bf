//! Push notifications and the local callback registry.

use std::collections::HashMap;
use std::sync::Arc;

use deltacast_proto::FieldMap;
use parking_lot::Mutex;

/// A push notification delivered to subscription callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicEvent {
    /// Fields of an instance changed. `change` holds only the fields
    /// whose values actually differ from before.
    Mutation {
        /// Topic owning the instance.
        topic: String,
        /// Mutated instance.
        id: String,
        /// The changed fields.
        change: FieldMap,
    },
    /// A new instance appeared under the topic.
    NewInstance {
        /// Topic owning the instance.
        topic: String,
        /// Id of the new instance.
        id: String,
    },
}

impl TopicEvent {
    /// Topic the event belongs to.
    #[must_use]
    pub fn topic(&self) -> &str {
        match self {
            Self::Mutation { topic, .. } | Self::NewInstance { topic, .. } => topic,
        }
    }

    /// Instance the event concerns.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Mutation { id, .. } | Self::NewInstance { id, .. } => id,
        }
    }
}

/// A subscription callback. Runs on the reader task, so it should
/// return quickly; spawn anything slow.
pub type EventCallback = Arc<dyn Fn(&TopicEvent) + Send + Sync>;

/// Local mirror of the broker's two-tier subscriber index: per topic, a
/// topic-wide list and an instance-scoped map. Additive only.
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    topics: Mutex<HashMap<String, TopicCallbacks>>,
}

#[derive(Default)]
struct TopicCallbacks {
    topic_wide: Vec<EventCallback>,
    by_instance: HashMap<String, Vec<EventCallback>>,
}

impl CallbackRegistry {
    pub(crate) fn register(&self, topic: &str, instance: Option<&str>, callback: EventCallback) {
        let mut topics = self.topics.lock();
        let entry = topics.entry(topic.to_string()).or_default();
        match instance {
            Some(id) => entry
                .by_instance
                .entry(id.to_string())
                .or_default()
                .push(callback),
            None => entry.topic_wide.push(callback),
        }
    }

    /// Callbacks to run for `event`: the instance-scoped tier first,
    /// then the topic-wide tier. New-instance events only reach the
    /// topic-wide tier. Cloned out of the lock so a callback may itself
    /// register.
    pub(crate) fn matching(&self, event: &TopicEvent) -> Vec<EventCallback> {
        let topics = self.topics.lock();
        let Some(entry) = topics.get(event.topic()) else {
            return Vec::new();
        };
        let mut callbacks = Vec::new();
        if let TopicEvent::Mutation { id, .. } = event {
            if let Some(scoped) = entry.by_instance.get(id) {
                callbacks.extend(scoped.iter().cloned());
            }
        }
        callbacks.extend(entry.topic_wide.iter().cloned());
        callbacks
    }
}
