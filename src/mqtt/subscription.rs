use super::message_manager::ArrivedMessage;
use super::topic::TopicPattern;
use rumqttc::QoS;
use std::fmt;
use std::sync::Arc;

/// Called on the worker task for every message routed to a subscription.
pub type Callback = Arc<dyn Fn(&ArrivedMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub qos: QoS,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
        }
    }
}

/// One entry of the subscription table.
pub struct Subscription {
    pub pattern: TopicPattern,
    pub callback: Option<Callback>,
    /// Set once the broker acknowledged the subscribe request
    pub ready: bool,
    pub options: SubscribeOptions,
}

impl Subscription {
    pub fn new(topic: &str, callback: Option<Callback>, options: SubscribeOptions) -> Self {
        Self {
            pattern: TopicPattern::new(topic),
            callback,
            ready: false,
            options,
        }
    }

    pub fn topic(&self) -> &str {
        self.pattern.as_str()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic())
            .field("ready", &self.ready)
            .field("options", &self.options)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Subscriptions in registration order, keyed by their literal topic.
///
/// Dispatch walks the table front to back, so the oldest matching pattern wins.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    entries: Vec<Subscription>,
}

impl SubscriptionTable {
    pub fn get(&self, topic: &str) -> Option<&Subscription> {
        self.entries.iter().find(|s| s.topic() == topic)
    }

    pub fn get_mut(&mut self, topic: &str) -> Option<&mut Subscription> {
        self.entries.iter_mut().find(|s| s.topic() == topic)
    }

    /// Inserts `subscription`, replacing an entry with the same topic in place.
    pub fn insert(&mut self, subscription: Subscription) {
        match self.get_mut(subscription.topic()) {
            Some(existing) => *existing = subscription,
            None => self.entries.push(subscription),
        }
    }

    pub fn remove(&mut self, topic: &str) -> Option<Subscription> {
        let index = self.entries.iter().position(|s| s.topic() == topic)?;
        Some(self.entries.remove(index))
    }

    /// First subscription whose pattern covers `topic`.
    pub fn find_match(&self, topic: &str) -> Option<&Subscription> {
        self.entries.iter().find(|s| s.pattern.matches(topic))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Subscription> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_matching_pattern_wins() {
        let mut table = SubscriptionTable::default();
        table.insert(Subscription::new("a/#", None, SubscribeOptions::default()));
        table.insert(Subscription::new("a/+/c", None, SubscribeOptions::default()));

        assert_eq!(table.find_match("a/b/c").map(Subscription::topic), Some("a/#"));
        assert!(table.find_match("b/c").is_none());
    }

    #[test]
    fn insert_replaces_same_topic_in_place() {
        let mut table = SubscriptionTable::default();
        table.insert(Subscription::new("x", None, SubscribeOptions::default()));
        table.insert(Subscription::new("y", None, SubscribeOptions::default()));

        let mut replaced = Subscription::new(
            "x",
            None,
            SubscribeOptions {
                qos: QoS::AtLeastOnce,
            },
        );
        replaced.ready = true;
        table.insert(replaced);

        assert_eq!(table.len(), 2);
        let topics: Vec<_> = table.iter().map(Subscription::topic).collect();
        assert_eq!(topics, vec!["x", "y"]);
        assert_eq!(table.get("x").map(|s| s.options.qos), Some(QoS::AtLeastOnce));

        assert!(table.remove("x").is_some());
        assert!(table.remove("x").is_none());
        assert_eq!(table.len(), 1);
    }
}
