//! In-process replacement for database NOTIFY/LISTEN.
//!
//! Store methods that mutate `deployments`, `deployment_logs` or
//! `healthcheck_results` publish a JSON payload on [`APPLICATION_CHANGES`].
//! The bus decodes it and fans it out to subscribers keyed by
//! `(topic, resource_id)`, where the topic is the table name and the resource
//! id is the application id. Order is preserved within one topic.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const APPLICATION_CHANGES: &str = "application_changes";

const TOPIC_CAPACITY: usize = 256;
const FIREHOSE_CAPACITY: usize = 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub action: String,
    pub application_id: String,
    pub data: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TopicKey {
    pub topic: String,
    pub resource_id: String,
}

impl TopicKey {
    pub fn new(topic: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            resource_id: resource_id.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChangeBus {
    topics: Arc<DashMap<TopicKey, broadcast::Sender<ChangeEvent>>>,
    firehose: broadcast::Sender<ChangeEvent>,
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeBus {
    #[must_use]
    pub fn new() -> Self {
        let (firehose, _) = broadcast::channel(FIREHOSE_CAPACITY);
        Self {
            topics: Arc::new(DashMap::new()),
            firehose,
        }
    }

    /// Encode and publish an event the way a database trigger would.
    pub fn emit(&self, event: &ChangeEvent) {
        match serde_json::to_string(event) {
            Ok(payload) => self.publish(APPLICATION_CHANGES, &payload),
            Err(error) => tracing::warn!(%error, "failed to encode change event"),
        }
    }

    /// Decode a raw channel payload and republish it to topic subscribers.
    pub fn publish(&self, channel: &str, payload: &str) {
        if channel != APPLICATION_CHANGES {
            tracing::debug!(channel, "ignoring payload for unknown channel");
            return;
        }

        let event = match serde_json::from_str::<ChangeEvent>(payload) {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!(%error, "dropping malformed change payload");
                return;
            }
        };

        let key = TopicKey::new(event.table.clone(), event.application_id.clone());
        let mut stale = false;
        if let Some(sender) = self.topics.get(&key) {
            stale = sender.send(event.clone()).is_err();
        }
        if stale {
            self.topics
                .remove_if(&key, |_, sender| sender.receiver_count() == 0);
        }

        // No receivers is the common case when nothing is subscribed.
        let _ = self.firehose.send(event);
    }

    /// Subscribe to one `(topic, resource_id)` pair.
    #[must_use]
    pub fn subscribe(&self, topic: &str, resource_id: &str) -> broadcast::Receiver<ChangeEvent> {
        self.topics
            .entry(TopicKey::new(topic, resource_id))
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Subscribe to every event on the bus.
    #[must_use]
    pub fn subscribe_all(&self) -> broadcast::Receiver<ChangeEvent> {
        self.firehose.subscribe()
    }

    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(table: &str, application_id: &str, seq: u64) -> ChangeEvent {
        ChangeEvent {
            table: table.to_string(),
            action: "update".to_string(),
            application_id: application_id.to_string(),
            data: json!({ "seq": seq }),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_events_for_their_topic_in_order() {
        let bus = ChangeBus::new();
        let mut app_a = bus.subscribe("deployments", "app-a");
        let mut app_b = bus.subscribe("deployments", "app-b");

        for seq in 0..3 {
            bus.emit(&event("deployments", "app-a", seq));
        }
        bus.emit(&event("deployments", "app-b", 99));

        for seq in 0..3 {
            let received = app_a.recv().await.expect("event");
            assert_eq!(received.data["seq"], seq);
        }
        assert_eq!(app_b.recv().await.expect("event").data["seq"], 99);
        assert!(app_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_and_foreign_payloads_are_dropped() {
        let bus = ChangeBus::new();
        let mut all = bus.subscribe_all();

        bus.publish(APPLICATION_CHANGES, "{ nope");
        bus.publish("other_channel", &serde_json::to_string(&event("x", "y", 1)).expect("json"));

        assert!(all.try_recv().is_err());
    }

    #[tokio::test]
    async fn topics_without_receivers_are_pruned() {
        let bus = ChangeBus::new();
        let receiver = bus.subscribe("deployment_logs", "app-a");
        assert_eq!(bus.topic_count(), 1);

        drop(receiver);
        bus.emit(&event("deployment_logs", "app-a", 1));
        assert_eq!(bus.topic_count(), 0);
    }
}
