//! Topic subscriptions of every open multiplex connection.
//!
//! The hub keeps both directions, connection to topics and topic to
//! connections, and drops a topic key once its last subscriber leaves. A
//! single pump task fans change-bus events out to subscribers; a connection
//! whose queue is closed is unsubscribed from everything; a full queue only
//! loses that one message.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::message::ServerMessage;
use crate::change_bus::{ChangeBus, ChangeEvent, TopicKey};

pub type ConnectionId = u64;

#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    next_id: AtomicU64,
    connections: DashMap<ConnectionId, mpsc::Sender<ServerMessage>>,
    by_connection: DashMap<ConnectionId, HashSet<TopicKey>>,
    by_topic: DashMap<TopicKey, HashSet<ConnectionId>>,
}

impl Hub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, outbound: mpsc::Sender<ServerMessage>) -> ConnectionId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.connections.insert(id, outbound);
        id
    }

    /// Returns `false` when the connection was already subscribed.
    pub fn subscribe(&self, connection: ConnectionId, key: TopicKey) -> bool {
        let added = self
            .inner
            .by_connection
            .entry(connection)
            .or_default()
            .insert(key.clone());
        if added {
            self.inner.by_topic.entry(key).or_default().insert(connection);
        }
        added
    }

    /// Returns `false` when the connection was not subscribed.
    pub fn unsubscribe(&self, connection: ConnectionId, key: &TopicKey) -> bool {
        let removed = self
            .inner
            .by_connection
            .get_mut(&connection)
            .is_some_and(|mut topics| topics.remove(key));
        self.inner
            .by_connection
            .remove_if(&connection, |_, topics| topics.is_empty());
        if !removed {
            return false;
        }

        if let Some(mut subscribers) = self.inner.by_topic.get_mut(key) {
            subscribers.remove(&connection);
        }
        self.inner
            .by_topic
            .remove_if(key, |_, subscribers| subscribers.is_empty());
        true
    }

    /// Drops every subscription of a connection and forgets its queue.
    pub fn remove_connection(&self, connection: ConnectionId) {
        self.inner.connections.remove(&connection);
        let topics = self
            .inner
            .by_connection
            .remove(&connection)
            .map(|(_, topics)| topics)
            .unwrap_or_default();
        for key in topics {
            if let Some(mut subscribers) = self.inner.by_topic.get_mut(&key) {
                subscribers.remove(&connection);
            }
            self.inner
                .by_topic
                .remove_if(&key, |_, subscribers| subscribers.is_empty());
        }
    }

    /// Delivers one message to every subscriber of `key`; returns how many
    /// connections took it.
    pub fn broadcast(&self, key: &TopicKey, message: &ServerMessage) -> usize {
        let subscribers: Vec<ConnectionId> = self
            .inner
            .by_topic
            .get(key)
            .map(|subscribers| subscribers.iter().copied().collect())
            .unwrap_or_default();

        let mut delivered = 0;
        let mut closed = Vec::new();
        for connection in subscribers {
            let sent = match self.inner.connections.get(&connection) {
                Some(outbound) => outbound.try_send(message.clone()),
                None => Err(TrySendError::Closed(message.clone())),
            };
            match sent {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(connection, topic = %key.topic, "subscriber queue full, message dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(connection),
            }
        }

        for connection in closed {
            debug!(connection, topic = %key.topic, "dropping subscriber with a closed queue");
            self.remove_connection(connection);
        }
        delivered
    }

    pub fn dispatch(&self, event: ChangeEvent) {
        let key = TopicKey::new(event.table.clone(), event.application_id.clone());
        let topic = event.table.clone();
        let message = ServerMessage::new(&topic, serde_json::json!({
            "action": event.action,
            "resource_id": event.application_id,
            "data": event.data,
        }))
        .with_topic(&topic);
        self.broadcast(&key, &message);
    }

    /// Topic map as `topic/resource -> connections`, for inspection.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<(String, String), BTreeSet<ConnectionId>> {
        self.inner
            .by_topic
            .iter()
            .map(|entry| {
                (
                    (entry.key().topic.clone(), entry.key().resource_id.clone()),
                    entry.value().iter().copied().collect(),
                )
            })
            .collect()
    }

    #[must_use]
    pub fn topics_of(&self, connection: ConnectionId) -> usize {
        self.inner
            .by_connection
            .get(&connection)
            .map_or(0, |topics| topics.len())
    }

    /// Forwards change-bus events until `cancel` fires.
    pub async fn run(self, bus: ChangeBus, cancel: CancellationToken) {
        let mut events = bus.subscribe_all();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => self.dispatch(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "realtime hub lagged behind the change bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn key(topic: &str, resource: &str) -> TopicKey {
        TopicKey::new(topic, resource)
    }

    #[tokio::test]
    async fn broadcasts_reach_only_subscribers_of_the_topic() {
        let hub = Hub::new();
        let (first_tx, mut first) = mpsc::channel(8);
        let (second_tx, mut second) = mpsc::channel(8);
        let a = hub.register(first_tx);
        let b = hub.register(second_tx);

        hub.subscribe(a, key("deployments", "app-1"));
        hub.subscribe(b, key("deployments", "app-2"));

        hub.dispatch(ChangeEvent {
            table: "deployments".to_string(),
            action: "update".to_string(),
            application_id: "app-1".to_string(),
            data: json!({ "status": "live" }),
        });

        let message = first.recv().await.expect("delivered");
        assert_eq!(message.action, "deployments");
        assert_eq!(message.topic.as_deref(), Some("deployments"));
        assert_eq!(message.data["data"]["status"], "live");
        assert!(second.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_sends_unsubscribe_the_connection() {
        let hub = Hub::new();
        let (closed_tx, closed_rx) = mpsc::channel(1);
        let (live_tx, _live_rx) = mpsc::channel(8);
        let gone = hub.register(closed_tx);
        let live = hub.register(live_tx);
        drop(closed_rx);

        hub.subscribe(gone, key("deployment_logs", "app-1"));
        hub.subscribe(live, key("deployment_logs", "app-1"));

        let delivered = hub.broadcast(&key("deployment_logs", "app-1"), &ServerMessage::pong());
        assert_eq!(delivered, 1);
        assert_eq!(hub.topics_of(gone), 0);
        assert_eq!(
            hub.snapshot().get(&("deployment_logs".to_string(), "app-1".to_string())),
            Some(&BTreeSet::from([live]))
        );
    }

    #[tokio::test]
    async fn a_full_queue_drops_the_message_but_keeps_the_connection() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::channel(1);
        let connection = hub.register(tx);
        let topic = key("deployment_logs", "app-1");
        hub.subscribe(connection, topic.clone());

        assert_eq!(hub.broadcast(&topic, &ServerMessage::pong()), 1);
        assert_eq!(hub.broadcast(&topic, &ServerMessage::pong()), 0);
        assert_eq!(hub.topics_of(connection), 1);

        rx.recv().await.expect("first message queued");
        assert_eq!(hub.broadcast(&topic, &ServerMessage::pong()), 1);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn removing_a_connection_clears_all_its_topics() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::channel(8);
        let connection = hub.register(tx);
        hub.subscribe(connection, key("deployments", "a"));
        hub.subscribe(connection, key("healthcheck_results", "a"));

        hub.remove_connection(connection);
        assert!(hub.snapshot().is_empty());
        assert_eq!(hub.topics_of(connection), 0);
    }

    #[tokio::test]
    async fn the_pump_forwards_bus_events() {
        let hub = Hub::new();
        let bus = ChangeBus::new();
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);
        let connection = hub.register(tx);
        hub.subscribe(connection, key("deployments", "app-1"));

        let pump = tokio::spawn(hub.clone().run(bus.clone(), cancel.clone()));
        tokio::task::yield_now().await;
        // The pump subscribes asynchronously; keep emitting until it listens.
        let message = loop {
            bus.emit(&ChangeEvent {
                table: "deployments".to_string(),
                action: "insert".to_string(),
                application_id: "app-1".to_string(),
                data: json!({}),
            });
            if let Ok(Some(message)) = tokio::time::timeout(std::time::Duration::from_millis(20), rx.recv()).await {
                break message;
            }
        };
        assert_eq!(message.data["action"], "insert");

        cancel.cancel();
        pump.await.expect("pump stops");
    }

    proptest! {
        #[test]
        fn subscribe_then_unsubscribe_restores_the_topic_map(
            existing in prop::collection::vec((0u8..3, 0u8..3, 0u8..3), 0..12),
            connection in 0u8..3,
            topic in 0u8..3,
            resource in 0u8..3,
        ) {
            let hub = Hub::new();
            let mut ids = Vec::new();
            for _ in 0..3 {
                let (tx, _rx) = mpsc::channel(1);
                ids.push(hub.register(tx));
            }
            for (owner, topic, resource) in &existing {
                hub.subscribe(ids[usize::from(*owner)], key(&format!("t{topic}"), &format!("r{resource}")));
            }

            let before = hub.snapshot();
            let target = key(&format!("t{topic}"), &format!("r{resource}"));
            let id = ids[usize::from(connection)];
            if hub.subscribe(id, target.clone()) {
                prop_assert!(hub.unsubscribe(id, &target));
            }
            prop_assert_eq!(hub.snapshot(), before);
        }
    }
}
