use std::collections::HashMap;

use dashmap::DashMap;
use log::*;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::types::ServerFrame;

/// Unique identifier for a connection (server-generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

pub type Subscriber = UnboundedSender<ServerFrame>;

/// Subscriber sets keyed by topic name.
pub struct Broker {
    topics: DashMap<String, HashMap<ConnectionId, Subscriber>>,
}

impl Broker {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }

    /// Add a connection to a topic. Re-subscribing replaces the previous handle.
    pub fn subscribe(&self, topic: &str, id: ConnectionId, sender: Subscriber) {
        debug!("Connection {} subscribed to {}", id.as_str(), topic);
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(id, sender);
    }

    pub fn unsubscribe(&self, topic: &str, id: &ConnectionId) {
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.remove(id);
            if subscribers.is_empty() {
                drop(subscribers); // release the shard lock before removal
                self.topics.remove_if(topic, |_, s| s.is_empty());
            }
        }
    }

    /// Drop a connection from every topic it joined.
    pub fn unsubscribe_all(&self, id: &ConnectionId) {
        for mut entry in self.topics.iter_mut() {
            entry.value_mut().remove(id);
        }
        self.topics.retain(|_, subscribers| !subscribers.is_empty());
    }

    /// Send `payload` to every subscriber of `topic`, best-effort.
    ///
    /// Handles whose receiving side has gone away are removed. Returns the
    /// number of subscribers the frame was handed to.
    pub fn publish(&self, topic: &str, payload: Value) -> usize {
        let frame = ServerFrame::Message {
            destination: topic.to_string(),
            body: payload,
        };

        let mut delivered = 0;
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.retain(|id, sender| match sender.send(frame.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    warn!(
                        "Connection {} closed, removing it from {}",
                        id.as_str(),
                        topic
                    );
                    false
                }
            });
            if subscribers.is_empty() {
                drop(subscribers);
                self.topics.remove_if(topic, |_, s| s.is_empty());
            }
        }

        debug!("Published to {} ({} subscribers)", topic, delivered);
        delivered
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}
