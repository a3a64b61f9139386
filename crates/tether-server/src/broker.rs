//! Channel membership and publication fan-in.
//!
//! The broker only knows which socket ids belong to which channel and
//! carries publications to the server's fan-out task; delivery to the
//! sockets themselves (and the publish-out middleware) is the server's job.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tether_core::errors::BrokerError;
use tether_core::ids::SocketId;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

/// A publication accepted by the broker.
#[derive(Clone, Debug, PartialEq)]
pub struct BrokerPublication {
    /// Channel published to.
    pub channel: String,
    /// Published payload.
    pub data: Value,
}

/// Publish/subscribe backend.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Add `socket` to `channel`. Joining twice is a no-op.
    async fn subscribe(&self, socket: &SocketId, channel: &str) -> Result<(), BrokerError>;

    /// Remove `socket` from `channel`.
    async fn unsubscribe(&self, socket: &SocketId, channel: &str) -> Result<(), BrokerError>;

    /// Hand `data` to every subscriber of `channel`.
    async fn publish(&self, channel: &str, data: Value) -> Result<(), BrokerError>;

    /// Current members of `channel`.
    async fn subscribers(&self, channel: &str) -> Vec<SocketId>;

    /// Channels with at least one member.
    async fn channels(&self) -> Vec<String>;

    /// Feed of accepted publications.
    fn publications(&self) -> broadcast::Receiver<BrokerPublication>;
}

/// In-process broker backed by a `tokio::sync::broadcast` channel.
#[derive(Debug)]
pub struct MemoryBroker {
    members: RwLock<HashMap<String, BTreeSet<SocketId>>>,
    feed: broadcast::Sender<BrokerPublication>,
}

impl MemoryBroker {
    /// Broker whose feed buffers up to `capacity` publications per reader.
    pub fn new(capacity: usize) -> Self {
        let (feed, _rx) = broadcast::channel(capacity.max(1));
        Self {
            members: RwLock::new(HashMap::new()),
            feed,
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, socket: &SocketId, channel: &str) -> Result<(), BrokerError> {
        let mut members = self.members.write().await;
        let _ = members
            .entry(channel.to_string())
            .or_default()
            .insert(socket.clone());
        Ok(())
    }

    async fn unsubscribe(&self, socket: &SocketId, channel: &str) -> Result<(), BrokerError> {
        let mut members = self.members.write().await;
        if let Some(set) = members.get_mut(channel) {
            let _ = set.remove(socket);
            if set.is_empty() {
                let _ = members.remove(channel);
            }
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, data: Value) -> Result<(), BrokerError> {
        let publication = BrokerPublication {
            channel: channel.to_string(),
            data,
        };
        // No receivers just means nobody is listening yet.
        if self.feed.send(publication).is_err() {
            debug!(channel, "publication dropped, no fan-out receiver");
        }
        Ok(())
    }

    async fn subscribers(&self, channel: &str) -> Vec<SocketId> {
        self.members
            .read()
            .await
            .get(channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn channels(&self) -> Vec<String> {
        let mut names: Vec<_> = self.members.read().await.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    fn publications(&self) -> broadcast::Receiver<BrokerPublication> {
        self.feed.subscribe()
    }
}
