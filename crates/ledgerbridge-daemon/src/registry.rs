//! Open stream connections.

use ledgerbridge_core::GatewayMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};

pub type ConnectionId = u64;

/// Maps connection ids to their outbound queues.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<GatewayMessage>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection and return its id and outbound queue.
    pub async fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<GatewayMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.write().await.insert(id, tx);
        tracing::debug!(id, "connection registered");
        (id, rx)
    }

    pub async fn deregister(&self, id: ConnectionId) {
        if self.connections.write().await.remove(&id).is_some() {
            tracing::debug!(id, "connection removed");
        }
    }

    /// Queue `message` for one connection. Unknown ids are ignored.
    pub async fn send(&self, id: ConnectionId, message: GatewayMessage) {
        let connections = self.connections.read().await;
        if let Some(tx) = connections.get(&id)
            && tx.send(message).is_err()
        {
            tracing::debug!(id, "dropping message for closed connection");
        }
    }

    /// Queue a copy of `message` for every connection. Returns how many
    /// accepted it.
    pub async fn broadcast(&self, message: &GatewayMessage) -> usize {
        let connections = self.connections.read().await;
        connections
            .values()
            .filter(|tx| tx.send(message.clone()).is_ok())
            .count()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
