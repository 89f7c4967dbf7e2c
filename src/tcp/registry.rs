use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::tcp::Connection;
use crate::types::ConnectionId;

/// Live server-side connections by id
#[derive(Debug, Default)]
pub struct Registry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, conn: Arc<Connection>) {
        self.connections.write().await.insert(conn.id(), conn);
    }

    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.write().await.remove(&id)
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&id).cloned()
    }

    /// Registered ids, ascending
    pub async fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Every registered connection, ordered by id
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut all: Vec<_> = self.connections.read().await.values().cloned().collect();
        all.sort_by_key(|c| c.id());
        all
    }

    /// Remove and return every connection
    pub async fn drain(&self) -> Vec<Arc<Connection>> {
        self.connections.write().await.drain().map(|(_, c)| c).collect()
    }
}
