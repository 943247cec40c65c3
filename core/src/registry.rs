use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::envelope::ConnectionId;

/// Live connections keyed by id.
///
/// Removal is a single map operation, so a concurrent `get` sees either the
/// whole entry or nothing. Entries are handed out as `Arc`s; a dispatch
/// already in flight finishes on its own reference.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: DashMap<ConnectionId, Arc<Endpoint>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry, returning any entry it replaced.
    pub fn add(&self, endpoint: Arc<Endpoint>) -> Option<Arc<Endpoint>> {
        let id = endpoint.connection_id();
        debug!(target: "registry", connection_id = id, "Adding connection");
        self.entries.insert(id, endpoint)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Endpoint>> {
        self.entries.get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.entries.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes the entry and closes it. Close errors are logged by the entry
    /// and swallowed here. Returns whether an entry was present.
    pub async fn remove_and_close(&self, id: ConnectionId) -> bool {
        match self.entries.remove(&id) {
            Some((_, endpoint)) => {
                let _ = endpoint.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn remove_and_close_all(&self) {
        let ids: Vec<ConnectionId> = self.entries.iter().map(|e| *e.key()).collect();
        info!(target: "registry", count = ids.len(), "Closing all connections");
        for id in ids {
            self.remove_and_close(id).await;
        }
    }
}
