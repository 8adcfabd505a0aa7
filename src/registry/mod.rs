//! Live-connection registry for realtime fan-out.
//!
//! Maps an authenticated identity to the set of its currently-open
//! connections (one identity, many tabs/devices). The registry owns the
//! entries; a [`ConnectionHandle`] only routes payloads to whatever
//! task actually drives the connection and never controls its
//! lifetime. A send racing a disconnect fails closed: it counts as a
//! failed send, the handle is pruned, and nothing raises into the
//! caller.

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

#[cfg(test)]
mod tests;

/// Routing handle for one open connection.
///
/// Wraps the sender half of the connection's outbound channel. When the
/// connection task drops its receiver the handle's sends fail and the
/// registry prunes it on the next delivery attempt.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    sender: mpsc::UnboundedSender<String>,
}

impl ConnectionHandle {
    /// Wrap a connection's outbound sender.
    pub fn new(sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
        }
    }

    /// Stable id of this handle, used for removal.
    pub fn id(&self) -> Uuid {
        self.id
    }

    fn send(&self, payload: &str) -> bool {
        self.sender.send(payload.to_string()).is_ok()
    }
}

/// Registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Identities with at least one open connection.
    pub identity_count: usize,
    /// Total open connections.
    pub connection_count: usize,
}

/// Concurrently-mutated map of identity -> open connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, HashMap<Uuid, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle for `identity`, creating the entry on first
    /// connect.
    pub async fn add(&self, identity: &str, handle: ConnectionHandle) {
        let mut connections = self.connections.write().await;
        connections
            .entry(identity.to_string())
            .or_default()
            .insert(handle.id, handle);
    }

    /// Remove one handle for `identity`; the entry is deleted once its
    /// set becomes empty.
    pub async fn remove(&self, identity: &str, handle_id: Uuid) {
        let mut connections = self.connections.write().await;
        if let Some(set) = connections.get_mut(identity) {
            set.remove(&handle_id);
            if set.is_empty() {
                connections.remove(identity);
            }
        }
    }

    /// Remove a handle from every identity. Used when the identity is
    /// unknown at disconnect time.
    pub async fn remove_everywhere(&self, handle_id: Uuid) {
        let mut connections = self.connections.write().await;
        connections.retain(|_, set| {
            set.remove(&handle_id);
            !set.is_empty()
        });
    }

    /// Send `payload` to every open connection of `identity`, pruning
    /// handles whose send fails. Returns the number of successful
    /// sends; 0 when the identity is unknown or every send failed.
    pub async fn send_to(&self, identity: &str, payload: &str) -> usize {
        let mut connections = self.connections.write().await;
        let Some(set) = connections.get_mut(identity) else {
            return 0;
        };

        let mut sent = 0;
        let mut dead = Vec::new();
        for (id, handle) in set.iter() {
            if handle.send(payload) {
                sent += 1;
            } else {
                dead.push(*id);
            }
        }

        for id in dead {
            set.remove(&id);
        }
        if set.is_empty() {
            connections.remove(identity);
        }

        debug!(identity = %identity, sent, "fan-out delivery");
        sent
    }

    /// Current identity and connection counts.
    pub async fn stats(&self) -> RegistryStats {
        let connections = self.connections.read().await;
        RegistryStats {
            identity_count: connections.len(),
            connection_count: connections.values().map(HashMap::len).sum(),
        }
    }
}
