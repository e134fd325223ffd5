//! DashMap-based registry of live connections.
//!
//! Bookkeeping only: connections never exchange data through it. Each entry
//! holds a snapshot of the connection plus the token that cancels it, so the
//! process can shut every connection down on exit.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::types::{ConnectionInfo, ConnectionState};

/// Registry entry combining the snapshot with the connection's cancel token.
pub struct RegisteredConnection {
    pub info: ConnectionInfo,
    pub cancel: CancellationToken,
}

/// Registry of live connections keyed by connection id.
///
/// Every connection token is a child of one shutdown token, so a connection
/// registered after [`ConnectionRegistry::cancel_all`] starts out cancelled.
pub struct ConnectionRegistry {
    connections: DashMap<String, RegisteredConnection>,
    shutdown: CancellationToken,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Track a connection and hand back its cancellation token.
    pub fn register(&self, info: ConnectionInfo) -> CancellationToken {
        let cancel = self.shutdown.child_token();
        self.connections.insert(
            info.connection_id.clone(),
            RegisteredConnection {
                info,
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    pub fn unregister(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.connections
            .remove(connection_id)
            .map(|(_, registered)| registered.info)
    }

    pub fn update_state(&self, connection_id: &str, state: ConnectionState) {
        if let Some(mut registered) = self.connections.get_mut(connection_id) {
            registered.info.state = state;
        }
    }

    pub fn get(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.info.clone())
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|entry| entry.info.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Cancel every connection, including ones registered later.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
