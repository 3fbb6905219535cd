use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::domain::ConnectionId;

use super::connection::Connection;

/// The set of live connections. The lock is only ever held for set
/// operations, never across a network write.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Returns `false` when the connection was already registered.
    pub fn register(&self, connection: Arc<Connection>) -> bool {
        self.lock()
            .insert(connection.id(), connection)
            .is_none()
    }

    pub fn deregister(&self, connection_id: ConnectionId) -> Option<Arc<Connection>> {
        self.lock().remove(&connection_id)
    }

    /// Copies the live handles out so fan-out can run without the lock.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().values().cloned().collect()
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.lock().contains_key(&connection_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
