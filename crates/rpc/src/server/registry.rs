//! Live connections of a server.

use dashmap::DashMap;

use super::connection::Connection;

#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    connections: DashMap<u64, Connection>,
}

impl ConnectionRegistry {
    pub(crate) fn insert(&self, connection: Connection) {
        self.connections.insert(connection.id(), connection);
    }

    pub(crate) fn remove(&self, id: u64) -> Option<Connection> {
        self.connections.remove(&id).map(|(_, connection)| connection)
    }

    /// Snapshot ordered by id.
    pub(crate) fn snapshot(&self) -> Vec<Connection> {
        let mut connections: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        connections.sort_by_key(Connection::id);
        connections
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.len()
    }
}
