//! Remote connection identifiers announced by the worker.

use std::collections::BTreeSet;

use crate::ipc::protocol::ConnectionId;

/// Set of connection ids asserted by `ConnectionEstablished` messages.
///
/// Owned by the receive loop. Entries persist for the lifetime of the
/// session; there is no removal path.
#[derive(Debug, Default, Clone)]
pub struct ConnectionRegistry {
    ids: BTreeSet<ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an id. Returns `false` if it was already known.
    pub fn register(&mut self, id: ConnectionId) -> bool {
        self.ids.insert(id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.ids.contains(&id)
    }

    pub fn all(&self) -> BTreeSet<ConnectionId> {
        self.ids.clone()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
