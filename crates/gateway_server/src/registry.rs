//! Live sockets and uid bindings owned by one Gateway.
//!
//! The registry is generic over the connection type so routing decisions can
//! be exercised without real sockets.

use crate::error::BindError;
use gateway_protocol::{ConnectionId, IdSequence, Uid};
use rand::seq::IteratorRandom;
use std::collections::HashMap;

/// Client connections, worker links, and the uid ↔ socket-id maps.
///
/// `uid_to_socket` and `socket_to_uid` are kept exact inverses of each other,
/// and every bound socket is a live client.
#[derive(Debug)]
pub struct ConnectionRegistry<C> {
    clients: HashMap<ConnectionId, C>,
    links: HashMap<ConnectionId, C>,
    uid_to_socket: HashMap<Uid, ConnectionId>,
    socket_to_uid: HashMap<ConnectionId, Uid>,
    ids: IdSequence,
}

impl<C> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self {
            clients: HashMap::new(),
            links: HashMap::new(),
            uid_to_socket: HashMap::new(),
            socket_to_uid: HashMap::new(),
            ids: IdSequence::new(),
        }
    }
}

impl<C> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an id no client or link has used before.
    pub fn allocate_id(&mut self) -> ConnectionId {
        let (clients, links) = (&self.clients, &self.links);
        self.ids.next(|id| clients.contains_key(&id) || links.contains_key(&id))
    }

    pub fn insert_client(&mut self, id: ConnectionId, connection: C) -> Option<C> {
        self.unbind_socket(id);
        self.clients.insert(id, connection)
    }

    /// Removes a client and its binding. Returns the connection and the uid
    /// it was bound to.
    pub fn remove_client(&mut self, id: ConnectionId) -> Option<(C, Option<Uid>)> {
        let connection = self.clients.remove(&id)?;
        let uid = self.unbind_socket(id);
        Some((connection, uid))
    }

    pub fn client(&self, id: ConnectionId) -> Option<&C> {
        self.clients.get(&id)
    }

    pub fn client_mut(&mut self, id: ConnectionId) -> Option<&mut C> {
        self.clients.get_mut(&id)
    }

    pub fn has_client(&self, id: ConnectionId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn client_ids(&self) -> Vec<ConnectionId> {
        self.clients.keys().copied().collect()
    }

    pub fn clients(&self) -> impl Iterator<Item = &C> {
        self.clients.values()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn insert_link(&mut self, id: ConnectionId, connection: C) -> Option<C> {
        self.links.insert(id, connection)
    }

    pub fn remove_link(&mut self, id: ConnectionId) -> Option<C> {
        self.links.remove(&id)
    }

    pub fn link_mut(&mut self, id: ConnectionId) -> Option<&mut C> {
        self.links.get_mut(&id)
    }

    pub fn link_ids(&self) -> Vec<ConnectionId> {
        self.links.keys().copied().collect()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Binds `uid` to `socket`.
    ///
    /// Repeating the uid a socket already carries is a no-op; a socket that
    /// carries a different uid is rejected. A uid that is already
    /// bound elsewhere moves to the new socket; the previous socket is returned
    /// and becomes unauthenticated.
    pub fn bind(&mut self, socket: ConnectionId, uid: Uid) -> Result<Option<ConnectionId>, BindError> {
        if uid.is_anonymous() {
            return Err(BindError::Anonymous);
        }
        if !self.clients.contains_key(&socket) {
            return Err(BindError::NotLive(socket));
        }
        if let Some(&bound) = self.socket_to_uid.get(&socket) {
            if bound == uid {
                return Ok(None);
            }
            return Err(BindError::AlreadyBound { socket, uid: bound });
        }
        let previous = self.uid_to_socket.insert(uid, socket);
        if let Some(previous) = previous {
            self.socket_to_uid.remove(&previous);
        }
        self.socket_to_uid.insert(socket, uid);
        Ok(previous)
    }

    pub fn unbind_socket(&mut self, socket: ConnectionId) -> Option<Uid> {
        let uid = self.socket_to_uid.remove(&socket)?;
        self.uid_to_socket.remove(&uid);
        Some(uid)
    }

    pub fn uid_of(&self, socket: ConnectionId) -> Option<Uid> {
        self.socket_to_uid.get(&socket).copied()
    }

    pub fn socket_of(&self, uid: Uid) -> Option<ConnectionId> {
        self.uid_to_socket.get(&uid).copied()
    }

    /// Sockets that currently carry a uid.
    pub fn bound_sockets(&self) -> Vec<ConnectionId> {
        self.socket_to_uid.keys().copied().collect()
    }

    pub fn bound_uids(&self) -> Vec<Uid> {
        self.uid_to_socket.keys().copied().collect()
    }

    /// Picks a worker link uniformly at random.
    pub fn select_link(&self) -> Option<ConnectionId> {
        self.links.keys().copied().choose(&mut rand::thread_rng())
    }

    /// Checks that both maps are inverse and only reference live clients.
    pub fn is_consistent(&self) -> bool {
        self.uid_to_socket.len() == self.socket_to_uid.len()
            && self.uid_to_socket.iter().all(|(uid, socket)| {
                self.socket_to_uid.get(socket) == Some(uid) && self.clients.contains_key(socket)
            })
    }
}
