//! Live roster of connected peers.
//!
//! The roster is owned by the relay's coordinator task; nothing else touches
//! it, so every method takes `&mut self` / `&self` without locking.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::chat::Role;
use crate::protocol::Verb;
use crate::{RelayError, Result};

/// Identifier of one accepted connection.
pub type ConnectionId = Uuid;

/// A connection registered with the relay.
///
/// Dropping it closes the peer: the outbound queue sender goes away (the
/// writer flushes and shuts the socket) and the close signal fires (the
/// reader stops).
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    username: Option<String>,
    role: Role,
    muted: bool,
    outbound: mpsc::Sender<Bytes>,
    _close: oneshot::Sender<()>,
}

impl Connection {
    /// Create an unbound connection with the default role.
    pub fn new(
        addr: SocketAddr,
        outbound: mpsc::Sender<Bytes>,
        close: oneshot::Sender<()>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            addr,
            username: None,
            role: Role::Regular,
            muted: false,
            outbound,
            _close: close,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Username bound by the handshake, if any.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Queue a frame for this peer without waiting.
    pub fn send(&self, frame: Bytes) -> Result<()> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                RelayError::Send(format!("outbound queue full for {}", self.addr))
            }
            mpsc::error::TrySendError::Closed(_) => {
                RelayError::Send(format!("connection {} closed", self.addr))
            }
        })
    }
}

/// Public view of a bound roster entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub username: String,
    pub role: Role,
    pub muted: bool,
}

/// Result of applying a moderation command.
#[derive(Debug)]
pub enum ModerationOutcome {
    /// No live connection carries the target name.
    TargetNotFound,
    /// The requester's role may not act on the target's role.
    Denied { requester: Role, target: Role },
    /// The target's muted flag was toggled.
    MuteToggled {
        target: ConnectionId,
        name: String,
        muted: bool,
    },
    /// The target was toggled between regular and admin.
    AdminToggled {
        target: ConnectionId,
        name: String,
        admin: bool,
    },
    /// The target was removed; the caller delivers the kick notice and drops it.
    Kicked { name: String, connection: Connection },
}

/// Registry of live connections indexed by id and by username.
pub struct Roster {
    host_name: String,
    host_key: Option<String>,
    capacity: usize,
    connections: HashMap<ConnectionId, Connection>,
    by_name: HashMap<String, ConnectionId>,
}

impl Roster {
    /// Create an empty roster. `host_name` is the only name that binds as host.
    pub fn new(host_name: impl Into<String>, capacity: usize) -> Self {
        Self {
            host_name: host_name.into(),
            host_key: None,
            capacity,
            connections: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    /// Reserve the host name for connections presenting `key`.
    pub fn with_host_key(mut self, key: impl Into<String>) -> Self {
        self.host_key = Some(key.into());
        self
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live connections, bound or not.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.capacity
    }

    /// Register a freshly accepted connection.
    ///
    /// On refusal the connection is handed back so the caller can notify it.
    pub fn admit(&mut self, connection: Connection) -> std::result::Result<(), Connection> {
        if self.is_full() {
            return Err(connection);
        }
        self.connections.insert(connection.id, connection);
        Ok(())
    }

    /// Bind a handshake username to a connection and return its role.
    ///
    /// Once a host key is set, the host name only binds with that key.
    pub fn bind(
        &mut self,
        id: ConnectionId,
        username: &str,
        host_key: Option<&str>,
    ) -> Result<Role> {
        let is_host = username == self.host_name;
        if is_host {
            if let Some(expected) = &self.host_key {
                if host_key != Some(expected.as_str()) {
                    return Err(RelayError::Handshake(format!(
                        "username '{username}' is reserved for the host"
                    )));
                }
            }
        }
        if self.by_name.contains_key(username) {
            return Err(RelayError::Handshake(format!(
                "username '{username}' is already in use"
            )));
        }
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| RelayError::Handshake("connection is gone".to_string()))?;
        if connection.username.is_some() {
            return Err(RelayError::Handshake("handshake already completed".to_string()));
        }

        connection.role = if is_host {
            Role::Host
        } else {
            Role::Regular
        };
        connection.username = Some(username.to_string());
        self.by_name.insert(username.to_string(), id);
        Ok(connection.role)
    }

    /// Remove a connection.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(&id)?;
        if let Some(name) = &connection.username {
            self.by_name.remove(name);
        }
        Some(connection)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Find the connection bound to `username`.
    pub fn find(&self, username: &str) -> Option<&Connection> {
        self.by_name
            .get(username)
            .and_then(|id| self.connections.get(id))
    }

    /// Snapshot of bound entries, sorted by username.
    pub fn entries(&self) -> Vec<RosterEntry> {
        let mut entries: Vec<RosterEntry> = self
            .connections
            .values()
            .filter_map(|c| {
                c.username.as_ref().map(|name| RosterEntry {
                    username: name.clone(),
                    role: c.role,
                    muted: c.muted,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.username.cmp(&b.username));
        entries
    }

    /// Apply a moderation verb on behalf of the participant named `requester`
    /// to the connection named `target`.
    ///
    /// A requester name that matches no one carries no privileges.
    pub fn moderate(&mut self, requester: &str, verb: Verb, target: &str) -> ModerationOutcome {
        let requester_role = self.find(requester).map_or(Role::Regular, |c| c.role);
        let Some(&target_id) = self.by_name.get(target) else {
            return ModerationOutcome::TargetNotFound;
        };
        let Some(target_conn) = self.connections.get_mut(&target_id) else {
            return ModerationOutcome::TargetNotFound;
        };

        if !requester_role.can_moderate(target_conn.role) {
            return ModerationOutcome::Denied {
                requester: requester_role,
                target: target_conn.role,
            };
        }

        let name = target.to_string();
        match verb {
            Verb::Mute => {
                target_conn.muted = !target_conn.muted;
                ModerationOutcome::MuteToggled {
                    target: target_id,
                    name,
                    muted: target_conn.muted,
                }
            }
            Verb::Admin => {
                target_conn.role = match target_conn.role {
                    Role::Admin => Role::Regular,
                    _ => Role::Admin,
                };
                ModerationOutcome::AdminToggled {
                    target: target_id,
                    name,
                    admin: target_conn.role == Role::Admin,
                }
            }
            Verb::Kick => match self.remove(target_id) {
                Some(connection) => ModerationOutcome::Kicked { name, connection },
                None => ModerationOutcome::TargetNotFound,
            },
        }
    }

    /// Queue a frame for one connection.
    pub fn send_to(&self, id: ConnectionId, frame: Bytes) -> Result<()> {
        match self.connections.get(&id) {
            Some(connection) => connection.send(frame),
            None => Err(RelayError::Send(format!("connection {id} not found"))),
        }
    }

    /// Queue a frame for every connection. Per-recipient failures are logged
    /// and skipped. Returns the number of connections the frame was queued for.
    pub fn broadcast(&self, frame: &Bytes) -> usize {
        let mut delivered = 0;
        for connection in self.connections.values() {
            match connection.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Broadcast to {} skipped: {}", connection.addr, e),
            }
        }
        debug!("Broadcast delivered to {}/{}", delivered, self.connections.len());
        delivered
    }

    /// Drop every connection.
    pub fn clear(&mut self) {
        self.by_name.clear();
        self.connections.clear();
    }
}
