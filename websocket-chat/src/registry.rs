//! Table of live connections and their session metadata.
//!
//! The registry is a plain owned value. Callers that share it between tasks
//! wrap it in a single lock (see [`crate::session::ChatHub`]) so that every
//! register, rename, unregister and snapshot is observed atomically.

use std::{collections::BTreeMap, fmt, sync::Arc};

use thiserror::Error;
use tokio::sync::mpsc;

/// Process-unique identity of a connection. Starts at 1 and is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Frames queued for the transport writer of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(Arc<str>),
    Close,
}

/// Send half of one peer's outbound queue.
///
/// The connection is open for as long as the transport is still draining
/// the queue; once the receiver is dropped every send fails.
#[derive(Debug, Clone)]
pub struct Connection {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn send(&self, frame: Outbound) -> Result<(), mpsc::error::SendError<Outbound>> {
        self.tx.send(frame)
    }
}

#[derive(Debug)]
pub struct Entry {
    pub id: ConnectionId,
    pub name: String,
    pub connection: Connection,
}

/// Point-in-time view of who is online, in connection order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    pub count: usize,
    pub users: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is not registered")]
    NotFound(ConnectionId),
}

#[derive(Debug)]
pub struct Registry {
    // Ids increase monotonically, so key order is insertion order.
    entries: BTreeMap<ConnectionId, Entry>,
    next_id: u64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn register(&mut self, connection: Connection) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                id,
                name: default_name(id),
                connection,
            },
        );
        id
    }

    /// Swaps the display name and returns the previous one.
    pub fn rename(
        &mut self,
        id: ConnectionId,
        name: impl Into<String>,
    ) -> Result<String, RegistryError> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;
        Ok(std::mem::replace(&mut entry.name, name.into()))
    }

    /// Removes the entry. Returns `None` when it was already gone.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<Entry> {
        self.entries.remove(&id)
    }

    pub fn name(&self, id: ConnectionId) -> Option<&str> {
        self.entries.get(&id).map(|entry| entry.name.as_str())
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub fn snapshot(&self) -> Roster {
        Roster {
            count: self.entries.len(),
            users: self.entries.values().map(|entry| entry.name.clone()).collect(),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn default_name(id: ConnectionId) -> String {
    format!("Usuario{id}")
}
