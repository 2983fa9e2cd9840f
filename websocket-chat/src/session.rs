//! Per-connection protocol state machine and the shared hub it drives.
//!
//! [`ChatHub`] owns the only shared mutable state, the [`Registry`], behind
//! one lock. Every transition takes the lock once, mutates the registry and
//! queues all resulting notices before releasing it, so observers never see
//! a roster that disagrees with the join/leave/rename notice before it.
//! Queuing is non-blocking, so no network I/O happens under the lock.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    broadcast::{broadcast, close_all, send_to},
    message::{ClientToServer, ServerToClient},
    registry::{Connection, ConnectionId, Registry, Roster, default_name},
};

#[derive(Debug, Default)]
pub struct ChatHub {
    registry: Mutex<Registry>,
}

impl ChatHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn roster(&self) -> Roster {
        self.registry.lock().await.snapshot()
    }

    /// Closes every live connection. Used on server shutdown.
    pub async fn shutdown(&self) {
        let registry = self.registry.lock().await;
        info!(connections = registry.len(), "closing all connections");
        close_all(&registry);
    }

    async fn join(&self, connection: Connection) -> ConnectionId {
        let mut registry = self.registry.lock().await;
        let id = registry.register(connection);
        let name = default_name(id);
        info!(%id, %name, "client connected");

        send_to(
            &registry,
            id,
            &ServerToClient::system(format!("Welcome to the chat! You are {name}")),
        );
        broadcast(
            &registry,
            &ServerToClient::system(format!("{name} joined the chat")),
            Some(id),
        );
        broadcast_roster(&registry);
        id
    }

    async fn rename(&self, id: ConnectionId, username: &str) {
        let username = username.trim();
        if username.is_empty() {
            debug!(%id, "ignoring empty username");
            return;
        }

        let mut registry = self.registry.lock().await;
        let old = match registry.rename(id, username) {
            Ok(old) => old,
            Err(error) => {
                debug!(%error, "rename for unknown connection");
                return;
            }
        };
        info!(%id, %old, new = %username, "client renamed");

        broadcast(
            &registry,
            &ServerToClient::system(format!("{old} is now known as {username}")),
            None,
        );
        broadcast_roster(&registry);
    }

    async fn chat(&self, id: ConnectionId, text: String) {
        if text.trim().is_empty() {
            debug!(%id, "ignoring empty chat message");
            return;
        }

        let registry = self.registry.lock().await;
        let Some(username) = registry.name(id) else {
            debug!(%id, "chat from unknown connection");
            return;
        };
        broadcast(&registry, &ServerToClient::chat(username, text), None);
    }

    async fn leave(&self, id: ConnectionId) -> bool {
        let mut registry = self.registry.lock().await;
        let Some(entry) = registry.unregister(id) else {
            return false;
        };
        info!(%id, name = %entry.name, "client disconnected");

        broadcast(
            &registry,
            &ServerToClient::system(format!("{} left the chat", entry.name)),
            None,
        );
        broadcast_roster(&registry);
        true
    }
}

fn broadcast_roster(registry: &Registry) {
    let Roster { users, .. } = registry.snapshot();
    broadcast(registry, &ServerToClient::user_count(users), None);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

/// Protocol state for one transport connection.
///
/// Transport events must be fed in arrival order from a single task.
pub struct Session {
    hub: Arc<ChatHub>,
    id: Option<ConnectionId>,
    state: SessionState,
}

impl Session {
    pub fn new(hub: Arc<ChatHub>) -> Self {
        Self {
            hub,
            id: None,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Registers the connection and announces it. Only valid while connecting.
    pub async fn open(&mut self, connection: Connection) -> Option<ConnectionId> {
        if self.state != SessionState::Connecting {
            warn!(state = ?self.state, "open on a session that is not connecting");
            return self.id;
        }
        let id = self.hub.join(connection).await;
        self.id = Some(id);
        self.state = SessionState::Active;
        Some(id)
    }

    /// Applies one inbound payload. Invalid payloads are logged and dropped;
    /// the session stays active.
    pub async fn receive(&mut self, raw: &str) {
        let (SessionState::Active, Some(id)) = (self.state, self.id) else {
            debug!(state = ?self.state, "ignoring payload for inactive session");
            return;
        };

        match ClientToServer::decode(raw) {
            Ok(ClientToServer::SetUsername { username }) => self.hub.rename(id, &username).await,
            Ok(ClientToServer::Chat { text }) => self.hub.chat(id, text).await,
            Err(error) => warn!(%id, %error, "dropping inbound payload"),
        }
    }

    /// Moves to `Closed` and announces the departure. Repeated calls are no-ops.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        if let Some(id) = self.id {
            self.hub.leave(id).await;
        }
    }
}
