//! Fan-out of server events to registered connections.
//!
//! Each call serializes the event once and hands the same buffer to every
//! recipient's outbound queue. Queues are unbounded, so delivery never waits
//! on a slow peer, and a failed send only affects that peer.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    message::{ServerToClient, encode},
    registry::{ConnectionId, Outbound, Registry},
};

/// Delivers `message` to every open connection except `exclude`.
///
/// Returns how many queues accepted the frame.
pub fn broadcast(
    registry: &Registry,
    message: &ServerToClient,
    exclude: Option<ConnectionId>,
) -> usize {
    let Some(frame) = serialize(message) else {
        return 0;
    };

    let mut delivered = 0;
    for entry in registry.entries() {
        if Some(entry.id) == exclude || !entry.connection.is_open() {
            continue;
        }
        match entry.connection.send(Outbound::Text(Arc::clone(&frame))) {
            Ok(()) => delivered += 1,
            Err(_) => debug!(id = %entry.id, "dropping broadcast for closed connection"),
        }
    }
    delivered
}

/// Delivers `message` to a single connection. Returns `false` when the
/// connection is absent or already closed.
pub fn send_to(registry: &Registry, id: ConnectionId, message: &ServerToClient) -> bool {
    let Some(entry) = registry.get(id) else {
        return false;
    };
    let Some(frame) = serialize(message) else {
        return false;
    };
    entry.connection.send(Outbound::Text(frame)).is_ok()
}

/// Asks every connection's writer to close the socket.
pub fn close_all(registry: &Registry) {
    for entry in registry.entries() {
        let _ = entry.connection.send(Outbound::Close);
    }
}

fn serialize(message: &ServerToClient) -> Option<Arc<str>> {
    match encode(message) {
        Ok(text) => Some(Arc::from(text)),
        Err(error) => {
            warn!(?error, "failed to serialize outbound message");
            None
        }
    }
}
