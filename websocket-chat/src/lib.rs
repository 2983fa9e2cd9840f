//! Real-time broadcast chat over websockets.
//!
//! Every connected client can set a display name and exchange short text
//! messages with every other client. Each module focuses on a concrete
//! responsibility:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`message`] defines the tagged JSON envelopes exchanged on the wire.
//! - [`registry`] tracks live connections, their identities and display names.
//! - [`broadcast`] fans one serialized event out to registered connections.
//! - [`session`] is the per-connection protocol state machine and the hub
//!   that owns the registry.
//! - [`server`] accepts websocket upgrades with axum and feeds each socket
//!   into a session.
//! - [`reconnect`] keeps one logical client session alive across transient
//!   network failures with exponential backoff.
//! - [`client`] is a terminal client built on the reconnection controller.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod message;
pub mod reconnect;
pub mod registry;
pub mod server;
pub mod session;
