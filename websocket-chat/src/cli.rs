use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use clap::{Args, Parser, Subcommand};

use crate::reconnect::ReconnectPolicy;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server, accepting websocket connections.
    Server(ServerArgs),
    /// Connect to a server and participate in the chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address the server should bind to.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,
}

impl ServerArgs {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Server URL. `http`/`https` map to `ws`/`wss`.
    #[arg(long, default_value = "ws://127.0.0.1:3000/")]
    pub server: String,

    /// Display name applied after every (re)connect.
    #[arg(long)]
    pub username: Option<String>,

    /// Reconnect attempts after an unexpected disconnect.
    #[arg(long, default_value_t = 5)]
    pub max_attempts: u32,

    /// Delay before the first reconnect attempt; doubles on each retry.
    #[arg(long, default_value_t = 1000)]
    pub base_delay_ms: u64,

    /// Upper bound for a single reconnect delay.
    #[arg(long)]
    pub max_delay_ms: Option<u64>,
}

impl ClientArgs {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: self.max_delay_ms.map(Duration::from_millis),
        }
    }
}
