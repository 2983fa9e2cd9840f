//! Client-side reconnection controller.
//!
//! One task owns the single websocket of a logical chat session. When the
//! socket drops without a close handshake the task waits according to
//! [`Backoff`] and dials again; a clean close, an explicit [`ClientHandle::close`]
//! or running out of attempts ends the session. Everything the task observes
//! is reported upward as a [`ClientEvent`].

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    select,
    sync::mpsc,
    task::JoinHandle,
    time::sleep,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, info, warn};

use crate::message::{ClientToServer, ServerToClient, encode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound for a single delay. `None` lets the delay keep doubling.
    pub max_delay: Option<Duration>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    After { attempt: u32, delay: Duration },
    /// Attempts just ran out. Returned exactly once.
    GiveUp,
    Exhausted,
}

/// Retry bookkeeping for one logical session.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
    gave_up: bool,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            gave_up: false,
        }
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Called on every successful open.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.gave_up = false;
    }

    /// Decides what to do after an unclean close.
    pub fn next(&mut self) -> Retry {
        if self.gave_up {
            return Retry::Exhausted;
        }
        if self.attempts >= self.policy.max_attempts {
            self.gave_up = true;
            return Retry::GiveUp;
        }

        self.attempts += 1;
        let factor = 1u32.checked_shl(self.attempts - 1).unwrap_or(u32::MAX);
        let mut delay = self.policy.base_delay.saturating_mul(factor);
        if let Some(max_delay) = self.policy.max_delay {
            delay = delay.min(max_delay);
        }
        Retry::After {
            attempt: self.attempts,
            delay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Message(ServerToClient),
    Disconnected {
        clean: bool,
    },
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    GaveUp,
    Error(String),
}

/// Handle to a running controller. Dropping it closes the session.
pub struct ClientHandle {
    commands: mpsc::Sender<ClientToServer>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    /// Queues a message for the server. Fails only after the controller stopped.
    pub async fn send(&self, message: ClientToServer) -> Result<(), ClientToServer> {
        self.commands.send(message).await.map_err(|err| err.0)
    }

    /// Closes the socket cleanly and waits for the controller to stop.
    pub async fn close(self) {
        let ClientHandle { commands, task } = self;
        drop(commands);
        if let Err(error) = task.await {
            warn!(?error, "reconnect controller panicked");
        }
    }
}

pub fn spawn(
    url: impl Into<String>,
    policy: ReconnectPolicy,
) -> (ClientHandle, mpsc::Receiver<ClientEvent>) {
    let (command_tx, command_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(256);
    let controller = Controller {
        url: url.into(),
        backoff: Backoff::new(policy),
        commands: command_rx,
        events: event_tx,
    };
    let task = tokio::spawn(controller.run());
    (
        ClientHandle {
            commands: command_tx,
            task,
        },
        event_rx,
    )
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum SessionEnd {
    Closed { clean: bool },
    UserClosed,
}

struct Controller {
    url: String,
    backoff: Backoff,
    commands: mpsc::Receiver<ClientToServer>,
    events: mpsc::Sender<ClientEvent>,
}

impl Controller {
    async fn run(mut self) {
        loop {
            let Some(attempt) = self.dial().await else {
                debug!("session closed while connecting");
                return;
            };
            match attempt {
                Ok(socket) => {
                    info!(url = %self.url, "connected");
                    self.backoff.reset();
                    self.emit(ClientEvent::Connected).await;
                    match self.pump(socket).await {
                        SessionEnd::UserClosed => {
                            self.emit(ClientEvent::Disconnected { clean: true }).await;
                            return;
                        }
                        SessionEnd::Closed { clean } => {
                            self.emit(ClientEvent::Disconnected { clean }).await;
                            if clean {
                                return;
                            }
                        }
                    }
                }
                Err(error) => {
                    warn!(url = %self.url, %error, "connection attempt failed");
                    self.emit(ClientEvent::Error(error.to_string())).await;
                }
            }

            match self.backoff.next() {
                Retry::After { attempt, delay } => {
                    self.emit(ClientEvent::Reconnecting {
                        attempt,
                        max_attempts: self.backoff.policy().max_attempts,
                        delay,
                    })
                    .await;
                    if !self.wait(delay).await {
                        debug!("session closed while waiting to reconnect");
                        return;
                    }
                }
                Retry::GiveUp => {
                    self.emit(ClientEvent::GaveUp).await;
                    return;
                }
                Retry::Exhausted => return,
            }
        }
    }

    /// Opens the websocket. Returns `None` if the session was closed before
    /// the handshake finished.
    async fn dial(&mut self) -> Option<Result<Socket, WsError>> {
        let connect = connect_async(self.url.clone());
        tokio::pin!(connect);
        loop {
            select! {
                result = &mut connect => return Some(result.map(|(socket, _)| socket)),
                command = self.commands.recv() => match command {
                    Some(message) => warn!(?message, "not connected; dropping message"),
                    None => return None,
                },
            }
        }
    }

    /// Sleeps before the next attempt. Returns `false` if the session was
    /// closed meanwhile.
    async fn wait(&mut self, delay: Duration) -> bool {
        let timer = sleep(delay);
        tokio::pin!(timer);
        loop {
            select! {
                _ = &mut timer => return true,
                command = self.commands.recv() => match command {
                    Some(message) => warn!(?message, "not connected; dropping message"),
                    None => return false,
                },
            }
        }
    }

    async fn pump(&mut self, socket: Socket) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();
        loop {
            select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => match ServerToClient::decode(&text) {
                        Ok(message) => self.emit(ClientEvent::Message(message)).await,
                        Err(error) => debug!(%error, "ignoring server payload"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "server closed connection");
                        return SessionEnd::Closed { clean: true };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(%error, "connection lost");
                        return SessionEnd::Closed { clean: false };
                    }
                    None => return SessionEnd::Closed { clean: false },
                },
                command = self.commands.recv() => match command {
                    Some(message) => {
                        let text = match encode(&message) {
                            Ok(text) => text,
                            Err(error) => {
                                warn!(%error, "failed to encode message");
                                continue;
                            }
                        };
                        if let Err(error) = sink.send(Message::Text(text)).await {
                            warn!(%error, "failed to send message");
                            return SessionEnd::Closed { clean: false };
                        }
                    }
                    None => {
                        if let Err(error) = sink.close().await {
                            debug!(%error, "close handshake failed");
                        }
                        return SessionEnd::UserClosed;
                    }
                },
            }
        }
    }

    async fn emit(&self, event: ClientEvent) {
        if self.events.send(event).await.is_err() {
            debug!("event receiver dropped");
        }
    }
}
