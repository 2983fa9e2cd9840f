use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    Router,
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::{net::TcpListener, sync::mpsc::UnboundedReceiver, time::timeout};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    registry::{Connection, Outbound},
    session::{ChatHub, Session},
};

const WRITER_DRAIN: Duration = Duration::from_secs(1);

pub struct ChatServer {
    listener: TcpListener,
    hub: Arc<ChatHub>,
}

impl ChatServer {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            hub: Arc::new(ChatHub::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let ChatServer { listener, hub } = self;
        let app = router(Arc::clone(&hub));

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("chat server shutting down");
                hub.shutdown().await;
            })
            .await?;

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

pub fn router(hub: Arc<ChatHub>) -> Router {
    Router::new()
        .route("/", get(upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

async fn upgrade(State(hub): State<Arc<ChatHub>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<ChatHub>) {
    let (sink, mut stream) = socket.split();
    let (connection, outbox) = Connection::new();
    let writer = tokio::spawn(write_outbound(sink, outbox));

    let mut session = Session::new(hub);
    let id = session.open(connection).await;

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => session.receive(&text).await,
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => session.receive(text).await,
                Err(error) => debug!(?id, %error, "dropping non-utf8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                debug!(?id, ?frame, "client closed connection");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(error) => {
                warn!(?id, %error, "websocket receive error");
                break;
            }
        }
    }

    session.close().await;

    // The writer ends once the registry drops the connection's queue.
    let abort = writer.abort_handle();
    if timeout(WRITER_DRAIN, writer).await.is_err() {
        abort.abort();
    }
}

async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbox: UnboundedReceiver<Outbound>,
) {
    while let Some(frame) = outbox.recv().await {
        let message = match frame {
            Outbound::Text(text) => Message::Text(text.to_string()),
            Outbound::Close => Message::Close(Some(CloseFrame {
                code: close_code::AWAY,
                reason: "server shutting down".into(),
            })),
        };
        let closing = matches!(message, Message::Close(_));
        if let Err(error) = sink.send(message).await {
            debug!(%error, "failed to deliver frame to client");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}
