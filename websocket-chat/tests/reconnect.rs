use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use futures_util::SinkExt;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    time::{Instant, timeout},
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use websocket_chat::{
    message::{ServerToClient, encode},
    reconnect::{self, ClientEvent, ReconnectPolicy},
    server::ChatServer,
};

async fn unused_addr() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?)
}

async fn next_event(events: &mut mpsc::Receiver<ClientEvent>) -> Result<ClientEvent> {
    timeout(Duration::from_secs(2), events.recv())
        .await?
        .context("controller stopped")
}

#[tokio::test(start_paused = true)]
async fn unreachable_server_gives_up_after_doubling_delays() -> Result<()> {
    let addr = unused_addr().await?;
    let start = Instant::now();
    let (handle, mut events) =
        reconnect::spawn(format!("ws://{addr}/"), ReconnectPolicy::default());

    let mut delays = Vec::new();
    let mut failures = 0;
    let mut gave_up = 0;
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Error(_) => failures += 1,
            ClientEvent::Reconnecting {
                attempt,
                max_attempts,
                delay,
            } => {
                assert_eq!(attempt as usize, delays.len() + 1);
                assert_eq!(max_attempts, 5);
                delays.push(delay.as_millis());
            }
            ClientEvent::GaveUp => gave_up += 1,
            other => panic!("unexpected event {other:?}"),
        }
    }

    assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
    assert_eq!(failures, 6);
    assert_eq!(gave_up, 1);
    assert!(start.elapsed() >= Duration::from_millis(31_000));

    handle.close().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn closing_during_backoff_cancels_the_retry() -> Result<()> {
    let addr = unused_addr().await?;
    let start = Instant::now();
    let (handle, mut events) =
        reconnect::spawn(format!("ws://{addr}/"), ReconnectPolicy::default());

    // Plain recv: a timeout here would let the paused clock skip the backoff.
    assert!(matches!(events.recv().await, Some(ClientEvent::Error(_))));
    assert!(matches!(
        events.recv().await,
        Some(ClientEvent::Reconnecting { attempt: 1, .. })
    ));

    handle.close().await;
    assert_eq!(events.recv().await, None);
    assert!(start.elapsed() < Duration::from_millis(1000));
    Ok(())
}

#[tokio::test]
async fn closing_during_a_stalled_handshake_returns() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (accepted_tx, accepted_rx) = oneshot::channel();

    // Accepts TCP but never answers the upgrade request.
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let _ = accepted_tx.send(());
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stream);
        anyhow::Ok(())
    });

    let (handle, mut events) =
        reconnect::spawn(format!("ws://{addr}/"), ReconnectPolicy::default());
    timeout(Duration::from_secs(2), accepted_rx)
        .await?
        .context("listener dropped")?;

    timeout(Duration::from_secs(2), handle.close())
        .await
        .context("close hung on a pending handshake")?;
    assert_eq!(events.recv().await, None);

    server.abort();
    Ok(())
}

#[tokio::test]
async fn abrupt_drop_reconnects_and_resets_attempts() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = tokio::spawn(async move {
        for _ in 0..2 {
            let (stream, _) = listener.accept().await?;
            let socket = accept_async(stream).await?;
            // No close handshake: the client must treat this as a lost connection.
            drop(socket);
        }
        let (stream, _) = listener.accept().await?;
        let mut socket = accept_async(stream).await?;
        socket
            .send(Message::Text(encode(&ServerToClient::system("back"))?))
            .await?;
        socket.close(None).await?;
        anyhow::Ok(())
    });

    let policy = ReconnectPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(20),
        max_delay: None,
    };
    let (handle, mut events) = reconnect::spawn(format!("ws://{addr}/"), policy);

    for _ in 0..2 {
        assert_eq!(next_event(&mut events).await?, ClientEvent::Connected);
        assert_eq!(
            next_event(&mut events).await?,
            ClientEvent::Disconnected { clean: false }
        );
        assert_eq!(
            next_event(&mut events).await?,
            ClientEvent::Reconnecting {
                attempt: 1,
                max_attempts: 3,
                delay: Duration::from_millis(20),
            }
        );
    }

    assert_eq!(next_event(&mut events).await?, ClientEvent::Connected);
    assert!(matches!(
        next_event(&mut events).await?,
        ClientEvent::Message(ServerToClient::System { message, .. }) if message == "back"
    ));
    assert_eq!(
        next_event(&mut events).await?,
        ClientEvent::Disconnected { clean: true }
    );
    assert_eq!(events.recv().await, None);

    handle.close().await;
    server.await??;
    Ok(())
}

#[tokio::test]
async fn server_shutdown_is_a_clean_close() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server = ChatServer::new(listener);
    let addr = server.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run_until(async move {
        let _ = shutdown_rx.await;
    }));

    let (handle, mut events) =
        reconnect::spawn(format!("ws://{addr}/"), ReconnectPolicy::default());

    assert_eq!(next_event(&mut events).await?, ClientEvent::Connected);
    assert!(matches!(
        next_event(&mut events).await?,
        ClientEvent::Message(ServerToClient::System { .. })
    ));
    assert!(matches!(
        next_event(&mut events).await?,
        ClientEvent::Message(ServerToClient::UserCount { count: 1, .. })
    ));

    let _ = shutdown_tx.send(());
    assert_eq!(
        next_event(&mut events).await?,
        ClientEvent::Disconnected { clean: true }
    );
    assert_eq!(events.recv().await, None);

    handle.close().await;
    task.await??;
    Ok(())
}
