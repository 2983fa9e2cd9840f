use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
};
use tracing::warn;

use crate::{
    cli::ClientArgs,
    message::{ClientToServer, ServerToClient},
    reconnect::{self, ClientEvent, ClientHandle},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let url = websocket_url(&args.server)?;
    let (handle, mut events) = reconnect::spawn(url, args.policy());

    // `next_line` is cancel safe, so a partly typed line survives an event
    // winning the select.
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut connected = false;

    loop {
        select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                handle_event(event, &handle, args.username.as_deref(), &mut connected).await?;
            }
            line = stdin.next_line() => {
                if !handle_stdin_input(line, &handle, connected).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }

    handle.close().await;
    Ok(())
}

/// Maps an `http(s)` or `ws(s)` base URL to the websocket endpoint.
pub fn websocket_url(server: &str) -> Result<String> {
    let (scheme, rest) = server
        .split_once("://")
        .with_context(|| format!("server url '{server}' has no scheme"))?;
    let scheme = match scheme {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => bail!("unsupported url scheme '{other}'"),
    };
    Ok(format!("{scheme}://{rest}"))
}

async fn handle_event(
    event: ClientEvent,
    handle: &ClientHandle,
    username: Option<&str>,
    connected: &mut bool,
) -> Result<()> {
    match &event {
        ClientEvent::Connected => {
            *connected = true;
            if let Some(username) = username {
                let rename = ClientToServer::SetUsername {
                    username: username.to_string(),
                };
                if handle.send(rename).await.is_err() {
                    warn!("controller stopped before username was sent");
                }
            }
        }
        ClientEvent::Disconnected { .. } | ClientEvent::GaveUp => *connected = false,
        _ => {}
    }

    match render_event(&event) {
        Line::Out(line) => write_stdout(&line).await?,
        Line::Err(line) => write_stderr(&line).await?,
    }
    Ok(())
}

async fn handle_stdin_input(
    line: io::Result<Option<String>>,
    handle: &ClientHandle,
    connected: bool,
) -> Result<bool> {
    let Some(line) = line? else {
        return Ok(false);
    };

    let message = match parse_input(&line) {
        Input::Empty => return Ok(true),
        Input::Quit => {
            write_stdout("*** leaving chat").await?;
            return Ok(false);
        }
        Input::MissingName => {
            write_stderr("!!! usage: /name <new name>").await?;
            return Ok(true);
        }
        Input::Send(message) => message,
    };

    if !connected {
        write_stderr("!!! not connected; message dropped").await?;
        return Ok(true);
    }
    if handle.send(message).await.is_err() {
        return Ok(false);
    }
    Ok(true)
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Empty,
    Quit,
    MissingName,
    Send(ClientToServer),
}

fn parse_input(line: &str) -> Input {
    let text = line.trim();
    if text.is_empty() {
        return Input::Empty;
    }
    if text.eq_ignore_ascii_case("/quit") {
        return Input::Quit;
    }

    let rename = text
        .strip_prefix("/name")
        .filter(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace));
    match rename.map(str::trim) {
        Some("") => Input::MissingName,
        Some(username) => Input::Send(ClientToServer::SetUsername {
            username: username.to_string(),
        }),
        None => Input::Send(ClientToServer::Chat {
            text: text.to_string(),
        }),
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Out(String),
    Err(String),
}

fn render_event(event: &ClientEvent) -> Line {
    match event {
        ClientEvent::Connected => Line::Out("*** connected to chat server".into()),
        ClientEvent::Disconnected { clean: true } => {
            Line::Out("*** disconnected from server".into())
        }
        ClientEvent::Disconnected { clean: false } => {
            Line::Out("*** connection lost, trying to reconnect...".into())
        }
        ClientEvent::Reconnecting {
            attempt,
            max_attempts,
            delay,
        } => Line::Out(format!(
            "*** reconnecting ({attempt}/{max_attempts}) in {}ms...",
            delay.as_millis()
        )),
        ClientEvent::GaveUp => {
            Line::Out("*** could not reconnect; restart the client to try again".into())
        }
        ClientEvent::Error(error) => Line::Err(format!("!!! connection error: {error}")),
        ClientEvent::Message(message) => Line::Out(render_message(message)),
    }
}

fn render_message(message: &ServerToClient) -> String {
    match message {
        ServerToClient::Chat {
            username,
            message,
            timestamp,
        } => format!("[{}] <{username}> {message}", local_time(timestamp)),
        ServerToClient::System { message, .. } => format!("*** {message}"),
        ServerToClient::UserCount { count, users, .. } => {
            let noun = if *count == 1 { "user" } else { "users" };
            format!("*** {count} {noun} online: {}", users.join(", "))
        }
    }
}

fn local_time(timestamp: &str) -> String {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|time| time.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|_| timestamp.to_string())
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn maps_page_schemes_to_websocket_schemes() {
        assert_eq!(
            websocket_url("http://localhost:3000/").expect("http"),
            "ws://localhost:3000/"
        );
        assert_eq!(
            websocket_url("https://chat.example.com").expect("https"),
            "wss://chat.example.com"
        );
        assert_eq!(
            websocket_url("ws://127.0.0.1:3000/").expect("ws"),
            "ws://127.0.0.1:3000/"
        );
        assert!(websocket_url("ftp://example.com").is_err());
        assert!(websocket_url("localhost:3000").is_err());
    }

    #[test]
    fn renders_roster_and_notices() {
        let single = ServerToClient::UserCount {
            count: 1,
            users: vec!["alice".into()],
            timestamp: String::new(),
        };
        assert_eq!(render_message(&single), "*** 1 user online: alice");

        let pair = ServerToClient::user_count(vec!["alice".into(), "bob".into()]);
        assert_eq!(render_message(&pair), "*** 2 users online: alice, bob");

        assert_eq!(
            render_event(&ClientEvent::Reconnecting {
                attempt: 2,
                max_attempts: 5,
                delay: Duration::from_millis(2000),
            }),
            Line::Out("*** reconnecting (2/5) in 2000ms...".into())
        );
        assert!(matches!(
            render_event(&ClientEvent::Error("refused".into())),
            Line::Err(line) if line.ends_with("refused")
        ));
    }

    #[test]
    fn parses_name_and_quit_commands() {
        assert_eq!(parse_input("   "), Input::Empty);
        assert_eq!(parse_input("/QUIT\n"), Input::Quit);
        assert_eq!(parse_input("/name"), Input::MissingName);
        assert_eq!(parse_input("/name    "), Input::MissingName);
        assert_eq!(
            parse_input("/name  robert \n"),
            Input::Send(ClientToServer::SetUsername {
                username: "robert".into()
            })
        );
        assert_eq!(
            parse_input("/names are fun"),
            Input::Send(ClientToServer::Chat {
                text: "/names are fun".into()
            })
        );
        assert_eq!(
            parse_input(" hello "),
            Input::Send(ClientToServer::Chat {
                text: "hello".into()
            })
        );
    }

    #[test]
    fn chat_lines_fall_back_to_raw_timestamp() {
        let chat = ServerToClient::Chat {
            username: "bob".into(),
            message: "hi".into(),
            timestamp: "yesterday".into(),
        };
        assert_eq!(render_message(&chat), "[yesterday] <bob> hi");

        let stamped = ServerToClient::chat("bob", "hi");
        let rendered = render_message(&stamped);
        assert!(rendered.ends_with("] <bob> hi"));
        assert_eq!(rendered.find(']'), Some(9));
    }
}
