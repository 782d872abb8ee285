//! Line-oriented front end: stdin lines become input, session events are
//! printed to stdout.

use std::io::Write;

use anyhow::Result;
use session_mux::{MessageKind, MuxClient, MuxEvent, SessionEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Agent,
    Shell,
}

const HELP: &str = "\
/more          load older history (agent)
/hide, /show   simulate the page going to the background and back
/online        the network came back
/retry         retry after the connection gave up
/reconnect     re-send this session's connect now
/token <t>     re-authenticate with a new token
/close         end the session on the server and exit
/quit          disconnect and exit";

enum Action {
    Continue,
    Exit,
}

pub async fn run(client: MuxClient, key: String, target: Target) -> Result<()> {
    let mut key = key;
    let mut sessions = client.registry().events();
    let mut connection = client.mux().events();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("type /help for commands");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match handle_line(&client, &key, target, &line) {
                    Ok(Action::Continue) => {}
                    Ok(Action::Exit) => break,
                    Err(e) => eprintln!("! {e}"),
                }
            }
            event = sessions.recv() => match event {
                Ok(event) => {
                    if let SessionEvent::Renamed { from, to } = &event
                        && *from == key
                    {
                        key = to.clone();
                    }
                    let ended = matches!(
                        &event,
                        SessionEvent::ShellExited { key: k, .. } if *k == key
                    );
                    render(&event, &key);
                    if ended {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "fell behind on session events"),
                Err(RecvError::Closed) => break,
            },
            event = connection.recv() => match event {
                Ok(event) => render_connection(&event),
                Err(RecvError::Lagged(n)) => {
                    debug!(skipped = n, "fell behind on connection events")
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.shutdown();
    Ok(())
}

fn handle_line(client: &MuxClient, key: &str, target: Target, line: &str) -> Result<Action> {
    let (command, rest) = match line.strip_prefix('/') {
        Some(cmd) => cmd.split_once(' ').unwrap_or((cmd, "")),
        None => {
            match target {
                Target::Agent => {
                    client.agent().send_input(key, line)?;
                }
                Target::Shell => {
                    client.shell().send_input(key, &format!("{line}\n"))?;
                }
            }
            return Ok(Action::Continue);
        }
    };

    match command {
        "help" => println!("{HELP}"),
        "more" if target == Target::Agent => {
            if !client.agent().load_more_history(key)? {
                println!("* no older history to load");
            }
        }
        "hide" => client.mux().set_visible(false),
        "show" => client.mux().set_visible(true),
        "online" => client.mux().network_online(),
        "offline" => client.mux().network_offline(),
        "retry" => client.mux().retry(),
        "reconnect" => {
            if !client.registry().reconnect_now(key) {
                println!("* {key} will not reconnect");
            }
        }
        "token" if !rest.trim().is_empty() => client.mux().reauthenticate(rest.trim()),
        "close" => {
            match target {
                Target::Agent => client.agent().close(key)?,
                Target::Shell => client.shell().close(key)?,
            };
            return Ok(Action::Exit);
        }
        "quit" => {
            match target {
                Target::Agent => client.agent().disconnect(key)?,
                Target::Shell => client.shell().disconnect(key)?,
            };
            return Ok(Action::Exit);
        }
        other => println!("* unknown command /{other}, try /help"),
    }
    Ok(Action::Continue)
}

fn render(event: &SessionEvent, current: &str) {
    match event {
        SessionEvent::Committed { key, message } if key == current => {
            let label = match message.kind {
                MessageKind::User => "you",
                MessageKind::Assistant => "agent",
                MessageKind::ToolUse => "tool",
                MessageKind::ToolResult => "result",
                MessageKind::System => "system",
            };
            println!("[{label}] {}", message.content);
        }
        SessionEvent::StreamDelta { key, text, .. } if key == current => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        SessionEvent::StreamFinished { key, .. } if key == current => println!(),
        SessionEvent::Thinking { key, active: true } if key == current => println!("* thinking"),
        SessionEvent::ToolActive {
            key,
            name: Some(name),
        } if key == current => println!("* running {name}"),
        SessionEvent::ShellOutput { key, data } if key == current => {
            print!("{data}");
            let _ = std::io::stdout().flush();
        }
        SessionEvent::ShellExited { code, .. } => println!("* shell exited ({code:?})"),
        SessionEvent::StatusChanged { key, status } => println!("* {key} {status}"),
        SessionEvent::Renamed { from, to } => println!("* {from} is now {to}"),
        SessionEvent::ReconnectScheduled {
            key,
            attempt,
            delay,
        } => println!("* reconnecting {key} in {}ms (attempt {attempt})", delay.as_millis()),
        SessionEvent::HistoryLoaded { committed, has_more, .. } => {
            let hint = if *has_more { ", /more for older" } else { "" };
            println!("* {committed} messages replayed{hint}");
        }
        SessionEvent::HistoryPrepended { count, has_more, .. } => {
            let hint = if *has_more { "" } else { ", that's all" };
            println!("* {count} older messages loaded{hint}");
        }
        SessionEvent::Error { key, error } => {
            println!("! {key}: {error} (recovery: {:?})", error.recovery());
        }
        other => debug!(?other, "session event"),
    }
}

fn render_connection(event: &MuxEvent) {
    match event {
        MuxEvent::StateChanged { to, .. } => println!("* connection {to}"),
        MuxEvent::Authenticated { reconnect: true } => println!("* reconnected"),
        MuxEvent::Authenticated { .. } => {}
        _ => {
            if let Some(error) = event.surfaced() {
                println!("! {error} (recovery: {:?})", error.recovery());
            }
        }
    }
}
