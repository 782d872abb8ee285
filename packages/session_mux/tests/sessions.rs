//! End-to-end session scenarios over the in-process transport.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::Instant;

use session_mux::config::{ServerConfig, SessionConfig};
use session_mux::{
    Channel, ClientConfig, MemoryServer, MessageKind, MuxClient, NoView, SendOutcome, ServerEnd,
    SessionEvent, SessionStatus, SurfacedError, memory_pair,
};

// --- harness ---

fn client_with(config: ClientConfig) -> (MuxClient, MemoryServer) {
    let (transport, server) = memory_pair();
    (MuxClient::new(transport, &config, Arc::new(NoView)), server)
}

fn client() -> (MuxClient, MemoryServer) {
    client_with(ClientConfig {
        server: ServerConfig {
            token: "secret".to_string(),
            ..Default::default()
        },
        ..Default::default()
    })
}

async fn handshake(end: &mut ServerEnd) {
    let auth = end.recv().await.unwrap();
    assert_eq!(auth.kind, "auth");
    assert_eq!(auth.payload["token"], "secret");
    end.send_system("auth_success", json!({})).await;
}

async fn wait_for<T>(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut f: impl FnMut(&SessionEvent) -> Option<T>,
) -> T {
    let found = tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = f(&event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("session events closed"),
            }
        }
    })
    .await;
    found.expect("timed out waiting for session event")
}

/// Read the client's connect for `temporary` and answer it with `durable`.
async fn attach(
    end: &mut ServerEnd,
    events: &mut broadcast::Receiver<SessionEvent>,
    temporary: &str,
    durable: &str,
) {
    let connect = end.recv_skip_ping().await.unwrap();
    assert_eq!(connect.channel, Channel::Agent);
    assert_eq!(connect.kind, "connect");
    assert_eq!(connect.session_key.as_deref(), Some(temporary));
    end.send_to(
        Channel::Agent,
        durable,
        "ready",
        json!({"original_session_id": temporary, "history_count": 0}),
    )
    .await;
    wait_for(events, |e| match e {
        SessionEvent::Renamed { to, .. } if to == durable => Some(()),
        _ => None,
    })
    .await;
}

fn status(client: &MuxClient, key: &str) -> SessionStatus {
    client.registry().with_session(key, |s| s.status).unwrap()
}

// --- durable keys ---

#[tokio::test(start_paused = true)]
async fn temporary_key_is_replaced_by_server_key() {
    let (client, mut server) = client();
    let mut events = client.registry().events();
    let tmp = client.open_agent("work", json!({"cwd": "/tmp"})).unwrap();
    assert!(tmp.starts_with("new-"));

    let mut end = server.accept().await.unwrap();
    handshake(&mut end).await;
    let connect = end.recv_skip_ping().await.unwrap();
    assert_eq!(connect.session_key.as_deref(), Some(tmp.as_str()));
    assert_eq!(connect.payload["resume"], false);
    assert_eq!(connect.payload["cwd"], "/tmp");

    end.send_to(
        Channel::Agent,
        "srv-9",
        "ready",
        json!({"original_session_id": tmp, "history_count": 0}),
    )
    .await;
    let (from, to) = wait_for(&mut events, |e| match e {
        SessionEvent::Renamed { from, to } => Some((from.clone(), to.clone())),
        _ => None,
    })
    .await;
    assert_eq!((from.as_str(), to.as_str()), (tmp.as_str(), "srv-9"));
    assert!(!client.registry().has(&tmp));
    assert_eq!(client.registry().active().as_deref(), Some("srv-9"));
    assert_eq!(status(&client, "srv-9"), SessionStatus::Connected);
    assert!(client.mux().is_subscribed(Channel::Agent, "srv-9"));

    assert_eq!(
        client.agent().send_input("srv-9", "hello").unwrap(),
        SendOutcome::Written
    );
    let input = end.recv_skip_ping().await.unwrap();
    assert_eq!(input.kind, "input");
    assert_eq!(input.session_key.as_deref(), Some("srv-9"));
    assert_eq!(input.payload["text"], "hello");
}

// --- reconnects ---

#[tokio::test(start_paused = true)]
async fn server_disconnect_reconnects_only_that_session() {
    let (client, mut server) = client();
    let mut events = client.registry().events();
    let a = client.open_agent("a", json!({"model": "m"})).unwrap();
    let b = client.open_agent("b", json!({})).unwrap();

    let mut end = server.accept().await.unwrap();
    handshake(&mut end).await;
    attach(&mut end, &mut events, &a, "srv-a").await;
    attach(&mut end, &mut events, &b, "srv-b").await;

    let start = Instant::now();
    end.send_to(
        Channel::Agent,
        "srv-a",
        "disconnected",
        json!({"reason": "agent restarted"}),
    )
    .await;
    let (attempt, delay) = wait_for(&mut events, |e| match e {
        SessionEvent::ReconnectScheduled {
            key,
            attempt,
            delay,
        } if key == "srv-a" => Some((*attempt, *delay)),
        _ => None,
    })
    .await;
    assert_eq!(attempt, 1);
    assert_eq!(delay, Duration::from_millis(500));
    assert_eq!(status(&client, "srv-a"), SessionStatus::Disconnected);

    let resume = end.recv_skip_ping().await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(500));
    assert_eq!(resume.kind, "connect");
    assert_eq!(resume.session_key.as_deref(), Some("srv-a"));
    assert_eq!(resume.payload["resume"], true);
    assert_eq!(resume.payload["model"], "m");
    assert_eq!(status(&client, "srv-a"), SessionStatus::Connecting);

    // the other session never noticed
    assert_eq!(status(&client, "srv-b"), SessionStatus::Connected);
    assert_eq!(
        client
            .registry()
            .with_session("srv-b", |s| s.reconnect.attempts)
            .unwrap(),
        0
    );
    assert_eq!(server.opens(), 1);

    end.send_to(Channel::Agent, "srv-a", "ready", json!({"history_count": 0}))
        .await;
    wait_for(&mut events, |e| match e {
        SessionEvent::StatusChanged { key, status } if key == "srv-a" => {
            (*status == SessionStatus::Connected).then_some(())
        }
        _ => None,
    })
    .await;
    assert_eq!(
        client
            .registry()
            .with_session("srv-a", |s| s.reconnect.attempts)
            .unwrap(),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn dropped_socket_resumes_before_queued_input() {
    let (client, mut server) = client();
    let mut events = client.registry().events();
    let tmp = client.open_agent("work", json!({})).unwrap();

    let mut end = server.accept().await.unwrap();
    handshake(&mut end).await;
    attach(&mut end, &mut events, &tmp, "srv-1").await;

    end.close();
    wait_for(&mut events, |e| match e {
        SessionEvent::StatusChanged { key, status } if key == "srv-1" => {
            (*status == SessionStatus::Disconnected).then_some(())
        }
        _ => None,
    })
    .await;
    assert_eq!(
        client.agent().send_input("srv-1", "typed offline").unwrap(),
        SendOutcome::Queued
    );

    let mut end = server.accept().await.unwrap();
    handshake(&mut end).await;
    let resume = end.recv_skip_ping().await.unwrap();
    assert_eq!(resume.kind, "connect");
    assert_eq!(resume.session_key.as_deref(), Some("srv-1"));
    assert_eq!(resume.payload["resume"], true);
    let input = end.recv_skip_ping().await.unwrap();
    assert_eq!(input.kind, "input");
    assert_eq!(input.payload["text"], "typed offline");

    assert_eq!(server.opens(), 2);
    assert_eq!(client.mux().pending_len(), 0);
    assert_eq!(status(&client, "srv-1"), SessionStatus::Connecting);
}

#[tokio::test(start_paused = true)]
async fn session_opened_during_outage_attaches_once() {
    let (client, mut server) = client();
    let mut events = client.registry().events();
    let first = client.open_agent("first", json!({})).unwrap();

    let mut end = server.accept().await.unwrap();
    handshake(&mut end).await;
    attach(&mut end, &mut events, &first, "srv-1").await;

    end.close();
    wait_for(&mut events, |e| match e {
        SessionEvent::StatusChanged { key, status } if key == "srv-1" => {
            (*status == SessionStatus::Disconnected).then_some(())
        }
        _ => None,
    })
    .await;
    let second = client.open_agent("second", json!({})).unwrap();

    let mut end = server.accept().await.unwrap();
    handshake(&mut end).await;
    let mut connects = Vec::new();
    while let Ok(Some(frame)) =
        tokio::time::timeout(Duration::from_secs(2), end.recv_skip_ping()).await
    {
        if frame.kind == "connect" && frame.session_key.as_deref() == Some(second.as_str()) {
            connects.push(frame);
        }
    }
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].payload["resume"], false);
}

// --- history ---

#[tokio::test(start_paused = true)]
async fn history_replay_then_older_page() {
    let (client, mut server) = client_with(ClientConfig {
        server: ServerConfig {
            token: "secret".to_string(),
            ..Default::default()
        },
        session: SessionConfig {
            history_page_size: 2,
            ..Default::default()
        },
        ..Default::default()
    });
    let mut events = client.registry().events();
    let tmp = client.open_agent("long", json!({})).unwrap();

    let mut end = server.accept().await.unwrap();
    handshake(&mut end).await;
    end.recv_skip_ping().await.unwrap();
    end.send_to(
        Channel::Agent,
        "srv-h",
        "ready",
        json!({"original_session_id": tmp, "history_count": 100}),
    )
    .await;
    for i in 97..100 {
        end.send_to(
            Channel::Agent,
            "srv-h",
            "assistant",
            json!({"id": format!("m{i}"), "content": format!("reply {i}")}),
        )
        .await;
    }
    end.send_to(
        Channel::Agent,
        "srv-h",
        "history_end",
        json!({"total": 100, "count": 3}),
    )
    .await;
    let (committed, has_more) = wait_for(&mut events, |e| match e {
        SessionEvent::HistoryLoaded {
            committed,
            has_more,
            ..
        } => Some((*committed, *has_more)),
        _ => None,
    })
    .await;
    assert_eq!((committed, has_more), (3, true));

    assert!(client.agent().load_more_history("srv-h").unwrap());
    // one page at a time
    assert!(!client.agent().load_more_history("srv-h").unwrap());
    let request = end.recv_skip_ping().await.unwrap();
    assert_eq!(request.kind, "load_more_history");
    assert_eq!(request.payload["before_index"], 97);
    assert_eq!(request.payload["limit"], 2);

    for i in 95..97 {
        end.send_to(
            Channel::Agent,
            "srv-h",
            "assistant",
            json!({"id": format!("m{i}"), "content": format!("reply {i}")}),
        )
        .await;
    }
    end.send_to(
        Channel::Agent,
        "srv-h",
        "history_page_end",
        json!({"count": 2, "has_more": true, "oldest_index": 95}),
    )
    .await;
    let (count, anchor) = wait_for(&mut events, |e| match e {
        SessionEvent::HistoryPrepended { count, anchor, .. } => Some((*count, anchor.clone())),
        _ => None,
    })
    .await;
    assert_eq!(count, 2);
    assert_eq!(anchor.as_deref(), Some("m97"));

    let ids = client
        .registry()
        .with_session("srv-h", |s| {
            s.messages.iter().map(|m| m.id.clone()).collect::<Vec<_>>()
        })
        .unwrap();
    assert_eq!(ids, vec!["m95", "m96", "m97", "m98", "m99"]);
    assert_eq!(
        client
            .registry()
            .with_session("srv-h", |s| s.history.oldest_loaded_index)
            .unwrap(),
        Some(95)
    );
}

#[tokio::test(start_paused = true)]
async fn page_end_with_overflowing_bounds_is_ignored() {
    let (client, mut server) = client();
    let mut events = client.registry().events();
    let tmp = client.open_agent("long", json!({})).unwrap();

    let mut end = server.accept().await.unwrap();
    handshake(&mut end).await;
    end.recv_skip_ping().await.unwrap();
    end.send_to(
        Channel::Agent,
        "srv-o",
        "ready",
        json!({"original_session_id": tmp, "history_count": 1}),
    )
    .await;
    end.send_to(Channel::Agent, "srv-o", "user", json!({"content": "m99"}))
        .await;
    end.send_to(
        Channel::Agent,
        "srv-o",
        "history_end",
        json!({"total": 100, "count": 1}),
    )
    .await;
    wait_for(&mut events, |e| match e {
        SessionEvent::HistoryLoaded { .. } => Some(()),
        _ => None,
    })
    .await;

    assert!(client.agent().load_more_history("srv-o").unwrap());
    assert_eq!(end.recv_skip_ping().await.unwrap().kind, "load_more_history");
    end.send_to(
        Channel::Agent,
        "srv-o",
        "history_page_end",
        json!({"count": u64::MAX, "has_more": true, "oldest_index": 5}),
    )
    .await;
    wait_for(&mut events, |e| match e {
        SessionEvent::StalePageDiscarded { key } if key == "srv-o" => Some(()),
        _ => None,
    })
    .await;

    // the session keeps processing frames
    end.send_to(Channel::Agent, "srv-o", "user", json!({"content": "still here"}))
        .await;
    let content = wait_for(&mut events, |e| match e {
        SessionEvent::Committed { key, message } if key == "srv-o" => {
            Some(message.content.clone())
        }
        _ => None,
    })
    .await;
    assert_eq!(content, "still here");
}

// --- errors ---

#[tokio::test(start_paused = true)]
async fn permanent_error_stops_routing() {
    let (client, mut server) = client();
    let mut events = client.registry().events();
    let tmp = client.open_agent("gone", json!({})).unwrap();

    let mut end = server.accept().await.unwrap();
    handshake(&mut end).await;
    attach(&mut end, &mut events, &tmp, "srv-p").await;

    end.send_to(
        Channel::Agent,
        "srv-p",
        "error",
        json!({"message": "session not found", "permanent": true}),
    )
    .await;
    let error = wait_for(&mut events, |e| match e {
        SessionEvent::Error { key, error } if key == "srv-p" => Some(error.clone()),
        _ => None,
    })
    .await;
    assert_eq!(
        error,
        SurfacedError::Permanent {
            message: "session not found".to_string()
        }
    );
    assert!(!client.mux().is_subscribed(Channel::Agent, "srv-p"));
    assert_eq!(status(&client, "srv-p"), SessionStatus::Disconnected);
    let (should_reconnect, last) = client
        .registry()
        .with_session("srv-p", |s| {
            (
                s.reconnect.should_reconnect,
                s.messages.last().map(|m| m.kind),
            )
        })
        .unwrap();
    assert!(!should_reconnect);
    assert_eq!(last, Some(MessageKind::System));

    // a new socket does not resurrect it
    end.close();
    let mut end = server.accept().await.unwrap();
    handshake(&mut end).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(end.drain().iter().all(|f| f.kind == "ping"));
}

// --- shell ---

#[tokio::test(start_paused = true)]
async fn shell_streams_output_until_exit() {
    let (client, mut server) = client();
    let mut events = client.registry().events();
    let tmp = client.open_shell("sh", 80, 24).unwrap();

    let mut end = server.accept().await.unwrap();
    handshake(&mut end).await;
    let connect = end.recv_skip_ping().await.unwrap();
    assert_eq!(connect.channel, Channel::Shell);
    assert_eq!(connect.payload["cols"], 80);
    assert_eq!(connect.payload["rows"], 24);
    assert_eq!(connect.payload["resume"], false);

    end.send_to(
        Channel::Shell,
        "pty-1",
        "connected",
        json!({"original_session_id": tmp, "cols": 80, "rows": 24}),
    )
    .await;
    end.send_to(Channel::Shell, "pty-1", "output", json!({"data": "$ "}))
        .await;
    let (key, data) = wait_for(&mut events, |e| match e {
        SessionEvent::ShellOutput { key, data } => Some((key.clone(), data.clone())),
        _ => None,
    })
    .await;
    assert_eq!((key.as_str(), data.as_str()), ("pty-1", "$ "));
    assert_eq!(status(&client, "pty-1"), SessionStatus::Connected);

    client.shell().send_input("pty-1", "ls\n").unwrap();
    client.shell().resize("pty-1", 120, 40).unwrap();
    let input = end.recv_skip_ping().await.unwrap();
    assert_eq!((input.kind.as_str(), input.payload["data"].as_str()), ("input", Some("ls\n")));
    let resize = end.recv_skip_ping().await.unwrap();
    assert_eq!(resize.kind, "resize");
    assert_eq!(resize.payload["cols"], 120);

    end.send_to(Channel::Shell, "pty-1", "exit", json!({"code": 0}))
        .await;
    let code = wait_for(&mut events, |e| match e {
        SessionEvent::ShellExited { code, .. } => Some(*code),
        _ => None,
    })
    .await;
    assert_eq!(code, Some(0));
    assert!(!client.mux().is_subscribed(Channel::Shell, "pty-1"));
    assert!(
        !client
            .registry()
            .with_session("pty-1", |s| s.reconnect.should_reconnect)
            .unwrap()
    );
}
