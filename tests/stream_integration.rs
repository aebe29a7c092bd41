//! Integration tests for the viewer WebSocket channel: live tailing,
//! truncation, exclusivity and takeover, against a real relay on real
//! temp directories.

mod common;

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::{append_line, log_line, pair_device, start_relay};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(url: &str) -> Ws {
    let (ws, _) = connect_async(url).await.expect("ws connect");
    ws
}

fn envelope(kind: &str, payload: Value) -> Message {
    Message::Text(
        json!({
            "type": kind,
            "payload": payload,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
        .to_string(),
    )
}

/// Receive the next JSON envelope, skipping transport frames.
async fn recv_envelope(ws: &mut Ws) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for envelope")
            .expect("stream ended")
            .expect("ws error");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).expect("envelope json"),
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Receive envelopes until one of the wanted type arrives.
async fn recv_type(ws: &mut Ws, wanted: &str) -> Value {
    for _ in 0..50 {
        let envelope = recv_envelope(ws).await;
        if envelope["type"] == wanted {
            return envelope["payload"].clone();
        }
    }
    panic!("never received {wanted}");
}

/// Subscribe, retrying while the session is still being discovered.
async fn subscribe_ready(ws: &mut Ws, session_id: &str) {
    for _ in 0..50 {
        ws.send(envelope("subscribe", json!({ "session_id": session_id })))
            .await
            .expect("send subscribe");
        loop {
            let envelope = recv_envelope(ws).await;
            match envelope["type"].as_str() {
                Some("subscribed") => return,
                Some("error") => {
                    assert_eq!(envelope["payload"]["code"], "unknown_session");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    break;
                }
                // Broadcast chatter (discoveries, status) is fine to skip.
                _ => {}
            }
        }
    }
    panic!("session {session_id} never became subscribable");
}

/// Assert no session_message arrives within the window.
async fn expect_no_session_message(ws: &mut Ws, window: Duration) {
    let result = tokio::time::timeout(window, async {
        loop {
            let envelope = recv_envelope(ws).await;
            if envelope["type"] == "session_message" {
                panic!("unexpected session_message: {envelope}");
            }
        }
    })
    .await;
    assert!(result.is_err(), "quiet window should elapse");
}

/// A fresh project dir with an empty session log.
fn empty_session(root: &Path, session: &str) -> PathBuf {
    let project = root.join("proj");
    std::fs::create_dir_all(&project).unwrap();
    let log = project.join(format!("{session}.jsonl"));
    std::fs::write(&log, "").unwrap();
    log
}

#[tokio::test]
async fn test_single_line_tail_then_state() {
    let dir = TempDir::new().unwrap();
    let log = empty_session(dir.path(), "s1");
    let relay = start_relay(dir.path()).await;
    let key = pair_device(&relay.base_url(), "D1").await;

    let mut ws = connect(&format!("{}?key={key}", relay.ws_url())).await;
    recv_type(&mut ws, "connected").await;
    let auth = recv_type(&mut ws, "authenticated").await;
    assert_eq!(auth["success"], true);
    assert_eq!(auth["device_id"], "D1");

    subscribe_ready(&mut ws, "s1").await;
    recv_type(&mut ws, "session_history_start").await;
    recv_type(&mut ws, "session_history_end").await;

    append_line(&log, &log_line("s1", "user", "hi"));

    let message = recv_type(&mut ws, "session_message").await;
    assert_eq!(message["role"], "user");
    assert_eq!(message["content"], "hi");
    assert_eq!(message["historical"], false);

    let state = recv_type(&mut ws, "session_state").await;
    assert_eq!(state["state"], "working");
}

#[tokio::test]
async fn test_history_prelude_replays_existing_tail() {
    let dir = TempDir::new().unwrap();
    let log = empty_session(dir.path(), "s1");
    append_line(&log, &log_line("s1", "user", "question"));
    append_line(&log, &log_line("s1", "assistant", "answer"));

    let relay = start_relay(dir.path()).await;
    let base = relay.base_url();
    let key = pair_device(&base, "D1").await;

    // Wait for the catch-up read to land before subscribing, so both
    // records are in the replay buffer.
    let client = reqwest::Client::new();
    for _ in 0..50 {
        let body: Value = client
            .get(format!("{base}/api/sessions"))
            .bearer_auth(&key)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if body["sessions"][0]["record_count"] == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let mut ws = connect(&format!("{}?key={key}", relay.ws_url())).await;
    recv_type(&mut ws, "authenticated").await;
    subscribe_ready(&mut ws, "s1").await;

    recv_type(&mut ws, "session_history_start").await;
    let first = recv_type(&mut ws, "session_message").await;
    assert_eq!(first["content"], "question");
    assert_eq!(first["historical"], true);
    let second = recv_type(&mut ws, "session_message").await;
    assert_eq!(second["content"], "answer");
    assert_eq!(second["historical"], true);
    recv_type(&mut ws, "session_history_end").await;
}

#[tokio::test]
async fn test_truncation_never_duplicates() {
    let dir = TempDir::new().unwrap();
    let log = empty_session(dir.path(), "s1");
    let relay = start_relay(dir.path()).await;
    let key = pair_device(&relay.base_url(), "D1").await;

    let mut ws = connect(&format!("{}?key={key}", relay.ws_url())).await;
    recv_type(&mut ws, "authenticated").await;
    subscribe_ready(&mut ws, "s1").await;
    recv_type(&mut ws, "session_history_end").await;

    append_line(&log, &log_line("s1", "user", "one"));
    append_line(&log, &log_line("s1", "user", "two"));
    assert_eq!(recv_type(&mut ws, "session_message").await["content"], "one");
    assert_eq!(recv_type(&mut ws, "session_message").await["content"], "two");

    // Truncate to zero: the viewer must see nothing new.
    std::fs::write(&log, "").unwrap();
    expect_no_session_message(&mut ws, Duration::from_millis(400)).await;

    // One new line after the truncation: exactly one more message.
    append_line(&log, &log_line("s1", "user", "three"));
    assert_eq!(
        recv_type(&mut ws, "session_message").await["content"],
        "three"
    );
    expect_no_session_message(&mut ws, Duration::from_millis(400)).await;
}

#[tokio::test]
async fn test_exclusive_viewer_with_takeover() {
    let dir = TempDir::new().unwrap();
    let log = empty_session(dir.path(), "s1");
    let relay = start_relay(dir.path()).await;
    let base = relay.base_url();
    let key_a = pair_device(&base, "device-a").await;
    let key_b = pair_device(&base, "device-b").await;

    let mut a = connect(&format!("{}?key={key_a}", relay.ws_url())).await;
    recv_type(&mut a, "authenticated").await;
    subscribe_ready(&mut a, "s1").await;
    recv_type(&mut a, "session_history_end").await;

    // B without force is refused and A keeps streaming.
    let mut b = connect(&format!("{}?key={key_b}", relay.ws_url())).await;
    recv_type(&mut b, "authenticated").await;
    b.send(envelope("subscribe", json!({ "session_id": "s1", "force": false })))
        .await
        .unwrap();
    let occupied = recv_type(&mut b, "session_occupied").await;
    assert_eq!(occupied["existing_device"], "device-a");
    assert_eq!(occupied["can_take_over"], true);

    append_line(&log, &log_line("s1", "user", "for-a"));
    assert_eq!(recv_type(&mut a, "session_message").await["content"], "for-a");

    // B with force displaces A.
    b.send(envelope("subscribe", json!({ "session_id": "s1", "force": true })))
        .await
        .unwrap();
    recv_type(&mut b, "subscribed").await;
    recv_type(&mut b, "session_history_end").await;

    let taken_over = recv_type(&mut a, "session_taken_over").await;
    assert_eq!(taken_over["new_device"], "device-b");
    // A's channel closes with the takeover code.
    let mut close_code = None;
    while let Some(Ok(message)) =
        tokio::time::timeout(Duration::from_secs(5), a.next()).await.expect("close timeout")
    {
        if let Message::Close(frame) = message {
            close_code = frame.map(|f| u16::from(f.code));
            break;
        }
    }
    assert_eq!(close_code, Some(4429));

    // Subsequent records go to B alone.
    append_line(&log, &log_line("s1", "assistant", "for-b"));
    assert_eq!(recv_type(&mut b, "session_message").await["content"], "for-b");
}

#[tokio::test]
async fn test_session_terminated_reaches_viewer() {
    let dir = TempDir::new().unwrap();
    let log = empty_session(dir.path(), "s1");
    let relay = start_relay(dir.path()).await;
    let key = pair_device(&relay.base_url(), "D1").await;

    let mut ws = connect(&format!("{}?key={key}", relay.ws_url())).await;
    recv_type(&mut ws, "authenticated").await;
    subscribe_ready(&mut ws, "s1").await;
    recv_type(&mut ws, "session_history_end").await;

    std::fs::remove_file(&log).unwrap();
    let terminated = recv_type(&mut ws, "session_terminated").await;
    assert_eq!(terminated["session_id"], "s1");
    assert!(terminated["reason"].is_string());
}

#[tokio::test]
async fn test_unauthenticated_and_invalid_auth() {
    let dir = TempDir::new().unwrap();
    let relay = start_relay(dir.path()).await;

    // No key at upgrade: connected, but subscribe is refused.
    let mut ws = connect(&relay.ws_url()).await;
    recv_type(&mut ws, "connected").await;
    ws.send(envelope("subscribe", json!({ "session_id": "s1" })))
        .await
        .unwrap();
    let error = recv_type(&mut ws, "error").await;
    assert_eq!(error["code"], "unauthorized");

    // Malformed frames get error replies without closing.
    ws.send(Message::Text("{not json".to_string())).await.unwrap();
    let error = recv_type(&mut ws, "error").await;
    assert_eq!(error["code"], "malformed_envelope");

    ws.send(envelope("teleport", json!({}))).await.unwrap();
    let error = recv_type(&mut ws, "error").await;
    assert_eq!(error["code"], "unknown_type");

    // A bad key fails authentication and closes with 4401.
    ws.send(envelope("authenticate", json!({ "key": "bogus" })))
        .await
        .unwrap();
    let failed = recv_type(&mut ws, "authentication_failed").await;
    assert_eq!(failed["reason"], "unknown");
    let mut close_code = None;
    while let Some(Ok(message)) =
        tokio::time::timeout(Duration::from_secs(5), ws.next()).await.expect("close timeout")
    {
        if let Message::Close(frame) = message {
            close_code = frame.map(|f| u16::from(f.code));
            break;
        }
    }
    assert_eq!(close_code, Some(4401));
}

#[tokio::test]
async fn test_ping_pong() {
    let dir = TempDir::new().unwrap();
    let relay = start_relay(dir.path()).await;
    let key = pair_device(&relay.base_url(), "D1").await;

    let mut ws = connect(&format!("{}?key={key}", relay.ws_url())).await;
    recv_type(&mut ws, "authenticated").await;

    ws.send(envelope("ping", json!({}))).await.unwrap();
    recv_type(&mut ws, "pong").await;
}

#[tokio::test]
async fn test_repeated_protocol_abuse_closes_channel() {
    let dir = TempDir::new().unwrap();
    let relay = start_relay(dir.path()).await;
    let key = pair_device(&relay.base_url(), "D1").await;

    let mut ws = connect(&format!("{}?key={key}", relay.ws_url())).await;
    recv_type(&mut ws, "authenticated").await;

    for _ in 0..4 {
        ws.send(Message::Text("garbage".to_string())).await.unwrap();
    }

    let mut closed = false;
    for _ in 0..20 {
        match tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("close timeout")
        {
            Some(Ok(Message::Close(_))) | None => {
                closed = true;
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(_)) => {
                closed = true;
                break;
            }
        }
    }
    assert!(closed, "channel should close after repeated abuse");
}
