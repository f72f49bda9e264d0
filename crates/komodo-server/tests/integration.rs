//! End-to-end tests over real WebSocket connections.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use komodo_server::ServerHandle;
use komodo_settings::RelaySettings;
use komodo_store::{NoopAudit, SqliteAuditLog};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

fn test_settings(dir: &std::path::Path) -> RelaySettings {
    let mut settings = RelaySettings::default();
    settings.server.host = "127.0.0.1".into();
    settings.server.port = 0;
    settings.relay.bump_grace_ms = 100;
    settings.capture.path = dir.join("captures");
    settings
}

async fn boot_server(dir: &std::path::Path) -> (String, ServerHandle) {
    let handle = komodo_server::start(test_settings(dir), Arc::new(NoopAudit))
        .await
        .unwrap();
    (format!("ws://{}/ws", handle.addr), handle)
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut WsStream, event: &str, data: Value) {
    let frame = json!({"event": event, "data": data}).to_string();
    ws.send(Message::text(frame)).await.unwrap();
}

/// Read the next text frame as JSON.
async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Read until an event with the given name arrives and return its data.
async fn read_event(ws: &mut WsStream, event: &str) -> Value {
    loop {
        let msg = read_json(ws).await;
        if msg["event"] == event {
            return msg["data"].clone();
        }
    }
}

async fn join(ws: &mut WsStream, session: Value, client: Value) {
    send(ws, "join", json!([session, client.clone()])).await;
    loop {
        if read_event(ws, "joined").await == client {
            return;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_update_is_relayed_and_cached() {
    let dir = tempfile::tempdir().unwrap();
    let (url, handle) = boot_server(dir.path()).await;
    let mut a = connect(&url).await;
    let mut b = connect(&url).await;

    join(&mut a, json!(5), json!(1)).await;
    join(&mut b, json!(5), json!(2)).await;

    let packet = json!([0, 5, 1, 1, 3, 1, 0, 1, 2, 3, 0, 0, 0, 1]);
    send(&mut a, "update", packet.clone()).await;
    assert_eq!(read_event(&mut b, "relayUpdate").await, packet);

    send(&mut b, "state", json!({"session_id": 5, "client_id": 2, "version": 2})).await;
    let state = read_event(&mut b, "state").await;
    assert_eq!(state["clients"], json!([1, 2]));
    assert_eq!(
        state["entities"],
        json!([{"id": 1, "latest": packet, "render": true, "locked": false}])
    );
    assert_eq!(state["isRecording"], json!(false));

    handle.shutdown().await;
}

#[tokio::test]
async fn e2e_state_error_for_unknown_session() {
    let dir = tempfile::tempdir().unwrap();
    let (url, handle) = boot_server(dir.path()).await;
    let mut ws = connect(&url).await;

    send(&mut ws, "state", json!({"session_id": 77, "client_id": 1})).await;
    let error = read_event(&mut ws, "stateError").await;
    assert_eq!(error["session_id"], json!(77));

    handle.shutdown().await;
}

#[tokio::test]
async fn e2e_duplicate_connection_is_bumped() {
    let dir = tempfile::tempdir().unwrap();
    let (url, handle) = boot_server(dir.path()).await;
    let mut old = connect(&url).await;
    let mut new = connect(&url).await;
    let mut peer = connect(&url).await;

    join(&mut old, json!("lab"), json!("alice")).await;
    join(&mut peer, json!("lab"), json!("bob")).await;
    join(&mut new, json!("lab"), json!("alice")).await;

    // The stale socket is closed by the server after the grace period.
    let closed = timeout(TIMEOUT, async {
        loop {
            match old.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "bumped connection was not closed");

    send(&mut peer, "state", json!({"session_id": "lab", "client_id": "bob"})).await;
    let state = read_event(&mut peer, "state").await;
    // The stale entry was the first "alice"; the newest one sits after "bob".
    assert_eq!(state["clients"], json!(["bob", "alice"]));

    handle.shutdown().await;
}

#[tokio::test]
async fn e2e_disconnect_notifies_room() {
    let dir = tempfile::tempdir().unwrap();
    let (url, handle) = boot_server(dir.path()).await;
    let mut a = connect(&url).await;
    let mut b = connect(&url).await;

    join(&mut a, json!(5), json!(1)).await;
    join(&mut b, json!(5), json!(2)).await;

    a.close(None).await.unwrap();
    assert_eq!(read_event(&mut b, "disconnected").await, json!(1));

    handle.shutdown().await;
}

#[tokio::test]
async fn e2e_record_then_play_back() {
    let dir = tempfile::tempdir().unwrap();
    let (url, handle) = boot_server(dir.path()).await;
    let mut a = connect(&url).await;
    let mut b = connect(&url).await;
    join(&mut a, json!(5), json!(1)).await;
    join(&mut b, json!(5), json!(2)).await;

    send(&mut a, "start_recording", json!(5)).await;
    send(&mut a, "sessionInfo", json!(5)).await;
    let info = read_event(&mut a, "sessionInfo").await;
    assert_eq!(info["isRecording"], json!(true));
    let start = info["recordingStart"].as_i64().unwrap();

    send(&mut a, "update", json!([0, 5, 1, 4, 3, 1, 0, 0, 0, 1, 1, 1, 1, 1])).await;
    send(&mut a, "interact", json!([0, 5, 1, 4, 4, 8, 0])).await;
    let _ = read_event(&mut b, "interactionUpdate").await;
    send(&mut a, "end_recording", json!(5)).await;

    // end_recording has no reply; a state round trip orders it before playback.
    send(&mut a, "state", json!({"session_id": 5, "client_id": 1})).await;
    assert_eq!(read_event(&mut a, "state").await["isRecording"], json!(false));

    send(
        &mut a,
        "playback",
        json!({"session_id": 5, "client_id": 1, "playback_id": format!("5_{start}")}),
    )
    .await;

    let mut seen: Vec<String> = Vec::new();
    let saw = |seen: &[String], name: &str| seen.iter().any(|e| e == name);
    while !(saw(&seen, "playbackEnd") && saw(&seen, "interactionPlaybackEnd")) {
        let msg = read_json(&mut b).await;
        seen.push(msg["event"].as_str().unwrap_or_default().to_owned());
    }
    assert!(saw(&seen, "relayUpdate"));
    assert!(saw(&seen, "interactionUpdate"));
    assert!(!saw(&seen, "playbackError"));

    handle.shutdown().await;
}

#[tokio::test]
async fn e2e_playback_of_missing_capture_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let (url, handle) = boot_server(dir.path()).await;
    let mut a = connect(&url).await;
    join(&mut a, json!(5), json!(1)).await;

    send(
        &mut a,
        "playback",
        json!({"session_id": 5, "client_id": 1, "playback_id": "5_123"}),
    )
    .await;
    let error = read_event(&mut a, "playbackError").await;
    assert_eq!(error["playback_id"], json!("5_123"));
    let _ = read_event(&mut a, "playbackEnd").await;
    let _ = read_event(&mut a, "interactionPlaybackEnd").await;

    handle.shutdown().await;
}

#[tokio::test]
async fn e2e_audit_log_records_connections() {
    let dir = tempfile::tempdir().unwrap();
    let audit = SqliteAuditLog::open(&dir.path().join("audit.db")).unwrap();
    let handle = komodo_server::start(test_settings(dir.path()), Arc::new(audit.clone()))
        .await
        .unwrap();
    let url = format!("ws://{}/ws", handle.addr);

    let mut a = connect(&url).await;
    join(&mut a, json!(8), json!(1)).await;
    a.close(None).await.unwrap();

    let session = komodo_core::SessionId::number(8);
    let mut events = Vec::new();
    for _ in 0..100 {
        events = audit
            .connection_events(&session)
            .unwrap()
            .into_iter()
            .map(|row| row.event)
            .collect();
        if events.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(events, ["connect", "disconnect"]);

    handle.shutdown().await;
}

#[tokio::test]
async fn health_reports_live_counts() {
    let dir = tempfile::tempdir().unwrap();
    let (url, handle) = boot_server(dir.path()).await;
    let mut a = connect(&url).await;
    join(&mut a, json!(5), json!(1)).await;

    let body: Value = reqwest::get(format!("http://{}/health", handle.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 1);
    assert_eq!(body["sessions"], 1);

    handle.shutdown().await;
}
