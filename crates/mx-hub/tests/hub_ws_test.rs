use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mx_core::config::{HubConfig, PinSetting};
use mx_hub::server::{router, HubState};
use mx_store::Store;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_hub(pin: PinSetting) -> (SocketAddr, Arc<HubState>) {
    let store = Store::open_in_memory().await.unwrap();
    let config = HubConfig {
        pin,
        secret: Some("test-secret".into()),
        ..HubConfig::default()
    };
    let state = Arc::new(HubState::new(store, &config));
    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn register(addr: SocketAddr, matrix_id: &str, pin: Option<&str>) -> reqwest::Response {
    let mut url = format!("http://{addr}/register?matrix_id={matrix_id}&display_name={matrix_id}");
    if let Some(pin) = pin {
        url.push_str(&format!("&pin={pin}"));
    }
    reqwest::get(url).await.unwrap()
}

/// Register and open a WebSocket; consumes the `registered` greeting.
async fn connect(addr: SocketAddr, matrix_id: &str) -> WsStream {
    let response = register(addr, matrix_id, None).await;
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    let token = body["token"].as_str().unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/?token={token}"))
        .await
        .unwrap();

    let greeting = next_json(&mut ws).await;
    assert_eq!(greeting["type"], "registered");
    assert_eq!(greeting["matrix_id"], matrix_id);
    ws
}

/// Next JSON text frame, skipping protocol pings, within a deadline.
async fn next_json(ws: &mut WsStream) -> serde_json::Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(1), ws.next())
            .await
            .expect("frame within 1s")
            .expect("stream open")
            .expect("frame ok");
        match message {
            Message::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                if value["type"] == "ping" {
                    continue;
                }
                return value;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn broadcast_reaches_connected_peers() {
    let (addr, _state) = spawn_hub(PinSetting::Disabled).await;
    let mut alpha = connect(addr, "alpha").await;
    let mut beta = connect(addr, "beta").await;

    // alpha sees beta come online.
    let presence = next_json(&mut alpha).await;
    assert_eq!(presence["type"], "presence");
    assert_eq!(presence["matrix_id"], "beta");
    assert_eq!(presence["status"], "online");

    alpha
        .send(Message::text(r#"{"type":"message","content":"hi"}"#))
        .await
        .unwrap();

    let received = next_json(&mut beta).await;
    assert_eq!(received["type"], "message");
    assert_eq!(received["from"], "alpha");
    assert_eq!(received["content"], "hi");
    assert!(received["timestamp"].is_string());

    // Health reflects both connections.
    let health: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["connectedMatrices"], 2);
    let online: Vec<String> = health["online"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert!(online.contains(&"alpha".to_string()));
    assert!(online.contains(&"beta".to_string()));
}

#[tokio::test]
async fn direct_message_to_offline_peer_fails() {
    let (addr, _state) = spawn_hub(PinSetting::Disabled).await;
    let mut alpha = connect(addr, "alpha").await;

    alpha
        .send(Message::text(
            r#"{"type":"message","to":"beta","content":"x"}"#,
        ))
        .await
        .unwrap();

    let error = next_json(&mut alpha).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "DELIVERY_FAILED");
}

#[tokio::test]
async fn direct_message_reaches_named_peer_only() {
    let (addr, _state) = spawn_hub(PinSetting::Disabled).await;
    let mut alpha = connect(addr, "alpha").await;
    let mut beta = connect(addr, "beta").await;
    let mut gamma = connect(addr, "gamma").await;

    // Drain presence notices on alpha and beta.
    let _ = next_json(&mut alpha).await;
    let _ = next_json(&mut alpha).await;
    let _ = next_json(&mut beta).await;

    let payload = r#"{"type":"message","to":"gamma","content":"psst","metadata":{"sequence_number":7}}"#;
    alpha.send(Message::text(payload)).await.unwrap();

    let received = next_json(&mut gamma).await;
    assert_eq!(received["from"], "alpha");
    assert_eq!(received["content"], "psst");
    // The sender's sequence number travels in metadata.
    assert_eq!(received["metadata"]["sequence_number"], 7);

    // beta must not see the direct message; the next thing it could see is
    // nothing (timeout) — probe with a short deadline.
    let nothing = tokio::time::timeout(Duration::from_millis(200), beta.next()).await;
    assert!(nothing.is_err(), "beta unexpectedly received a frame");
}

#[tokio::test]
async fn register_enforces_pin() {
    let (addr, _state) = spawn_hub(PinSetting::Configured("424242".into())).await;

    let wrong = register(addr, "alpha", Some("111111")).await;
    assert_eq!(wrong.status(), reqwest::StatusCode::UNAUTHORIZED);

    let missing = register(addr, "alpha", None).await;
    assert_eq!(missing.status(), reqwest::StatusCode::UNAUTHORIZED);

    let right = register(addr, "alpha", Some("424242")).await;
    assert!(right.status().is_success());
    let body: serde_json::Value = right.json().await.unwrap();
    assert!(body["token"].as_str().unwrap().len() >= 32);
}

#[tokio::test]
async fn register_requires_matrix_id() {
    let (addr, _state) = spawn_hub(PinSetting::Disabled).await;
    let response = reqwest::get(format!("http://{addr}/register")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn websocket_rejects_bad_token() {
    let (addr, _state) = spawn_hub(PinSetting::Disabled).await;
    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/?token=bogus")).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected 401 upgrade rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn new_connection_replaces_old_one() {
    let (addr, state) = spawn_hub(PinSetting::Disabled).await;
    let mut first = connect(addr, "alpha").await;
    let _second = connect(addr, "alpha").await;

    // The old socket receives a clean close (code 1000) after the grace
    // period; frames before it (e.g. pings) are skipped.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let message = tokio::time::timeout_at(deadline, first.next())
            .await
            .expect("close within grace period")
            .expect("stream open");
        match message {
            Ok(Message::Close(Some(frame))) => {
                assert_eq!(u16::from(frame.code), 1000);
                assert_eq!(frame.reason.as_str(), "Replaced by new connection");
                break;
            }
            Ok(_) => continue,
            Err(_) => break, // connection reset also counts as closed
        }
    }

    // Only one registry entry remains connected.
    assert_eq!(state.connected_count(), 1);
}

#[tokio::test]
async fn presence_updates_are_broadcast() {
    let (addr, _state) = spawn_hub(PinSetting::Disabled).await;
    let mut alpha = connect(addr, "alpha").await;
    let mut beta = connect(addr, "beta").await;
    let _ = next_json(&mut alpha).await; // beta online

    beta.send(Message::text(r#"{"type":"presence","status":"away"}"#))
        .await
        .unwrap();

    let presence = next_json(&mut alpha).await;
    assert_eq!(presence["type"], "presence");
    assert_eq!(presence["matrix_id"], "beta");
    assert_eq!(presence["status"], "away");
}

#[tokio::test]
async fn client_initiated_ping_is_echoed() {
    let (addr, _state) = spawn_hub(PinSetting::Disabled).await;
    let mut alpha = connect(addr, "alpha").await;

    alpha
        .send(Message::text(r#"{"type":"ping"}"#))
        .await
        .unwrap();

    // next_json skips hub heartbeat pings, so read the raw frame here.
    let frame = tokio::time::timeout(Duration::from_secs(1), alpha.next())
        .await
        .expect("reply within 1s")
        .expect("stream open")
        .expect("frame ok");
    match frame {
        Message::Text(text) => {
            let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            assert_eq!(value["type"], "ping");
        }
        other => panic!("expected ping frame, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_frame_types_are_dropped_invalid_json_errors() {
    let (addr, _state) = spawn_hub(PinSetting::Disabled).await;
    let mut alpha = connect(addr, "alpha").await;

    // Unknown type: silently dropped, connection stays up.
    alpha
        .send(Message::text(r#"{"type":"telepathy","content":"hm"}"#))
        .await
        .unwrap();

    // Invalid JSON: INVALID_MESSAGE error.
    alpha.send(Message::text("not json")).await.unwrap();
    let error = next_json(&mut alpha).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "INVALID_MESSAGE");
}
