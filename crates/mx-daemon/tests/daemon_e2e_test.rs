use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use mx_core::config::{HubConfig, PinSetting};
use mx_core::types::MessageStatus;
use mx_daemon::Daemon;
use mx_hub::server::{router as hub_router, HubState};
use mx_store::Store;
use tokio_tungstenite::tungstenite::Message as WsMessage;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_hub() -> SocketAddr {
    let store = Store::open_in_memory().await.unwrap();
    let config = HubConfig {
        pin: PinSetting::Disabled,
        secret: Some("e2e-secret".into()),
        ..HubConfig::default()
    };
    let state = Arc::new(HubState::new(store, &config));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, hub_router(state)).await.unwrap();
    });
    addr
}

async fn connect_peer(addr: SocketAddr, matrix_id: &str) -> WsStream {
    let body: serde_json::Value =
        reqwest::get(format!("http://{addr}/register?matrix_id={matrix_id}"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    let token = body["token"].as_str().unwrap();
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/?token={token}"))
        .await
        .unwrap();
    // Consume the registered greeting.
    let _ = tokio::time::timeout(Duration::from_secs(1), ws.next())
        .await
        .unwrap();
    ws
}

/// Collect `n` message frames (skipping pings/presence), with a deadline.
async fn collect_messages(ws: &mut WsStream, n: usize, deadline: Duration) -> Vec<serde_json::Value> {
    let mut out = Vec::new();
    let end = tokio::time::Instant::now() + deadline;
    while out.len() < n {
        let frame = tokio::time::timeout_at(end, ws.next())
            .await
            .expect("frames within deadline")
            .expect("stream open")
            .expect("frame ok");
        if let WsMessage::Text(text) = frame {
            let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            if value["type"] == "message" {
                out.push(value);
            }
        }
    }
    out
}

#[tokio::test]
async fn queued_messages_drain_in_sequence_order_once_connected() {
    let hub = spawn_hub().await;

    let store = Store::open_in_memory().await.unwrap();
    let daemon = Daemon::new(store.clone(), "alpha", format!("http://{hub}"), None);
    let shared = daemon.shared();
    let shutdown = daemon.shutdown_handle();

    // Producers enqueue while the daemon is not yet connected: queued-only
    // mode, synchronous to the store.
    for content in ["one", "two", "three"] {
        mx_daemon::enqueue(&shared, None, content.to_string(), None)
            .await
            .unwrap();
    }

    // Peer connects before the daemon starts draining.
    let mut beta = connect_peer(hub, "beta").await;

    let local = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    tokio::spawn(daemon.run(local));

    let received = collect_messages(&mut beta, 3, Duration::from_secs(15)).await;
    let contents: Vec<&str> = received
        .iter()
        .map(|m| m["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, vec!["one", "two", "three"]);
    let sequences: Vec<i64> = received
        .iter()
        .map(|m| m["metadata"]["sequence_number"].as_i64().unwrap())
        .collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert!(received.iter().all(|m| m["from"] == "alpha"));

    // Sender-side rows settled to `sent`.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let due = store.due_outbound("alpha", 10).await.unwrap();
            if due.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("queue drained");

    shutdown.trigger();
}

#[tokio::test]
async fn inbound_broadcasts_are_persisted_and_published() {
    let hub = spawn_hub().await;

    let store = Store::open_in_memory().await.unwrap();
    let daemon = Daemon::new(store.clone(), "alpha", format!("http://{hub}"), None);
    let shared = daemon.shared();
    let shutdown = daemon.shutdown_handle();
    let events = shared.events.subscribe();

    let local = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    tokio::spawn(daemon.run(local));

    // Wait for the daemon to come online.
    tokio::time::timeout(Duration::from_secs(10), async {
        while !shared.is_connected() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("daemon connected");

    let mut beta = connect_peer(hub, "beta").await;
    let payload = r#"{"type":"message","content":"from beta","metadata":{"message_id":"b-1","sequence_number":1}}"#;
    futures_util::SinkExt::send(&mut beta, WsMessage::text(payload))
        .await
        .unwrap();

    // Local subscribers see the message.
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv_async())
        .await
        .expect("event within deadline")
        .expect("bus open");
    assert_eq!(event.content, "from beta");
    assert_eq!(event.from_matrix, "beta");
    assert_eq!(event.sequence_number, 1);

    // And it is durable, unread, deduped by id.
    let unread = store.unread_messages("alpha").await.unwrap();
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0].id, "b-1");
    assert_eq!(unread[0].status, MessageStatus::Delivered);

    shutdown.trigger();
}

#[tokio::test]
async fn status_endpoint_reports_disconnected_without_hub() {
    // Point at a port nothing listens on.
    let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = unused.local_addr().unwrap();
    drop(unused);

    let store = Store::open_in_memory().await.unwrap();
    let daemon = Daemon::new(store, "alpha", format!("http://{dead_addr}"), None);
    let shutdown = daemon.shutdown_handle();

    let local = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local.local_addr().unwrap();
    tokio::spawn(daemon.run(local));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status: serde_json::Value = reqwest::get(format!("http://{local_addr}/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["connected"], false);
    assert_eq!(status["matrixId"], "alpha");
    assert_eq!(status["authStopped"], false);

    shutdown.trigger();
}

#[tokio::test]
async fn auth_reset_clears_failure_state() {
    let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = unused.local_addr().unwrap();
    drop(unused);

    let store = Store::open_in_memory().await.unwrap();
    let daemon = Daemon::new(store, "alpha", format!("http://{dead_addr}"), Some("000000".into()));
    let shared = daemon.shared();
    let shutdown = daemon.shutdown_handle();

    // Simulate the connection loop exhausting its auth budget.
    for _ in 0..mx_daemon::MAX_AUTH_FAILURES {
        shared.auth.record_failure("invalid PIN (401)");
    }
    assert!(shared.auth.is_stopped());

    let local = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local.local_addr().unwrap();
    tokio::spawn(daemon.run(local));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let client = reqwest::Client::new();
    let response: serde_json::Value = client
        .post(format!("http://{local_addr}/auth-reset"))
        .json(&serde_json::json!({"pin": "123456"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["ok"], true);
    assert!(!shared.auth.is_stopped());
    assert_eq!(shared.auth.failure_count(), 0);
    assert_eq!(shared.auth.pin().as_deref(), Some("123456"));

    shutdown.trigger();
}
