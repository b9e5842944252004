//! The hub connection task: register, connect, read, transmit, reconnect.
//!
//! Owns the WebSocket. Inbound `message` frames are persisted (dedup by
//! message id) and published on the event bus; `ping` frames get a `pong`.
//! Outbound frames arrive over a channel together with an ack sender, so the
//! outbound worker can drive its two-phase commit off the actual socket
//! write result. Reconnects use exponential backoff with jitter; repeated
//! auth failures stop the loop until `/auth-reset`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use mx_core::shutdown::ShutdownSignal;
use mx_core::types::{MatrixMessage, MessageStatus, MessageType};
use rand::Rng;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::state::{OutboundFrame, Shared};

/// Reconnect backoff bounds.
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    token: String,
}

/// Hub → client frames the daemon cares about.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum HubFrame {
    Registered {
        matrix_id: String,
        online_matrices: Vec<String>,
    },
    Message {
        from: String,
        content: String,
        timestamp: String,
        #[serde(default)]
        metadata: Option<serde_json::Value>,
    },
    Presence {
        matrix_id: String,
        status: String,
    },
    Ping,
    Error {
        code: String,
        message: String,
    },
}

/// Run the connection loop until shutdown.
pub async fn run(
    shared: Shared,
    mut out_rx: mpsc::Receiver<OutboundFrame>,
    shutdown: ShutdownSignal,
) {
    let mut shutdown_rx = shutdown.subscribe();
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("reqwest client");
    let mut attempt: u32 = 0;

    loop {
        if shutdown.is_shutting_down() {
            break;
        }
        // While disconnected, fail queued transmits immediately so the
        // outbound worker can park the rows with backoff instead of waiting
        // on a socket that is not there.
        while let Ok((_frame, ack)) = out_rx.try_recv() {
            let _ = ack.send(Err("not connected".to_string()));
        }
        if shared.auth.is_stopped() {
            // Wait for an operator /auth-reset (or shutdown).
            tokio::select! {
                _ = shared.reconnect.notified() => continue,
                _ = shutdown_rx.recv() => break,
            }
        }

        let token = match register(&http, &shared).await {
            Ok(token) => {
                shared.auth.record_success();
                token
            }
            Err(RegisterError::Auth(e)) => {
                let stopped = shared.auth.record_failure(e.clone());
                warn!(error = %e, stopped, "hub registration rejected");
                if !stopped {
                    backoff_sleep(&mut attempt, &mut shutdown_rx).await;
                }
                continue;
            }
            Err(RegisterError::Transport(e)) => {
                debug!(error = %e, "hub unreachable, staying in queued-only mode");
                backoff_sleep(&mut attempt, &mut shutdown_rx).await;
                continue;
            }
        };

        let ws_url = format!(
            "{}/?token={}&display_name={}",
            shared.hub_url.replacen("http", "ws", 1),
            token,
            shared.display_name,
        );
        let mut socket = match tokio_tungstenite::connect_async(&ws_url).await {
            Ok((socket, _)) => socket,
            Err(e) => {
                warn!(error = %e, "websocket connect failed");
                backoff_sleep(&mut attempt, &mut shutdown_rx).await;
                continue;
            }
        };

        info!(hub = %shared.hub_url, "connected to hub");
        attempt = 0;
        shared.set_connected(true);
        shared.kick.notify_one();

        // Connected loop: reads, transmits, reacts to shutdown.
        loop {
            tokio::select! {
                inbound = socket.next() => {
                    match inbound {
                        Some(Ok(WsMessage::Text(text))) => {
                            handle_frame(&shared, &mut socket, text.as_str()).await;
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            info!(?frame, "hub closed the connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "socket error");
                            break;
                        }
                        None => break,
                    }
                }
                outbound = out_rx.recv() => {
                    let Some((frame, ack)) = outbound else { break };
                    let result = socket
                        .send(WsMessage::text(frame))
                        .await
                        .map_err(|e| e.to_string());
                    let _ = ack.send(result);
                }
                _ = shutdown_rx.recv() => {
                    let _ = socket.close(None).await;
                    shared.set_connected(false);
                    return;
                }
            }
        }

        shared.set_connected(false);
        backoff_sleep(&mut attempt, &mut shutdown_rx).await;
    }
    shared.set_connected(false);
}

enum RegisterError {
    Auth(String),
    Transport(String),
}

async fn register(http: &reqwest::Client, shared: &Shared) -> Result<String, RegisterError> {
    let mut url = format!(
        "{}/register?matrix_id={}&display_name={}",
        shared.hub_url, shared.matrix_id, shared.display_name
    );
    if let Some(pin) = shared.auth.pin() {
        url.push_str(&format!("&pin={pin}"));
    }
    let response = http
        .get(&url)
        .send()
        .await
        .map_err(|e| RegisterError::Transport(e.to_string()))?;
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(RegisterError::Auth("invalid PIN (401)".into()));
    }
    if !status.is_success() {
        return Err(RegisterError::Transport(format!("register returned {status}")));
    }
    let body: RegisterResponse = response
        .json()
        .await
        .map_err(|e| RegisterError::Transport(e.to_string()))?;
    Ok(body.token)
}

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn handle_frame(shared: &Shared, socket: &mut Socket, raw: &str) {
    let frame: HubFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(_) => {
            debug!(raw, "unparseable hub frame dropped");
            return;
        }
    };
    match frame {
        HubFrame::Ping => {
            let pong = serde_json::json!({"type": "pong", "matrix_id": shared.matrix_id});
            let _ = socket.send(WsMessage::text(pong.to_string())).await;
        }
        HubFrame::Registered {
            matrix_id,
            online_matrices,
        } => {
            debug!(%matrix_id, online = online_matrices.len(), "hub registration confirmed");
        }
        HubFrame::Presence { matrix_id, status } => {
            debug!(%matrix_id, %status, "peer presence");
        }
        HubFrame::Error { code, message } => {
            warn!(%code, %message, "hub error frame");
        }
        HubFrame::Message {
            from,
            content,
            timestamp,
            metadata,
        } => {
            let message = inbound_message(from, content, &timestamp, metadata);
            match shared.store.insert_inbound(&message).await {
                Ok(true) => shared.events.publish(Arc::new(message)),
                Ok(false) => {
                    debug!(message_id = %message.id, "duplicate delivery ignored");
                }
                Err(e) => warn!(error = %e, "failed to persist inbound message"),
            }
        }
    }
}

/// Build the local row for a received message. Id and sequence number come
/// from the sender's metadata so dedup and per-sender ordering hold across
/// redeliveries.
fn inbound_message(
    from: String,
    content: String,
    timestamp: &str,
    metadata: Option<serde_json::Value>,
) -> MatrixMessage {
    let message_id = metadata
        .as_ref()
        .and_then(|m| m.get("message_id"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let sequence_number = metadata
        .as_ref()
        .and_then(|m| m.get("sequence_number"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let message_type = metadata
        .as_ref()
        .and_then(|m| m.get("kind"))
        .and_then(|v| v.as_str())
        .map(|kind| {
            if kind == "direct" {
                MessageType::Direct
            } else {
                MessageType::Broadcast
            }
        })
        .unwrap_or(MessageType::Broadcast);
    let created_at = chrono::DateTime::parse_from_rfc3339(timestamp)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    MatrixMessage {
        id: message_id,
        from_matrix: from,
        to_matrix: None,
        content,
        message_type,
        status: MessageStatus::Delivered,
        retry_count: 0,
        max_retries: mx_core::types::DEFAULT_MAX_RETRIES,
        next_retry_at: None,
        sequence_number,
        metadata,
        created_at,
        attempted_at: None,
        sent_at: None,
        delivered_at: Some(Utc::now()),
        read_at: None,
        last_error: None,
    }
}

async fn backoff_sleep(
    attempt: &mut u32,
    shutdown_rx: &mut tokio::sync::broadcast::Receiver<()>,
) {
    let exp = (*attempt).min(6);
    let base = RECONNECT_BASE.as_millis() as u64;
    let delay = (base << exp).min(RECONNECT_MAX.as_millis() as u64);
    let jitter = rand::thread_rng().gen_range(0..500);
    *attempt += 1;
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(delay + jitter)) => {}
        _ = shutdown_rx.recv() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_message_reads_metadata_fields() {
        let metadata = serde_json::json!({
            "message_id": "m-1",
            "sequence_number": 42,
            "kind": "direct",
        });
        let message = inbound_message(
            "beta".into(),
            "hello".into(),
            "2026-08-01T10:00:00+00:00",
            Some(metadata),
        );
        assert_eq!(message.id, "m-1");
        assert_eq!(message.sequence_number, 42);
        assert_eq!(message.message_type, MessageType::Direct);
        assert_eq!(message.status, MessageStatus::Delivered);
        assert!(message.delivered_at.is_some());
    }

    #[test]
    fn inbound_message_defaults_without_metadata() {
        let message = inbound_message("beta".into(), "x".into(), "garbage", None);
        assert_eq!(message.sequence_number, 0);
        assert_eq!(message.message_type, MessageType::Broadcast);
        assert!(!message.id.is_empty());
    }
}
