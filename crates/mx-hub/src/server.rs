//! The hub: HTTP surface, WebSocket fan-out, presence, and heartbeat.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use mx_core::config::HubConfig;
use mx_core::types::MatrixStatus;
use mx_store::Store;
use mx_telemetry::metrics::{global_metrics, Labels, MetricsCollector};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::{PinMode, TokenBook};
use crate::protocol::{
    parse_client_frame, ClientFrame, ParsedFrame, ServerFrame, ERR_DELIVERY_FAILED,
    ERR_INVALID_MESSAGE,
};

/// Hub → client heartbeat interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// A connection with no inbound frame for this long is closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a replaced connection is kept alive before the close frame.
pub const REPLACE_GRACE: Duration = Duration::from_secs(2);

/// Registry rows with `last_seen` before this instant count as stale.
fn idle_cutoff() -> chrono::DateTime<Utc> {
    Utc::now() - chrono::Duration::from_std(IDLE_TIMEOUT).expect("fits")
}

// ---------------------------------------------------------------------------
// Connection registry
// ---------------------------------------------------------------------------

/// What the writer task consumes.
enum Outgoing {
    Frame(ServerFrame),
    Close { reason: &'static str },
}

struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Outgoing>,
    display_name: String,
    /// Unix millis of the last inbound frame.
    last_inbound: Arc<AtomicI64>,
    /// Distinguishes this socket from one that replaced it.
    epoch: u64,
}

// ---------------------------------------------------------------------------
// HubState
// ---------------------------------------------------------------------------

pub struct HubState {
    pub store: Store,
    pub tokens: TokenBook,
    pub pin: PinMode,
    connections: DashMap<String, ConnectionHandle>,
    epoch_counter: AtomicU64,
    started_at: Instant,
    metrics: &'static MetricsCollector,
}

impl HubState {
    pub fn new(store: Store, config: &HubConfig) -> Self {
        let pin = PinMode::resolve(&config.pin);
        if let Some(pin_value) = pin.display() {
            // The operator needs this to hand out to daemons.
            info!(pin = %pin_value, "hub PIN");
        } else {
            info!("hub PIN disabled");
        }
        let secret = config.secret.clone().unwrap_or_else(|| {
            warn!("MATRIX_HUB_SECRET not set, using a process-local random secret");
            use rand::Rng;
            rand::thread_rng()
                .sample_iter(&rand::distributions::Alphanumeric)
                .take(32)
                .map(char::from)
                .collect()
        });
        Self {
            store,
            tokens: TokenBook::new(secret, config.token_expiry_hours),
            pin,
            connections: DashMap::new(),
            epoch_counter: AtomicU64::new(1),
            started_at: Instant::now(),
            metrics: global_metrics(),
        }
    }

    pub fn connected_ids(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn connected_count(&self) -> usize {
        self.connections.len()
    }

    /// Send a frame to one matrix. False when it is not connected (or its
    /// writer is gone).
    fn send_to(&self, matrix_id: &str, frame: ServerFrame) -> bool {
        match self.connections.get(matrix_id) {
            Some(handle) => handle.tx.send(Outgoing::Frame(frame)).is_ok(),
            None => false,
        }
    }

    /// Fan a frame out to every connection except `except`. Send failures
    /// are tolerated; the heartbeat reaps dead writers.
    fn broadcast(&self, frame: &ServerFrame, except: Option<&str>) -> usize {
        let mut delivered = 0;
        for entry in self.connections.iter() {
            if Some(entry.key().as_str()) == except {
                continue;
            }
            if entry.tx.send(Outgoing::Frame(frame.clone())).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    async fn broadcast_presence(&self, matrix_id: &str, status: &str, display_name: Option<String>) {
        let frame = ServerFrame::Presence {
            matrix_id: matrix_id.to_string(),
            status: status.to_string(),
            display_name,
        };
        self.broadcast(&frame, Some(matrix_id));
    }

    /// Drop the connection entry if it still belongs to `epoch`.
    fn remove_if_current(&self, matrix_id: &str, epoch: u64) -> bool {
        self.connections
            .remove_if(matrix_id, |_, handle| handle.epoch == epoch)
            .is_some()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/register", get(register))
        .route("/matrices", get(matrices))
        .route("/", get(ws_upgrade))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<Arc<HubState>>) -> impl IntoResponse {
    // The health probe doubles as the stale-registry sweep.
    if let Err(e) = state.store.sweep_stale_matrices(idle_cutoff()).await {
        warn!(error = %e, "stale matrix sweep failed");
    }
    let online = state.connected_ids();
    state
        .metrics
        .set_gauge("connected_matrices", online.len() as i64);
    Json(serde_json::json!({
        "status": "ok",
        "connectedMatrices": online.len(),
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "online": online,
        "metrics": state.metrics.snapshot(),
    }))
}

#[derive(Debug, Deserialize)]
struct RegisterParams {
    matrix_id: Option<String>,
    display_name: Option<String>,
    pin: Option<String>,
}

async fn register(
    State(state): State<Arc<HubState>>,
    Query(params): Query<RegisterParams>,
) -> Response {
    let Some(matrix_id) = params.matrix_id.filter(|id| !id.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "matrix_id is required"})),
        )
            .into_response();
    };

    if !state.pin.verify(params.pin.as_deref()) {
        state.metrics.inc_counter("auth_failures_total", Labels::empty());
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "invalid pin"})),
        )
            .into_response();
    }

    let display_name = params.display_name.unwrap_or_else(|| matrix_id.clone());
    if let Err(e) = state.store.upsert_matrix(&matrix_id, &display_name, None).await {
        warn!(error = %e, matrix_id = %matrix_id, "registry upsert failed");
    }

    let token = state.tokens.issue(&matrix_id);
    info!(matrix_id = %matrix_id, "matrix registered");
    Json(serde_json::json!({"token": token, "matrix_id": matrix_id})).into_response()
}

async fn matrices(State(state): State<Arc<HubState>>) -> impl IntoResponse {
    let registered = state.store.list_matrices().await.unwrap_or_default();
    Json(serde_json::json!({
        "connected": state.connected_ids(),
        "registered": registered,
    }))
}

#[derive(Debug, Deserialize)]
struct WsParams {
    token: Option<String>,
    display_name: Option<String>,
}

async fn ws_upgrade(
    State(state): State<Arc<HubState>>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let matrix_id = params
        .token
        .as_deref()
        .and_then(|token| state.tokens.validate(token));
    let Some(matrix_id) = matrix_id else {
        state.metrics.inc_counter("auth_failures_total", Labels::empty());
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "invalid or expired token"})),
        )
            .into_response();
    };
    let display_name = params.display_name.unwrap_or_else(|| matrix_id.clone());
    ws.on_upgrade(move |socket| handle_socket(state, socket, matrix_id, display_name))
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

async fn handle_socket(
    state: Arc<HubState>,
    socket: WebSocket,
    matrix_id: String,
    display_name: String,
) {
    let epoch = state.epoch_counter.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
    let last_inbound = Arc::new(AtomicI64::new(Utc::now().timestamp_millis()));

    let handle = ConnectionHandle {
        tx: tx.clone(),
        display_name: display_name.clone(),
        last_inbound: last_inbound.clone(),
        epoch,
    };

    // Replacement: keep the old socket alive briefly, then close it cleanly.
    if let Some(old) = state.connections.insert(matrix_id.clone(), handle) {
        info!(matrix_id = %matrix_id, "connection replaced");
        tokio::spawn(async move {
            tokio::time::sleep(REPLACE_GRACE).await;
            let _ = old.tx.send(Outgoing::Close {
                reason: "Replaced by new connection",
            });
        });
    }

    if let Err(e) = state.store.upsert_matrix(&matrix_id, &display_name, None).await {
        warn!(error = %e, "registry update on connect failed");
    }

    // Greet, then tell everyone else.
    let _ = tx.send(Outgoing::Frame(ServerFrame::Registered {
        matrix_id: matrix_id.clone(),
        online_matrices: state.connected_ids(),
    }));
    state
        .broadcast_presence(&matrix_id, "online", Some(display_name.clone()))
        .await;
    state
        .metrics
        .set_gauge("connected_matrices", state.connected_count() as i64);

    let (mut sink, mut stream) = socket.split();

    // Writer: drains the outbound channel onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(outgoing) = rx.recv().await {
            match outgoing {
                Outgoing::Frame(frame) => {
                    if sink.send(Message::Text(frame.to_json().into())).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close { reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: 1000,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Reader: dispatch inbound frames until the peer goes away.
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                debug!(matrix_id = %matrix_id, error = %e, "socket read error");
                break;
            }
        };
        last_inbound.store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        match message {
            Message::Text(text) => {
                dispatch_frame(&state, &matrix_id, text.as_str(), &tx).await;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
            Message::Binary(_) => {
                debug!(matrix_id = %matrix_id, "binary frame ignored");
            }
        }
    }

    // Teardown: only the current epoch owner clears the registry entry, so a
    // replaced socket's exit does not knock out its successor.
    if state.remove_if_current(&matrix_id, epoch) {
        if let Err(e) = state
            .store
            .set_matrix_status(&matrix_id, MatrixStatus::Offline)
            .await
        {
            warn!(error = %e, "offline status update failed");
        }
        state.broadcast_presence(&matrix_id, "offline", None).await;
        state
            .metrics
            .set_gauge("connected_matrices", state.connected_count() as i64);
        info!(matrix_id = %matrix_id, "matrix disconnected");
    }
    writer.abort();
}

async fn dispatch_frame(
    state: &Arc<HubState>,
    matrix_id: &str,
    raw: &str,
    tx: &mpsc::UnboundedSender<Outgoing>,
) {
    match parse_client_frame(raw) {
        ParsedFrame::Frame(ClientFrame::Pong { .. }) => {
            // Liveness only; last_inbound is already updated.
        }
        ParsedFrame::Frame(ClientFrame::Ping) => {
            let _ = tx.send(Outgoing::Frame(ServerFrame::Ping));
        }
        ParsedFrame::Frame(ClientFrame::Presence { status }) => {
            let mapped = match status {
                crate::protocol::PresenceStatus::Online => MatrixStatus::Online,
                crate::protocol::PresenceStatus::Away => MatrixStatus::Away,
            };
            if let Err(e) = state.store.set_matrix_status(matrix_id, mapped).await {
                warn!(error = %e, "presence update failed");
            }
            state
                .broadcast_presence(matrix_id, status.as_str(), None)
                .await;
        }
        ParsedFrame::Frame(ClientFrame::Message {
            to,
            content,
            metadata,
        }) => {
            if let Err(e) = state.store.touch_matrix(matrix_id).await {
                warn!(error = %e, "touch failed");
            }
            let frame = ServerFrame::Message {
                from: matrix_id.to_string(),
                content,
                timestamp: Utc::now().to_rfc3339(),
                metadata,
            };
            match to {
                Some(recipient) => {
                    if state.send_to(&recipient, frame) {
                        state.metrics.inc_counter(
                            "messages_relayed_total",
                            Labels::new(&[("kind", "direct")]),
                        );
                    } else {
                        state.metrics.inc_counter("delivery_failures_total", Labels::empty());
                        let _ = tx.send(Outgoing::Frame(ServerFrame::error(
                            ERR_DELIVERY_FAILED,
                            format!("{recipient} is not connected"),
                        )));
                    }
                }
                None => {
                    let delivered = state.broadcast(&frame, Some(matrix_id));
                    state.metrics.add_counter(
                        "messages_relayed_total",
                        Labels::new(&[("kind", "broadcast")]),
                        delivered as u64,
                    );
                }
            }
        }
        ParsedFrame::UnknownType(kind) => {
            debug!(matrix_id = %matrix_id, kind = %kind, "unknown frame type dropped");
        }
        ParsedFrame::Invalid => {
            let _ = tx.send(Outgoing::Frame(ServerFrame::error(
                ERR_INVALID_MESSAGE,
                "frame is not valid JSON",
            )));
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

/// Hub-side liveness: ping every connection on an interval; close the ones
/// whose last inbound frame is too old; expire registry rows and tokens.
pub fn spawn_heartbeat(state: Arc<HubState>, shutdown: mx_core::shutdown::ShutdownSignal) {
    let mut shutdown_rx = shutdown.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => heartbeat_tick(&state).await,
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("hub heartbeat stopped");
    });
}

async fn heartbeat_tick(state: &Arc<HubState>) {
    let now_ms = Utc::now().timestamp_millis();
    let idle_ms = IDLE_TIMEOUT.as_millis() as i64;

    let mut timed_out = Vec::new();
    for entry in state.connections.iter() {
        let age = now_ms - entry.last_inbound.load(Ordering::Relaxed);
        if age > idle_ms {
            timed_out.push((entry.key().clone(), entry.epoch));
        } else {
            let _ = entry.tx.send(Outgoing::Frame(ServerFrame::Ping));
        }
    }

    for (matrix_id, epoch) in timed_out {
        warn!(matrix_id = %matrix_id, "ping timeout, closing connection");
        let mut display_name = None;
        if let Some(handle) = state.connections.get(&matrix_id) {
            if handle.epoch == epoch {
                display_name = Some(handle.display_name.clone());
                let _ = handle.tx.send(Outgoing::Close {
                    reason: "Ping timeout",
                });
            }
        }
        if state.remove_if_current(&matrix_id, epoch) {
            if let Err(e) = state
                .store
                .set_matrix_status(&matrix_id, MatrixStatus::Offline)
                .await
            {
                warn!(error = %e, "offline status update failed");
            }
            state.broadcast_presence(&matrix_id, "offline", display_name).await;
        }
    }

    if let Err(e) = state.store.sweep_stale_matrices(idle_cutoff()).await {
        warn!(error = %e, "stale matrix sweep failed");
    }
    state.tokens.sweep_expired();
}
