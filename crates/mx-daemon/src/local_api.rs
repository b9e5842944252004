//! Local HTTP surface for supervising scripts and in-workspace consumers:
//! `/status`, an SSE `/stream` of inbound messages, and `/auth-reset`.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::info;

use crate::state::Shared;

pub fn router(shared: Shared) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/stream", get(stream))
        .route("/auth-reset", post(auth_reset))
        .with_state(shared)
}

async fn status(State(shared): State<Shared>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "connected": shared.is_connected(),
        "matrixId": shared.matrix_id,
        "authFailureCount": shared.auth.failure_count(),
        "authStopped": shared.auth.is_stopped(),
        "lastAuthError": shared.auth.last_error(),
    }))
}

/// `text/event-stream` of inbound messages: one `data:` line of message
/// JSON per event, with `: heartbeat` comments keeping the connection warm.
async fn stream(
    State(shared): State<Shared>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = shared.events.subscribe();
    let stream = rx.into_stream().map(|message| {
        let data = serde_json::to_string(&*message).unwrap_or_else(|_| "{}".into());
        Ok(Event::default().data(data))
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

#[derive(Debug, Deserialize)]
struct AuthResetBody {
    pin: Option<String>,
}

async fn auth_reset(
    State(shared): State<Shared>,
    Json(body): Json<AuthResetBody>,
) -> Json<serde_json::Value> {
    info!("auth reset requested");
    shared.auth.reset(body.pin);
    shared.reconnect.notify_one();
    Json(serde_json::json!({"ok": true}))
}
