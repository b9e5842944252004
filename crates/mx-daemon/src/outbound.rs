//! The outbound worker: two-phase delivery of queued messages to the hub.
//!
//! Phase one (enqueue) happens on the producer's thread via
//! [`enqueue`]; it is synchronous to the store and never blocks on hub
//! reachability. This worker is phase two: it sweeps due rows oldest-first,
//! marks each `sending`, transmits the frame, and settles the row to `sent`
//! or back to `pending` with backoff. Rows found still in `sending` at
//! startup are resurrected — the frame carries a stable message id and
//! sequence number, so the peer dedups redelivery.

use std::time::Duration;

use chrono::Utc;
use mx_core::shutdown::ShutdownSignal;
use mx_core::types::{MatrixMessage, MessageStatus, MessageType};
use mx_store::{EnqueueRequest, StoreError};
use rand::Rng;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::state::Shared;

/// Poll interval while idle; an enqueue kick wakes the worker sooner.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);
/// Rows taken per sweep.
const SWEEP_BATCH: usize = 16;
/// Send retry backoff bounds (matches the task engine's curve).
const SEND_RETRY_BASE_SECS: i64 = 10;
const SEND_RETRY_MAX_SECS: i64 = 300;
const SEND_RETRY_JITTER_MS: i64 = 2_000;

/// Producer-side enqueue: mint the sequence number and persist the row,
/// then kick the worker. Never blocks on the hub.
pub async fn enqueue(
    shared: &Shared,
    to_matrix: Option<String>,
    content: String,
    metadata: Option<serde_json::Value>,
) -> Result<MatrixMessage, StoreError> {
    let message = shared
        .store
        .enqueue_message(EnqueueRequest {
            from_matrix: shared.matrix_id.clone(),
            to_matrix,
            content,
            metadata,
        })
        .await?;
    shared.kick.notify_one();
    Ok(message)
}

/// The wire frame for one queued row. The sequence number and message id
/// ride in `metadata` so the hub relays them to peers for dedup/ordering.
fn build_frame(message: &MatrixMessage) -> String {
    let mut metadata = message
        .metadata
        .clone()
        .unwrap_or_else(|| serde_json::json!({}));
    if let Some(obj) = metadata.as_object_mut() {
        obj.insert("message_id".into(), serde_json::json!(message.id));
        obj.insert(
            "sequence_number".into(),
            serde_json::json!(message.sequence_number),
        );
        obj.insert(
            "kind".into(),
            serde_json::json!(match message.message_type {
                MessageType::Direct => "direct",
                MessageType::Broadcast => "broadcast",
            }),
        );
    }
    let mut frame = serde_json::json!({
        "type": "message",
        "content": message.content,
        "metadata": metadata,
    });
    if let Some(to) = &message.to_matrix {
        frame["to"] = serde_json::json!(to);
    }
    frame.to_string()
}

fn send_retry_at(retry_count: i64) -> chrono::DateTime<Utc> {
    let exp = retry_count.clamp(0, 20) as u32;
    let secs = SEND_RETRY_BASE_SECS
        .saturating_mul(1i64 << exp)
        .min(SEND_RETRY_MAX_SECS);
    let jitter = rand::thread_rng().gen_range(0..SEND_RETRY_JITTER_MS);
    Utc::now() + chrono::Duration::seconds(secs) + chrono::Duration::milliseconds(jitter)
}

/// Run the outbound worker until shutdown.
pub async fn run(shared: Shared, shutdown: ShutdownSignal) {
    let mut shutdown_rx = shutdown.subscribe();

    // Crash recovery: anything still `sending` was in flight when a previous
    // process died between the two phases.
    match shared.store.resurrect_sending(&shared.matrix_id).await {
        Ok(0) => {}
        Ok(n) => info!(count = n, "recovered in-flight messages"),
        Err(e) => warn!(error = %e, "sending-row recovery failed"),
    }

    loop {
        tokio::select! {
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            _ = shared.kick.notified() => {}
            _ = shutdown_rx.recv() => break,
        }
        if !shared.is_connected() {
            // Queued-only mode: producers keep enqueueing, the queue drains
            // on reconnect.
            continue;
        }
        if let Err(e) = sweep_once(&shared).await {
            warn!(error = %e, "outbound sweep failed");
        }
    }
    debug!("outbound worker stopped");
}

/// One sweep: take due rows oldest-first and push them through the socket.
pub async fn sweep_once(shared: &Shared) -> Result<usize, StoreError> {
    let due = shared
        .store
        .due_outbound(&shared.matrix_id, SWEEP_BATCH)
        .await?;
    let mut sent = 0;
    for message in due {
        // Another worker may have taken the row between the select and here.
        if !shared.store.mark_sending(&message.id).await? {
            continue;
        }
        let frame = build_frame(&message);
        let (ack, done) = oneshot::channel();
        let transmit = shared.out_tx.send((frame, ack)).await;

        let result = match transmit {
            Ok(()) => match done.await {
                Ok(result) => result,
                Err(_) => Err("connection task dropped the frame".to_string()),
            },
            Err(_) => Err("connection task unavailable".to_string()),
        };

        match result {
            Ok(()) => {
                shared.store.mark_sent(&message.id).await?;
                sent += 1;
                debug!(
                    message_id = %message.id,
                    sequence = message.sequence_number,
                    "message sent"
                );
            }
            Err(error) => {
                let status = shared
                    .store
                    .mark_send_failed(&message.id, &error, send_retry_at(message.retry_count))
                    .await?;
                if status == MessageStatus::Failed {
                    warn!(message_id = %message.id, error = %error, "message failed terminally");
                } else {
                    debug!(message_id = %message.id, error = %error, "send failed, will retry");
                }
                // Transmission trouble usually means the socket is going
                // down; stop the sweep and let reconnect sort it out.
                break;
            }
        }
    }
    Ok(sent)
}

/// Slow housekeeping loop: purge old terminal rows and keep the search log
/// bounded.
pub async fn run_housekeeping(shared: Shared, shutdown: ShutdownSignal) {
    let mut shutdown_rx = shutdown.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs(3600));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cutoff = Utc::now() - chrono::Duration::days(7);
                match shared.store.purge_messages(cutoff).await {
                    Ok(0) => {}
                    Ok(n) => info!(purged = n, "old messages purged"),
                    Err(e) => warn!(error = %e, "message purge failed"),
                }
                if let Err(e) = shared.store.trim_search_log(10_000).await {
                    warn!(error = %e, "search log trim failed");
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
    debug!("housekeeping stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(to: Option<&str>, seq: i64) -> MatrixMessage {
        MatrixMessage {
            id: "msg-1".into(),
            from_matrix: "alpha".into(),
            to_matrix: to.map(|s| s.to_string()),
            content: "hi".into(),
            message_type: MatrixMessage::message_type_for(&to.map(|s| s.to_string())),
            status: MessageStatus::Pending,
            retry_count: 0,
            max_retries: 5,
            next_retry_at: None,
            sequence_number: seq,
            metadata: Some(serde_json::json!({"topic": "greetings"})),
            created_at: Utc::now(),
            attempted_at: None,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            last_error: None,
        }
    }

    #[test]
    fn frame_carries_sequence_and_id_in_metadata() {
        let frame: serde_json::Value =
            serde_json::from_str(&build_frame(&message(None, 7))).unwrap();
        assert_eq!(frame["type"], "message");
        assert_eq!(frame["metadata"]["sequence_number"], 7);
        assert_eq!(frame["metadata"]["message_id"], "msg-1");
        assert_eq!(frame["metadata"]["kind"], "broadcast");
        // Caller metadata is preserved.
        assert_eq!(frame["metadata"]["topic"], "greetings");
        assert!(frame.get("to").is_none());
    }

    #[test]
    fn direct_frames_name_the_recipient() {
        let frame: serde_json::Value =
            serde_json::from_str(&build_frame(&message(Some("beta"), 3))).unwrap();
        assert_eq!(frame["to"], "beta");
        assert_eq!(frame["metadata"]["kind"], "direct");
    }

    #[test]
    fn send_retry_backoff_is_bounded() {
        for count in 0..10 {
            let at = send_retry_at(count);
            let delta = at - Utc::now();
            assert!(delta.num_seconds() >= SEND_RETRY_BASE_SECS - 1);
            assert!(delta.num_seconds() <= SEND_RETRY_MAX_SECS + 2);
        }
    }
}
