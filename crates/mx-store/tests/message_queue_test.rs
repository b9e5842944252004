use chrono::{Duration, Utc};
use mx_core::types::{MessageStatus, MessageType};
use mx_store::{EnqueueRequest, Store};

async fn store() -> Store {
    Store::open_in_memory().await.expect("in-memory store")
}

fn request(from: &str, to: Option<&str>, content: &str) -> EnqueueRequest {
    EnqueueRequest {
        from_matrix: from.into(),
        to_matrix: to.map(|s| s.into()),
        content: content.into(),
        metadata: None,
    }
}

// ---------------------------------------------------------------------------
// Sequence counter
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sequence_numbers_are_contiguous_from_one() {
    let store = store().await;
    for expected in 1..=5 {
        let seq = store.next_sequence_number("alpha").await.unwrap();
        assert_eq!(seq, expected);
    }
    // Independent per matrix.
    assert_eq!(store.next_sequence_number("beta").await.unwrap(), 1);
}

#[tokio::test]
async fn concurrent_sequence_calls_never_collide() {
    let store = store().await;
    let mut handles = Vec::new();
    for _ in 0..20 {
        let s = store.clone();
        handles.push(tokio::spawn(async move {
            s.next_sequence_number("alpha").await.unwrap()
        }));
    }
    let mut seen = Vec::new();
    for h in handles {
        seen.push(h.await.unwrap());
    }
    seen.sort_unstable();
    let expected: Vec<i64> = (1..=20).collect();
    assert_eq!(seen, expected, "no gaps, no duplicates");
}

// ---------------------------------------------------------------------------
// Outbound queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enqueue_stamps_type_and_sequence() {
    let store = store().await;
    let broadcast = store.enqueue_message(request("alpha", None, "hi all")).await.unwrap();
    assert_eq!(broadcast.message_type, MessageType::Broadcast);
    assert_eq!(broadcast.status, MessageStatus::Pending);
    assert_eq!(broadcast.sequence_number, 1);

    let direct = store
        .enqueue_message(request("alpha", Some("beta"), "hi beta"))
        .await
        .unwrap();
    assert_eq!(direct.message_type, MessageType::Direct);
    assert_eq!(direct.sequence_number, 2);
}

#[tokio::test]
async fn two_phase_send_transitions() {
    let store = store().await;
    let msg = store.enqueue_message(request("alpha", None, "x")).await.unwrap();

    assert!(store.mark_sending(&msg.id).await.unwrap());
    // Second worker cannot also take it.
    assert!(!store.mark_sending(&msg.id).await.unwrap());

    assert!(store.mark_sent(&msg.id).await.unwrap());
    assert!(store.mark_delivered(&msg.id).await.unwrap());

    let row = store.get_message(&msg.id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Delivered);
    assert!(row.attempted_at.is_some());
    assert!(row.sent_at.is_some());
    assert!(row.delivered_at.is_some());
}

#[tokio::test]
async fn due_outbound_is_oldest_first_and_respects_backoff() {
    let store = store().await;
    let m1 = store.enqueue_message(request("alpha", None, "first")).await.unwrap();
    let m2 = store.enqueue_message(request("alpha", None, "second")).await.unwrap();
    let m3 = store.enqueue_message(request("alpha", None, "third")).await.unwrap();

    // Park m2 in the future.
    store.mark_sending(&m2.id).await.unwrap();
    store
        .mark_send_failed(&m2.id, "conn refused", Utc::now() + Duration::minutes(5))
        .await
        .unwrap();

    let due = store.due_outbound("alpha", 10).await.unwrap();
    let ids: Vec<&str> = due.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec![m1.id.as_str(), m3.id.as_str()]);
    assert_eq!(due[0].sequence_number, 1);
}

#[tokio::test]
async fn retries_exhaust_into_failed_and_sweeps_ignore_it() {
    let store = store().await;
    let msg = store.enqueue_message(request("alpha", None, "doomed")).await.unwrap();

    let mut status = MessageStatus::Pending;
    for _ in 0..msg.max_retries {
        assert!(store.mark_sending(&msg.id).await.unwrap());
        status = store
            .mark_send_failed(&msg.id, "boom", Utc::now() - Duration::seconds(1))
            .await
            .unwrap();
    }
    assert_eq!(status, MessageStatus::Failed);

    let row = store.get_message(&msg.id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Failed);
    assert_eq!(row.retry_count, row.max_retries);
    assert_eq!(row.last_error.as_deref(), Some("boom"));

    // Terminal rows never reappear in the sweep.
    assert!(store.due_outbound("alpha", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn resurrect_sending_returns_rows_to_pending() {
    let store = store().await;
    let msg = store.enqueue_message(request("alpha", None, "in flight")).await.unwrap();
    store.mark_sending(&msg.id).await.unwrap();

    // Simulated crash between sending and sent.
    assert_eq!(store.resurrect_sending("alpha").await.unwrap(), 1);
    let row = store.get_message(&msg.id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Pending);

    // Retry goes through normally afterwards.
    let due = store.due_outbound("alpha", 10).await.unwrap();
    assert_eq!(due.len(), 1);
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inbound_insert_dedups_by_id() {
    let store = store().await;
    // The sender's copy, as it would arrive over the wire.
    let msg = store.enqueue_message(request("beta", None, "from beta")).await.unwrap();

    assert!(store.insert_inbound(&msg).await.unwrap());
    // Redelivery of the same id is a no-op.
    assert!(!store.insert_inbound(&msg).await.unwrap());
}

#[tokio::test]
async fn unread_ordering_is_per_sender_sequence() {
    let store = store().await;

    // Interleave two senders; consumption must be grouped by sender with
    // ascending sequence numbers inside each group.
    let b1 = store.enqueue_message(request("beta", None, "b1")).await.unwrap();
    let g1 = store.enqueue_message(request("gamma", None, "g1")).await.unwrap();
    let b2 = store.enqueue_message(request("beta", None, "b2")).await.unwrap();

    for m in [&b1, &g1, &b2] {
        store.insert_inbound(m).await.unwrap();
    }

    let unread = store.unread_messages("alpha").await.unwrap();
    let order: Vec<(String, i64)> = unread
        .iter()
        .map(|m| (m.from_matrix.clone(), m.sequence_number))
        .collect();
    assert_eq!(
        order,
        vec![
            ("beta".to_string(), 1),
            ("beta".to_string(), 2),
            ("gamma".to_string(), 1),
        ]
    );

    assert!(store.mark_read(&b1.id).await.unwrap());
    assert!(!store.mark_read(&b1.id).await.unwrap());
    assert_eq!(store.unread_messages("alpha").await.unwrap().len(), 2);
}

#[tokio::test]
async fn purge_drops_only_old_terminal_rows() {
    let store = store().await;
    let done = store.enqueue_message(request("alpha", None, "old done")).await.unwrap();
    store.mark_sending(&done.id).await.unwrap();
    store.mark_sent(&done.id).await.unwrap();

    let pending = store.enqueue_message(request("alpha", None, "still pending")).await.unwrap();

    // Cutoff in the future: old terminal row goes, pending row stays.
    let purged = store.purge_messages(Utc::now() + Duration::seconds(1)).await.unwrap();
    assert_eq!(purged, 1);
    assert!(store.get_message(&done.id).await.unwrap().is_none());
    assert!(store.get_message(&pending.id).await.unwrap().is_some());
}
