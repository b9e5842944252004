//! The matrix message queues and the per-matrix sequence counter.
//!
//! The counter row is the sole source of sequence numbers: enqueue bumps it
//! and inserts the message inside one `BEGIN IMMEDIATE` transaction, so two
//! processes enqueueing concurrently can never observe the same number.
//! Callers must never read-then-write the counter.

use chrono::{DateTime, Utc};
use mx_core::types::{MatrixMessage, MessageStatus, MessageType, DEFAULT_MAX_RETRIES};
use uuid::Uuid;

use crate::{
    enum_from_sql, enum_to_sql, json_column, parse_ts, parse_ts_opt, Result, Store, StoreError,
};

const MESSAGE_COLUMNS: &str = "id, from_matrix, to_matrix, content, message_type, status,
    retry_count, max_retries, next_retry_at, sequence_number, metadata, created_at,
    attempted_at, sent_at, delivered_at, read_at, last_error";

/// What a producer hands to `enqueue_message`.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub from_matrix: String,
    pub to_matrix: Option<String>,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
}

impl Store {
    /// Bump and return the next sequence number for a matrix.
    ///
    /// Single upsert-increment statement; after k calls the returned values
    /// are exactly 1..k with no gaps or duplicates, under any concurrency.
    pub async fn next_sequence_number(&self, matrix_id: &str) -> Result<i64> {
        let matrix_id = matrix_id.to_string();
        self.conn()
            .call(move |conn| {
                let seq: i64 = conn.query_row(
                    "INSERT INTO matrix_sequences (matrix_id, next_sequence)
                     VALUES (?1, 1)
                     ON CONFLICT(matrix_id) DO UPDATE SET next_sequence = next_sequence + 1
                     RETURNING next_sequence",
                    rusqlite::params![matrix_id],
                    |r| r.get(0),
                )?;
                Ok(seq)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Phase one of the outbound path: mint a sequence number and insert the
    /// row as `pending`, atomically.
    pub async fn enqueue_message(&self, req: EnqueueRequest) -> Result<MatrixMessage> {
        let id = Uuid::new_v4().to_string();
        let message_type = MatrixMessage::message_type_for(&req.to_matrix);
        let type_str = enum_to_sql(&message_type);
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let metadata = req.metadata.as_ref().map(|v| v.to_string());
        let row_id = id.clone();

        let sequence_number: i64 = self
            .conn()
            .call(move |conn| {
                let tx = conn
                    .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let seq: i64 = tx.query_row(
                    "INSERT INTO matrix_sequences (matrix_id, next_sequence)
                     VALUES (?1, 1)
                     ON CONFLICT(matrix_id) DO UPDATE SET next_sequence = next_sequence + 1
                     RETURNING next_sequence",
                    rusqlite::params![req.from_matrix],
                    |r| r.get(0),
                )?;
                tx.execute(
                    "INSERT INTO matrix_messages (id, from_matrix, to_matrix, content,
                        message_type, status, retry_count, max_retries, sequence_number,
                        metadata, created_at)
                     VALUES (?1,?2,?3,?4,?5,'pending',0,?6,?7,?8,?9)",
                    rusqlite::params![
                        row_id,
                        req.from_matrix,
                        req.to_matrix,
                        req.content,
                        type_str,
                        DEFAULT_MAX_RETRIES,
                        seq,
                        metadata,
                        now_str,
                    ],
                )?;
                tx.commit()?;
                Ok(seq)
            })
            .await?;

        self.get_message(&id).await?.ok_or_else(|| {
            StoreError::not_found("matrix_message", format!("{id} (seq {sequence_number})"))
        })
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<MatrixMessage>> {
        let id = id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM matrix_messages WHERE id = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_message(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    /// Phase two: move `pending → sending` before the frame goes out. False
    /// when another worker already took the row.
    pub async fn mark_sending(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE matrix_messages SET status = 'sending', attempted_at = ?1
                     WHERE id = ?2 AND status = 'pending'",
                    rusqlite::params![now, id],
                )?)
            })
            .await?;
        Ok(changed > 0)
    }

    /// Transmit succeeded: `sending → sent`.
    pub async fn mark_sent(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE matrix_messages SET status = 'sent', sent_at = ?1
                     WHERE id = ?2 AND status = 'sending'",
                    rusqlite::params![now, id],
                )?)
            })
            .await?;
        Ok(changed > 0)
    }

    /// Delivery acknowledged: `sent → delivered`.
    pub async fn mark_delivered(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE matrix_messages SET status = 'delivered', delivered_at = ?1
                     WHERE id = ?2 AND status = 'sent'",
                    rusqlite::params![now, id],
                )?)
            })
            .await?;
        Ok(changed > 0)
    }

    /// Transmit failed: back to `pending` with retry bookkeeping, or
    /// terminally `failed` once the retry budget is spent.
    pub async fn mark_send_failed(
        &self,
        id: &str,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<MessageStatus> {
        let id = id.to_string();
        let error = error.to_string();
        let retry_at = next_retry_at.to_rfc3339();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let tx = conn
                    .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let row: Option<(i64, i64)> = tx
                    .query_row(
                        "SELECT retry_count, max_retries FROM matrix_messages
                         WHERE id = ?1 AND status = 'sending'",
                        rusqlite::params![id],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .ok();
                let Some((retry_count, max_retries)) = row else {
                    tx.rollback()?;
                    return Ok(MessageStatus::Failed);
                };
                let next_status = if retry_count + 1 >= max_retries {
                    tx.execute(
                        "UPDATE matrix_messages
                         SET status = 'failed', retry_count = retry_count + 1,
                             last_error = ?1, next_retry_at = NULL
                         WHERE id = ?2",
                        rusqlite::params![error, id],
                    )?;
                    MessageStatus::Failed
                } else {
                    tx.execute(
                        "UPDATE matrix_messages
                         SET status = 'pending', retry_count = retry_count + 1,
                             last_error = ?1, next_retry_at = ?2, attempted_at = ?3
                         WHERE id = ?4",
                        rusqlite::params![error, retry_at, now, id],
                    )?;
                    MessageStatus::Pending
                };
                tx.commit()?;
                Ok(next_status)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Outbound rows ready to send, oldest first. Per-sender delivery order
    /// is monotone because rows are created in sequence order.
    pub async fn due_outbound(&self, from_matrix: &str, limit: usize) -> Result<Vec<MatrixMessage>> {
        let from = from_matrix.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM matrix_messages
                     WHERE from_matrix = ?1 AND status = 'pending'
                       AND (next_retry_at IS NULL OR next_retry_at <= ?2)
                       AND retry_count < max_retries
                     ORDER BY created_at ASC LIMIT ?3"
                ))?;
                let mut rows = stmt.query(rusqlite::params![from, now, limit as i64])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_message(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Crash recovery: any row stuck in `sending` is moved back to `pending`
    /// for immediate retry. Safe because frames carry stable sequence
    /// numbers and peers dedup.
    pub async fn resurrect_sending(&self, from_matrix: &str) -> Result<usize> {
        let from = from_matrix.to_string();
        let changed = self
            .conn()
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE matrix_messages
                     SET status = 'pending', next_retry_at = NULL
                     WHERE from_matrix = ?1 AND status = 'sending'",
                    rusqlite::params![from],
                )?)
            })
            .await?;
        if changed > 0 {
            tracing::info!(count = changed, "resurrected in-flight messages after restart");
        }
        Ok(changed)
    }

    /// Store a message received from the hub. Dedup by message id: the
    /// second delivery of the same id is a no-op and returns `false`.
    pub async fn insert_inbound(&self, message: &MatrixMessage) -> Result<bool> {
        let m = message.clone();
        let type_str = enum_to_sql(&m.message_type);
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT OR IGNORE INTO matrix_messages (id, from_matrix, to_matrix,
                        content, message_type, status, retry_count, max_retries,
                        sequence_number, metadata, created_at, delivered_at)
                     VALUES (?1,?2,?3,?4,?5,'delivered',0,?6,?7,?8,?9,?10)",
                    rusqlite::params![
                        m.id,
                        m.from_matrix,
                        m.to_matrix,
                        m.content,
                        type_str,
                        m.max_retries,
                        m.sequence_number,
                        m.metadata.as_ref().map(|v| v.to_string()),
                        m.created_at.to_rfc3339(),
                        now,
                    ],
                )?)
            })
            .await?;
        Ok(changed > 0)
    }

    /// Unread inbound messages for this matrix, in per-sender sequence order.
    pub async fn unread_messages(&self, own_matrix: &str) -> Result<Vec<MatrixMessage>> {
        let own = own_matrix.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM matrix_messages
                     WHERE from_matrix != ?1 AND status = 'delivered' AND read_at IS NULL
                     ORDER BY from_matrix, sequence_number"
                ))?;
                let mut rows = stmt.query(rusqlite::params![own])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_message(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn mark_read(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE matrix_messages SET read_at = ?1
                     WHERE id = ?2 AND read_at IS NULL",
                    rusqlite::params![now, id],
                )?)
            })
            .await?;
        Ok(changed > 0)
    }

    /// Operator cleanup: drop terminal rows older than the cutoff.
    pub async fn purge_messages(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let cutoff = older_than.to_rfc3339();
        let changed = self
            .conn()
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM matrix_messages
                     WHERE created_at < ?1
                       AND status IN ('sent','delivered','failed')",
                    rusqlite::params![cutoff],
                )?)
            })
            .await?;
        Ok(changed)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MatrixMessage> {
    let type_str: String = row.get(4)?;
    let status_str: String = row.get(5)?;
    let next_retry: Option<String> = row.get(8)?;
    let metadata_str: Option<String> = row.get(10)?;
    let created_at: String = row.get(11)?;
    let attempted: Option<String> = row.get(12)?;
    let sent: Option<String> = row.get(13)?;
    let delivered: Option<String> = row.get(14)?;
    let read: Option<String> = row.get(15)?;

    let message_type: MessageType = enum_from_sql(&type_str);
    let metadata: Option<serde_json::Value> = match metadata_str {
        Some(s) => Some(json_column(10, &s)?),
        None => None,
    };
    Ok(MatrixMessage {
        id: row.get(0)?,
        from_matrix: row.get(1)?,
        to_matrix: row.get(2)?,
        content: row.get(3)?,
        message_type,
        status: enum_from_sql(&status_str),
        retry_count: row.get(6)?,
        max_retries: row.get(7)?,
        next_retry_at: parse_ts_opt(next_retry),
        sequence_number: row.get(9)?,
        metadata,
        created_at: parse_ts(&created_at),
        attempted_at: parse_ts_opt(attempted),
        sent_at: parse_ts_opt(sent),
        delivered_at: parse_ts_opt(delivered),
        read_at: parse_ts_opt(read),
        last_error: row.get(16)?,
    })
}
