//! Mission (agent task) rows and the fenced claim contract.
//!
//! The claim is a single conditional UPDATE: it succeeds only while the row
//! is `queued` with a NULL `execution_id` and every dependency is completed.
//! Everything else — idempotent re-claim, wrong agent, already claimed — is
//! classified by reading the row back after a zero-row update. No other
//! cross-process serialization exists or is needed.

use chrono::Utc;
use mx_core::types::{Mission, MissionStatus, TaskPriority};
use serde::{Deserialize, Serialize};

use crate::{enum_from_sql, enum_to_sql, parse_ts, parse_ts_opt, Result, Store, StoreError};

const MISSION_COLUMNS: &str = "id, prompt, context, priority, status, retry_count, max_retries,
    timeout_ms, assigned_to, execution_id, parent_mission_id, unified_task_id, session_id,
    next_retry_at, started_at, completed_at, last_error, created_at, updated_at";

/// Why a claim did not take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimFailure {
    NotFound,
    WrongAgent,
    AlreadyClaimed,
    InvalidStatus,
}

/// Outcome of `claim_task`. `claimed` is also true for the idempotent case
/// (same execution id already holds the row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimOutcome {
    pub claimed: bool,
    pub reason: Option<ClaimFailure>,
}

impl ClaimOutcome {
    fn ok() -> Self {
        Self {
            claimed: true,
            reason: None,
        }
    }

    fn rejected(reason: ClaimFailure) -> Self {
        Self {
            claimed: false,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DequeueError {
    #[error("mission not found")]
    NotFound,
    #[error("mission is {status} (expected queued)")]
    InvalidStatus { status: MissionStatus },
    #[error("mission already claimed by another execution")]
    AlreadyClaimed,
}

/// SQL fragment: true when the mission has an unfinished dependency.
const HAS_UNMET_DEPS: &str = "EXISTS (
    SELECT 1 FROM mission_deps d
    JOIN missions dep ON dep.id = d.depends_on_id
    WHERE d.mission_id = missions.id AND dep.status != 'completed'
)";

impl Store {
    /// Insert a mission (and its dependency edges).
    pub async fn create_mission(&self, mission: &Mission) -> Result<()> {
        let m = mission.clone();
        let priority = enum_to_sql(&m.priority);
        let status = enum_to_sql(&m.status);
        self.conn()
            .call(move |conn| {
                let tx = conn.unchecked_transaction()?;
                tx.execute(
                    "INSERT INTO missions (id, prompt, context, priority, status, retry_count,
                        max_retries, timeout_ms, assigned_to, execution_id, parent_mission_id,
                        unified_task_id, session_id, next_retry_at, started_at, completed_at,
                        last_error, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
                    rusqlite::params![
                        m.id,
                        m.prompt,
                        m.context,
                        priority,
                        status,
                        m.retry_count,
                        m.max_retries,
                        m.timeout_ms,
                        m.assigned_to,
                        m.execution_id,
                        m.parent_mission_id,
                        m.unified_task_id,
                        m.session_id,
                        m.next_retry_at.map(|d| d.to_rfc3339()),
                        m.started_at.map(|d| d.to_rfc3339()),
                        m.completed_at.map(|d| d.to_rfc3339()),
                        m.last_error,
                        m.created_at.to_rfc3339(),
                        m.updated_at.to_rfc3339(),
                    ],
                )?;
                for dep in &m.depends_on {
                    tx.execute(
                        "INSERT OR IGNORE INTO mission_deps (mission_id, depends_on_id)
                         VALUES (?1, ?2)",
                        rusqlite::params![m.id, dep],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_mission(&self, id: &str) -> Result<Option<Mission>> {
        let id = id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MISSION_COLUMNS} FROM missions WHERE id = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                let mission = match rows.next()? {
                    Some(row) => Some(load_mission(conn, row)?),
                    None => None,
                };
                Ok(mission)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Atomic, fenced claim: `queued → processing`.
    ///
    /// The single conditional UPDATE is the only write; if it changed no
    /// rows, the row is read back to classify why, and a row already held by
    /// the same `execution_id` is an idempotent success.
    pub async fn claim_task(
        &self,
        task_id: &str,
        agent_id: i64,
        execution_id: &str,
    ) -> Result<ClaimOutcome> {
        let id = task_id.to_string();
        let exec = execution_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let changed = conn.execute(
                    &format!(
                        "UPDATE missions
                         SET status = 'processing', execution_id = ?1, started_at = ?2,
                             updated_at = ?2
                         WHERE id = ?3 AND status = 'queued' AND execution_id IS NULL
                           AND (assigned_to = ?4 OR assigned_to IS NULL)
                           AND NOT {HAS_UNMET_DEPS}"
                    ),
                    rusqlite::params![exec, now, id, agent_id],
                )?;
                if changed > 0 {
                    return Ok(ClaimOutcome::ok());
                }

                // Classify the rejection.
                let row: Option<(String, Option<String>, Option<i64>)> = conn
                    .query_row(
                        "SELECT status, execution_id, assigned_to FROM missions WHERE id = ?1",
                        rusqlite::params![id],
                        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                    )
                    .ok();
                let Some((status, existing_exec, assigned_to)) = row else {
                    return Ok(ClaimOutcome::rejected(ClaimFailure::NotFound));
                };
                if existing_exec.as_deref() == Some(exec.as_str()) {
                    // Retry of a claim we already won.
                    return Ok(ClaimOutcome::ok());
                }
                if let Some(owner) = assigned_to {
                    if owner != agent_id {
                        return Ok(ClaimOutcome::rejected(ClaimFailure::WrongAgent));
                    }
                }
                if existing_exec.is_some() {
                    return Ok(ClaimOutcome::rejected(ClaimFailure::AlreadyClaimed));
                }
                let _status: MissionStatus = enum_from_sql(&status);
                Ok(ClaimOutcome::rejected(ClaimFailure::InvalidStatus))
            })
            .await
            .map_err(StoreError::from)
    }

    /// `queued → running` under BEGIN IMMEDIATE; errors unless the row is
    /// queued with no execution id.
    pub async fn atomic_dequeue_mission(
        &self,
        mission_id: &str,
        agent_id: i64,
        execution_id: &str,
    ) -> Result<std::result::Result<Mission, DequeueError>> {
        let id = mission_id.to_string();
        let exec = execution_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(
                    rusqlite::TransactionBehavior::Immediate,
                )?;
                let row: Option<(String, Option<String>)> = tx
                    .query_row(
                        "SELECT status, execution_id FROM missions WHERE id = ?1",
                        rusqlite::params![id],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .ok();
                let Some((status_raw, existing_exec)) = row else {
                    return Ok(Err(DequeueError::NotFound));
                };
                let status: MissionStatus = enum_from_sql(&status_raw);
                if status != MissionStatus::Queued {
                    return Ok(Err(DequeueError::InvalidStatus { status }));
                }
                if existing_exec.is_some() {
                    return Ok(Err(DequeueError::AlreadyClaimed));
                }
                tx.execute(
                    "UPDATE missions
                     SET status = 'running', execution_id = ?1, assigned_to = ?2,
                         started_at = ?3, updated_at = ?3
                     WHERE id = ?4",
                    rusqlite::params![exec, agent_id, now, id],
                )?;
                let mut stmt = tx.prepare(&format!(
                    "SELECT {MISSION_COLUMNS} FROM missions WHERE id = ?1"
                ))?;
                let mission = stmt.query_row(rusqlite::params![id], |row| {
                    raw_mission(row)
                })?;
                drop(stmt);
                let deps = load_deps(&tx, &mission.id)?;
                tx.commit()?;
                let mut mission = mission;
                mission.depends_on = deps;
                Ok(Ok(mission))
            })
            .await
            .map_err(StoreError::from)
    }

    /// Release a held mission back to the queue. Only the execution-id
    /// holder may do this; clears the fence and `started_at`.
    pub async fn release_mission(&self, id: &str, execution_id: &str) -> Result<bool> {
        let id = id.to_string();
        let exec = execution_id.to_string();
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE missions
                     SET status = 'queued', execution_id = NULL, started_at = NULL,
                         updated_at = ?1
                     WHERE id = ?2 AND execution_id = ?3
                       AND status IN ('processing','running')",
                    rusqlite::params![now, id, exec],
                )?)
            })
            .await?;
        Ok(changed > 0)
    }

    /// Terminal success; only the fence holder may complete.
    pub async fn complete_mission(&self, id: &str, execution_id: &str) -> Result<bool> {
        let id = id.to_string();
        let exec = execution_id.to_string();
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE missions
                     SET status = 'completed', completed_at = ?1, updated_at = ?1
                     WHERE id = ?2 AND execution_id = ?3
                       AND status IN ('processing','running')",
                    rusqlite::params![now, id, exec],
                )?)
            })
            .await?;
        Ok(changed > 0)
    }

    /// Record a failure. With retries remaining the row parks in `retrying`
    /// until `next_retry_at`; otherwise it terminates in `failed`.
    pub async fn fail_mission(
        &self,
        id: &str,
        execution_id: &str,
        error: &str,
        next_retry_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<bool> {
        let id = id.to_string();
        let exec = execution_id.to_string();
        let error = error.to_string();
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .call(move |conn| {
                let sql = if next_retry_at.is_some() {
                    "UPDATE missions
                     SET status = 'retrying', execution_id = NULL, started_at = NULL,
                         last_error = ?1, next_retry_at = ?2, updated_at = ?3
                     WHERE id = ?4 AND execution_id = ?5
                       AND status IN ('processing','running')"
                } else {
                    "UPDATE missions
                     SET status = 'failed', execution_id = NULL, completed_at = ?3,
                         last_error = ?1, next_retry_at = ?2, updated_at = ?3
                     WHERE id = ?4 AND execution_id = ?5
                       AND status IN ('processing','running')"
                };
                Ok(conn.execute(
                    sql,
                    rusqlite::params![
                        error,
                        next_retry_at.map(|d| d.to_rfc3339()),
                        now,
                        id,
                        exec
                    ],
                )?)
            })
            .await?;
        Ok(changed > 0)
    }

    /// Cancel a non-terminal mission. Terminal statuses are immutable.
    pub async fn cancel_mission(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE missions
                     SET status = 'cancelled', execution_id = NULL, completed_at = ?1,
                         updated_at = ?1
                     WHERE id = ?2 AND status NOT IN ('completed','failed','cancelled')",
                    rusqlite::params![now, id],
                )?)
            })
            .await?;
        Ok(changed > 0)
    }

    /// Move a pending mission into the queue (or park it in `blocked` when
    /// it has unmet dependencies).
    pub async fn queue_mission(&self, id: &str) -> Result<MissionStatus> {
        let id = id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let blocked: bool = conn.query_row(
                    &format!("SELECT {HAS_UNMET_DEPS} FROM missions WHERE id = ?1"),
                    rusqlite::params![id],
                    |r| r.get(0),
                )?;
                let next = if blocked { "blocked" } else { "queued" };
                conn.execute(
                    "UPDATE missions SET status = ?1, updated_at = ?2
                     WHERE id = ?3 AND status IN ('pending','blocked')",
                    rusqlite::params![next, now, id],
                )?;
                Ok(if blocked {
                    MissionStatus::Blocked
                } else {
                    MissionStatus::Queued
                })
            })
            .await
            .map_err(StoreError::from)
    }

    /// Rows due for a retry sweep: `pending|retrying` with `next_retry_at`
    /// unset or in the past.
    pub async fn due_mission_retries(&self, limit: usize) -> Result<Vec<String>> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id FROM missions
                     WHERE status IN ('pending','retrying')
                       AND (next_retry_at IS NULL OR next_retry_at <= ?1)
                     ORDER BY created_at ASC LIMIT ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![now, limit as i64])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row.get(0)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Re-queue a due row. Counts the retry when the row came from
    /// `retrying`; a pending row entering the queue for the first time keeps
    /// its count. Past `max_retries` the row terminates in `failed`.
    pub async fn requeue_mission(&self, id: &str) -> Result<MissionStatus> {
        let id = id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(
                    rusqlite::TransactionBehavior::Immediate,
                )?;
                let row: Option<(String, i64, i64)> = tx
                    .query_row(
                        "SELECT status, retry_count, max_retries FROM missions WHERE id = ?1",
                        rusqlite::params![id],
                        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                    )
                    .ok();
                let Some((status_raw, retry_count, max_retries)) = row else {
                    return Ok(MissionStatus::Failed);
                };
                let status: MissionStatus = enum_from_sql(&status_raw);
                let next = match status {
                    MissionStatus::Retrying if retry_count + 1 > max_retries => {
                        tx.execute(
                            "UPDATE missions SET status = 'failed', completed_at = ?1,
                                 updated_at = ?1 WHERE id = ?2",
                            rusqlite::params![now, id],
                        )?;
                        MissionStatus::Failed
                    }
                    MissionStatus::Retrying => {
                        tx.execute(
                            "UPDATE missions SET status = 'queued',
                                 retry_count = retry_count + 1, next_retry_at = NULL,
                                 updated_at = ?1 WHERE id = ?2",
                            rusqlite::params![now, id],
                        )?;
                        MissionStatus::Queued
                    }
                    MissionStatus::Pending => {
                        tx.execute(
                            "UPDATE missions SET status = 'queued', next_retry_at = NULL,
                                 updated_at = ?1 WHERE id = ?2",
                            rusqlite::params![now, id],
                        )?;
                        MissionStatus::Queued
                    }
                    other => other,
                };
                tx.commit()?;
                Ok(next)
            })
            .await
            .map_err(StoreError::from)
    }

    /// In-flight rows whose holder may have crashed: `processing|running`
    /// with a `started_at`. The caller applies each row's own `timeout_ms`.
    pub async fn inflight_missions(&self) -> Result<Vec<Mission>> {
        self.conn()
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MISSION_COLUMNS} FROM missions
                     WHERE status IN ('processing','running') AND started_at IS NOT NULL"
                ))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(load_mission(conn, row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Flip every `blocked` mission whose dependencies are now all completed
    /// back to `queued`. Returns how many rows moved.
    pub async fn unblock_ready_missions(&self) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .call(move |conn| {
                Ok(conn.execute(
                    &format!(
                        "UPDATE missions SET status = 'queued', updated_at = ?1
                         WHERE status = 'blocked' AND NOT {HAS_UNMET_DEPS}"
                    ),
                    rusqlite::params![now],
                )?)
            })
            .await?;
        Ok(changed)
    }

    /// Missions referencing a unified task, with their statuses.
    pub async fn missions_for_unified(&self, unified_id: i64) -> Result<Vec<(String, MissionStatus)>> {
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, status FROM missions WHERE unified_task_id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![unified_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let id: String = row.get(0)?;
                    let status: String = row.get(1)?;
                    out.push((id, enum_from_sql(&status)));
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn list_missions_by_status(&self, status: MissionStatus) -> Result<Vec<Mission>> {
        let status = enum_to_sql(&status);
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MISSION_COLUMNS} FROM missions WHERE status = ?1
                     ORDER BY created_at ASC"
                ))?;
                let mut rows = stmt.query(rusqlite::params![status])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(load_mission(conn, row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn raw_mission(row: &rusqlite::Row<'_>) -> rusqlite::Result<Mission> {
    let priority_str: String = row.get(3)?;
    let status_str: String = row.get(4)?;
    let next_retry: Option<String> = row.get(13)?;
    let started: Option<String> = row.get(14)?;
    let completed: Option<String> = row.get(15)?;
    let created_at: String = row.get(17)?;
    let updated_at: String = row.get(18)?;

    let priority: TaskPriority = enum_from_sql(&priority_str);
    Ok(Mission {
        id: row.get(0)?,
        prompt: row.get(1)?,
        context: row.get(2)?,
        priority,
        status: enum_from_sql(&status_str),
        retry_count: row.get(5)?,
        max_retries: row.get(6)?,
        timeout_ms: row.get(7)?,
        depends_on: Vec::new(),
        assigned_to: row.get(8)?,
        execution_id: row.get(9)?,
        parent_mission_id: row.get(10)?,
        unified_task_id: row.get(11)?,
        session_id: row.get(12)?,
        next_retry_at: parse_ts_opt(next_retry),
        started_at: parse_ts_opt(started),
        completed_at: parse_ts_opt(completed),
        last_error: row.get(16)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn load_deps(conn: &rusqlite::Connection, mission_id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT depends_on_id FROM mission_deps WHERE mission_id = ?1 ORDER BY depends_on_id",
    )?;
    let mut rows = stmt.query(rusqlite::params![mission_id])?;
    let mut deps = Vec::new();
    while let Some(row) = rows.next()? {
        deps.push(row.get(0)?);
    }
    Ok(deps)
}

fn load_mission(conn: &rusqlite::Connection, row: &rusqlite::Row<'_>) -> rusqlite::Result<Mission> {
    let mut mission = raw_mission(row)?;
    mission.depends_on = load_deps(conn, &mission.id)?;
    Ok(mission)
}
