//! Unified tasks: cross-cutting work items, optionally mirrored to GitHub.
//!
//! There is no separate per-session task table; session-scoped work is a
//! unified task with `domain = 'session'`.

use chrono::Utc;
use mx_core::types::{
    GithubSyncStatus, TaskDomain, TaskPriority, UnifiedTask, UnifiedTaskStatus,
};

use crate::{enum_from_sql, enum_to_sql, parse_ts, Result, Store, StoreError};

const UNIFIED_COLUMNS: &str = "id, title, description, domain, priority, status,
    github_issue_number, github_issue_url, github_repo, github_sync_status,
    session_id, agent_id, project_path, created_at, updated_at";

/// Fields for creating a unified task; id and sync status are stamped by the
/// store.
#[derive(Debug, Clone)]
pub struct NewUnifiedTask {
    pub title: String,
    pub description: Option<String>,
    pub domain: TaskDomain,
    pub priority: TaskPriority,
    pub session_id: Option<String>,
    pub agent_id: Option<i64>,
    pub project_path: Option<String>,
    pub github_issue_number: Option<i64>,
}

impl Store {
    pub async fn create_unified_task(&self, new: NewUnifiedTask) -> Result<UnifiedTask> {
        let sync = UnifiedTask::initial_sync_status(new.domain, new.github_issue_number);
        let domain = enum_to_sql(&new.domain);
        let priority = enum_to_sql(&new.priority);
        let sync_str = enum_to_sql(&sync);
        let now = Utc::now().to_rfc3339();
        let id: i64 = self
            .conn()
            .call(move |conn| {
                let id = conn.query_row(
                    "INSERT INTO unified_tasks (title, description, domain, priority, status,
                        github_issue_number, github_sync_status, session_id, agent_id,
                        project_path, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,'pending',?5,?6,?7,?8,?9,?10,?10)
                     RETURNING id",
                    rusqlite::params![
                        new.title,
                        new.description,
                        domain,
                        priority,
                        new.github_issue_number,
                        sync_str,
                        new.session_id,
                        new.agent_id,
                        new.project_path,
                        now,
                    ],
                    |r| r.get(0),
                )?;
                Ok(id)
            })
            .await?;
        self.get_unified_task(id)
            .await?
            .ok_or_else(|| StoreError::not_found("unified_task", id.to_string()))
    }

    pub async fn get_unified_task(&self, id: i64) -> Result<Option<UnifiedTask>> {
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {UNIFIED_COLUMNS} FROM unified_tasks WHERE id = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_unified(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn set_unified_status(&self, id: i64, status: UnifiedTaskStatus) -> Result<()> {
        let status = enum_to_sql(&status);
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE unified_tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![status, now, id],
                )?)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::not_found("unified_task", id.to_string()));
        }
        Ok(())
    }

    /// Record the result of a GitHub sync attempt.
    pub async fn set_github_linkage(
        &self,
        id: i64,
        issue_number: Option<i64>,
        issue_url: Option<String>,
        repo: Option<String>,
        sync_status: GithubSyncStatus,
    ) -> Result<()> {
        let sync = enum_to_sql(&sync_status);
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE unified_tasks
                     SET github_issue_number = COALESCE(?1, github_issue_number),
                         github_issue_url = COALESCE(?2, github_issue_url),
                         github_repo = COALESCE(?3, github_repo),
                         github_sync_status = ?4,
                         updated_at = ?5
                     WHERE id = ?6",
                    rusqlite::params![issue_number, issue_url, repo, sync, now, id],
                )?)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::not_found("unified_task", id.to_string()));
        }
        Ok(())
    }

    /// System-domain tasks still waiting for an external sync.
    pub async fn unified_tasks_pending_sync(&self) -> Result<Vec<UnifiedTask>> {
        self.conn()
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {UNIFIED_COLUMNS} FROM unified_tasks
                     WHERE domain = 'system' AND github_sync_status = 'pending'
                     ORDER BY created_at ASC"
                ))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_unified(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Cascading rollup: flip the unified task to `done` iff every mission
    /// referencing it is terminal and at least one completed. Returns true
    /// when the flip happened in this call.
    pub async fn rollup_unified(&self, unified_id: i64) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let tx = conn
                    .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let (non_terminal, completed): (i64, i64) = tx.query_row(
                    "SELECT
                        COUNT(*) FILTER (WHERE status NOT IN ('completed','failed','cancelled')),
                        COUNT(*) FILTER (WHERE status = 'completed')
                     FROM missions WHERE unified_task_id = ?1",
                    rusqlite::params![unified_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?;
                let flipped = if non_terminal == 0 && completed >= 1 {
                    tx.execute(
                        "UPDATE unified_tasks SET status = 'done', updated_at = ?1
                         WHERE id = ?2 AND status != 'done'",
                        rusqlite::params![now, unified_id],
                    )? > 0
                } else {
                    false
                };
                tx.commit()?;
                Ok(flipped)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn list_unified_tasks(&self, domain: Option<TaskDomain>) -> Result<Vec<UnifiedTask>> {
        let domain_str = domain.map(|d| enum_to_sql(&d));
        self.conn()
            .call(move |conn| {
                let mut sql = format!("SELECT {UNIFIED_COLUMNS} FROM unified_tasks WHERE 1=1");
                let mut params: Vec<Box<dyn rusqlite::types::ToSql + Send>> = Vec::new();
                if let Some(d) = domain_str {
                    sql.push_str(" AND domain = ?");
                    params.push(Box::new(d));
                }
                sql.push_str(" ORDER BY created_at ASC");
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params_from_iter(
                    params.iter().map(|p| p.as_ref() as &dyn rusqlite::types::ToSql),
                ))?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_unified(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }
}

fn row_to_unified(row: &rusqlite::Row<'_>) -> rusqlite::Result<UnifiedTask> {
    let domain_str: String = row.get(3)?;
    let priority_str: String = row.get(4)?;
    let status_str: String = row.get(5)?;
    let sync_str: String = row.get(9)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;

    let domain: TaskDomain = enum_from_sql(&domain_str);
    Ok(UnifiedTask {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        domain,
        priority: enum_from_sql(&priority_str),
        status: enum_from_sql(&status_str),
        github_issue_number: row.get(6)?,
        github_issue_url: row.get(7)?,
        github_repo: row.get(8)?,
        github_sync_status: enum_from_sql(&sync_str),
        session_id: row.get(10)?,
        agent_id: row.get(11)?,
        project_path: row.get(12)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}
