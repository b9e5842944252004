//! Agent rows: one per worker in a workspace.

use chrono::Utc;
use mx_core::types::{Agent, AgentStatus};

use crate::{enum_from_sql, enum_to_sql, parse_ts, Result, Store, StoreError};

impl Store {
    /// Create an agent by name, or return the existing row (names are unique).
    pub async fn ensure_agent(&self, name: &str) -> Result<Agent> {
        let name = name.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agents (name, status, created_at, last_active_at)
                     VALUES (?1, 'pending', ?2, ?2)
                     ON CONFLICT(name) DO NOTHING",
                    rusqlite::params![name, now],
                )?;
                let mut stmt = conn.prepare(
                    "SELECT id, name, status, sessions_count, learnings_count,
                            tasks_completed, created_at, last_active_at
                     FROM agents WHERE name = ?1",
                )?;
                let agent = stmt.query_row(rusqlite::params![name], row_to_agent)?;
                Ok(agent)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_agent(&self, id: i64) -> Result<Option<Agent>> {
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, status, sessions_count, learnings_count,
                            tasks_completed, created_at, last_active_at
                     FROM agents WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_agent(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn set_agent_status(&self, id: i64, status: AgentStatus) -> Result<()> {
        let status = enum_to_sql(&status);
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE agents SET status = ?1, last_active_at = ?2 WHERE id = ?3",
                    rusqlite::params![status, now, id],
                )?)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::not_found("agent", id.to_string()));
        }
        Ok(())
    }

    /// Bump one of the cumulative counters and refresh `last_active_at`.
    pub(crate) async fn bump_agent_counter(&self, id: i64, column: AgentCounter) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let sql = match column {
            AgentCounter::Sessions => {
                "UPDATE agents SET sessions_count = sessions_count + 1, last_active_at = ?1
                 WHERE id = ?2"
            }
            AgentCounter::Learnings => {
                "UPDATE agents SET learnings_count = learnings_count + 1, last_active_at = ?1
                 WHERE id = ?2"
            }
            AgentCounter::TasksCompleted => {
                "UPDATE agents SET tasks_completed = tasks_completed + 1, last_active_at = ?1
                 WHERE id = ?2"
            }
        };
        self.conn()
            .call(move |conn| {
                conn.execute(sql, rusqlite::params![now, id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        self.conn()
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, status, sessions_count, learnings_count,
                            tasks_completed, created_at, last_active_at
                     FROM agents ORDER BY id",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_agent(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum AgentCounter {
    Sessions,
    Learnings,
    TasksCompleted,
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let status_str: String = row.get(2)?;
    let created_at: String = row.get(6)?;
    let last_active_at: String = row.get(7)?;
    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        status: enum_from_sql(&status_str),
        sessions_count: row.get(3)?,
        learnings_count: row.get(4)?,
        tasks_completed: row.get(5)?,
        created_at: parse_ts(&created_at),
        last_active_at: parse_ts(&last_active_at),
    })
}
