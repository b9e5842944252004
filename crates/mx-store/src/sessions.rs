//! Session persistence.
//!
//! `previous_session_id` forms a DAG: the store rejects links to missing
//! sessions and links that would close a cycle.

use chrono::Utc;
use mx_core::types::{Session, SessionContext, Visibility};

use crate::{enum_from_sql, enum_to_sql, json_column, parse_ts, Result, Store, StoreError};

const SESSION_COLUMNS: &str = "id, summary, context, tags, agent_id, visibility, project_path,
                               previous_session_id, created_at, updated_at";

impl Store {
    /// Insert or update a session.
    pub async fn save_session(&self, session: &Session) -> Result<()> {
        let s = session.clone();
        let context = match &s.context {
            Some(ctx) if !ctx.is_empty() => {
                Some(serde_json::to_string(ctx).expect("serialize context"))
            }
            _ => None,
        };
        let tags = serde_json::to_string(&s.tags).expect("serialize tags");
        let visibility = enum_to_sql(&s.visibility);
        let now = Utc::now().to_rfc3339();

        let inserted_new: bool = self
            .conn()
            .call(move |conn| {
                // Validate the predecessor link before writing.
                if let Some(prev) = &s.previous_session_id {
                    let mut current = Some(prev.clone());
                    let mut hops = 0;
                    while let Some(cursor) = current {
                        if cursor == s.id {
                            return Err(tokio_rusqlite::Error::Rusqlite(
                                rusqlite::Error::SqliteFailure(
                                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
                                    Some(format!("session chain cycle through {}", s.id)),
                                ),
                            ));
                        }
                        let next: Option<Option<String>> = conn
                            .query_row(
                                "SELECT previous_session_id FROM sessions WHERE id = ?1",
                                rusqlite::params![cursor],
                                |r| r.get(0),
                            )
                            .ok();
                        match next {
                            None => {
                                return Err(tokio_rusqlite::Error::Rusqlite(
                                    rusqlite::Error::SqliteFailure(
                                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
                                        Some(format!("previous session {} does not exist", cursor)),
                                    ),
                                ));
                            }
                            Some(prev_of_cursor) => current = prev_of_cursor,
                        }
                        hops += 1;
                        if hops > 10_000 {
                            break;
                        }
                    }
                }

                let existed: bool = conn
                    .query_row(
                        "SELECT 1 FROM sessions WHERE id = ?1",
                        rusqlite::params![s.id],
                        |_| Ok(true),
                    )
                    .unwrap_or(false);

                conn.execute(
                    "INSERT INTO sessions (id, summary, context, tags, agent_id, visibility,
                        project_path, previous_session_id, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
                     ON CONFLICT(id) DO UPDATE SET
                        summary=excluded.summary, context=excluded.context, tags=excluded.tags,
                        visibility=excluded.visibility, project_path=excluded.project_path,
                        previous_session_id=excluded.previous_session_id,
                        updated_at=excluded.updated_at",
                    rusqlite::params![
                        s.id,
                        s.summary,
                        context,
                        tags,
                        s.agent_id,
                        visibility,
                        s.project_path,
                        s.previous_session_id,
                        s.created_at.to_rfc3339(),
                        now,
                    ],
                )?;
                Ok(!existed)
            })
            .await
            .map_err(map_constraint)?;

        if inserted_new {
            if let Some(agent_id) = session.agent_id {
                self.bump_agent_counter(agent_id, crate::agents::AgentCounter::Sessions)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let id = id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_session(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    /// The most recent session visible in the caller's scope.
    ///
    /// Scope filters compose: an agent filter restricts to that agent's rows
    /// plus shared/public/orchestrator-owned ones; a project filter restricts
    /// to that project plus unscoped rows.
    pub async fn latest_session(
        &self,
        agent_id: Option<i64>,
        project_path: Option<&str>,
    ) -> Result<Option<Session>> {
        let project = project_path.map(|p| p.to_string());
        self.conn()
            .call(move |conn| {
                let mut sql = format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE 1=1"
                );
                let mut params: Vec<Box<dyn rusqlite::types::ToSql + Send>> = Vec::new();

                if let Some(agent) = agent_id {
                    sql.push_str(
                        " AND (agent_id = ? OR agent_id IS NULL
                           OR visibility IN ('shared','public'))",
                    );
                    params.push(Box::new(agent));
                }
                if let Some(project) = project {
                    sql.push_str(" AND (project_path = ? OR project_path IS NULL)");
                    params.push(Box::new(project));
                }
                sql.push_str(" ORDER BY created_at DESC LIMIT 1");

                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params_from_iter(
                    params.iter().map(|p| p.as_ref() as &dyn rusqlite::types::ToSql),
                ))?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_session(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn list_sessions(
        &self,
        agent_id: Option<i64>,
        project_path: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Session>> {
        let project = project_path.map(|p| p.to_string());
        self.conn()
            .call(move |conn| {
                let mut sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE 1=1");
                let mut params: Vec<Box<dyn rusqlite::types::ToSql + Send>> = Vec::new();
                if let Some(agent) = agent_id {
                    sql.push_str(
                        " AND (agent_id = ? OR agent_id IS NULL
                           OR visibility IN ('shared','public'))",
                    );
                    params.push(Box::new(agent));
                }
                if let Some(project) = project {
                    sql.push_str(" AND (project_path = ? OR project_path IS NULL)");
                    params.push(Box::new(project));
                }
                sql.push_str(" ORDER BY created_at DESC LIMIT ?");
                params.push(Box::new(limit as i64));

                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params_from_iter(
                    params.iter().map(|p| p.as_ref() as &dyn rusqlite::types::ToSql),
                ))?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_session(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn delete_session(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let changed = self
            .conn()
            .call(move |conn| {
                Ok(conn.execute("DELETE FROM sessions WHERE id = ?1", rusqlite::params![id])?)
            })
            .await?;
        Ok(changed > 0)
    }
}

fn map_constraint(e: tokio_rusqlite::Error) -> StoreError {
    if let tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(_, Some(ref msg))) = e {
        if msg.contains("cycle") || msg.contains("does not exist") {
            return StoreError::Constraint(msg.clone());
        }
    }
    StoreError::Db(e)
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let context_str: Option<String> = row.get(2)?;
    let tags_str: String = row.get(3)?;
    let visibility_str: String = row.get(5)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    let visibility: Visibility = enum_from_sql(&visibility_str);
    let context: Option<SessionContext> = match context_str {
        Some(s) => Some(json_column(2, &s)?),
        None => None,
    };
    Ok(Session {
        id: row.get(0)?,
        summary: row.get(1)?,
        context,
        tags: json_column(3, &tags_str)?,
        agent_id: row.get(4)?,
        visibility,
        project_path: row.get(6)?,
        previous_session_id: row.get(7)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}
