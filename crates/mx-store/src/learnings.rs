//! Learning persistence, validation, and keyword (FTS) search.

use chrono::Utc;
use mx_core::types::{Confidence, Learning, MaturityStage, NewLearning, Visibility};

use crate::{enum_from_sql, enum_to_sql, parse_ts, parse_ts_opt, Result, Store, StoreError};

const LEARNING_COLUMNS: &str = "id, category, title, description, what_happened, lesson,
    prevention, context, source_url, confidence, maturity_stage, times_validated,
    last_validated_at, agent_id, visibility, project_path, created_at, updated_at";

/// Optional filters for listing and keyword search.
#[derive(Debug, Clone, Default)]
pub struct LearningFilter {
    /// Restrict to rows visible to this agent (None = orchestrator, sees all).
    pub agent_id: Option<i64>,
    /// When set, only rows with matching (or absent) project_path.
    pub project_path: Option<String>,
    /// When set, only this category.
    pub category: Option<String>,
    /// Include shared/public rows from other agents (default true).
    pub include_shared: bool,
}

impl LearningFilter {
    pub fn for_agent(agent_id: Option<i64>) -> Self {
        Self {
            agent_id,
            project_path: None,
            category: None,
            include_shared: true,
        }
    }

    /// Append WHERE clauses for this filter; parameterized only.
    fn push_where(
        &self,
        sql: &mut String,
        params: &mut Vec<Box<dyn rusqlite::types::ToSql + Send>>,
    ) {
        if let Some(agent) = self.agent_id {
            if self.include_shared {
                sql.push_str(
                    " AND (agent_id = ? OR agent_id IS NULL
                       OR visibility IN ('shared','public'))",
                );
            } else {
                sql.push_str(" AND (agent_id = ? OR agent_id IS NULL)");
            }
            params.push(Box::new(agent));
        }
        if let Some(project) = &self.project_path {
            sql.push_str(" AND (project_path = ? OR project_path IS NULL)");
            params.push(Box::new(project.clone()));
        }
        if let Some(category) = &self.category {
            sql.push_str(" AND category = ?");
            params.push(Box::new(category.clone()));
        }
    }
}

impl Store {
    /// Record a new learning. Derived fields (confidence, maturity) are
    /// stamped from `times_validated = 0`; the assigned id is returned on
    /// the row.
    pub async fn save_learning(&self, new: NewLearning) -> Result<Learning> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let visibility = enum_to_sql(&new.visibility);
        let confidence = enum_to_sql(&Confidence::for_validations(0));
        let maturity = enum_to_sql(&MaturityStage::for_validations(0));
        let agent_id = new.agent_id;

        let id: i64 = self
            .conn()
            .call(move |conn| {
                let id = conn.query_row(
                    "INSERT INTO learnings (category, title, description, what_happened,
                        lesson, prevention, context, source_url, confidence, maturity_stage,
                        times_validated, last_validated_at, agent_id, visibility, project_path,
                        created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,0,NULL,?11,?12,?13,?14,?14)
                     RETURNING id",
                    rusqlite::params![
                        new.category,
                        new.title,
                        new.description,
                        new.what_happened,
                        new.lesson,
                        new.prevention,
                        new.context,
                        new.source_url,
                        confidence,
                        maturity,
                        new.agent_id,
                        visibility,
                        new.project_path,
                        now_str,
                    ],
                    |r| r.get(0),
                )?;
                Ok(id)
            })
            .await?;

        if let Some(agent) = agent_id {
            self.bump_agent_counter(agent, crate::agents::AgentCounter::Learnings)
                .await?;
        }

        self.get_learning(id)
            .await?
            .ok_or_else(|| StoreError::not_found("learning", id.to_string()))
    }

    pub async fn get_learning(&self, id: i64) -> Result<Option<Learning>> {
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {LEARNING_COLUMNS} FROM learnings WHERE id = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_learning(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    /// Record one validation: `times_validated += 1` (monotone), then restamp
    /// maturity and confidence from the step functions.
    pub async fn validate_learning(&self, id: i64) -> Result<Learning> {
        let now = Utc::now().to_rfc3339();
        let updated: Option<Learning> = self
            .conn()
            .call(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let times: Option<i64> = tx
                    .query_row(
                        "SELECT times_validated FROM learnings WHERE id = ?1",
                        rusqlite::params![id],
                        |r| r.get(0),
                    )
                    .ok();
                let times = match times {
                    Some(t) => t + 1,
                    None => return Ok(None),
                };
                let confidence = crate::enum_to_sql(&Confidence::for_validations(times));
                let maturity = crate::enum_to_sql(&MaturityStage::for_validations(times));
                tx.execute(
                    "UPDATE learnings
                     SET times_validated = ?1, confidence = ?2, maturity_stage = ?3,
                         last_validated_at = ?4, updated_at = ?4
                     WHERE id = ?5",
                    rusqlite::params![times, confidence, maturity, now, id],
                )?;
                let mut stmt = tx.prepare(&format!(
                    "SELECT {LEARNING_COLUMNS} FROM learnings WHERE id = ?1"
                ))?;
                let learning = stmt.query_row(rusqlite::params![id], row_to_learning)?;
                drop(stmt);
                tx.commit()?;
                Ok(Some(learning))
            })
            .await?;
        updated.ok_or_else(|| StoreError::not_found("learning", id.to_string()))
    }

    /// Full-text keyword search over (title, description, lesson).
    ///
    /// Terms are sanitized into prefix matches joined by OR. Results come
    /// back as `(id, sparse_score)` where the score is `1 - i / n` over the
    /// FTS result order (best first).
    pub async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        filter: &LearningFilter,
    ) -> Result<Vec<(i64, f64)>> {
        let Some(match_expr) = build_match_expression(query) else {
            return Ok(Vec::new());
        };
        let filter = filter.clone();
        self.conn()
            .call(move |conn| {
                let mut sql = String::from(
                    "SELECT l.id FROM learnings_fts
                     JOIN learnings l ON l.id = learnings_fts.rowid
                     WHERE learnings_fts MATCH ?",
                );
                let mut params: Vec<Box<dyn rusqlite::types::ToSql + Send>> = Vec::new();
                params.push(Box::new(match_expr));
                filter.push_where(&mut sql, &mut params);
                sql.push_str(" ORDER BY rank LIMIT ?");
                params.push(Box::new(limit as i64));

                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params_from_iter(
                    params.iter().map(|p| p.as_ref() as &dyn rusqlite::types::ToSql),
                ))?;
                let mut ids = Vec::new();
                while let Some(row) = rows.next()? {
                    ids.push(row.get::<_, i64>(0)?);
                }
                let n = ids.len() as f64;
                Ok(ids
                    .into_iter()
                    .enumerate()
                    .map(|(i, id)| (id, 1.0 - i as f64 / n))
                    .collect())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn list_learnings(
        &self,
        filter: &LearningFilter,
        limit: usize,
    ) -> Result<Vec<Learning>> {
        let filter = filter.clone();
        self.conn()
            .call(move |conn| {
                let mut sql = format!("SELECT {LEARNING_COLUMNS} FROM learnings WHERE 1=1");
                let mut params: Vec<Box<dyn rusqlite::types::ToSql + Send>> = Vec::new();
                filter.push_where(&mut sql, &mut params);
                sql.push_str(" ORDER BY updated_at DESC LIMIT ?");
                params.push(Box::new(limit as i64));

                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params_from_iter(
                    params.iter().map(|p| p.as_ref() as &dyn rusqlite::types::ToSql),
                ))?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_learning(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn delete_learning(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn()
            .call(move |conn| {
                Ok(conn.execute("DELETE FROM learnings WHERE id = ?1", rusqlite::params![id])?)
            })
            .await?;
        Ok(changed > 0)
    }

    /// Rows that should be (re)embedded: id plus the text the vector side
    /// indexes. Used by the indexer daemon and the reindex path.
    pub async fn learnings_for_indexing(&self) -> Result<Vec<(i64, String)>> {
        self.conn()
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title, description, COALESCE(lesson, '') FROM learnings",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let id: i64 = row.get(0)?;
                    let title: String = row.get(1)?;
                    let description: String = row.get(2)?;
                    let lesson: String = row.get(3)?;
                    out.push((id, format!("{title}\n{description}\n{lesson}")));
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }
}

/// Build an FTS5 MATCH expression of OR-joined prefix terms.
///
/// Returns `None` for queries with no indexable terms.
fn build_match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| {
            t.chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect::<String>()
        })
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\"*"))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(format!("({})", terms.join(" OR ")))
    }
}

fn row_to_learning(row: &rusqlite::Row<'_>) -> rusqlite::Result<Learning> {
    let confidence_str: String = row.get(9)?;
    let maturity_str: String = row.get(10)?;
    let last_validated: Option<String> = row.get(12)?;
    let visibility_str: String = row.get(14)?;
    let created_at: String = row.get(16)?;
    let updated_at: String = row.get(17)?;

    let visibility: Visibility = enum_from_sql(&visibility_str);
    Ok(Learning {
        id: row.get(0)?,
        category: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        what_happened: row.get(4)?,
        lesson: row.get(5)?,
        prevention: row.get(6)?,
        context: row.get(7)?,
        source_url: row.get(8)?,
        confidence: enum_from_sql(&confidence_str),
        maturity_stage: enum_from_sql(&maturity_str),
        times_validated: row.get(11)?,
        last_validated_at: parse_ts_opt(last_validated),
        agent_id: row.get(13)?,
        visibility,
        project_path: row.get(15)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_expression_builds_prefix_terms() {
        assert_eq!(
            build_match_expression("typography guidelines").unwrap(),
            "(\"typography\"* OR \"guidelines\"*)"
        );
    }

    #[test]
    fn match_expression_strips_operators() {
        // FTS operators and punctuation must not leak into the MATCH string.
        assert_eq!(
            build_match_expression("error: \"timeout\" (retry)").unwrap(),
            "(\"error\"* OR \"timeout\"* OR \"retry\"*)"
        );
    }

    #[test]
    fn match_expression_empty_for_punctuation_only() {
        assert!(build_match_expression("?! --").is_none());
        assert!(build_match_expression("   ").is_none());
    }
}
