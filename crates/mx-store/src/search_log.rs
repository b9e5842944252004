//! Search telemetry log (the data source for the weight-tuning loop).

use mx_core::types::SearchRecord;

use crate::{parse_ts, Result, Store, StoreError};

impl Store {
    pub async fn record_search(&self, record: &SearchRecord) -> Result<()> {
        let r = record.clone();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO search_log (query, query_type, result_count, latency_ms,
                        source, agent_id, recorded_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    rusqlite::params![
                        r.query,
                        r.query_type,
                        r.result_count,
                        r.latency_ms,
                        r.source,
                        r.agent_id,
                        r.recorded_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn recent_searches(&self, limit: usize) -> Result<Vec<SearchRecord>> {
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT query, query_type, result_count, latency_ms, source, agent_id,
                            recorded_at
                     FROM search_log ORDER BY id DESC LIMIT ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![limit as i64])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let recorded_at: String = row.get(6)?;
                    out.push(SearchRecord {
                        query: row.get(0)?,
                        query_type: row.get(1)?,
                        result_count: row.get(2)?,
                        latency_ms: row.get(3)?,
                        source: row.get(4)?,
                        agent_id: row.get(5)?,
                        recorded_at: parse_ts(&recorded_at),
                    });
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Keep the log bounded; drops rows beyond the newest `keep`.
    pub async fn trim_search_log(&self, keep: usize) -> Result<usize> {
        let changed = self
            .conn()
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM search_log WHERE id NOT IN (
                        SELECT id FROM search_log ORDER BY id DESC LIMIT ?1
                     )",
                    rusqlite::params![keep as i64],
                )?)
            })
            .await?;
        Ok(changed)
    }
}
