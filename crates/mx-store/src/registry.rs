//! The matrix registry: one row per workspace identity known to the hub.

use chrono::{DateTime, Utc};
use mx_core::types::{MatrixEntry, MatrixStatus};

use crate::{enum_from_sql, enum_to_sql, json_column, parse_ts, Result, Store, StoreError};

impl Store {
    /// Insert or refresh a registry row. `registered_at` is kept from the
    /// first registration; `last_seen` only moves forward.
    pub async fn upsert_matrix(
        &self,
        id: &str,
        display_name: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<MatrixEntry> {
        let id = id.to_string();
        let display_name = display_name.to_string();
        let metadata_str = metadata.as_ref().map(|v| v.to_string());
        let now = Utc::now().to_rfc3339();
        let row_id = id.clone();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO matrix_registry (id, display_name, status, last_seen,
                        metadata, registered_at)
                     VALUES (?1, ?2, 'online', ?3, ?4, ?3)
                     ON CONFLICT(id) DO UPDATE SET
                        display_name = excluded.display_name,
                        status = 'online',
                        last_seen = MAX(last_seen, excluded.last_seen),
                        metadata = COALESCE(excluded.metadata, metadata)",
                    rusqlite::params![id, display_name, now, metadata_str],
                )?;
                Ok(())
            })
            .await?;
        self.get_matrix(&row_id)
            .await?
            .ok_or_else(|| StoreError::not_found("matrix", row_id))
    }

    pub async fn get_matrix(&self, id: &str) -> Result<Option<MatrixEntry>> {
        let id = id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, display_name, status, last_seen, metadata, registered_at
                     FROM matrix_registry WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_entry(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    /// Advance `last_seen` (monotone: an older timestamp never wins).
    pub async fn touch_matrix(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "UPDATE matrix_registry SET last_seen = MAX(last_seen, ?1) WHERE id = ?2",
                    rusqlite::params![now, id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn set_matrix_status(&self, id: &str, status: MatrixStatus) -> Result<()> {
        let id = id.to_string();
        let status = enum_to_sql(&status);
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "UPDATE matrix_registry
                     SET status = ?1, last_seen = MAX(last_seen, ?2)
                     WHERE id = ?3",
                    rusqlite::params![status, now, id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn list_matrices(&self) -> Result<Vec<MatrixEntry>> {
        self.conn()
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, display_name, status, last_seen, metadata, registered_at
                     FROM matrix_registry ORDER BY id",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_entry(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Mark rows offline whose `last_seen` is older than the cutoff.
    /// Returns the ids that flipped.
    pub async fn sweep_stale_matrices(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let cutoff = cutoff.to_rfc3339();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id FROM matrix_registry
                     WHERE status != 'offline' AND last_seen < ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![cutoff])?;
                let mut stale = Vec::new();
                while let Some(row) = rows.next()? {
                    stale.push(row.get::<_, String>(0)?);
                }
                drop(rows);
                drop(stmt);
                for id in &stale {
                    conn.execute(
                        "UPDATE matrix_registry SET status = 'offline' WHERE id = ?1",
                        rusqlite::params![id],
                    )?;
                }
                Ok(stale)
            })
            .await
            .map_err(StoreError::from)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<MatrixEntry> {
    let status_str: String = row.get(2)?;
    let last_seen: String = row.get(3)?;
    let metadata_str: Option<String> = row.get(4)?;
    let registered_at: String = row.get(5)?;
    let status: MatrixStatus = enum_from_sql(&status_str);
    let metadata: Option<serde_json::Value> = match metadata_str {
        Some(s) => Some(json_column(4, &s)?),
        None => None,
    };
    Ok(MatrixEntry {
        id: row.get(0)?,
        display_name: row.get(1)?,
        status,
        last_seen: parse_ts(&last_seen),
        metadata,
        registered_at: parse_ts(&registered_at),
    })
}
