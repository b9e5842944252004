//! Durable embedded store shared by the fabric processes of one workspace.
//!
//! A single SQLite file holds agents, sessions, learnings, unified tasks,
//! missions, the matrix registry, the matrix message queues, the sequence
//! counters, and the search telemetry log. All co-located processes (hub,
//! daemon, orchestrator) open the same file; WAL mode plus a 5 s busy
//! timeout turn lock contention into waits instead of errors, and schema
//! bring-up is serialized by a file-based init lock.
//!
//! The correctness-critical operations — the fenced mission claim, the
//! atomic dequeue, and the sequence counter — are each a single guarded
//! statement (or one `BEGIN IMMEDIATE` transaction); see `missions.rs` and
//! `messages.rs`.

use std::path::Path;

use mx_core::lockfile::{InitLock, InitLockError};
use tokio_rusqlite::Connection;

mod agents;
mod learnings;
mod messages;
mod missions;
mod registry;
mod schema;
mod search_log;
mod sessions;
mod unified;

pub use learnings::LearningFilter;
pub use messages::EnqueueRequest;
pub use missions::{ClaimFailure, ClaimOutcome, DequeueError};
pub use unified::NewUnifiedTask;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("init lock: {0}")]
    InitLock(#[from] InitLockError),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// helpers — enum <-> SQLite string
// ---------------------------------------------------------------------------

pub(crate) fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

pub(crate) fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

/// Decode a JSON-typed column, mapping decode failures to a column
/// conversion error instead of panicking on read.
pub(crate) fn json_column<T: serde::de::DeserializeOwned>(
    idx: usize,
    raw: &str,
) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_ts(raw: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .expect("valid rfc3339 timestamp")
        .with_timezone(&chrono::Utc)
}

pub(crate) fn parse_ts_opt(raw: Option<String>) -> Option<chrono::DateTime<chrono::Utc>> {
    raw.map(|s| parse_ts(&s))
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Async handle on the workspace store.
///
/// Cheap to clone; all calls are serialized onto the connection's worker
/// thread by `tokio_rusqlite`.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the store at the given file path.
    ///
    /// Schema creation runs under the init lock so that concurrent
    /// processes bringing up the same file do not race migrations; a lock
    /// file older than 30 s is treated as abandoned and reclaimed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let init_lock = match InitLock::acquire(path) {
            Ok(lock) => Some(lock),
            Err(InitLockError::Held(holder)) => {
                // Another process is initializing; by the time our busy
                // timeout expires the schema will exist. Migrations are
                // idempotent, so running them again is harmless.
                tracing::debug!(holder = %holder, "init lock held, proceeding without it");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let conn = Connection::open(path).await?;
        let store = Self { conn };
        store.init_schema().await?;
        drop(init_lock);
        Ok(store)
    }

    /// Purely in-memory store (tests).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                schema::apply(conn)?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
