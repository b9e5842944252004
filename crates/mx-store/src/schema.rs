//! Schema creation and migrations.
//!
//! Everything here is idempotent: tables and indexes use `IF NOT EXISTS`,
//! and column additions swallow the "duplicate column name" error so that
//! re-running bring-up against an already-migrated file is a no-op. The
//! whole batch runs inside one transaction.

use rusqlite::Connection;

const PRAGMAS: &str = "
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;
    PRAGMA temp_store=MEMORY;
    PRAGMA busy_timeout=5000;
    PRAGMA foreign_keys=ON;
";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS agents (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        name            TEXT NOT NULL UNIQUE,
        status          TEXT NOT NULL DEFAULT 'pending',
        sessions_count  INTEGER NOT NULL DEFAULT 0,
        learnings_count INTEGER NOT NULL DEFAULT 0,
        tasks_completed INTEGER NOT NULL DEFAULT 0,
        created_at      TEXT NOT NULL,
        last_active_at  TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sessions (
        id                  TEXT PRIMARY KEY,
        summary             TEXT NOT NULL,
        context             TEXT,
        tags                TEXT NOT NULL DEFAULT '[]',
        agent_id            INTEGER,
        visibility          TEXT NOT NULL DEFAULT 'private',
        project_path        TEXT,
        previous_session_id TEXT,
        created_at          TEXT NOT NULL,
        updated_at          TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_agent   ON sessions(agent_id);
    CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_path);
    CREATE INDEX IF NOT EXISTS idx_sessions_created ON sessions(created_at);

    CREATE TABLE IF NOT EXISTS learnings (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        category          TEXT NOT NULL,
        title             TEXT NOT NULL,
        description       TEXT NOT NULL,
        what_happened     TEXT,
        lesson            TEXT,
        prevention        TEXT,
        context           TEXT,
        source_url        TEXT,
        confidence        TEXT NOT NULL DEFAULT 'low',
        maturity_stage    TEXT NOT NULL DEFAULT 'observation',
        times_validated   INTEGER NOT NULL DEFAULT 0,
        last_validated_at TEXT,
        agent_id          INTEGER,
        visibility        TEXT NOT NULL DEFAULT 'private',
        project_path      TEXT,
        created_at        TEXT NOT NULL,
        updated_at        TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_learnings_category ON learnings(category);
    CREATE INDEX IF NOT EXISTS idx_learnings_agent    ON learnings(agent_id);
    CREATE INDEX IF NOT EXISTS idx_learnings_project  ON learnings(project_path);

    CREATE VIRTUAL TABLE IF NOT EXISTS learnings_fts USING fts5(
        title, description, lesson,
        content='learnings',
        content_rowid='id'
    );

    CREATE TRIGGER IF NOT EXISTS learnings_fts_ai AFTER INSERT ON learnings BEGIN
        INSERT INTO learnings_fts(rowid, title, description, lesson)
        VALUES (new.id, new.title, new.description, new.lesson);
    END;

    CREATE TRIGGER IF NOT EXISTS learnings_fts_ad AFTER DELETE ON learnings BEGIN
        INSERT INTO learnings_fts(learnings_fts, rowid, title, description, lesson)
        VALUES ('delete', old.id, old.title, old.description, old.lesson);
    END;

    CREATE TRIGGER IF NOT EXISTS learnings_fts_au AFTER UPDATE ON learnings BEGIN
        INSERT INTO learnings_fts(learnings_fts, rowid, title, description, lesson)
        VALUES ('delete', old.id, old.title, old.description, old.lesson);
        INSERT INTO learnings_fts(rowid, title, description, lesson)
        VALUES (new.id, new.title, new.description, new.lesson);
    END;

    CREATE TABLE IF NOT EXISTS unified_tasks (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        title               TEXT NOT NULL,
        description         TEXT,
        domain              TEXT NOT NULL,
        priority            TEXT NOT NULL DEFAULT 'normal',
        status              TEXT NOT NULL DEFAULT 'pending',
        github_issue_number INTEGER,
        github_issue_url    TEXT,
        github_repo         TEXT,
        github_sync_status  TEXT NOT NULL DEFAULT 'local_only',
        session_id          TEXT,
        agent_id            INTEGER,
        project_path        TEXT,
        created_at          TEXT NOT NULL,
        updated_at          TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_unified_domain ON unified_tasks(domain);
    CREATE INDEX IF NOT EXISTS idx_unified_status ON unified_tasks(status);

    CREATE TABLE IF NOT EXISTS missions (
        id                TEXT PRIMARY KEY,
        prompt            TEXT NOT NULL,
        context           TEXT,
        priority          TEXT NOT NULL DEFAULT 'normal',
        status            TEXT NOT NULL DEFAULT 'pending',
        retry_count       INTEGER NOT NULL DEFAULT 0,
        max_retries       INTEGER NOT NULL DEFAULT 5,
        timeout_ms        INTEGER NOT NULL DEFAULT 300000,
        assigned_to       INTEGER,
        execution_id      TEXT,
        parent_mission_id TEXT,
        unified_task_id   INTEGER,
        session_id        TEXT,
        next_retry_at     TEXT,
        started_at        TEXT,
        completed_at      TEXT,
        last_error        TEXT,
        created_at        TEXT NOT NULL,
        updated_at        TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_missions_status  ON missions(status);
    CREATE INDEX IF NOT EXISTS idx_missions_unified ON missions(unified_task_id);

    CREATE TABLE IF NOT EXISTS mission_deps (
        mission_id    TEXT NOT NULL,
        depends_on_id TEXT NOT NULL,
        PRIMARY KEY (mission_id, depends_on_id)
    );

    CREATE TABLE IF NOT EXISTS matrix_registry (
        id            TEXT PRIMARY KEY,
        display_name  TEXT NOT NULL,
        status        TEXT NOT NULL DEFAULT 'offline',
        last_seen     TEXT NOT NULL,
        metadata      TEXT,
        registered_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS matrix_messages (
        id              TEXT PRIMARY KEY,
        from_matrix     TEXT NOT NULL,
        to_matrix       TEXT,
        content         TEXT NOT NULL,
        message_type    TEXT NOT NULL,
        status          TEXT NOT NULL DEFAULT 'pending',
        retry_count     INTEGER NOT NULL DEFAULT 0,
        max_retries     INTEGER NOT NULL DEFAULT 5,
        next_retry_at   TEXT,
        sequence_number INTEGER NOT NULL,
        metadata        TEXT,
        created_at      TEXT NOT NULL,
        attempted_at    TEXT,
        sent_at         TEXT,
        delivered_at    TEXT,
        read_at         TEXT,
        last_error      TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_messages_status ON matrix_messages(status);
    CREATE INDEX IF NOT EXISTS idx_messages_order
        ON matrix_messages(from_matrix, sequence_number);

    CREATE TABLE IF NOT EXISTS matrix_sequences (
        matrix_id     TEXT PRIMARY KEY,
        next_sequence INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS search_log (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        query        TEXT NOT NULL,
        query_type   TEXT NOT NULL,
        result_count INTEGER NOT NULL,
        latency_ms   INTEGER NOT NULL,
        source       TEXT NOT NULL,
        agent_id     INTEGER,
        recorded_at  TEXT NOT NULL
    );
";

/// Columns added after the initial schema shipped. Each entry is applied
/// with the duplicate-column error swallowed.
const COLUMN_MIGRATIONS: &[&str] = &[
    "ALTER TABLE matrix_messages ADD COLUMN read_at TEXT",
    "ALTER TABLE learnings ADD COLUMN source_url TEXT",
    "ALTER TABLE missions ADD COLUMN parent_mission_id TEXT",
];

/// Apply pragmas, schema, and migrations. Idempotent.
pub fn apply(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(PRAGMAS)?;

    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(SCHEMA)?;
    for migration in COLUMN_MIGRATIONS {
        match tx.execute(migration, []) {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(_, Some(ref msg)))
                if msg.contains("duplicate column name") => {}
            Err(e) => return Err(e),
        }
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        apply(&conn).unwrap();
        apply(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='missions'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn fts_triggers_mirror_inserts() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();

        conn.execute(
            "INSERT INTO learnings (category, title, description, lesson, created_at, updated_at)
             VALUES ('frontend', 'typography guidelines', 'use a scale', 'stick to it',
                     '2026-01-01T00:00:00+00:00', '2026-01-01T00:00:00+00:00')",
            [],
        )
        .unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM learnings_fts WHERE learnings_fts MATCH 'typography'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);

        // Update re-mirrors.
        conn.execute("UPDATE learnings SET title = 'spacing guidelines' WHERE id = 1", [])
            .unwrap();
        let stale: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM learnings_fts WHERE learnings_fts MATCH 'typography'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(stale, 0);

        // Delete removes the mirror row.
        conn.execute("DELETE FROM learnings WHERE id = 1", []).unwrap();
        let left: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM learnings_fts WHERE learnings_fts MATCH 'spacing'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(left, 0);
    }
}
