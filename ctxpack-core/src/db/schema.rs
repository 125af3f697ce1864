//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: sessions, learned relevance, file relationships
    r#"
    -- One row per ranking decision. Core fields are immutable after insert;
    -- outcome columns are written once by the feedback loop.
    CREATE TABLE IF NOT EXISTS context_sessions (
        id                   INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id      TEXT,
        task_type            TEXT NOT NULL,
        task_mode            TEXT NOT NULL,
        task_description     TEXT NOT NULL,
        included_files       JSON NOT NULL,
        confidence_scores    JSON NOT NULL,
        outcome_success      INTEGER,
        files_actually_used  JSON,
        total_tokens         INTEGER NOT NULL,
        timestamp            DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS file_relevance (
        file_path        TEXT NOT NULL,
        task_type        TEXT NOT NULL,
        task_mode        TEXT NOT NULL,
        relevance_score  REAL NOT NULL DEFAULT 0.5,
        confidence       REAL NOT NULL DEFAULT 0.5,
        success_count    INTEGER NOT NULL DEFAULT 0,
        total_count      INTEGER NOT NULL DEFAULT 0,
        last_updated     DATETIME NOT NULL,

        PRIMARY KEY (file_path, task_type, task_mode)
    );

    -- Unordered pair stored as file_a < file_b
    CREATE TABLE IF NOT EXISTS file_relationships (
        file_a               TEXT NOT NULL,
        file_b               TEXT NOT NULL,
        co_occurrence_count  INTEGER NOT NULL DEFAULT 0,
        git_co_change_count  INTEGER NOT NULL DEFAULT 0,
        strength             REAL NOT NULL DEFAULT 0,

        PRIMARY KEY (file_a, file_b),
        CHECK (file_a < file_b)
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_conversation ON context_sessions(conversation_id);
    CREATE INDEX IF NOT EXISTS idx_relationships_b ON file_relationships(file_b);
    "#,
    // Version 2: outcome lookups for stats
    r#"
    CREATE INDEX IF NOT EXISTS idx_sessions_outcome ON context_sessions(outcome_success)
        WHERE outcome_success IS NOT NULL;
    CREATE INDEX IF NOT EXISTS idx_relevance_task ON file_relevance(task_type, task_mode);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
