//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.
//! Migrations after the first are additive only: new columns are nullable so
//! rows written by older versions stay readable.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: cycles and their child tables
    r#"
    CREATE TABLE IF NOT EXISTS cycles (
        cycle_id          INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id        TEXT NOT NULL,
        generation_marker TEXT NOT NULL,
        user_intent       TEXT NOT NULL,
        phase_number      INTEGER,
        task_number       INTEGER,
        start_time        DATETIME NOT NULL,
        end_time          DATETIME,
        primary_activity  TEXT NOT NULL,

        UNIQUE(session_id, generation_marker)
    );

    CREATE TABLE IF NOT EXISTS file_contexts (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        cycle_id        INTEGER NOT NULL REFERENCES cycles(cycle_id) ON DELETE CASCADE,
        file_path       TEXT NOT NULL,
        agent_type      TEXT NOT NULL,
        agent_id        TEXT NOT NULL,
        operation_type  TEXT NOT NULL,
        change_reason   TEXT NOT NULL,
        edit_count      INTEGER NOT NULL DEFAULT 0,
        timestamp       DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS summaries (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        cycle_id         INTEGER NOT NULL REFERENCES cycles(cycle_id) ON DELETE CASCADE,
        intent_sequence  INTEGER NOT NULL,
        summary_text     TEXT NOT NULL,
        summary_type     TEXT NOT NULL,
        confidence_level TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS subagent_tasks (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        cycle_id         INTEGER NOT NULL REFERENCES cycles(cycle_id) ON DELETE CASCADE,
        task_description TEXT NOT NULL,
        agent_id         TEXT,
        files_modified   JSON NOT NULL DEFAULT '[]',
        status           TEXT NOT NULL,
        completion_time  DATETIME
    );

    CREATE INDEX IF NOT EXISTS idx_cycles_session ON cycles(session_id, end_time);
    CREATE INDEX IF NOT EXISTS idx_file_contexts_path ON file_contexts(file_path, timestamp);
    CREATE INDEX IF NOT EXISTS idx_file_contexts_timestamp ON file_contexts(timestamp);
    CREATE INDEX IF NOT EXISTS idx_file_contexts_cycle ON file_contexts(cycle_id);
    CREATE INDEX IF NOT EXISTS idx_summaries_cycle ON summaries(cycle_id);
    CREATE INDEX IF NOT EXISTS idx_subagent_tasks_cycle ON subagent_tasks(cycle_id);
    "#,
    // Version 2: intent provenance on cycles
    r#"
    ALTER TABLE cycles ADD COLUMN intent_confidence TEXT;
    ALTER TABLE cycles ADD COLUMN transcript_path TEXT;
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::debug!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
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
