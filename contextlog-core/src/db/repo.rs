//! Database repository layer
//!
//! The aggregator is the only writer: one transaction per cycle. Everything
//! else here is read-side query surface over committed cycles.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// How long a writer waits on a locked database before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of committing a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// A new cycle row was written
    Inserted(i64),
    /// The same (session, generation marker) was already committed
    AlreadyCommitted(i64),
}

impl CommitOutcome {
    pub fn cycle_id(&self) -> i64 {
        match self {
            CommitOutcome::Inserted(id) | CommitOutcome::AlreadyCommitted(id) => *id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, CommitOutcome::Inserted(_))
    }
}

/// Database handle (single connection)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // Foreign keys for referential integrity, WAL so readers never block the writer
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ============================================
    // Cycle commit
    // ============================================

    /// Commit a cycle and all of its child rows in one transaction.
    ///
    /// The `cycle_id` fields of the record are ignored; the store assigns the
    /// id and writes it into every child row. Committing the same
    /// `(session_id, generation_marker)` twice returns the existing id and
    /// writes nothing.
    pub fn commit_cycle(&self, record: &CycleRecord) -> Result<CommitOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let cycle = &record.cycle;
        if let Some(existing) = Self::find_cycle_id(&tx, &cycle.session_id, &cycle.generation_marker)? {
            return Ok(CommitOutcome::AlreadyCommitted(existing));
        }

        let inserted = tx.execute(
            r#"
            INSERT INTO cycles (session_id, generation_marker, user_intent, intent_confidence,
                                phase_number, task_number, start_time, end_time,
                                primary_activity, transcript_path)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                cycle.session_id,
                cycle.generation_marker,
                cycle.user_intent,
                cycle.intent_confidence.map(|c| c.as_str()),
                cycle.phase_number,
                cycle.task_number,
                fmt_ts(cycle.start_time),
                cycle.end_time.map(fmt_ts),
                cycle.primary_activity.as_str(),
                cycle.transcript_path,
            ],
        );

        match inserted {
            Ok(_) => {}
            // Lost a race with another process committing the same request
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                drop(tx);
                let existing = conn
                    .query_row(
                        "SELECT cycle_id FROM cycles WHERE session_id = ? AND generation_marker = ?",
                        [&cycle.session_id, &cycle.generation_marker],
                        |row| row.get(0),
                    )
                    .optional()?;
                return match existing {
                    Some(id) => Ok(CommitOutcome::AlreadyCommitted(id)),
                    None => Err(Error::Database(rusqlite::Error::SqliteFailure(e, None))),
                };
            }
            Err(e) => return Err(e.into()),
        }

        let cycle_id = tx.last_insert_rowid();
        Self::insert_children(&tx, cycle_id, record)?;
        tx.commit()?;

        tracing::info!(
            cycle_id,
            session_id = %cycle.session_id,
            file_contexts = record.file_contexts.len(),
            summaries = record.summaries.len(),
            subagent_tasks = record.subagent_tasks.len(),
            "Committed cycle"
        );
        Ok(CommitOutcome::Inserted(cycle_id))
    }

    fn find_cycle_id(tx: &Transaction, session_id: &str, marker: &str) -> Result<Option<i64>> {
        tx.query_row(
            "SELECT cycle_id FROM cycles WHERE session_id = ? AND generation_marker = ?",
            [session_id, marker],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    fn insert_children(tx: &Transaction, cycle_id: i64, record: &CycleRecord) -> Result<()> {
        for fc in &record.file_contexts {
            tx.execute(
                r#"
                INSERT INTO file_contexts (cycle_id, file_path, agent_type, agent_id,
                                           operation_type, change_reason, edit_count, timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    cycle_id,
                    fc.file_path,
                    fc.agent_type.as_str(),
                    fc.agent_id,
                    fc.operation_type.as_str(),
                    fc.change_reason,
                    fc.edit_count,
                    fmt_ts(fc.timestamp),
                ],
            )?;
        }

        for summary in &record.summaries {
            tx.execute(
                r#"
                INSERT INTO summaries (cycle_id, intent_sequence, summary_text, summary_type, confidence_level)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    cycle_id,
                    summary.intent_sequence,
                    summary.summary_text,
                    summary.summary_type.as_str(),
                    summary.confidence_level.as_str(),
                ],
            )?;
        }

        for task in &record.subagent_tasks {
            tx.execute(
                r#"
                INSERT INTO subagent_tasks (cycle_id, task_description, agent_id, files_modified,
                                            status, completion_time)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    cycle_id,
                    task.task_description,
                    task.agent_id,
                    serde_json::to_string(&task.files_modified)?,
                    task.status.as_str(),
                    task.completion_time.map(fmt_ts),
                ],
            )?;
        }

        Ok(())
    }

    // ============================================
    // Cycle queries
    // ============================================

    /// Get a cycle by ID
    pub fn get_cycle(&self, cycle_id: i64) -> Result<Option<Cycle>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM cycles WHERE cycle_id = ?",
            [cycle_id],
            Self::row_to_cycle,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Load a cycle together with all of its child rows
    pub fn get_cycle_record(&self, cycle_id: i64) -> Result<CycleRecord> {
        let cycle = self
            .get_cycle(cycle_id)?
            .ok_or(Error::CycleNotFound(cycle_id))?;
        Ok(CycleRecord {
            cycle,
            file_contexts: self.cycle_file_contexts(cycle_id)?,
            summaries: self.cycle_summaries(cycle_id)?,
            subagent_tasks: self.cycle_subagent_tasks(cycle_id)?,
        })
    }

    /// Find the cycle committed for a user request
    pub fn find_cycle(&self, session_id: &str, generation_marker: &str) -> Result<Option<Cycle>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM cycles WHERE session_id = ? AND generation_marker = ?",
            [session_id, generation_marker],
            Self::row_to_cycle,
        )
        .optional()
        .map_err(Error::from)
    }

    /// The N most recently committed cycles, newest first
    pub fn recent_cycles(&self, n: usize) -> Result<Vec<Cycle>> {
        self.list_cycles(&CycleFilter {
            limit: Some(n),
            ..Default::default()
        })
    }

    /// Cycles whose intent or primary activity contains `text` (case-insensitive)
    pub fn search_cycles(&self, text: &str) -> Result<Vec<Cycle>> {
        self.list_cycles(&CycleFilter {
            text: Some(text.to_string()),
            ..Default::default()
        })
    }

    /// List cycles with optional filtering, newest first
    pub fn list_cycles(&self, filter: &CycleFilter) -> Result<Vec<Cycle>> {
        let conn = self.conn.lock().unwrap();

        let mut sql = String::from("SELECT * FROM cycles WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];

        if let Some(session_id) = &filter.session_id {
            sql.push_str(" AND session_id = ?");
            params.push(Box::new(session_id.clone()));
        }

        if let Some(activity) = &filter.activity {
            sql.push_str(" AND primary_activity = ?");
            params.push(Box::new(activity.as_str().to_string()));
        }

        if let Some(text) = &filter.text {
            let pattern = format!("%{}%", escape_like(text));
            sql.push_str(r" AND (user_intent LIKE ? ESCAPE '\' OR primary_activity LIKE ? ESCAPE '\')");
            params.push(Box::new(pattern.clone()));
            params.push(Box::new(pattern));
        }

        if let Some(since) = &filter.since {
            sql.push_str(" AND start_time >= ?");
            params.push(Box::new(fmt_ts(*since)));
        }

        if let Some(file_path) = &filter.file_path {
            sql.push_str(" AND cycle_id IN (SELECT cycle_id FROM file_contexts WHERE file_path = ?)");
            params.push(Box::new(file_path.clone()));
        }

        sql.push_str(" ORDER BY cycle_id DESC");

        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql)?;
        let cycles = stmt
            .query_map(params_refs.as_slice(), Self::row_to_cycle)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(cycles)
    }

    /// Ids of every committed cycle, newest first
    pub fn committed_cycle_ids(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT cycle_id FROM cycles ORDER BY cycle_id DESC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// End time of the latest committed cycle in a session
    pub fn last_cycle_end(&self, session_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let result: Option<String> = conn
            .query_row(
                "SELECT MAX(end_time) FROM cycles WHERE session_id = ?",
                [session_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::from)?
            .flatten();

        Ok(result.and_then(|s| parse_ts(&s)))
    }

    /// Total committed cycles
    pub fn count_cycles(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM cycles", [], |row| row.get(0))?;
        Ok(count)
    }

    fn row_to_cycle(row: &Row) -> rusqlite::Result<Cycle> {
        let start_time_str: String = row.get("start_time")?;
        let end_time_str: Option<String> = row.get("end_time")?;
        let activity_str: String = row.get("primary_activity")?;
        let confidence_str: Option<String> = row.get("intent_confidence")?;

        Ok(Cycle {
            cycle_id: row.get("cycle_id")?,
            session_id: row.get("session_id")?,
            generation_marker: row.get("generation_marker")?,
            user_intent: row.get("user_intent")?,
            intent_confidence: confidence_str.and_then(|s| s.parse().ok()),
            phase_number: row.get("phase_number")?,
            task_number: row.get("task_number")?,
            start_time: parse_ts(&start_time_str).unwrap_or_else(Utc::now),
            end_time: end_time_str.and_then(|s| parse_ts(&s)),
            primary_activity: activity_str.parse().unwrap_or(Activity::Research),
            transcript_path: row.get("transcript_path")?,
        })
    }

    // ============================================
    // Child row queries
    // ============================================

    /// Every recorded operation on a file, oldest first
    pub fn file_history(&self, file_path: &str) -> Result<Vec<FileContext>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM file_contexts WHERE file_path = ? ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt
            .query_map([file_path], Self::row_to_file_context)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// File operations of one cycle in the order they happened
    pub fn cycle_file_contexts(&self, cycle_id: i64) -> Result<Vec<FileContext>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM file_contexts WHERE cycle_id = ? ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt
            .query_map([cycle_id], Self::row_to_file_context)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn cycle_summaries(&self, cycle_id: i64) -> Result<Vec<Summary>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM summaries WHERE cycle_id = ? ORDER BY id ASC")?;
        let rows = stmt
            .query_map([cycle_id], Self::row_to_summary)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn cycle_subagent_tasks(&self, cycle_id: i64) -> Result<Vec<SubagentTask>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM subagent_tasks WHERE cycle_id = ? ORDER BY id ASC")?;
        let rows = stmt
            .query_map([cycle_id], Self::row_to_subagent_task)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_file_context(row: &Row) -> rusqlite::Result<FileContext> {
        let agent_type_str: String = row.get("agent_type")?;
        let operation_str: String = row.get("operation_type")?;
        let timestamp_str: String = row.get("timestamp")?;

        Ok(FileContext {
            id: row.get("id")?,
            cycle_id: row.get("cycle_id")?,
            file_path: row.get("file_path")?,
            agent_type: agent_type_str.parse().unwrap_or(AgentType::Main),
            agent_id: row.get("agent_id")?,
            operation_type: operation_str.parse().unwrap_or(OperationType::Edit),
            change_reason: row.get("change_reason")?,
            edit_count: row.get("edit_count")?,
            timestamp: parse_ts(&timestamp_str).unwrap_or_else(Utc::now),
        })
    }

    fn row_to_summary(row: &Row) -> rusqlite::Result<Summary> {
        let type_str: String = row.get("summary_type")?;
        let confidence_str: String = row.get("confidence_level")?;

        Ok(Summary {
            id: row.get("id")?,
            cycle_id: row.get("cycle_id")?,
            intent_sequence: row.get("intent_sequence")?,
            summary_text: row.get("summary_text")?,
            summary_type: type_str.parse().unwrap_or(SummaryType::ExecutionSummary),
            confidence_level: confidence_str.parse().unwrap_or(Confidence::Low),
        })
    }

    fn row_to_subagent_task(row: &Row) -> rusqlite::Result<SubagentTask> {
        let files_str: String = row.get("files_modified")?;
        let status_str: String = row.get("status")?;
        let completion_str: Option<String> = row.get("completion_time")?;

        Ok(SubagentTask {
            id: row.get("id")?,
            cycle_id: row.get("cycle_id")?,
            task_description: row.get("task_description")?,
            agent_id: row.get("agent_id")?,
            files_modified: serde_json::from_str(&files_str).unwrap_or_default(),
            status: status_str.parse().unwrap_or(TaskStatus::InProgress),
            completion_time: completion_str.and_then(|s| parse_ts(&s)),
        })
    }
}

/// Filter for listing cycles
#[derive(Debug, Default)]
pub struct CycleFilter {
    /// Restrict to one session
    pub session_id: Option<String>,
    /// Restrict to one primary activity
    pub activity: Option<Activity>,
    /// Substring of the intent or activity name
    pub text: Option<String>,
    /// Cycles started at or after this time
    pub since: Option<DateTime<Utc>>,
    /// Cycles that touched this file
    pub file_path: Option<String>,
    /// Maximum number of cycles to return
    pub limit: Option<usize>,
}

/// Fixed-width UTC timestamps so that text order is time order
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 10, minute, 0).unwrap()
    }

    fn create_test_record(session: &str, marker: &str, intent: &str) -> CycleRecord {
        CycleRecord {
            cycle: Cycle {
                cycle_id: 0,
                session_id: session.to_string(),
                generation_marker: marker.to_string(),
                user_intent: intent.to_string(),
                intent_confidence: Some(Confidence::Medium),
                phase_number: None,
                task_number: None,
                start_time: at(0),
                end_time: Some(at(5)),
                primary_activity: Activity::FileModification,
                transcript_path: None,
            },
            file_contexts: vec![FileContext {
                id: 0,
                cycle_id: 0,
                file_path: "/src/auth.rs".to_string(),
                agent_type: AgentType::Main,
                agent_id: "main".to_string(),
                operation_type: OperationType::Edit,
                change_reason: "modified via Edit".to_string(),
                edit_count: 1,
                timestamp: at(1),
            }],
            summaries: vec![Summary {
                id: 0,
                cycle_id: 0,
                intent_sequence: 1,
                summary_text: intent.to_string(),
                summary_type: SummaryType::UserIntent,
                confidence_level: Confidence::Medium,
            }],
            subagent_tasks: vec![SubagentTask {
                id: 0,
                cycle_id: 0,
                task_description: "Audit auth".to_string(),
                agent_id: Some("subagent-1".to_string()),
                files_modified: vec!["/src/auth.rs".to_string()],
                status: TaskStatus::Completed,
                completion_time: Some(at(4)),
            }],
        }
    }

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    #[test]
    fn test_commit_assigns_cycle_id_to_children() {
        let db = test_db();
        let outcome = db
            .commit_cycle(&create_test_record("s1", "u1", "fix the login timeout bug"))
            .unwrap();
        assert!(outcome.is_new());

        let record = db.get_cycle_record(outcome.cycle_id()).unwrap();
        assert_eq!(record.cycle.user_intent, "fix the login timeout bug");
        assert_eq!(record.cycle.intent_confidence, Some(Confidence::Medium));
        assert!(record.file_contexts.iter().all(|fc| fc.cycle_id == outcome.cycle_id()));
        assert_eq!(record.summaries[0].cycle_id, outcome.cycle_id());
        assert_eq!(record.subagent_tasks[0].files_modified, vec!["/src/auth.rs"]);
        assert_eq!(record.subagent_tasks[0].status, TaskStatus::Completed);
    }

    #[test]
    fn test_commit_is_idempotent() {
        let db = test_db();
        let record = create_test_record("s1", "u1", "intent");

        let first = db.commit_cycle(&record).unwrap();
        let second = db.commit_cycle(&record).unwrap();

        assert_eq!(second, CommitOutcome::AlreadyCommitted(first.cycle_id()));
        assert_eq!(db.count_cycles().unwrap(), 1);
        assert_eq!(db.file_history("/src/auth.rs").unwrap().len(), 1);
    }

    #[test]
    fn test_recent_and_search() {
        let db = test_db();
        db.commit_cycle(&create_test_record("s1", "u1", "add retry to uploader")).unwrap();
        db.commit_cycle(&create_test_record("s1", "u2", "Fix the 50% progress bar")).unwrap();
        db.commit_cycle(&create_test_record("s1", "u3", "document the cli")).unwrap();

        let recent = db.recent_cycles(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].user_intent, "document the cli");

        let hits = db.search_cycles("PROGRESS").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(db.search_cycles("50%").unwrap().len(), 1);
        assert_eq!(db.search_cycles("file_mod").unwrap().len(), 3);
    }

    #[test]
    fn test_list_cycles_filter() {
        let db = test_db();
        db.commit_cycle(&create_test_record("s1", "u1", "one")).unwrap();
        db.commit_cycle(&create_test_record("s2", "u1", "two")).unwrap();

        let filtered = db
            .list_cycles(&CycleFilter {
                session_id: Some("s2".to_string()),
                file_path: Some("/src/auth.rs".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].user_intent, "two");
        assert_eq!(db.committed_cycle_ids().unwrap().len(), 2);
    }

    #[test]
    fn test_last_cycle_end() {
        let db = test_db();
        assert!(db.last_cycle_end("s1").unwrap().is_none());
        db.commit_cycle(&create_test_record("s1", "u1", "one")).unwrap();
        assert_eq!(db.last_cycle_end("s1").unwrap(), Some(at(5)));
    }

    #[test]
    fn test_missing_cycle_record() {
        let db = test_db();
        assert!(matches!(db.get_cycle_record(42), Err(Error::CycleNotFound(42))));
    }
}
