//! Cycle aggregation
//!
//! At the end of a user request the aggregator:
//!
//! 1. **Seals** the session's `active/` logs by renaming them to
//!    `pending/<marker>/` and writing a manifest with the extracted intent.
//! 2. **Commits** every pending directory, oldest first, as one transaction
//!    per cycle. Directories that fail to commit stay pending and are
//!    retried on the next run of any session, so a session that never
//!    stops again still gets its backlog committed.
//! 3. **Moves** each committed directory to `committed/<cycle_id>/`, where
//!    the retention manager finds it.
//!
//! The generation marker identifies the user request: the uuid of the most
//! recent human prompt, or a content hash of the sealed logs when the
//! transcript has none. Committing the same marker twice is a no-op.

pub mod summary;

use crate::config::{write_atomic, ResolvedSettings};
use crate::db::{CommitOutcome, Database};
use crate::error::Result;
use crate::recorder::{subdirs, AgentToolLog, EphemeralLayout, LoadedLog, ToolRecord};
use crate::transcript::{Intent, IntentAnalysis, IntentExtractor, Prompt, TranscriptReader};
use crate::types::{
    Activity, AgentType, Confidence, Cycle, CycleRecord, FileContext, SubagentTask, SummaryType,
    TaskStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Manifest written next to the sealed logs
pub const MANIFEST_FILE: &str = "manifest.json";

/// Intent snapshot taken before history compaction
pub const INTENT_SNAPSHOT_FILE: &str = "intent.json";

/// Everything about a sealed cycle that does not come from the tool logs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleManifest {
    pub session_id: String,
    pub generation_marker: String,
    pub intent: Intent,
    /// Human prompts issued during the cycle, oldest first
    #[serde(default)]
    pub prompts: Vec<Prompt>,
    #[serde(default)]
    pub transcript_path: Option<String>,
    pub sealed_at: DateTime<Utc>,
}

/// A tool log record tagged with the agent that wrote it
#[derive(Debug, Clone)]
pub struct CycleEvent {
    pub agent_id: String,
    pub record: ToolRecord,
}

/// A cycle that reached the store during this run
#[derive(Debug, Clone)]
pub struct CommittedCycle {
    pub session_id: String,
    pub outcome: CommitOutcome,
    pub user_intent: String,
    pub primary_activity: Activity,
    pub file_count: usize,
    pub execution_summary: Option<String>,
}

/// What one aggregation run did
#[derive(Debug, Default)]
pub struct AggregationOutcome {
    /// Marker of the cycle sealed by this run, if any
    pub sealed: Option<String>,
    /// Pending cycles committed (or found already committed), oldest first
    pub committed: Vec<CommittedCycle>,
    /// Pending directories left in place for the next run
    pub deferred: usize,
    /// Recoverable problems: skipped lines, unreadable manifests
    pub warnings: Vec<String>,
}

impl AggregationOutcome {
    /// The newly inserted cycle of a session in this run, for feedback
    pub fn latest_new(&self, session_id: &str) -> Option<&CommittedCycle> {
        self.committed
            .iter()
            .rev()
            .find(|c| c.outcome.is_new() && c.session_id == session_id)
    }
}

/// Merges ephemeral logs and transcript intent into committed cycles
pub struct CycleAggregator<'a> {
    db: &'a Database,
    layout: &'a EphemeralLayout,
    settings: &'a ResolvedSettings,
}

impl<'a> CycleAggregator<'a> {
    pub fn new(db: &'a Database, layout: &'a EphemeralLayout, settings: &'a ResolvedSettings) -> Self {
        Self {
            db,
            layout,
            settings,
        }
    }

    /// Seal the active cycle of a session, then commit the pending backlog
    /// of every session, the invoking one last.
    pub fn run(
        &self,
        session_id: &str,
        transcript_path: Option<&Path>,
        now: DateTime<Utc>,
    ) -> Result<AggregationOutcome> {
        let mut outcome = AggregationOutcome::default();
        outcome.sealed = self.seal(session_id, transcript_path, now, &mut outcome.warnings)?;

        let own_dir = self.layout.session_dir(session_id);
        for session_dir in self.layout.sessions() {
            if session_dir == own_dir {
                continue;
            }
            let Some(other) = session_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Err(e) = self.commit_pending(other, &mut outcome) {
                tracing::warn!(session_id = other, error = %e, "Backlog of another session left pending");
                outcome
                    .warnings
                    .push(format!("backlog of session {} left pending: {}", other, e));
            }
        }

        self.commit_pending(session_id, &mut outcome)?;
        Ok(outcome)
    }

    /// Move the active logs into a pending directory with a manifest.
    ///
    /// Returns the generation marker, or `None` when there was nothing new
    /// to seal (no logs and no uncommitted prompt).
    pub fn seal(
        &self,
        session_id: &str,
        transcript_path: Option<&Path>,
        now: DateTime<Utc>,
        warnings: &mut Vec<String>,
    ) -> Result<Option<String>> {
        let active = self.layout.active_dir(session_id);
        let logs = self.layout.logs_in(&active);

        let since = self.db.last_cycle_end(session_id)?;
        let mut analysis = self.analyze(transcript_path, since, warnings);
        if analysis.intent.confidence == Confidence::Low {
            if let Some(snapshot) = read_intent_snapshot(&active) {
                analysis.intent = snapshot;
            }
        }

        let prompt_uuid = analysis.latest_prompt.as_ref().and_then(|p| p.uuid.clone());
        let marker = match prompt_uuid {
            Some(uuid) if self.db.find_cycle(session_id, &uuid)?.is_none() => uuid,
            Some(uuid) if logs.is_empty() => {
                tracing::debug!(session_id, marker = %uuid, "Cycle already committed, nothing to seal");
                return Ok(None);
            }
            // Tool events after the request's cycle was committed
            Some(uuid) => format!("{}-{}", uuid, &content_marker(session_id, &logs)?[..16]),
            None if logs.is_empty() => return Ok(None),
            None => content_marker(session_id, &logs)?,
        };

        let pending = self.layout.pending_dir(session_id, &marker);
        move_logs(&active, &pending)?;

        let manifest = CycleManifest {
            session_id: session_id.to_string(),
            generation_marker: marker.clone(),
            intent: analysis.intent,
            prompts: analysis.recent_prompts,
            transcript_path: transcript_path.map(|p| p.to_string_lossy().to_string()),
            sealed_at: now,
        };
        write_atomic(
            &pending.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&manifest)?.as_bytes(),
        )?;

        tracing::info!(
            session_id,
            marker = %marker,
            agent_logs = logs.len(),
            "Sealed cycle"
        );
        Ok(Some(marker))
    }

    /// Snapshot the current intent into the active cycle so it survives
    /// history compaction.
    pub fn snapshot_intent(&self, session_id: &str, transcript_path: Option<&Path>) -> Result<Option<Intent>> {
        let since = self.db.last_cycle_end(session_id)?;
        let analysis = self.analyze(transcript_path, since, &mut Vec::new());
        if analysis.intent.confidence == Confidence::Low {
            return Ok(None);
        }

        let path = self.layout.active_dir(session_id).join(INTENT_SNAPSHOT_FILE);
        write_atomic(&path, serde_json::to_string(&analysis.intent)?.as_bytes())?;
        Ok(Some(analysis.intent))
    }

    fn analyze(
        &self,
        transcript_path: Option<&Path>,
        since: Option<DateTime<Utc>>,
        warnings: &mut Vec<String>,
    ) -> IntentAnalysis {
        let extractor = IntentExtractor::new(&self.settings.intent);
        match transcript_path {
            Some(path) => {
                let reader = TranscriptReader::new(path);
                let mut entries = reader.entries();
                let analysis = extractor.analyze(&mut entries, since);
                if entries.skipped_lines() > 0 {
                    warnings.push(format!(
                        "skipped {} malformed transcript lines in {}",
                        entries.skipped_lines(),
                        path.display()
                    ));
                }
                analysis
            }
            None => extractor.analyze(std::iter::empty(), since),
        }
    }

    /// Commit every pending cycle of the session, oldest first.
    fn commit_pending(&self, session_id: &str, outcome: &mut AggregationOutcome) -> Result<()> {
        let mut backlog: Vec<(CycleManifest, PathBuf)> = Vec::new();
        for dir in subdirs(&self.layout.pending_root(session_id)) {
            match read_manifest(&dir) {
                Ok(manifest) => backlog.push((manifest, dir)),
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Unreadable cycle manifest");
                    outcome
                        .warnings
                        .push(format!("unreadable manifest in {}", dir.display()));
                    outcome.deferred += 1;
                }
            }
        }
        backlog.sort_by_key(|(m, _)| m.sealed_at);

        for (manifest, dir) in backlog {
            // Another session's run may commit and move this directory first
            let logs = match self
                .layout
                .logs_in(&dir)
                .iter()
                .map(|path| AgentToolLog::load(path))
                .collect::<Result<Vec<_>>>()
            {
                Ok(logs) => logs,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Failed to load sealed logs");
                    outcome.deferred += 1;
                    continue;
                }
            };
            for log in logs.iter().filter(|l| l.skipped > 0) {
                outcome.warnings.push(format!(
                    "skipped {} malformed lines in {} log",
                    log.skipped, log.agent_id
                ));
            }

            let record = build_record(&manifest, &logs, self.settings);
            let committed = match self.db.commit_cycle(&record) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(
                        session_id,
                        marker = %manifest.generation_marker,
                        error = %e,
                        "Cycle commit failed, leaving it pending"
                    );
                    outcome.deferred += 1;
                    continue;
                }
            };

            let target = self.layout.committed_dir(session_id, committed.cycle_id());
            settle_committed(&dir, &target)?;

            outcome.committed.push(CommittedCycle {
                session_id: session_id.to_string(),
                outcome: committed,
                user_intent: record.cycle.user_intent.clone(),
                primary_activity: record.cycle.primary_activity,
                file_count: distinct_files(&record.file_contexts),
                execution_summary: record
                    .summaries
                    .iter()
                    .find(|s| s.summary_type == SummaryType::ExecutionSummary)
                    .map(|s| s.summary_text.clone()),
            });
        }

        Ok(())
    }
}

/// Build the full record set for one sealed cycle.
///
/// Pure: the same manifest and logs always produce the same record, so a
/// retried commit writes exactly what the failed one would have.
pub fn build_record(manifest: &CycleManifest, logs: &[LoadedLog], settings: &ResolvedSettings) -> CycleRecord {
    let mut events: Vec<CycleEvent> = logs
        .iter()
        .flat_map(|log| {
            log.records.iter().map(|record| CycleEvent {
                agent_id: log.agent_id.clone(),
                record: record.clone(),
            })
        })
        .collect();
    events.sort_by_key(|e| e.record.timestamp());

    let file_contexts: Vec<FileContext> = events.iter().filter_map(file_context).collect();

    let primary_activity = summary::primary_activity(events.iter().filter_map(|e| match &e.record {
        ToolRecord::ToolUse { activity, .. } => *activity,
        _ => None,
    }));

    let subagent_tasks = if settings.features.subagent_tracking {
        subagent_tasks(&events, &file_contexts)
    } else {
        Vec::new()
    };

    let summaries = if settings.features.summaries {
        summary::build_summaries(
            &manifest.intent,
            &manifest.prompts,
            &events,
            &file_contexts,
            &subagent_tasks,
        )
    } else {
        Vec::new()
    };

    let first_event = events.first().map(|e| e.record.timestamp());
    let first_prompt = manifest.prompts.iter().filter_map(|p| p.timestamp).min();
    let start_time = [first_event, first_prompt]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(manifest.sealed_at);
    let last_event = events.last().map(|e| e.record.timestamp());
    let end_time = last_event.map_or(manifest.sealed_at, |t| t.max(manifest.sealed_at));

    CycleRecord {
        cycle: Cycle {
            cycle_id: 0,
            session_id: manifest.session_id.clone(),
            generation_marker: manifest.generation_marker.clone(),
            user_intent: manifest.intent.text.clone(),
            intent_confidence: Some(manifest.intent.confidence),
            phase_number: manifest.intent.phase_number,
            task_number: manifest.intent.task_number,
            start_time,
            end_time: Some(end_time),
            primary_activity,
            transcript_path: manifest.transcript_path.clone(),
        },
        file_contexts,
        summaries,
        subagent_tasks,
    }
}

fn file_context(event: &CycleEvent) -> Option<FileContext> {
    match &event.record {
        ToolRecord::ToolUse {
            timestamp,
            file_path: Some(file_path),
            operation_type: Some(operation_type),
            change_reason,
            edit_count,
            ..
        } => Some(FileContext {
            id: 0,
            cycle_id: 0,
            file_path: file_path.clone(),
            agent_type: AgentType::from_agent_id(&event.agent_id),
            agent_id: event.agent_id.clone(),
            operation_type: *operation_type,
            change_reason: change_reason.clone(),
            edit_count: *edit_count,
            timestamp: *timestamp,
        }),
        _ => None,
    }
}

/// Pair delegation start/finish records into tasks, in start order.
///
/// A start with no matching finish stays in progress.
fn subagent_tasks(events: &[CycleEvent], file_contexts: &[FileContext]) -> Vec<SubagentTask> {
    let mut tasks: Vec<SubagentTask> = Vec::new();

    for event in events {
        match &event.record {
            ToolRecord::DelegationStarted { description, .. } => tasks.push(open_task(description)),
            ToolRecord::DelegationFinished {
                timestamp,
                description,
                subagent_id,
                failed,
            } => {
                let status = if *failed {
                    TaskStatus::Failed
                } else {
                    TaskStatus::Completed
                };
                let files_modified = subagent_id
                    .as_deref()
                    .map(|id| files_written_by(id, file_contexts))
                    .unwrap_or_default();

                let open = tasks.iter().position(|t| {
                    t.status == TaskStatus::InProgress && t.task_description == *description
                });
                let index = match open {
                    Some(i) => i,
                    None => {
                        tasks.push(open_task(description));
                        tasks.len() - 1
                    }
                };
                let task = &mut tasks[index];
                task.status = status;
                task.agent_id = subagent_id.clone();
                task.files_modified = files_modified;
                task.completion_time = Some(*timestamp);
            }
            _ => {}
        }
    }

    tasks
}

fn open_task(description: &str) -> SubagentTask {
    SubagentTask {
        id: 0,
        cycle_id: 0,
        task_description: description.to_string(),
        agent_id: None,
        files_modified: Vec::new(),
        status: TaskStatus::InProgress,
        completion_time: None,
    }
}

/// Ordered set of paths an agent wrote
fn files_written_by(agent_id: &str, file_contexts: &[FileContext]) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for fc in file_contexts
        .iter()
        .filter(|fc| fc.agent_id == agent_id && fc.operation_type.is_write_class())
    {
        if !files.contains(&fc.file_path) {
            files.push(fc.file_path.clone());
        }
    }
    files
}

/// Move a committed pending directory to its `committed/<id>` home.
///
/// A directory already gone was settled by a concurrent run.
fn settle_committed(dir: &Path, target: &Path) -> Result<()> {
    let moved = if target.exists() {
        std::fs::remove_dir_all(dir)
    } else {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(dir, target)
    };
    match moved {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => Ok(other?),
    }
}

fn distinct_files(file_contexts: &[FileContext]) -> usize {
    let mut paths: Vec<&str> = file_contexts.iter().map(|fc| fc.file_path.as_str()).collect();
    paths.sort_unstable();
    paths.dedup();
    paths.len()
}

/// Marker for a cycle whose transcript has no prompt uuid
fn content_marker(session_id: &str, logs: &[PathBuf]) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    for path in logs {
        hasher.update(std::fs::read(path)?);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub(crate) fn read_manifest(dir: &Path) -> Result<CycleManifest> {
    let content = std::fs::read_to_string(dir.join(MANIFEST_FILE))?;
    Ok(serde_json::from_str(&content)?)
}

fn read_intent_snapshot(active: &Path) -> Option<Intent> {
    let content = std::fs::read_to_string(active.join(INTENT_SNAPSHOT_FILE)).ok()?;
    match serde_json::from_str(&content) {
        Ok(intent) => Some(intent),
        Err(e) => {
            tracing::warn!(dir = %active.display(), error = %e, "Ignoring malformed intent snapshot");
            None
        }
    }
}

/// Move every file of `from` into `to`, then remove `from`.
///
/// A file already present in `to` (a cycle sealed earlier under the same
/// marker) gets the new contents appended.
fn move_logs(from: &Path, to: &Path) -> Result<()> {
    if !from.exists() {
        std::fs::create_dir_all(to)?;
        return Ok(());
    }
    if !to.exists() {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(from, to)?;
        return Ok(());
    }

    for entry in std::fs::read_dir(from)?.flatten() {
        let source = entry.path();
        let Some(name) = source.file_name() else {
            continue;
        };
        let target = to.join(name);
        if target.exists() && name != INTENT_SNAPSHOT_FILE {
            let bytes = std::fs::read(&source)?;
            OpenOptions::new().append(true).open(&target)?.write_all(&bytes)?;
            std::fs::remove_file(&source)?;
        } else {
            std::fs::rename(&source, &target)?;
        }
    }
    std::fs::remove_dir_all(from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationType;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn edit(minute: i64, path: &str) -> ToolRecord {
        ToolRecord::ToolUse {
            timestamp: at(minute),
            tool_name: "Edit".to_string(),
            file_path: Some(path.to_string()),
            operation_type: Some(OperationType::Edit),
            activity: Some(Activity::FileModification),
            change_reason: "modified via Edit".to_string(),
            edit_count: 1,
        }
    }

    fn manifest(marker: &str) -> CycleManifest {
        CycleManifest {
            session_id: "s1".to_string(),
            generation_marker: marker.to_string(),
            intent: Intent {
                text: "fix the login timeout bug".to_string(),
                confidence: Confidence::Medium,
                task_number: None,
                phase_number: None,
            },
            prompts: Vec::new(),
            transcript_path: None,
            sealed_at: at(30),
        }
    }

    fn log(agent: &str, records: Vec<ToolRecord>) -> LoadedLog {
        LoadedLog {
            agent_id: agent.to_string(),
            records,
            skipped: 0,
        }
    }

    #[test]
    fn test_build_record_merges_agents_in_time_order() {
        let logs = vec![
            log("main", vec![edit(1, "/a.rs"), edit(5, "/b.rs")]),
            log("subagent-1", vec![edit(3, "/c.rs")]),
        ];
        let record = build_record(&manifest("u1"), &logs, &ResolvedSettings::default());

        let paths: Vec<_> = record.file_contexts.iter().map(|fc| fc.file_path.as_str()).collect();
        assert_eq!(paths, vec!["/a.rs", "/c.rs", "/b.rs"]);
        assert_eq!(record.file_contexts[1].agent_type, AgentType::Subagent);
        assert_eq!(record.cycle.start_time, at(1));
        assert_eq!(record.cycle.end_time, Some(at(30)));
        assert_eq!(record.cycle.primary_activity, Activity::FileModification);
    }

    #[test]
    fn test_build_record_zero_events() {
        let record = build_record(&manifest("u1"), &[], &ResolvedSettings::default());
        assert!(record.file_contexts.is_empty());
        assert_eq!(record.cycle.primary_activity, Activity::Research);
        assert_eq!(record.cycle.start_time, at(30));
    }

    #[test]
    fn test_subagent_tasks_pairing() {
        let logs = vec![
            log(
                "main",
                vec![
                    ToolRecord::DelegationStarted {
                        timestamp: at(1),
                        description: "Audit auth".to_string(),
                    },
                    ToolRecord::DelegationStarted {
                        timestamp: at(2),
                        description: "Write docs".to_string(),
                    },
                    ToolRecord::DelegationFinished {
                        timestamp: at(9),
                        description: "Audit auth".to_string(),
                        subagent_id: Some("subagent-1".to_string()),
                        failed: false,
                    },
                ],
            ),
            log("subagent-1", vec![edit(4, "/auth.rs"), edit(6, "/auth.rs")]),
        ];
        let record = build_record(&manifest("u1"), &logs, &ResolvedSettings::default());

        assert_eq!(record.subagent_tasks.len(), 2);
        let audit = &record.subagent_tasks[0];
        assert_eq!(audit.status, TaskStatus::Completed);
        assert_eq!(audit.files_modified, vec!["/auth.rs"]);
        assert_eq!(audit.completion_time, Some(at(9)));
        assert_eq!(record.subagent_tasks[1].status, TaskStatus::InProgress);
    }

    #[test]
    fn test_seal_and_commit_moves_logs() {
        let dir = TempDir::new().unwrap();
        let layout = EphemeralLayout::new(dir.path());
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let settings = ResolvedSettings::default();

        layout.agent_log("s1", "main").append(&[edit(1, "/a.rs")]).unwrap();

        let aggregator = CycleAggregator::new(&db, &layout, &settings);
        let outcome = aggregator.run("s1", None, at(30)).unwrap();

        assert!(outcome.sealed.is_some());
        assert_eq!(outcome.committed.len(), 1);
        let cycle_id = outcome.committed[0].outcome.cycle_id();
        assert!(layout.committed_dir("s1", cycle_id).join("main.jsonl").exists());
        assert!(!layout.active_dir("s1").exists());
        assert!(subdirs(&layout.pending_root("s1")).is_empty());

        // Nothing new: a second run seals and commits nothing
        let again = aggregator.run("s1", None, at(31)).unwrap();
        assert!(again.sealed.is_none());
        assert!(again.committed.is_empty());
        assert_eq!(db.count_cycles().unwrap(), 1);
    }

    #[test]
    fn test_failed_commit_stays_pending() {
        let dir = TempDir::new().unwrap();
        let layout = EphemeralLayout::new(dir.path());
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let settings = ResolvedSettings::default();

        layout.agent_log("s1", "main").append(&[edit(1, "/a.rs")]).unwrap();
        db.connection().execute_batch("DROP TABLE file_contexts").unwrap();

        let aggregator = CycleAggregator::new(&db, &layout, &settings);
        let outcome = aggregator.run("s1", None, at(30)).unwrap();

        assert_eq!(outcome.deferred, 1);
        assert_eq!(db.count_cycles().unwrap(), 0);
        let pending = subdirs(&layout.pending_root("s1"));
        assert_eq!(pending.len(), 1);
        assert!(pending[0].join("main.jsonl").exists());
    }

    #[test]
    fn test_move_logs_appends_into_existing_pending() {
        let dir = TempDir::new().unwrap();
        let layout = EphemeralLayout::new(dir.path());
        let pending = layout.pending_dir("s1", "u1");

        layout.agent_log("s1", "main").append(&[edit(1, "/a.rs")]).unwrap();
        move_logs(&layout.active_dir("s1"), &pending).unwrap();
        layout.agent_log("s1", "main").append(&[edit(2, "/b.rs")]).unwrap();
        move_logs(&layout.active_dir("s1"), &pending).unwrap();

        let loaded = AgentToolLog::load(&pending.join("main.jsonl")).unwrap();
        assert_eq!(loaded.records.len(), 2);
    }
}
