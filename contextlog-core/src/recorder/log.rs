//! Ephemeral per-agent tool logs
//!
//! Layout under the ephemeral root:
//!
//! ```text
//! <root>/<session_id>/active/<agent_id>.jsonl        in-flight cycle, one file per agent
//! <root>/<session_id>/active/intent.json             intent snapshot taken before compaction
//! <root>/<session_id>/pending/<marker>/...           sealed at cycle end, awaiting commit
//! <root>/<session_id>/committed/<cycle_id>/...       committed, kept for the retention window
//! ```
//!
//! Every `.jsonl` file has exactly one writer: the agent it is named after.
//! Readers tolerate missing files and torn trailing lines.

use crate::error::Result;
use crate::types::{Activity, OperationType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const ACTIVE_DIR: &str = "active";
const PENDING_DIR: &str = "pending";
const COMMITTED_DIR: &str = "committed";
const LOG_EXTENSION: &str = "jsonl";

/// One line of an agent tool log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolRecord {
    /// A completed tool invocation; one record per touched file
    ToolUse {
        timestamp: DateTime<Utc>,
        tool_name: String,
        #[serde(default)]
        file_path: Option<String>,
        #[serde(default)]
        operation_type: Option<OperationType>,
        #[serde(default)]
        activity: Option<Activity>,
        change_reason: String,
        #[serde(default)]
        edit_count: i64,
    },
    /// A delegation tool is about to start a subagent
    DelegationStarted {
        timestamp: DateTime<Utc>,
        description: String,
    },
    /// A delegation tool returned
    DelegationFinished {
        timestamp: DateTime<Utc>,
        description: String,
        #[serde(default)]
        subagent_id: Option<String>,
        #[serde(default)]
        failed: bool,
    },
    /// The owning agent reported that it stopped
    AgentStopped { timestamp: DateTime<Utc> },
}

impl ToolRecord {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ToolRecord::ToolUse { timestamp, .. }
            | ToolRecord::DelegationStarted { timestamp, .. }
            | ToolRecord::DelegationFinished { timestamp, .. }
            | ToolRecord::AgentStopped { timestamp } => *timestamp,
        }
    }
}

/// Append-only log for one agent within one cycle
#[derive(Debug, Clone)]
pub struct AgentToolLog {
    path: PathBuf,
    agent_id: String,
}

/// Records read back from one agent log
#[derive(Debug, Clone)]
pub struct LoadedLog {
    pub agent_id: String,
    pub records: Vec<ToolRecord>,
    /// Lines that could not be parsed
    pub skipped: usize,
}

impl AgentToolLog {
    pub fn new(dir: &Path, agent_id: &str) -> Self {
        Self {
            path: dir.join(format!("{}.{}", sanitize(agent_id), LOG_EXTENSION)),
            agent_id: agent_id.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Append records in one write.
    pub fn append(&self, records: &[ToolRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        // Retention may remove an empty directory between create and open
        let mut file = match self.open_for_append() {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.open_for_append()?,
            opened => opened?,
        };
        file.write_all(&buf)?;
        Ok(())
    }

    fn open_for_append(&self) -> std::io::Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&self.path)
    }

    /// Read a log file in append order, skipping unparsable lines.
    ///
    /// The agent id is taken from the file stem. A missing file reads as empty.
    pub fn load(path: &Path) -> Result<LoadedLog> {
        let agent_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        let file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LoadedLog {
                    agent_id,
                    records: Vec::new(),
                    skipped: 0,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        let mut skipped = 0;
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    skipped += 1;
                    tracing::debug!(path = %path.display(), line = index + 1, error = %e, "Tool log read error");
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ToolRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(
                        path = %path.display(),
                        line = index + 1,
                        error = %e,
                        "Skipping malformed tool log line"
                    );
                }
            }
        }

        Ok(LoadedLog {
            agent_id,
            records,
            skipped,
        })
    }
}

/// Directory layout of the ephemeral store
#[derive(Debug, Clone)]
pub struct EphemeralLayout {
    root: PathBuf,
}

impl EphemeralLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(sanitize(session_id))
    }

    /// Logs of the cycle currently in flight
    pub fn active_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(ACTIVE_DIR)
    }

    pub fn pending_root(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(PENDING_DIR)
    }

    pub fn pending_dir(&self, session_id: &str, marker: &str) -> PathBuf {
        self.pending_root(session_id).join(sanitize(marker))
    }

    pub fn committed_root(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(COMMITTED_DIR)
    }

    pub fn committed_dir(&self, session_id: &str, cycle_id: i64) -> PathBuf {
        self.committed_root(session_id).join(cycle_id.to_string())
    }

    /// Tool log for an agent in the active cycle
    pub fn agent_log(&self, session_id: &str, agent_id: &str) -> AgentToolLog {
        AgentToolLog::new(&self.active_dir(session_id), agent_id)
    }

    /// All agent logs in a directory, sorted by file name
    pub fn logs_in(&self, dir: &Path) -> Vec<PathBuf> {
        let pattern = dir.join(format!("*.{}", LOG_EXTENSION));
        let mut paths: Vec<PathBuf> = match glob::glob(&pattern.to_string_lossy()) {
            Ok(entries) => entries.flatten().collect(),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Invalid log glob");
                Vec::new()
            }
        };
        paths.sort();
        paths
    }

    /// Session directories under the root
    pub fn sessions(&self) -> Vec<PathBuf> {
        subdirs(&self.root)
    }
}

/// Immediate subdirectories of `dir`, sorted; empty if `dir` is missing.
pub(crate) fn subdirs(dir: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(_) => Vec::new(),
    };
    dirs.sort();
    dirs
}

/// Make an identifier safe to use as a single path component
pub fn sanitize(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
