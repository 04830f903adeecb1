//! Transcript reader for the host's append-only conversation log
//!
//! The transcript is line-delimited JSON written by the host while the
//! session runs. [`TranscriptReader::entries`] turns it into a lazy,
//! forward-only stream of [`TranscriptEntry`] values.
//!
//! # Error Handling
//!
//! - **Missing file**: yields an empty stream. The host may not have
//!   flushed the transcript yet.
//! - **Malformed or partial lines**: skipped and counted. The last line is
//!   routinely incomplete while the host is still writing.
//! - **Unknown record or block types**: ignored; only the five entry kinds
//!   the engine consumes are produced.
//! - **Sidechain records**: skipped. Subagent conversations are tracked
//!   through their own tool logs, not through the main transcript.
//!
//! The reader holds no cursor across invocations: every call to
//! [`TranscriptReader::entries`] restarts from the beginning of the file.

pub mod intent;

pub use intent::{Intent, IntentAnalysis, IntentExtractor, Prompt};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

/// Tool whose input carries the agent's structured task list
pub const TASK_LIST_TOOL: &str = "TodoWrite";

/// One item of a task-list snapshot
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskItem {
    /// Task description
    #[serde(default)]
    pub content: String,
    /// Status flag, e.g. `pending`, `in_progress`, `completed`
    #[serde(default)]
    pub status: String,
    /// Present-tense phrasing of the task, when provided
    #[serde(default, rename = "activeForm")]
    pub active_form: Option<String>,
}

/// Discriminant of [`EntryKind`], used for "most recent entry of type X" lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    UserMessage,
    AssistantMessage,
    ToolCall,
    ToolResult,
    TaskListSnapshot,
}

/// Typed payload of a transcript entry
#[derive(Debug, Clone, PartialEq)]
pub enum EntryKind {
    /// Text written by the human (or injected on their behalf when `is_meta`)
    UserMessage { text: String, is_meta: bool },
    /// Text produced by the assistant
    AssistantMessage { text: String },
    /// A tool invocation requested by the assistant
    ToolCall {
        tool_use_id: String,
        name: String,
        input: serde_json::Value,
    },
    /// The result of a tool invocation, echoed back as a user turn
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    /// The agent's structured task list at this point in the conversation
    TaskListSnapshot { tasks: Vec<TaskItem> },
}

impl EntryKind {
    pub fn entry_type(&self) -> EntryType {
        match self {
            EntryKind::UserMessage { .. } => EntryType::UserMessage,
            EntryKind::AssistantMessage { .. } => EntryType::AssistantMessage,
            EntryKind::ToolCall { .. } => EntryType::ToolCall,
            EntryKind::ToolResult { .. } => EntryType::ToolResult,
            EntryKind::TaskListSnapshot { .. } => EntryType::TaskListSnapshot,
        }
    }
}

/// One typed entry of the transcript
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    /// Record uuid assigned by the host
    pub uuid: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// 1-based line number the entry came from
    pub line: usize,
    pub kind: EntryKind,
}

// ============================================
// Raw JSONL record types (serde deserialization)
// ============================================

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawRecord {
    uuid: Option<String>,
    #[serde(rename = "type")]
    record_type: Option<String>,
    timestamp: Option<String>,
    is_sidechain: Option<bool>,
    is_meta: Option<bool>,
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawMessage {
    content: Option<RawContent>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

/// Reader over one transcript file
#[derive(Debug, Clone)]
pub struct TranscriptReader {
    path: PathBuf,
}

impl TranscriptReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stream entries from the start of the file.
    ///
    /// A missing or unreadable file produces an empty stream.
    pub fn entries(&self) -> Entries {
        let lines = match File::open(&self.path) {
            Ok(file) => Some(BufReader::new(file).lines()),
            Err(e) => {
                tracing::debug!(
                    path = %self.path.display(),
                    error = %e,
                    "Transcript not readable, treating as empty"
                );
                None
            }
        };

        Entries {
            lines,
            pending: VecDeque::new(),
            line_number: 0,
            skipped_lines: 0,
        }
    }

    /// The most recent entry of one type, found with a single streaming scan.
    pub fn last_of(&self, entry_type: EntryType) -> Option<TranscriptEntry> {
        self.entries()
            .filter(|e| e.kind.entry_type() == entry_type)
            .last()
    }
}

/// Lazy iterator over transcript entries
pub struct Entries {
    lines: Option<Lines<BufReader<File>>>,
    pending: VecDeque<TranscriptEntry>,
    line_number: usize,
    skipped_lines: usize,
}

impl Entries {
    /// Lines skipped so far because they were unreadable or malformed
    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    fn read_next_line(&mut self) -> Option<String> {
        let lines = self.lines.as_mut()?;
        loop {
            let line = lines.next()?;
            self.line_number += 1;
            match line {
                Ok(l) if l.trim().is_empty() => continue,
                Ok(l) => return Some(l),
                Err(e) => {
                    self.skipped_lines += 1;
                    tracing::debug!(line = self.line_number, error = %e, "Transcript read error");
                }
            }
        }
    }
}

impl Iterator for Entries {
    type Item = TranscriptEntry;

    fn next(&mut self) -> Option<TranscriptEntry> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(entry);
            }

            let line = self.read_next_line()?;
            let record: RawRecord = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    self.skipped_lines += 1;
                    tracing::debug!(
                        line = self.line_number,
                        error = %e,
                        "Skipping malformed transcript line"
                    );
                    continue;
                }
            };

            self.pending
                .extend(record_to_entries(record, self.line_number));
        }
    }
}

/// Convert a raw record into zero or more entries.
fn record_to_entries(record: RawRecord, line: usize) -> Vec<TranscriptEntry> {
    if record.is_sidechain.unwrap_or(false) {
        return Vec::new();
    }

    let timestamp = record
        .timestamp
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let is_meta = record.is_meta.unwrap_or(false);
    let is_assistant = match record.record_type.as_deref() {
        Some("assistant") => true,
        Some("user") => false,
        _ => return Vec::new(),
    };
    let Some(content) = record.message.and_then(|m| m.content) else {
        return Vec::new();
    };

    let make = |kind: EntryKind| TranscriptEntry {
        uuid: record.uuid.clone(),
        timestamp,
        line,
        kind,
    };
    let text_kind = |text: String| {
        if is_assistant {
            EntryKind::AssistantMessage { text }
        } else {
            EntryKind::UserMessage { text, is_meta }
        }
    };

    let mut entries = Vec::new();
    match content {
        RawContent::Text(text) => {
            if !text.trim().is_empty() {
                entries.push(make(text_kind(text)));
            }
        }
        RawContent::Blocks(blocks) => {
            // Text blocks of one record form a single message
            let mut texts: Vec<String> = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => {
                        if !text.trim().is_empty() {
                            texts.push(text);
                        }
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        if name == TASK_LIST_TOOL {
                            if let Some(tasks) = task_list_from_input(&input) {
                                entries.push(make(EntryKind::TaskListSnapshot { tasks }));
                            }
                        }
                        entries.push(make(EntryKind::ToolCall {
                            tool_use_id: id,
                            name,
                            input,
                        }));
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        entries.push(make(EntryKind::ToolResult {
                            tool_use_id,
                            content: result_text(&content),
                            is_error,
                        }));
                    }
                    ContentBlock::Unknown => {}
                }
            }
            if !texts.is_empty() {
                entries.insert(0, make(text_kind(texts.join("\n"))));
            }
        }
    }

    entries
}

fn task_list_from_input(input: &serde_json::Value) -> Option<Vec<TaskItem>> {
    let todos = input.get("todos")?;
    serde_json::from_value(todos.clone()).ok()
}

/// Flatten a tool_result content value into text
fn result_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
