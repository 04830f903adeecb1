//! Intent extraction
//!
//! Derives "what the user currently wants" from a transcript stream.
//! Signals, in priority order:
//!
//! 1. The most recent task-list snapshot with an in-progress item
//!    (confidence [`Confidence::High`]).
//! 2. The most recent human prompt, truncated at a natural boundary
//!    (confidence [`Confidence::Medium`]).
//! 3. Nothing found: empty intent with [`Confidence::Low`].
//!
//! Extraction never fails; an empty stream is a valid input.

use super::{EntryKind, TaskItem, TranscriptEntry};
use crate::config::IntentSettings;
use crate::types::Confidence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Prefixes of user-turn text that the host injects rather than the human types
const ECHO_PREFIXES: &[&str] = &[
    "<command-",
    "<local-command-",
    "<system-reminder>",
    "<user-prompt-submit-hook>",
    "<bash-",
    "[Request interrupted",
    "Caveat:",
];

/// Upper bound on prompts retained for per-cycle intent summaries
const MAX_RECENT_PROMPTS: usize = 10;

/// Shortest first sentence accepted as the whole intent
const MIN_SENTENCE_CHARS: usize = 12;

/// Inferred user intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub text: String,
    pub confidence: Confidence,
    /// 1-based position of the active task in the task list
    pub task_number: Option<i64>,
    /// "Phase N" mentioned in the intent text
    pub phase_number: Option<i64>,
}

impl Intent {
    /// The degenerate result: nothing usable was found
    pub fn unknown() -> Self {
        Self {
            text: String::new(),
            confidence: Confidence::Low,
            task_number: None,
            phase_number: None,
        }
    }
}

/// A human prompt from the transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub uuid: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Prompt text, truncated at a natural boundary
    pub text: String,
}

/// Everything the aggregator needs from one pass over the transcript
#[derive(Debug, Clone)]
pub struct IntentAnalysis {
    pub intent: Intent,
    /// The most recent human prompt; identifies the current user request
    pub latest_prompt: Option<Prompt>,
    /// Human prompts after the `since` cutoff, oldest first
    pub recent_prompts: Vec<Prompt>,
}

/// Extracts intent according to the configured tuning
pub struct IntentExtractor<'a> {
    settings: &'a IntentSettings,
}

impl<'a> IntentExtractor<'a> {
    pub fn new(settings: &'a IntentSettings) -> Self {
        Self { settings }
    }

    /// Best-effort current intent.
    pub fn extract(&self, entries: impl Iterator<Item = TranscriptEntry>) -> Intent {
        self.analyze(entries, None).intent
    }

    /// Single streaming pass collecting the intent plus the prompts issued
    /// after `since` (all prompts when `since` is `None`).
    pub fn analyze(
        &self,
        entries: impl Iterator<Item = TranscriptEntry>,
        since: Option<DateTime<Utc>>,
    ) -> IntentAnalysis {
        let mut last_tasks: Option<Vec<TaskItem>> = None;
        let mut latest_prompt: Option<Prompt> = None;
        let mut recent: VecDeque<Prompt> = VecDeque::new();

        for entry in entries {
            match entry.kind {
                EntryKind::TaskListSnapshot { tasks } => last_tasks = Some(tasks),
                EntryKind::UserMessage { text, is_meta } => {
                    if is_meta || is_echo(&text) {
                        continue;
                    }
                    let prompt = Prompt {
                        uuid: entry.uuid,
                        timestamp: entry.timestamp,
                        text: truncate_at_boundary(&text, self.settings.max_chars),
                    };
                    let after_cutoff = match (since, prompt.timestamp) {
                        (Some(cutoff), Some(ts)) => ts > cutoff,
                        _ => true,
                    };
                    if after_cutoff {
                        if recent.len() == MAX_RECENT_PROMPTS {
                            recent.pop_front();
                        }
                        recent.push_back(prompt.clone());
                    }
                    latest_prompt = Some(prompt);
                }
                _ => {}
            }
        }

        let intent = last_tasks
            .as_deref()
            .and_then(|tasks| self.from_task_list(tasks))
            .or_else(|| {
                latest_prompt.as_ref().map(|p| Intent {
                    text: p.text.clone(),
                    confidence: Confidence::Medium,
                    task_number: None,
                    phase_number: phase_number(&p.text),
                })
            })
            .unwrap_or_else(Intent::unknown);

        IntentAnalysis {
            intent,
            latest_prompt,
            recent_prompts: recent.into_iter().collect(),
        }
    }

    fn from_task_list(&self, tasks: &[TaskItem]) -> Option<Intent> {
        let (index, task) = tasks.iter().enumerate().find(|(_, t)| {
            self.settings
                .in_progress_markers
                .iter()
                .any(|m| m.eq_ignore_ascii_case(&t.status))
        })?;

        let text = task.content.trim();
        if text.is_empty() {
            return None;
        }

        Some(Intent {
            text: text.to_string(),
            confidence: Confidence::High,
            task_number: Some(index as i64 + 1),
            phase_number: phase_number(text),
        })
    }
}

/// Whether user-turn text was injected by the host rather than typed
pub fn is_echo(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.is_empty() || ECHO_PREFIXES.iter().any(|p| trimmed.starts_with(p))
}

/// Collapse whitespace and cut to at most `max_chars` characters, preferring
/// the end of the first sentence, then clause punctuation, then a word break.
pub fn truncate_at_boundary(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let chars: Vec<char> = collapsed.chars().collect();
    let max_chars = max_chars.max(1);
    // Boundaries earlier than these would lose too much of the request
    let min_sentence = MIN_SENTENCE_CHARS.min(max_chars);
    let min_cut = (max_chars / 4).max(8);

    let is_sentence_end = |i: usize| {
        matches!(chars[i], '.' | '!' | '?') && chars.get(i + 1).map_or(true, |c| *c == ' ')
    };

    let window = chars.len().min(max_chars);
    if let Some(end) = (min_sentence..window).find(|&i| is_sentence_end(i)) {
        return chars[..end].iter().collect();
    }
    if chars.len() <= max_chars {
        return collapsed.trim_end_matches(['.', '!', '?']).to_string();
    }

    // One character is reserved for the ellipsis
    let budget = max_chars - 1;
    let cut = (min_cut..budget)
        .rev()
        .find(|&i| matches!(chars[i], ',' | ';' | ':'))
        .or_else(|| (min_cut..budget).rev().find(|&i| chars[i] == ' '))
        .unwrap_or(budget);

    let mut out: String = chars[..cut].iter().collect();
    out.truncate(out.trim_end().len());
    out.push('…');
    out
}

/// Find "phase N" (any case, optional `:`/`#`/space separators) in text
pub fn phase_number(text: &str) -> Option<i64> {
    let lower = text.to_ascii_lowercase();
    let mut search_from = 0;
    while let Some(pos) = lower[search_from..].find("phase") {
        let after = search_from + pos + "phase".len();
        let rest = lower[after..].trim_start_matches([' ', ':', '#']);
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() {
            return digits.parse().ok();
        }
        search_from = after;
    }
    None
}
