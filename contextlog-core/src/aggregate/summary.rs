//! Activity vote and generated cycle summaries

use super::CycleEvent;
use crate::recorder::ToolRecord;
use crate::transcript::{Intent, Prompt};
use crate::types::{Activity, Confidence, FileContext, SubagentTask, Summary, SummaryType};
use std::collections::BTreeMap;

/// Edits to one file at which the workflow insight calls it out
const REPEATED_EDIT_THRESHOLD: usize = 3;

/// Files named in the execution summary before eliding the rest
const NAMED_FILES: usize = 3;

/// Majority activity category.
///
/// Ties go to the category declared first in [`Activity`]; a cycle with no
/// classified events is research.
pub fn primary_activity<I>(activities: I) -> Activity
where
    I: IntoIterator<Item = Activity>,
{
    let mut counts: BTreeMap<Activity, usize> = BTreeMap::new();
    for activity in activities {
        *counts.entry(activity).or_default() += 1;
    }

    let mut best: Option<(Activity, usize)> = None;
    for (activity, count) in counts {
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((activity, count));
        }
    }
    best.map(|(a, _)| a).unwrap_or(Activity::Research)
}

/// Build every summary row for a cycle.
///
/// One `user_intent` row per prompt the cycle saw (sequence 1..n), one
/// `execution_summary`, and a `workflow_insight` only when a pattern shows.
pub fn build_summaries(
    intent: &Intent,
    prompts: &[Prompt],
    events: &[CycleEvent],
    file_contexts: &[FileContext],
    tasks: &[SubagentTask],
) -> Vec<Summary> {
    let mut summaries: Vec<Summary> = prompts
        .iter()
        .filter(|p| !p.text.is_empty())
        .enumerate()
        .map(|(i, p)| summary(i as i64 + 1, p.text.clone(), SummaryType::UserIntent, Confidence::Medium))
        .collect();

    // Task-list intent (or a compaction snapshot) that no prompt carries
    if !intent.text.is_empty() && !summaries.iter().any(|s| s.summary_text == intent.text) {
        let sequence = summaries.len() as i64 + 1;
        summaries.push(summary(
            sequence,
            intent.text.clone(),
            SummaryType::UserIntent,
            intent.confidence,
        ));
    }

    let sequence = (summaries.len() as i64).max(1);
    summaries.push(summary(
        sequence,
        execution_text(events, file_contexts, tasks),
        SummaryType::ExecutionSummary,
        Confidence::High,
    ));

    if let Some(text) = workflow_insight(events, file_contexts, tasks) {
        summaries.push(summary(
            sequence,
            text,
            SummaryType::WorkflowInsight,
            Confidence::Medium,
        ));
    }

    summaries
}

fn summary(sequence: i64, text: String, summary_type: SummaryType, confidence: Confidence) -> Summary {
    Summary {
        id: 0,
        cycle_id: 0,
        intent_sequence: sequence,
        summary_text: text,
        summary_type,
        confidence_level: confidence,
    }
}

fn execution_text(events: &[CycleEvent], file_contexts: &[FileContext], tasks: &[SubagentTask]) -> String {
    let mut modified: Vec<&str> = Vec::new();
    let mut read = 0;
    for fc in file_contexts {
        if fc.operation_type.is_write_class() {
            if !modified.contains(&fc.file_path.as_str()) {
                modified.push(&fc.file_path);
            }
        } else {
            read += 1;
        }
    }

    let commands = events
        .iter()
        .filter(|e| matches!(&e.record, ToolRecord::ToolUse { tool_name, .. } if tool_name == "Bash"))
        .count();
    let mut agents: Vec<&str> = events.iter().map(|e| e.agent_id.as_str()).collect();
    agents.sort_unstable();
    agents.dedup();

    let mut parts = Vec::new();
    if !modified.is_empty() {
        let extra = modified.len().saturating_sub(NAMED_FILES);
        let more = format!("+{} more", extra);
        let mut names: Vec<&str> = modified
            .iter()
            .copied()
            .take(NAMED_FILES)
            .map(|p| p.rsplit('/').next().unwrap_or(p))
            .collect();
        if extra > 0 {
            names.push(&more);
        }
        parts.push(format!(
            "modified {} ({})",
            plural(modified.len(), "file"),
            names.join(", ")
        ));
    }
    if read > 0 {
        parts.push(format!("read {}", plural(read, "file")));
    }
    if commands > 0 {
        parts.push(format!("ran {}", plural(commands, "command")));
    }
    if !tasks.is_empty() {
        parts.push(format!("delegated {}", plural(tasks.len(), "task")));
    }

    if parts.is_empty() {
        return "No tool activity".to_string();
    }
    let mut text = parts.join(", ");
    if agents.len() > 1 {
        text.push_str(&format!(" across {} agents", agents.len()));
    }
    capitalize(&text)
}

fn workflow_insight(
    events: &[CycleEvent],
    file_contexts: &[FileContext],
    tasks: &[SubagentTask],
) -> Option<String> {
    let mut notes = Vec::new();

    if !tasks.is_empty() {
        notes.push(format!("delegated {} to subagents", plural(tasks.len(), "task")));
    }

    let mut edited = false;
    let mut tested_after_edit = false;
    for event in events {
        if let ToolRecord::ToolUse {
            operation_type,
            activity,
            ..
        } = &event.record
        {
            if operation_type.is_some_and(|op| op.is_write_class()) {
                edited = true;
            } else if edited && *activity == Some(Activity::Testing) {
                tested_after_edit = true;
            }
        }
    }
    if tested_after_edit {
        notes.push("ran tests after editing".to_string());
    }

    let mut edit_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for fc in file_contexts.iter().filter(|fc| fc.operation_type.is_write_class()) {
        *edit_counts.entry(&fc.file_path).or_default() += 1;
    }
    if let Some((path, count)) = edit_counts
        .into_iter()
        .filter(|(_, c)| *c >= REPEATED_EDIT_THRESHOLD)
        .max_by_key(|(_, c)| *c)
    {
        notes.push(format!("edited {} {} times", path, count));
    }

    if notes.is_empty() {
        None
    } else {
        Some(capitalize(&notes.join("; ")))
    }
}

fn plural(n: usize, noun: &str) -> String {
    if n == 1 {
        format!("1 {}", noun)
    } else {
        format!("{} {}s", n, noun)
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentType, OperationType};
    use chrono::Utc;

    fn tool_use(agent: &str, tool: &str, op: Option<OperationType>, activity: Activity) -> CycleEvent {
        CycleEvent {
            agent_id: agent.to_string(),
            record: ToolRecord::ToolUse {
                timestamp: Utc::now(),
                tool_name: tool.to_string(),
                file_path: None,
                operation_type: op,
                activity: Some(activity),
                change_reason: String::new(),
                edit_count: 0,
            },
        }
    }

    fn edit(path: &str) -> FileContext {
        FileContext {
            id: 0,
            cycle_id: 0,
            file_path: path.to_string(),
            agent_type: AgentType::Main,
            agent_id: "main".to_string(),
            operation_type: OperationType::Edit,
            change_reason: String::new(),
            edit_count: 1,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_primary_activity_majority() {
        let votes = [
            Activity::Testing,
            Activity::Research,
            Activity::Testing,
            Activity::FileModification,
        ];
        assert_eq!(primary_activity(votes), Activity::Testing);
    }

    #[test]
    fn test_primary_activity_tie_and_empty() {
        assert_eq!(
            primary_activity([Activity::Research, Activity::GitOperation]),
            Activity::GitOperation
        );
        assert_eq!(primary_activity(std::iter::empty()), Activity::Research);
    }

    #[test]
    fn test_summaries_per_prompt() {
        let prompts = vec![
            Prompt {
                uuid: Some("u1".to_string()),
                timestamp: None,
                text: "add a cache".to_string(),
            },
            Prompt {
                uuid: Some("u2".to_string()),
                timestamp: None,
                text: "now test it".to_string(),
            },
        ];
        let intent = Intent {
            text: "now test it".to_string(),
            confidence: Confidence::Medium,
            task_number: None,
            phase_number: None,
        };

        let summaries = build_summaries(&intent, &prompts, &[], &[], &[]);
        let intents: Vec<_> = summaries
            .iter()
            .filter(|s| s.summary_type == SummaryType::UserIntent)
            .map(|s| s.intent_sequence)
            .collect();
        assert_eq!(intents, vec![1, 2]);
        assert_eq!(summaries.last().unwrap().summary_text, "No tool activity");
    }

    #[test]
    fn test_execution_and_insight() {
        let events = vec![
            tool_use("main", "Edit", Some(OperationType::Edit), Activity::FileModification),
            tool_use("main", "Bash", None, Activity::Testing),
        ];
        let contexts = vec![edit("/src/a.rs"), edit("/src/a.rs"), edit("/src/a.rs")];

        let summaries = build_summaries(&Intent::unknown(), &[], &events, &contexts, &[]);
        let execution = summaries
            .iter()
            .find(|s| s.summary_type == SummaryType::ExecutionSummary)
            .unwrap();
        assert_eq!(execution.summary_text, "Modified 1 file (a.rs), ran 1 command");
        assert_eq!(execution.intent_sequence, 1);

        let insight = summaries
            .iter()
            .find(|s| s.summary_type == SummaryType::WorkflowInsight)
            .unwrap();
        assert_eq!(
            insight.summary_text,
            "Ran tests after editing; edited /src/a.rs 3 times"
        );
    }
}
