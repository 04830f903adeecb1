//! Tool classification
//!
//! Maps a tool invocation (name + parameters + result) to the file
//! operation it performed, the activity category it votes for, the files
//! it touched and the reason for the change.

use crate::types::{Activity, OperationType};
use serde_json::Value;

/// Tool that delegates work to a subagent
pub const DELEGATION_TOOL: &str = "Task";

/// Keys whose string values are file paths, in tool inputs and results
const PATH_KEYS: &[&str] = &["file_path", "filePath", "notebook_path", "notebookPath"];

/// Keys whose value may nest a path-bearing object in tool results
const NESTED_KEYS: &[&str] = &["file", "result"];

/// Keys holding a human-readable description of the call
const REASON_KEYS: &[&str] = &["description", "reason", "explanation"];

/// Substrings that mark a shell command as running tests
const TEST_COMMANDS: &[&str] = &[
    "cargo test",
    "cargo nextest",
    "pytest",
    "npm test",
    "npm run test",
    "yarn test",
    "pnpm test",
    "bun test",
    "go test",
    "jest",
    "vitest",
    "mvn test",
    "gradle test",
    "make test",
    "rspec",
    "phpunit",
    "tox",
];

/// Tools that only maintain the agent's own bookkeeping
const BOOKKEEPING_TOOLS: &[&str] = &["TodoWrite", "ExitPlanMode"];

/// How a tool invocation is classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// File operation, for tools that read or write files
    pub operation: Option<OperationType>,
    /// Activity vote; `None` for bookkeeping tools
    pub activity: Option<Activity>,
}

/// Classify a tool by identity and parameters.
pub fn classify(tool_name: &str, input: &Value) -> Classification {
    let (operation, activity) = match tool_name {
        "Read" | "NotebookRead" => (Some(OperationType::Read), Some(Activity::Research)),
        "Edit" | "NotebookEdit" => (Some(OperationType::Edit), Some(Activity::FileModification)),
        "Write" => (Some(OperationType::Write), Some(Activity::FileModification)),
        "MultiEdit" => (
            Some(OperationType::MultiEdit),
            Some(Activity::FileModification),
        ),
        "Bash" => (None, Some(classify_command(command(input).unwrap_or_default()))),
        DELEGATION_TOOL => (None, Some(Activity::Delegation)),
        name if BOOKKEEPING_TOOLS.contains(&name) => (None, None),
        _ => (None, Some(Activity::Research)),
    };

    Classification {
        operation,
        activity,
    }
}

/// The shell command of a Bash invocation
pub fn command(input: &Value) -> Option<&str> {
    input.get("command").and_then(Value::as_str)
}

/// Classify a shell command line.
pub fn classify_command(command: &str) -> Activity {
    let lower = command.to_ascii_lowercase();
    if TEST_COMMANDS.iter().any(|t| lower.contains(t)) {
        return Activity::Testing;
    }

    let runs_git = lower
        .split(['&', ';', '|', '\n'])
        .filter_map(|segment| segment.split_whitespace().next())
        .any(|program| program == "git" || program == "gh");
    if runs_git {
        Activity::GitOperation
    } else {
        Activity::CommandExecution
    }
}

/// Every file path referenced by the tool's parameters or result, deduplicated
/// in first-seen order.
///
/// Search tools take a directory `path`; only explicit file keys are used.
pub fn touched_files(input: &Value, output: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    collect_paths(input, &mut paths, 0);
    collect_paths(output, &mut paths, 0);
    paths
}

fn collect_paths(value: &Value, out: &mut Vec<String>, depth: usize) {
    let Some(map) = value.as_object() else {
        return;
    };
    for key in PATH_KEYS {
        if let Some(path) = map.get(*key).and_then(Value::as_str) {
            if !path.is_empty() && !out.iter().any(|p| p == path) {
                out.push(path.to_string());
            }
        }
    }
    if depth == 0 {
        for key in NESTED_KEYS {
            if let Some(nested) = map.get(*key) {
                collect_paths(nested, out, depth + 1);
            }
        }
    }
}

/// Number of discrete edits the invocation applied
pub fn edit_count(operation: Option<OperationType>, input: &Value) -> i64 {
    match operation {
        Some(OperationType::Read) | None => 0,
        Some(OperationType::MultiEdit) => input
            .get("edits")
            .and_then(Value::as_array)
            .map(|edits| edits.len().max(1) as i64)
            .unwrap_or(1),
        Some(OperationType::Edit) | Some(OperationType::Write) => 1,
    }
}

/// Why the tool ran: its description field when present, otherwise a
/// phrase synthesized from the tool name.
pub fn change_reason(tool_name: &str, operation: Option<OperationType>, input: &Value) -> String {
    let described = REASON_KEYS
        .iter()
        .filter_map(|key| input.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty());
    if let Some(text) = described {
        return text.to_string();
    }

    match operation {
        Some(op) if op.is_write_class() => format!("modified via {}", tool_name),
        Some(_) => format!("read via {}", tool_name),
        None => match command(input) {
            Some(cmd) => format!("ran `{}`", first_line(cmd)),
            None => format!("ran {}", tool_name),
        },
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default().trim()
}

/// Whether a delegation tool's result reports failure
pub fn delegation_failed(output: &Value) -> bool {
    if output.get("is_error").and_then(Value::as_bool) == Some(true) {
        return true;
    }
    match output.get("status").and_then(Value::as_str) {
        Some(status) => matches!(status, "error" | "failed"),
        None => output
            .as_str()
            .map(|s| s.trim_start().starts_with("Error"))
            .unwrap_or(false),
    }
}

/// Subagent identity reported by a delegation tool's result
pub fn delegated_agent_id(output: &Value) -> Option<String> {
    ["agentId", "agent_id"]
        .iter()
        .find_map(|key| output.get(*key).and_then(Value::as_str))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}
