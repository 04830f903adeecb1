//! Core domain types for contextlog
//!
//! These types represent the durable changelog model that the Cycle Aggregator
//! commits and the query layer reads back.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Cycle** | One user-request-to-completion round trip; the unit of aggregation |
//! | **FileContext** | One file-touching operation inside a cycle, with the reason it happened |
//! | **Summary** | A generated narrative about a cycle (intent, execution, insight) |
//! | **SubagentTask** | A unit of work delegated to a subagent within a cycle |
//! | **Agent** | The main assistant or a delegated subagent; each owns one tool log per cycle |
//!
//! Every child row (`FileContext`, `Summary`, `SubagentTask`) carries the
//! `cycle_id` of its parent. Before the cycle is committed that id is `0`;
//! the store fills it in inside the commit transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Agents
// ============================================

/// Which kind of agent performed an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// The main assistant conversation
    Main,
    /// A delegated child task
    Subagent,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Main => "main",
            AgentType::Subagent => "subagent",
        }
    }

    /// Derive the agent type from the agent identity used to name its log.
    pub fn from_agent_id(agent_id: &str) -> Self {
        if agent_id == MAIN_AGENT_ID {
            AgentType::Main
        } else {
            AgentType::Subagent
        }
    }
}

impl std::str::FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(AgentType::Main),
            "subagent" => Ok(AgentType::Subagent),
            _ => Err(format!("unknown agent type: {}", s)),
        }
    }
}

/// Agent identity used when the host does not supply one.
pub const MAIN_AGENT_ID: &str = "main";

// ============================================
// Operations and activities
// ============================================

/// File operation performed by a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Read,
    Edit,
    Write,
    #[serde(rename = "multiedit")]
    MultiEdit,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Read => "read",
            OperationType::Edit => "edit",
            OperationType::Write => "write",
            OperationType::MultiEdit => "multiedit",
        }
    }

    /// Whether the operation changes file contents
    pub fn is_write_class(&self) -> bool {
        !matches!(self, OperationType::Read)
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(OperationType::Read),
            "edit" => Ok(OperationType::Edit),
            "write" => Ok(OperationType::Write),
            "multiedit" => Ok(OperationType::MultiEdit),
            _ => Err(format!("unknown operation type: {}", s)),
        }
    }
}

/// Category of work a tool event represents.
///
/// The variant order is the tie-break order used by the activity vote:
/// when two categories have the same count, the earlier one wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    FileModification,
    Testing,
    GitOperation,
    Delegation,
    CommandExecution,
    Research,
}

impl Activity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Activity::FileModification => "file_modification",
            Activity::Testing => "testing",
            Activity::GitOperation => "git_operation",
            Activity::Delegation => "delegation",
            Activity::CommandExecution => "command_execution",
            Activity::Research => "research",
        }
    }
}

impl std::fmt::Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Activity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file_modification" => Ok(Activity::FileModification),
            "testing" => Ok(Activity::Testing),
            "git_operation" => Ok(Activity::GitOperation),
            "delegation" => Ok(Activity::Delegation),
            "command_execution" => Ok(Activity::CommandExecution),
            "research" => Ok(Activity::Research),
            _ => Err(format!("unknown activity: {}", s)),
        }
    }
}

// ============================================
// Intent
// ============================================

/// How much the intent (or a summary) can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Taken from the agent's own structured task list
    High,
    /// Taken from free-text user input
    Medium,
    /// Nothing usable was found
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }
}

impl std::str::FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Confidence::High),
            "medium" => Ok(Confidence::Medium),
            "low" => Ok(Confidence::Low),
            _ => Err(format!("unknown confidence level: {}", s)),
        }
    }
}

// ============================================
// Cycles
// ============================================

/// One user-request-to-completion round trip.
///
/// Rows are immutable once committed; `end_time` is written exactly once by
/// the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cycle {
    /// Monotonic identifier assigned by the store (0 before commit)
    pub cycle_id: i64,
    /// Host session this cycle belongs to
    pub session_id: String,
    /// Identifies the user request within the session; unique per session
    pub generation_marker: String,
    /// Derived description of what the user wanted
    pub user_intent: String,
    /// Confidence of `user_intent` (null on rows written before it existed)
    pub intent_confidence: Option<Confidence>,
    /// Optional project-phase metadata
    pub phase_number: Option<i64>,
    /// Optional task metadata (position of the active task in the task list)
    pub task_number: Option<i64>,
    /// First observed activity
    pub start_time: DateTime<Utc>,
    /// When the aggregator finalized the cycle
    pub end_time: Option<DateTime<Utc>>,
    /// Majority category of the cycle's tool events
    pub primary_activity: Activity,
    /// Transcript the intent was read from
    pub transcript_path: Option<String>,
}

/// A file-touching operation within a cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContext {
    /// Database row id (0 before insert)
    pub id: i64,
    /// Parent cycle (0 before commit)
    pub cycle_id: i64,
    pub file_path: String,
    pub agent_type: AgentType,
    /// Agent identity that wrote the underlying tool log
    pub agent_id: String,
    pub operation_type: OperationType,
    /// Why the file was touched
    pub change_reason: String,
    /// Number of discrete edits applied (0 for reads)
    pub edit_count: i64,
    pub timestamp: DateTime<Utc>,
}

/// Kind of generated summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryType {
    UserIntent,
    ExecutionSummary,
    WorkflowInsight,
}

impl SummaryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryType::UserIntent => "user_intent",
            SummaryType::ExecutionSummary => "execution_summary",
            SummaryType::WorkflowInsight => "workflow_insight",
        }
    }
}

impl std::str::FromStr for SummaryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_intent" => Ok(SummaryType::UserIntent),
            "execution_summary" => Ok(SummaryType::ExecutionSummary),
            "workflow_insight" => Ok(SummaryType::WorkflowInsight),
            _ => Err(format!("unknown summary type: {}", s)),
        }
    }
}

/// A narrative summary attached to a cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub id: i64,
    pub cycle_id: i64,
    /// Ordinal of the user intent this summary belongs to (1-based)
    pub intent_sequence: i64,
    pub summary_text: String,
    pub summary_type: SummaryType,
    pub confidence_level: Confidence,
}

/// Lifecycle of a delegated task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(format!("unknown task status: {}", s)),
        }
    }
}

/// A unit of delegated work inside a cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentTask {
    pub id: i64,
    pub cycle_id: i64,
    pub task_description: String,
    /// Subagent identity reported by the host, when known
    pub agent_id: Option<String>,
    /// Ordered set of paths the subagent wrote
    pub files_modified: Vec<String>,
    pub status: TaskStatus,
    pub completion_time: Option<DateTime<Utc>>,
}

/// A cycle with all of its child rows, committed as one unit.
#[derive(Debug, Clone)]
pub struct CycleRecord {
    pub cycle: Cycle,
    pub file_contexts: Vec<FileContext>,
    pub summaries: Vec<Summary>,
    pub subagent_tasks: Vec<SubagentTask>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_type_from_id() {
        assert_eq!(AgentType::from_agent_id("main"), AgentType::Main);
        assert_eq!(AgentType::from_agent_id("subagent-1"), AgentType::Subagent);
    }

    #[test]
    fn test_operation_round_trip_through_str() {
        for op in [
            OperationType::Read,
            OperationType::Edit,
            OperationType::Write,
            OperationType::MultiEdit,
        ] {
            assert_eq!(op.as_str().parse::<OperationType>().unwrap(), op);
        }
        assert!(!OperationType::Read.is_write_class());
        assert!(OperationType::MultiEdit.is_write_class());
    }

    #[test]
    fn test_activity_tie_break_order() {
        assert!(Activity::FileModification < Activity::Testing);
        assert!(Activity::CommandExecution < Activity::Research);
        assert_eq!("git_operation".parse::<Activity>(), Ok(Activity::GitOperation));
    }

    #[test]
    fn test_operation_serde_names() {
        let json = serde_json::to_string(&OperationType::MultiEdit).unwrap();
        assert_eq!(json, "\"multiedit\"");
    }
}
