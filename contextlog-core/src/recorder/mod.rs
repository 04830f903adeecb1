//! Tool event recording
//!
//! Every post-execution tool event is classified and appended to the acting
//! agent's ephemeral log. Writes are file appends only: an agent never reads
//! or locks another agent's log, so concurrent main-agent and subagent hook
//! processes do not contend.

pub mod classify;
mod log;

pub use log::{sanitize, AgentToolLog, EphemeralLayout, LoadedLog, ToolRecord};
pub(crate) use log::subdirs;

use crate::config::Features;
use crate::error::Result;
use crate::hook::{HookCommon, ToolUse, ToolUseResult};
use chrono::{DateTime, Utc};
use classify::DELEGATION_TOOL;

/// Appends tool events to agent-scoped logs
pub struct ToolEventRecorder<'a> {
    layout: &'a EphemeralLayout,
    features: &'a Features,
}

impl<'a> ToolEventRecorder<'a> {
    pub fn new(layout: &'a EphemeralLayout, features: &'a Features) -> Self {
        Self { layout, features }
    }

    /// Record a pre-execution event.
    ///
    /// Only delegation produces a record here, so the aggregator can report
    /// subagent tasks that never returned. Returns the number of records written.
    pub fn record_pre(&self, event: &ToolUse, now: DateTime<Utc>) -> Result<usize> {
        if event.tool_name != DELEGATION_TOOL || !self.features.subagent_tracking {
            return Ok(0);
        }

        let record = ToolRecord::DelegationStarted {
            timestamp: now,
            description: delegation_description(&event.tool_input),
        };
        self.log_for(&event.common).append(&[record])?;
        Ok(1)
    }

    /// Record a post-execution event: one record per touched file, or a single
    /// record without a file for tools that touched none.
    pub fn record_post(&self, event: &ToolUseResult, now: DateTime<Utc>) -> Result<usize> {
        let records = self.post_records(event, now);
        self.log_for(&event.common).append(&records)?;

        tracing::debug!(
            session_id = %event.common.session_id,
            agent_id = %event.common.agent_id(),
            tool = %event.tool_name,
            records = records.len(),
            "Recorded tool event"
        );
        Ok(records.len())
    }

    /// Mark the agent's log as finished.
    pub fn record_agent_stop(&self, common: &HookCommon, now: DateTime<Utc>) -> Result<()> {
        self.log_for(common)
            .append(&[ToolRecord::AgentStopped { timestamp: now }])
    }

    fn log_for(&self, common: &HookCommon) -> AgentToolLog {
        self.layout
            .agent_log(&common.session_id, common.agent_id())
    }

    fn post_records(&self, event: &ToolUseResult, now: DateTime<Utc>) -> Vec<ToolRecord> {
        let class = classify::classify(&event.tool_name, &event.tool_input);
        let reason = classify::change_reason(&event.tool_name, class.operation, &event.tool_input);
        let edit_count = classify::edit_count(class.operation, &event.tool_input);

        let files = if class.operation.is_some() {
            classify::touched_files(&event.tool_input, &event.tool_output)
        } else {
            Vec::new()
        };

        let make = |file_path: Option<String>| ToolRecord::ToolUse {
            timestamp: now,
            tool_name: event.tool_name.clone(),
            file_path,
            operation_type: class.operation,
            activity: class.activity,
            change_reason: reason.clone(),
            edit_count,
        };

        let mut records: Vec<ToolRecord> = if files.is_empty() {
            vec![make(None)]
        } else {
            files.into_iter().map(|f| make(Some(f))).collect()
        };

        if event.tool_name == DELEGATION_TOOL && self.features.subagent_tracking {
            records.push(ToolRecord::DelegationFinished {
                timestamp: now,
                description: delegation_description(&event.tool_input),
                subagent_id: classify::delegated_agent_id(&event.tool_output),
                failed: classify::delegation_failed(&event.tool_output),
            });
        }

        records
    }
}

/// Task description of a delegation call
fn delegation_description(input: &serde_json::Value) -> String {
    ["description", "prompt"]
        .iter()
        .find_map(|key| input.get(*key).and_then(|v| v.as_str()))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "delegated task".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::HookEvent;
    use crate::types::{Activity, OperationType};
    use tempfile::TempDir;

    fn post(payload: serde_json::Value) -> ToolUseResult {
        let mut payload = payload;
        payload["hook_event_name"] = "PostToolUse".into();
        match HookEvent::parse(&payload.to_string()).unwrap() {
            HookEvent::PostToolUse(e) => e,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_edit_records_one_line_per_file() {
        let dir = TempDir::new().unwrap();
        let layout = EphemeralLayout::new(dir.path());
        let features = Features::default();
        let recorder = ToolEventRecorder::new(&layout, &features);

        let event = post(serde_json::json!({
            "session_id": "s1",
            "tool_name": "MultiEdit",
            "tool_input": {"file_path": "/src/a.rs", "edits": [{}, {}]},
            "tool_response": {"filePath": "/src/a.rs"}
        }));
        assert_eq!(recorder.record_post(&event, Utc::now()).unwrap(), 1);

        let loaded = AgentToolLog::load(layout.agent_log("s1", "main").path()).unwrap();
        match &loaded.records[0] {
            ToolRecord::ToolUse {
                file_path,
                operation_type,
                edit_count,
                change_reason,
                ..
            } => {
                assert_eq!(file_path.as_deref(), Some("/src/a.rs"));
                assert_eq!(*operation_type, Some(OperationType::MultiEdit));
                assert_eq!(*edit_count, 2);
                assert_eq!(change_reason, "modified via MultiEdit");
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_bash_records_without_file() {
        let dir = TempDir::new().unwrap();
        let layout = EphemeralLayout::new(dir.path());
        let features = Features::default();
        let recorder = ToolEventRecorder::new(&layout, &features);

        let event = post(serde_json::json!({
            "session_id": "s1",
            "agent_id": "subagent-1",
            "tool_name": "Bash",
            "tool_input": {"command": "cargo test", "description": "Run tests"}
        }));
        recorder.record_post(&event, Utc::now()).unwrap();

        let loaded = AgentToolLog::load(layout.agent_log("s1", "subagent-1").path()).unwrap();
        match &loaded.records[0] {
            ToolRecord::ToolUse {
                file_path, activity, ..
            } => {
                assert!(file_path.is_none());
                assert_eq!(*activity, Some(Activity::Testing));
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_delegation_records() {
        let dir = TempDir::new().unwrap();
        let layout = EphemeralLayout::new(dir.path());
        let features = Features::default();
        let recorder = ToolEventRecorder::new(&layout, &features);

        let pre = match HookEvent::parse(
            r#"{"session_id":"s1","hook_event_name":"PreToolUse","tool_name":"Task","tool_input":{"description":"Audit auth"}}"#,
        )
        .unwrap()
        {
            HookEvent::PreToolUse(e) => e,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(recorder.record_pre(&pre, Utc::now()).unwrap(), 1);

        let event = post(serde_json::json!({
            "session_id": "s1",
            "tool_name": "Task",
            "tool_input": {"description": "Audit auth"},
            "tool_response": {"agentId": "subagent-1", "status": "completed"}
        }));
        assert_eq!(recorder.record_post(&event, Utc::now()).unwrap(), 2);

        let loaded = AgentToolLog::load(layout.agent_log("s1", "main").path()).unwrap();
        assert_eq!(loaded.records.len(), 3);
        assert!(matches!(
            &loaded.records[2],
            ToolRecord::DelegationFinished { subagent_id: Some(id), failed: false, .. } if id == "subagent-1"
        ));
    }

    #[test]
    fn test_pre_tool_use_for_other_tools_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let layout = EphemeralLayout::new(dir.path());
        let features = Features::default();
        let recorder = ToolEventRecorder::new(&layout, &features);

        let pre = match HookEvent::parse(
            r#"{"session_id":"s1","hook_event_name":"PreToolUse","tool_name":"Edit","tool_input":{}}"#,
        )
        .unwrap()
        {
            HookEvent::PreToolUse(e) => e,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(recorder.record_pre(&pre, Utc::now()).unwrap(), 0);
        assert!(!layout.active_dir("s1").exists());
    }
}
