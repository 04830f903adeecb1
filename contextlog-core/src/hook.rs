//! Hook invocation messages
//!
//! Each hook invocation is one inbound [`HookEvent`] (the JSON document the
//! host writes to stdin) and at most one outbound [`HookResponse`] (exit code
//! plus optional JSON decision on stdout).
//!
//! The event is a closed union tagged by `hook_event_name`; dispatch happens
//! with a single exhaustive match in [`crate::engine::handle`].

use crate::error::{Error, Result};
use crate::types::MAIN_AGENT_ID;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Fields present on every hook payload
#[derive(Debug, Clone, Deserialize)]
pub struct HookCommon {
    pub session_id: String,
    #[serde(default)]
    pub transcript_path: Option<PathBuf>,
    /// Working directory of the host session
    #[serde(default)]
    pub cwd: Option<String>,
    /// Identity of the acting agent; absent for the main agent
    #[serde(default)]
    pub agent_id: Option<String>,
}

impl HookCommon {
    /// Agent identity used to name this agent's tool log
    pub fn agent_id(&self) -> &str {
        self.agent_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(MAIN_AGENT_ID)
    }
}

/// A tool invocation about to run
#[derive(Debug, Clone, Deserialize)]
pub struct ToolUse {
    #[serde(flatten)]
    pub common: HookCommon,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: serde_json::Value,
}

/// A tool invocation that has finished
#[derive(Debug, Clone, Deserialize)]
pub struct ToolUseResult {
    #[serde(flatten)]
    pub common: HookCommon,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: serde_json::Value,
    #[serde(default, alias = "tool_response")]
    pub tool_output: serde_json::Value,
}

/// An idle or permission notification
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationEvent {
    #[serde(flatten)]
    pub common: HookCommon,
    #[serde(default)]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

/// End of the main agent's turn or of a subagent's task
#[derive(Debug, Clone, Deserialize)]
pub struct StopEvent {
    #[serde(flatten)]
    pub common: HookCommon,
    /// Set by the host when it is already continuing because of a stop hook
    #[serde(default)]
    pub stop_hook_active: bool,
}

/// How history compaction was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactType {
    Manual,
    Auto,
}

/// History is about to be compacted
#[derive(Debug, Clone, Deserialize)]
pub struct CompactEvent {
    #[serde(flatten)]
    pub common: HookCommon,
    #[serde(alias = "trigger")]
    pub compact_type: CompactType,
}

/// Inbound hook message
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "hook_event_name")]
pub enum HookEvent {
    PreToolUse(ToolUse),
    PostToolUse(ToolUseResult),
    Notification(NotificationEvent),
    Stop(StopEvent),
    SubagentStop(StopEvent),
    PreCompact(CompactEvent),
}

impl HookEvent {
    /// Parse a hook payload
    pub fn parse(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|e| Error::Parse {
            source_name: "hook payload".to_string(),
            message: e.to_string(),
        })
    }

    /// Fields shared by every variant
    pub fn common(&self) -> &HookCommon {
        match self {
            HookEvent::PreToolUse(e) => &e.common,
            HookEvent::PostToolUse(e) => &e.common,
            HookEvent::Notification(e) => &e.common,
            HookEvent::Stop(e) | HookEvent::SubagentStop(e) => &e.common,
            HookEvent::PreCompact(e) => &e.common,
        }
    }

    /// The `hook_event_name` this event was parsed from
    pub fn name(&self) -> &'static str {
        match self {
            HookEvent::PreToolUse(_) => "PreToolUse",
            HookEvent::PostToolUse(_) => "PostToolUse",
            HookEvent::Notification(_) => "Notification",
            HookEvent::Stop(_) => "Stop",
            HookEvent::SubagentStop(_) => "SubagentStop",
            HookEvent::PreCompact(_) => "PreCompact",
        }
    }
}

/// Decision returned to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Block,
}

/// JSON body written to stdout
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookDecision {
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Outbound hook message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookResponse {
    /// 0 lets the host proceed; nonzero asks it to block
    pub exit_code: i32,
    pub body: Option<HookDecision>,
}

impl HookResponse {
    /// Proceed with no output
    pub fn proceed() -> Self {
        Self {
            exit_code: 0,
            body: None,
        }
    }

    /// Proceed, attaching a human-readable reason
    pub fn approve(reason: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            body: Some(HookDecision {
                decision: Decision::Approve,
                reason: Some(reason.into()),
            }),
        }
    }

    /// Serialized body, if any
    pub fn body_json(&self) -> Option<String> {
        self.body
            .as_ref()
            .and_then(|b| serde_json::to_string(b).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_post_tool_use() {
        let payload = r#"{
            "session_id": "s-1",
            "transcript_path": "/tmp/t.jsonl",
            "cwd": "/work/app",
            "hook_event_name": "PostToolUse",
            "tool_name": "Edit",
            "tool_input": {"file_path": "/work/app/src/lib.rs"},
            "tool_response": {"success": true}
        }"#;

        let event = HookEvent::parse(payload).unwrap();
        assert_eq!(event.name(), "PostToolUse");
        assert_eq!(event.common().agent_id(), "main");
        match event {
            HookEvent::PostToolUse(e) => {
                assert_eq!(e.tool_name, "Edit");
                assert_eq!(e.tool_output["success"], true);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_stop_and_compact() {
        let stop = HookEvent::parse(
            r#"{"session_id":"s","hook_event_name":"Stop","stop_hook_active":true}"#,
        )
        .unwrap();
        assert!(matches!(stop, HookEvent::Stop(StopEvent { stop_hook_active: true, .. })));

        let compact = HookEvent::parse(
            r#"{"session_id":"s","hook_event_name":"PreCompact","trigger":"auto"}"#,
        )
        .unwrap();
        match compact {
            HookEvent::PreCompact(e) => assert_eq!(e.compact_type, CompactType::Auto),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_subagent_identity() {
        let event = HookEvent::parse(
            r#"{"session_id":"s","agent_id":"subagent-1","hook_event_name":"SubagentStop"}"#,
        )
        .unwrap();
        assert_eq!(event.common().agent_id(), "subagent-1");
    }

    #[test]
    fn test_unknown_event_and_missing_fields_are_parse_errors() {
        assert!(HookEvent::parse(r#"{"session_id":"s","hook_event_name":"Bogus"}"#).is_err());
        assert!(HookEvent::parse(r#"{"hook_event_name":"Stop"}"#).is_err());
        assert!(HookEvent::parse("not json").is_err());
    }

    #[test]
    fn test_response_body() {
        assert_eq!(HookResponse::proceed().body_json(), None);
        let json = HookResponse::approve("cycle 3 recorded").body_json().unwrap();
        assert_eq!(json, r#"{"decision":"approve","reason":"cycle 3 recorded"}"#);
    }
}
