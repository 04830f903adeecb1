//! Hook dispatch
//!
//! [`handle`] folds one inbound [`HookEvent`] into the ephemeral logs and the
//! store, and produces the [`HookResponse`] for the host. Each event variant
//! has exactly one handler.

use crate::aggregate::{AggregationOutcome, CycleAggregator};
use crate::config::{EnginePaths, InteractionLevel, ResolvedSettings};
use crate::db::Database;
use crate::error::Result;
use crate::hook::{
    CompactEvent, HookEvent, HookResponse, NotificationEvent, StopEvent, ToolUse, ToolUseResult,
};
use crate::recorder::{EphemeralLayout, ToolEventRecorder};
use crate::retention::RetentionManager;
use chrono::{DateTime, Utc};

/// Handle one hook invocation.
pub fn handle(
    event: HookEvent,
    settings: &ResolvedSettings,
    paths: &EnginePaths,
    now: DateTime<Utc>,
) -> Result<HookResponse> {
    if !settings.features.changelog {
        tracing::debug!(event = event.name(), "Changelog disabled, ignoring event");
        return Ok(HookResponse::proceed());
    }

    tracing::debug!(
        event = event.name(),
        session_id = %event.common().session_id,
        agent_id = %event.common().agent_id(),
        "Handling hook event"
    );

    let layout = EphemeralLayout::new(&paths.ephemeral_root);
    match event {
        HookEvent::PreToolUse(e) => on_pre_tool_use(&e, settings, &layout, now),
        HookEvent::PostToolUse(e) => on_post_tool_use(&e, settings, &layout, now),
        HookEvent::Notification(e) => on_notification(&e),
        HookEvent::Stop(e) => on_stop(&e, settings, paths, &layout, now),
        HookEvent::SubagentStop(e) => on_subagent_stop(&e, settings, &layout, now),
        HookEvent::PreCompact(e) => on_pre_compact(&e, settings, paths, &layout),
    }
}

fn on_pre_tool_use(
    event: &ToolUse,
    settings: &ResolvedSettings,
    layout: &EphemeralLayout,
    now: DateTime<Utc>,
) -> Result<HookResponse> {
    ToolEventRecorder::new(layout, &settings.features).record_pre(event, now)?;
    Ok(HookResponse::proceed())
}

fn on_post_tool_use(
    event: &ToolUseResult,
    settings: &ResolvedSettings,
    layout: &EphemeralLayout,
    now: DateTime<Utc>,
) -> Result<HookResponse> {
    ToolEventRecorder::new(layout, &settings.features).record_post(event, now)?;
    Ok(HookResponse::proceed())
}

fn on_notification(event: &NotificationEvent) -> Result<HookResponse> {
    tracing::info!(
        session_id = %event.common.session_id,
        notification_type = event.notification_type.as_deref().unwrap_or("unknown"),
        message = event.message.as_deref().unwrap_or(""),
        "Host notification"
    );
    Ok(HookResponse::proceed())
}

fn on_stop(
    event: &StopEvent,
    settings: &ResolvedSettings,
    paths: &EnginePaths,
    layout: &EphemeralLayout,
    now: DateTime<Utc>,
) -> Result<HookResponse> {
    if event.stop_hook_active {
        tracing::debug!(session_id = %event.common.session_id, "Stop hook already active, skipping");
        return Ok(HookResponse::proceed());
    }

    let db = open_store(paths)?;
    let session_id = &event.common.session_id;
    let outcome = CycleAggregator::new(&db, layout, settings).run(
        session_id,
        event.common.transcript_path.as_deref(),
        now,
    )?;
    for warning in &outcome.warnings {
        tracing::warn!(session_id = %session_id, "{}", warning);
    }

    // Runs even when nothing new committed so abandoned sessions still get swept
    RetentionManager::new(layout, &settings.cleanup_policy).apply(&db, Some(session_id), now)?;

    Ok(cycle_feedback(&outcome, session_id, settings.interaction_level))
}

fn on_subagent_stop(
    event: &StopEvent,
    settings: &ResolvedSettings,
    layout: &EphemeralLayout,
    now: DateTime<Utc>,
) -> Result<HookResponse> {
    if event.stop_hook_active {
        return Ok(HookResponse::proceed());
    }
    ToolEventRecorder::new(layout, &settings.features).record_agent_stop(&event.common, now)?;
    Ok(HookResponse::proceed())
}

fn on_pre_compact(
    event: &CompactEvent,
    settings: &ResolvedSettings,
    paths: &EnginePaths,
    layout: &EphemeralLayout,
) -> Result<HookResponse> {
    let db = open_store(paths)?;
    let snapshot = CycleAggregator::new(&db, layout, settings).snapshot_intent(
        &event.common.session_id,
        event.common.transcript_path.as_deref(),
    )?;
    tracing::info!(
        session_id = %event.common.session_id,
        compact_type = ?event.compact_type,
        saved = snapshot.is_some(),
        "Snapshot intent before compaction"
    );
    Ok(HookResponse::proceed())
}

fn open_store(paths: &EnginePaths) -> Result<Database> {
    let db = Database::open(&paths.database)?;
    db.migrate()?;
    Ok(db)
}

/// One-line report of the newly committed cycle
fn cycle_feedback(outcome: &AggregationOutcome, session_id: &str, level: InteractionLevel) -> HookResponse {
    if !level.reports_cycles() {
        return HookResponse::proceed();
    }
    let Some(cycle) = outcome.latest_new(session_id) else {
        return HookResponse::proceed();
    };

    let intent = if cycle.user_intent.is_empty() {
        "(no intent captured)"
    } else {
        cycle.user_intent.as_str()
    };
    let mut reason = format!(
        "Changelog cycle #{} [{}, {} file{}]: {}",
        cycle.outcome.cycle_id(),
        cycle.primary_activity,
        cycle.file_count,
        if cycle.file_count == 1 { "" } else { "s" },
        intent
    );
    if level == InteractionLevel::Verbose {
        if let Some(summary) = &cycle.execution_summary {
            reason.push_str(" | ");
            reason.push_str(summary);
        }
    }
    HookResponse::approve(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::Decision;
    use tempfile::TempDir;

    fn paths(dir: &TempDir) -> EnginePaths {
        EnginePaths {
            database: dir.path().join("changelog.db"),
            ephemeral_root: dir.path().join("ephemeral"),
        }
    }

    fn event(json: &str) -> HookEvent {
        HookEvent::parse(json).unwrap()
    }

    #[test]
    fn test_post_tool_use_then_stop_commits_cycle() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        let settings = ResolvedSettings::default();

        let post = event(
            r#"{"session_id":"s1","hook_event_name":"PostToolUse","tool_name":"Write",
                "tool_input":{"file_path":"/src/main.rs","content":"fn main() {}"}}"#,
        );
        assert_eq!(handle(post, &settings, &paths, Utc::now()).unwrap(), HookResponse::proceed());

        let stop = event(r#"{"session_id":"s1","hook_event_name":"Stop"}"#);
        let response = handle(stop, &settings, &paths, Utc::now()).unwrap();
        let body = response.body.expect("concise level reports the cycle");
        assert_eq!(body.decision, Decision::Approve);
        assert!(body.reason.unwrap().contains("file_modification, 1 file"));

        let db = Database::open(&paths.database).unwrap();
        let cycles = db.recent_cycles(10).unwrap();
        assert_eq!(cycles.len(), 1);
        assert_eq!(db.file_history("/src/main.rs").unwrap().len(), 1);
    }

    #[test]
    fn test_stop_hook_active_is_skipped() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        let settings = ResolvedSettings::default();

        let layout = EphemeralLayout::new(&paths.ephemeral_root);
        let post = event(
            r#"{"session_id":"s1","hook_event_name":"PostToolUse","tool_name":"Read",
                "tool_input":{"file_path":"/README.md"}}"#,
        );
        handle(post, &settings, &paths, Utc::now()).unwrap();

        let stop = event(r#"{"session_id":"s1","hook_event_name":"Stop","stop_hook_active":true}"#);
        handle(stop, &settings, &paths, Utc::now()).unwrap();

        assert!(layout.agent_log("s1", "main").path().exists());
        assert!(!paths.database.exists());
    }

    #[test]
    fn test_quiet_level_returns_no_body() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        let settings = ResolvedSettings {
            interaction_level: InteractionLevel::Quiet,
            ..Default::default()
        };

        let post = event(
            r#"{"session_id":"s1","hook_event_name":"PostToolUse","tool_name":"Bash",
                "tool_input":{"command":"cargo test"}}"#,
        );
        handle(post, &settings, &paths, Utc::now()).unwrap();
        let stop = event(r#"{"session_id":"s1","hook_event_name":"Stop"}"#);
        assert_eq!(
            handle(stop, &settings, &paths, Utc::now()).unwrap(),
            HookResponse::proceed()
        );
    }

    #[test]
    fn test_disabled_changelog_records_nothing() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        let mut settings = ResolvedSettings::default();
        settings.features.changelog = false;

        let post = event(
            r#"{"session_id":"s1","hook_event_name":"PostToolUse","tool_name":"Edit",
                "tool_input":{"file_path":"/a.rs"}}"#,
        );
        handle(post, &settings, &paths, Utc::now()).unwrap();
        assert!(!paths.ephemeral_root.exists());
    }

    #[test]
    fn test_subagent_stop_appends_to_own_log() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        let settings = ResolvedSettings::default();

        let stop = event(r#"{"session_id":"s1","agent_id":"subagent-7","hook_event_name":"SubagentStop"}"#);
        handle(stop, &settings, &paths, Utc::now()).unwrap();

        let layout = EphemeralLayout::new(&paths.ephemeral_root);
        assert!(layout.agent_log("s1", "subagent-7").path().exists());
        assert!(!layout.agent_log("s1", "main").path().exists());
    }
}
