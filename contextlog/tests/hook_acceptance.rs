use contextlog_core::Database;
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

struct HookTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    project: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl HookTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let project = base.join("project");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        for dir in [&home, &project, &xdg_data, &xdg_config, &xdg_state] {
            fs::create_dir_all(dir).expect("failed to create test directory");
        }

        Self {
            _temp_dir: temp_dir,
            home,
            project,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("contextlog/changelog.db")
    }

    fn write_project_settings(&self, settings: Value) {
        let path = self.project.join(".claude/contextlog.json");
        fs::create_dir_all(path.parent().expect("missing settings parent"))
            .expect("failed to create settings dir");
        fs::write(path, settings.to_string()).expect("failed to write settings");
    }

    /// Payload common fields pointing at the isolated project
    fn payload(&self, session: &str, event: &str) -> Value {
        json!({
            "session_id": session,
            "hook_event_name": event,
            "cwd": self.project,
        })
    }
}

fn run_hook(env: &HookTestEnv, args: &[&str], stdin: &str) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("contextlog-hook"));

    let mut child = Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("CLAUDE_PROJECT_DIR")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap_or_else(|e| panic!("failed to execute contextlog-hook: {e}"));

    child
        .stdin
        .take()
        .expect("stdin is piped")
        .write_all(stdin.as_bytes())
        .expect("failed to write payload");
    child
        .wait_with_output()
        .expect("failed to wait for contextlog-hook")
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "contextlog-hook {} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        args.join(" "),
        output.status,
        stdout,
        stderr
    );
}

fn post_edit(env: &HookTestEnv, args: &[&str], session: &str, file: &Path) {
    let mut payload = env.payload(session, "PostToolUse");
    payload["tool_name"] = json!("Edit");
    payload["tool_input"] = json!({"file_path": file, "old_string": "a", "new_string": "b"});
    payload["tool_response"] = json!({"success": true});

    let output = run_hook(env, args, &payload.to_string());
    assert_success(args, &output);
    assert!(output.stdout.is_empty(), "PostToolUse should not print a decision");
}

#[test]
fn post_tool_use_then_stop_commits_cycle_and_reports_it() {
    let env = HookTestEnv::new();
    let file = env.project.join("src/lib.rs");

    post_edit(&env, &[], "session-a", &file);

    let stop = env.payload("session-a", "Stop");
    let output = run_hook(&env, &[], &stop.to_string());
    assert_success(&[], &output);

    let body: Value = serde_json::from_slice(&output.stdout)
        .unwrap_or_else(|e| panic!("stdout should be a JSON decision: {e}"));
    assert_eq!(body["decision"], "approve");
    let reason = body["reason"].as_str().expect("decision carries a reason");
    assert!(
        reason.contains("file_modification"),
        "unexpected reason: {reason}"
    );

    let db_path = env.db_path();
    assert!(
        db_path.exists(),
        "database file should exist at {}",
        db_path.display()
    );

    let db = Database::open(&db_path).expect("failed to open db");
    db.migrate().expect("failed to migrate db");
    let cycles = db.recent_cycles(10).expect("failed to query cycles");
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0].session_id, "session-a");

    let history = db
        .file_history(&file.to_string_lossy())
        .expect("failed to query file history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].cycle_id, cycles[0].cycle_id);
}

#[test]
fn malformed_payload_exits_cleanly_without_output() {
    let env = HookTestEnv::new();

    for payload in ["", "not json", r#"{"hook_event_name":"Stop"}"#, r#"{"session_id":"s","hook_event_name":"Teleport"}"#] {
        let output = run_hook(&env, &[], payload);
        assert_success(&[], &output);
        assert!(
            output.stdout.is_empty(),
            "expected no stdout for {payload:?}, got {}",
            String::from_utf8_lossy(&output.stdout)
        );
        assert!(output.stderr.is_empty(), "hook must not write to stderr");
    }

    assert!(!env.db_path().exists());
}

#[test]
fn unknown_flags_do_not_break_the_hook() {
    let env = HookTestEnv::new();
    let args = ["--from-a-newer-host"];

    post_edit(&env, &args, "session-flags", &env.project.join("a.rs"));
    assert!(env.xdg_data.join("contextlog/ephemeral").exists());
}

#[test]
fn path_overrides_redirect_storage() {
    let env = HookTestEnv::new();
    let db = env.home.join("custom/changes.db");
    let ephemeral = env.home.join("custom/logs");
    let db_arg = db.to_string_lossy().into_owned();
    let eph_arg = ephemeral.to_string_lossy().into_owned();
    let args = ["--database", db_arg.as_str(), "--ephemeral-dir", eph_arg.as_str()];

    post_edit(&env, &args, "session-b", &env.project.join("main.rs"));
    assert!(ephemeral.join("session-b/active/main.jsonl").exists());

    let stop = env.payload("session-b", "Stop");
    let output = run_hook(&env, &args, &stop.to_string());
    assert_success(&args, &output);

    assert!(db.exists(), "database should be created at the override path");
    assert!(!env.db_path().exists(), "default database should be untouched");
}

#[test]
fn quiet_project_settings_suppress_feedback() {
    let env = HookTestEnv::new();
    env.write_project_settings(json!({"interaction_level": "quiet"}));

    post_edit(&env, &[], "session-q", &env.project.join("quiet.rs"));
    let output = run_hook(&env, &[], &env.payload("session-q", "Stop").to_string());
    assert_success(&[], &output);
    assert!(output.stdout.is_empty());

    let db = Database::open(&env.db_path()).expect("failed to open db");
    assert_eq!(db.count_cycles().expect("failed to count cycles"), 1);
}

#[test]
fn disabled_changelog_writes_nothing() {
    let env = HookTestEnv::new();
    env.write_project_settings(json!({"features": {"changelog": false}}));

    post_edit(&env, &[], "session-off", &env.project.join("off.rs"));
    let output = run_hook(&env, &[], &env.payload("session-off", "Stop").to_string());
    assert_success(&[], &output);

    assert!(output.stdout.is_empty());
    assert!(!env.db_path().exists());
    assert!(!env.xdg_data.join("contextlog/ephemeral").exists());
}
