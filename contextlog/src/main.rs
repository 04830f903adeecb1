//! contextlog-hook - hook entry point for the contextual changelog
//!
//! The host runs this binary once per hook event with the event JSON on
//! stdin. A decision body, when there is one, goes to stdout.
//!
//! The hook never disrupts the host: malformed input, store failures and
//! panics are logged and the process still exits 0 with no output.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/contextlog/changelog.db
//! - Tool logs: $XDG_DATA_HOME/contextlog/ephemeral/
//! - Logs: $XDG_STATE_HOME/contextlog/
//! - Settings: $XDG_CONFIG_HOME/contextlog/settings.json and <project>/.claude/contextlog.json

use anyhow::{Context, Result};
use chrono::Utc;
use clap::error::ErrorKind;
use clap::Parser;
use contextlog_core::config::{self, EnginePaths};
use contextlog_core::{engine, logging, HookEvent, ResolvedSettings};
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Default)]
#[command(name = "contextlog-hook")]
#[command(about = "Record coding-assistant hook events into a contextual changelog")]
#[command(version)]
struct Args {
    /// Database file (overrides settings)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Directory for per-agent tool logs (overrides settings)
    #[arg(long)]
    ephemeral_dir: Option<PathBuf>,

    /// Project whose settings apply (defaults to the payload's cwd)
    #[arg(long)]
    project_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        // Unknown flags from a newer host config must not break the session
        Err(_) => Args::default(),
    };

    // Keep panic messages off stderr; the host shows stderr to the user
    std::panic::set_hook(Box::new(|info| {
        tracing::error!(panic = %info, "Hook panicked");
    }));

    if let Ok(Some(body)) = std::panic::catch_unwind(|| run(&args)) {
        println!("{}", body);
    }
    ExitCode::SUCCESS
}

/// Handle one invocation, returning the response body to print
fn run(args: &Args) -> Option<String> {
    let mut payload = String::new();
    if io::stdin().read_to_string(&mut payload).is_err() {
        return None;
    }

    let event = HookEvent::parse(&payload);
    let cwd = event.as_ref().ok().and_then(|e| e.common().cwd.clone());
    let project = args
        .project_dir
        .clone()
        .or_else(|| config::project_dir(cwd.as_deref()));

    let mut settings = ResolvedSettings::resolve(project.as_deref());
    if let Some(database) = &args.database {
        settings.storage.database_path = Some(database.clone());
    }
    if let Some(dir) = &args.ephemeral_dir {
        settings.storage.ephemeral_dir = Some(dir.clone());
    }

    // Without a log file the hook still runs, just silently
    let _log_guard = logging::init(&settings.logging).ok();

    let event = match event {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed hook payload");
            return None;
        }
    };

    match dispatch(event, &settings) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Hook failed");
            None
        }
    }
}

fn dispatch(event: HookEvent, settings: &ResolvedSettings) -> Result<Option<String>> {
    let paths = EnginePaths::resolve(settings);
    let name = event.name();

    let response = engine::handle(event, settings, &paths, Utc::now())
        .with_context(|| format!("failed to handle {} event", name))?;

    tracing::debug!(event = name, exit_code = response.exit_code, "Hook complete");
    Ok(response.body_json())
}
