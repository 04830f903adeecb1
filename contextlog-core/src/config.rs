//! Settings resolution and path management
//!
//! Effective settings are the overlay of three JSON sources:
//! project settings over global settings over built-in defaults.
//!
//! - Global: `$XDG_CONFIG_HOME/contextlog/settings.json` (~/.config/contextlog/settings.json)
//! - Project: `<project>/.claude/contextlog.json`
//!
//! Storage follows the XDG Base Directory Specification:
//! - Data: `$XDG_DATA_HOME/contextlog/` (database and ephemeral tool logs)
//! - State/Logs: `$XDG_STATE_HOME/contextlog/`
//!
//! A [`ResolvedSettings`] value is built once per hook invocation and passed
//! to every component. Nothing reads settings from ambient state after that.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// How much feedback the hook returns to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionLevel {
    Silent,
    Quiet,
    #[default]
    Concise,
    Verbose,
}

impl InteractionLevel {
    /// Whether cycle-end feedback should be returned to the host
    pub fn reports_cycles(&self) -> bool {
        matches!(self, InteractionLevel::Concise | InteractionLevel::Verbose)
    }
}

/// Effective settings for one invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolvedSettings {
    /// Feedback verbosity
    pub interaction_level: InteractionLevel,

    /// Speech engine name; consumed by external tooling only
    pub tts_engine: Option<String>,

    /// Retention of ephemeral logs
    pub cleanup_policy: CleanupPolicy,

    /// Feature toggles
    pub features: Features,

    /// Intent extraction tuning
    pub intent: IntentSettings,

    /// Storage location overrides
    pub storage: StorageSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupPolicy {
    /// Number of most recent committed cycles whose tool logs are kept
    pub retention_cycles: u32,

    /// Age after which any ephemeral log is swept, even if never aggregated
    pub orphan_max_age_hours: u64,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            retention_cycles: 10,
            orphan_max_age_hours: 72,
        }
    }
}

/// Feature toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    /// Master switch: record tool events and aggregate cycles
    pub changelog: bool,
    /// Generate summary rows for each cycle
    pub summaries: bool,
    /// Derive subagent task rows from delegation events
    pub subagent_tracking: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            changelog: true,
            summaries: true,
            subagent_tracking: true,
        }
    }
}

/// Intent extraction tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentSettings {
    /// Upper bound on the length of free-text intent, in characters
    pub max_chars: usize,
    /// Task-list statuses that count as "in progress"
    pub in_progress_markers: Vec<String>,
}

impl Default for IntentSettings {
    fn default() -> Self {
        Self {
            max_chars: 160,
            in_progress_markers: vec!["in_progress".to_string()],
        }
    }
}

/// Storage location overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub database_path: Option<PathBuf>,
    pub ephemeral_dir: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Maximum number of log files to keep
    pub max_files: usize,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            max_files: 5,
        }
    }
}

impl ResolvedSettings {
    /// Resolve settings for a project from the default file locations.
    pub fn resolve(project_dir: Option<&Path>) -> Self {
        let global = Self::global_settings_path();
        let project = project_dir.map(Self::project_settings_path);
        Self::resolve_from(Some(&global), project.as_deref())
    }

    /// Resolve settings from explicit file locations.
    ///
    /// Missing or malformed files count as empty layers.
    pub fn resolve_from(global: Option<&Path>, project: Option<&Path>) -> Self {
        let global_layer = global.map(read_layer).unwrap_or(Value::Null);
        let project_layer = project.map(read_layer).unwrap_or(Value::Null);
        Self::from_layers(&global_layer, &project_layer)
    }

    /// Overlay `project` over `global` over the built-in defaults.
    ///
    /// If the merged document has a field of the wrong type, the project
    /// layer is dropped first and then the global one, so a bad file never
    /// takes the engine down.
    pub fn from_layers(global: &Value, project: &Value) -> Self {
        let mut merged = Value::Object(Map::new());
        overlay(&mut merged, global);
        overlay(&mut merged, project);

        match serde_json::from_value::<ResolvedSettings>(merged) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid merged settings, ignoring project layer");
                let mut fallback = Value::Object(Map::new());
                overlay(&mut fallback, global);
                serde_json::from_value(fallback).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Invalid global settings, using defaults");
                    ResolvedSettings::default()
                })
            }
        }
    }

    /// Returns the global settings file path
    ///
    /// `$XDG_CONFIG_HOME/contextlog/settings.json`
    pub fn global_settings_path() -> PathBuf {
        xdg_config_home().join("contextlog").join("settings.json")
    }

    /// Returns the project settings file path
    pub fn project_settings_path(project_dir: &Path) -> PathBuf {
        project_dir.join(".claude").join("contextlog.json")
    }
}

/// Read one settings layer; absent or unparsable files yield `Null`.
fn read_layer(path: &Path) -> Value {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Value::Null,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read settings");
            return Value::Null;
        }
    };

    match serde_json::from_str::<Value>(&content) {
        Ok(v @ Value::Object(_)) => v,
        Ok(_) => {
            tracing::warn!(path = %path.display(), "Settings root is not an object, ignoring");
            Value::Null
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to parse settings");
            Value::Null
        }
    }
}

/// Deep-merge `layer` into `base`. Objects merge key-wise; everything else replaces.
fn overlay(base: &mut Value, layer: &Value) {
    match (base, layer) {
        (Value::Object(base_map), Value::Object(layer_map)) => {
            for (key, value) in layer_map {
                let nested = value.is_object() && base_map.get(key).is_some_and(Value::is_object);
                match base_map.get_mut(key) {
                    Some(existing) if nested => overlay(existing, value),
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (base, layer) => *base = layer.clone(),
    }
}

/// Set one dotted key (e.g. `cleanup_policy.retention_cycles`) in a settings file.
///
/// Intermediate objects are created as needed. The file is replaced
/// atomically so concurrent hook invocations never observe a torn write.
pub fn set_value(path: &Path, dotted_key: &str, value: Value) -> Result<()> {
    let mut doc = match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str::<Value>(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Object(Map::new()),
        Err(e) => return Err(e.into()),
    };

    let keys: Vec<&str> = dotted_key.split('.').filter(|k| !k.is_empty()).collect();
    let Some((last, parents)) = keys.split_last() else {
        return Err(Error::Config(format!("invalid settings key: {:?}", dotted_key)));
    };

    let mut cursor = &mut doc;
    for key in parents {
        let map = cursor
            .as_object_mut()
            .ok_or_else(|| Error::Config(format!("{} is not an object", key)))?;
        cursor = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    cursor
        .as_object_mut()
        .ok_or_else(|| Error::Config(format!("parent of {} is not an object", last)))?
        .insert(last.to_string(), value);

    write_atomic(path, serde_json::to_string_pretty(&doc)?.as_bytes())
}

/// Write a file via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Filesystem locations used by one invocation
#[derive(Debug, Clone)]
pub struct EnginePaths {
    /// SQLite database holding committed cycles
    pub database: PathBuf,
    /// Root of the per-session ephemeral tool logs
    pub ephemeral_root: PathBuf,
}

impl EnginePaths {
    /// Default locations, honouring storage overrides from settings
    pub fn resolve(settings: &ResolvedSettings) -> Self {
        Self {
            database: settings
                .storage
                .database_path
                .clone()
                .unwrap_or_else(Self::database_path),
            ephemeral_root: settings
                .storage
                .ephemeral_dir
                .clone()
                .unwrap_or_else(|| Self::data_dir().join("ephemeral")),
        }
    }

    /// Returns the data directory path
    ///
    /// `$XDG_DATA_HOME/contextlog/` (~/.local/share/contextlog/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("contextlog")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/contextlog/` (~/.local/state/contextlog/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("contextlog")
    }

    /// Returns the default database file path
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("changelog.db")
    }
}

/// Pick the project directory for an invocation.
///
/// The payload's `cwd` wins, then `CLAUDE_PROJECT_DIR`, then the process
/// working directory.
pub fn project_dir(payload_cwd: Option<&str>) -> Option<PathBuf> {
    payload_cwd
        .filter(|c| !c.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("CLAUDE_PROJECT_DIR").map(PathBuf::from))
        .or_else(|| std::env::current_dir().ok())
}
