//! Retention of ephemeral tool logs
//!
//! Two passes, both run after aggregation:
//!
//! - **Window**: committed log directories of cycles outside the N most
//!   recently committed cycles are deleted. Only `committed/` is touched, so
//!   logs that have not reached the store are never removed here.
//! - **Orphan sweep**: any ephemeral directory whose newest file is older
//!   than the age limit is deleted, covering sessions abandoned by crashed
//!   processes. The invoking session's active and pending logs are exempt,
//!   and a sealed `pending/` cycle is only swept once its row is in the store.

use crate::config::CleanupPolicy;
use crate::db::Database;
use crate::error::Result;
use crate::aggregate::read_manifest;
use crate::recorder::{subdirs, EphemeralLayout};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::path::Path;

/// What a retention pass deleted
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetentionReport {
    /// Committed cycle directories outside the retention window
    pub expired_cycles: usize,
    /// Directories removed by the age sweep
    pub orphans: usize,
}

pub struct RetentionManager<'a> {
    layout: &'a EphemeralLayout,
    policy: &'a CleanupPolicy,
}

impl<'a> RetentionManager<'a> {
    pub fn new(layout: &'a EphemeralLayout, policy: &'a CleanupPolicy) -> Self {
        Self { layout, policy }
    }

    /// Apply both passes. `current_session` is the session whose hook is running.
    pub fn apply(
        &self,
        db: &Database,
        current_session: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RetentionReport> {
        let keep: HashSet<i64> = db
            .committed_cycle_ids()?
            .into_iter()
            .take(self.policy.retention_cycles as usize)
            .collect();

        let mut report = RetentionReport::default();
        let max_age = Duration::hours(self.policy.orphan_max_age_hours as i64);
        let exempt = current_session.map(|s| self.layout.session_dir(s));

        for session_dir in self.layout.sessions() {
            let Some(session_id) = session_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let removed_before = report.orphans + report.expired_cycles;
            for dir in subdirs(&self.layout.committed_root(session_id)) {
                let expired = dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.parse::<i64>().ok())
                    .is_some_and(|id| !keep.contains(&id));
                if expired {
                    remove_dir(&dir, &mut report.expired_cycles);
                }
            }

            let is_current = exempt.as_deref() == Some(session_dir.as_path());
            let mut candidates = subdirs(&self.layout.committed_root(session_id));
            if !is_current {
                candidates.push(self.layout.active_dir(session_id));
                for dir in subdirs(&self.layout.pending_root(session_id)) {
                    if is_committed(db, &dir)? {
                        candidates.push(dir);
                    } else {
                        tracing::debug!(dir = %dir.display(), "Keeping uncommitted cycle logs");
                    }
                }
            }

            for dir in candidates {
                if newest_mtime(&dir).is_some_and(|t| now - t > max_age) {
                    remove_dir(&dir, &mut report.orphans);
                }
            }

            // A live session may be about to append into an empty active/
            if !is_current && report.orphans + report.expired_cycles > removed_before {
                remove_if_empty(&session_dir);
            }
        }

        if report != RetentionReport::default() {
            tracing::info!(
                expired_cycles = report.expired_cycles,
                orphans = report.orphans,
                "Removed ephemeral logs"
            );
        }
        Ok(report)
    }
}

/// Whether a sealed cycle directory's marker already has a row in the store
fn is_committed(db: &Database, dir: &Path) -> Result<bool> {
    match read_manifest(dir) {
        Ok(manifest) => Ok(db
            .find_cycle(&manifest.session_id, &manifest.generation_marker)?
            .is_some()),
        Err(_) => Ok(false),
    }
}

fn remove_dir(dir: &Path, counter: &mut usize) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => *counter += 1,
        Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove ephemeral logs"),
    }
}

/// Remove a session directory and its layout subdirectories once nothing is left.
fn remove_if_empty(session_dir: &Path) {
    for child in subdirs(session_dir) {
        let _ = std::fs::remove_dir(child);
    }
    let _ = std::fs::remove_dir(session_dir);
}

/// Most recent modification time of a directory or any file directly inside it
fn newest_mtime(dir: &Path) -> Option<DateTime<Utc>> {
    let own = std::fs::metadata(dir).and_then(|m| m.modified()).ok()?;
    let files = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter_map(|e| e.metadata().and_then(|m| m.modified()).ok());
    files
        .chain(std::iter::once(own))
        .max()
        .map(DateTime::<Utc>::from)
}
