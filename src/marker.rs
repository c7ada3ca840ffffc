//! Per-task marker files
//!
//! A marker lives at `<task-dir>/.claude/army.json` and is the ground truth
//! for registry rebuilds. Two forms:
//! - completed: `{name, flavor, topic_id, created_at, [repo]}` written after
//!   the topic exists and the welcome message went out
//! - pending: `{pending_topic_name, pending_since}` written *before* topic
//!   creation, so a crash mid-spawn leaves evidence for the operator
//!
//! A malformed marker is surfaced as an error and never auto-repaired.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{ArmyError, Result};
use crate::paths::Paths;
use crate::registry::{Flavor, TaskStatus};
use crate::store::write_json_atomic;

/// Marker document, matched by shape (untagged)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Marker {
    /// A fully-created task
    Completed {
        name: String,
        flavor: Flavor,
        topic_id: i64,
        created_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repo: Option<PathBuf>,
        /// Recorded on pause/resume so recovery restores the right state
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<TaskStatus>,
    },
    /// A task caught mid-spawn by a crash
    Pending {
        pending_topic_name: String,
        pending_since: f64,
    },
}

impl Marker {
    pub fn is_pending(&self) -> bool {
        matches!(self, Marker::Pending { .. })
    }
}

/// Read the marker for a task directory.
///
/// `Ok(None)` for no marker; `MarkerCorrupt` for a marker that exists but
/// does not parse. Corrupt markers are never auto-repaired.
pub fn read_marker(task_dir: &Path) -> Result<Option<Marker>> {
    let path = Paths::marker_file(task_dir);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|_| ArmyError::MarkerCorrupt(path))
}

/// Write (or overwrite) the marker for a task directory.
pub fn write_marker(task_dir: &Path, marker: &Marker) -> Result<()> {
    write_json_atomic(&Paths::marker_file(task_dir), marker)
}

/// Remove a marker (session-flavor cleanup keeps the directory).
pub fn remove_marker(task_dir: &Path) -> Result<()> {
    let path = Paths::marker_file(task_dir);
    if path.exists() {
        fs::remove_file(&path)?;
    }
    Ok(())
}
