//! Message state: what each outstanding Telegram message refers to
//!
//! Keyed by Telegram message id and persisted at
//! `/tmp/claude-army-state.json` so notifications survive daemon restarts.
//! Each entry is a tagged sum: a permission prompt awaiting a button press,
//! or an idle notice that may later be superseded by tool activity.
//!
//! Entries are created on notification, marked handled when a user responds
//! or the entry expires, and removed entirely when a quick tool completion
//! deletes the underlying chat message.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::Result;
use crate::store::write_json_atomic;

/// Wall-clock seconds since the Unix epoch.
///
/// Notification ages must survive restarts, so they are wall-clock rather
/// than `Instant`-based.
pub fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Variant-specific fields of a tracked message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    /// An Allow/Deny prompt for one tool_use
    PermissionPrompt {
        tool_use_id: String,
        tool_name: String,
        transcript_path: PathBuf,
    },
    /// A text-only assistant turn announced as "waiting for input"
    Idle {
        /// Assistant message id, used to detect supersession by tool_use
        claude_msg_id: String,
    },
}

/// One tracked Telegram message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub pane: String,
    pub cwd: PathBuf,
    pub notified_at: f64,
    #[serde(default)]
    pub handled: bool,
    #[serde(default)]
    pub superseded: bool,
    #[serde(flatten)]
    pub kind: EntryKind,
}

impl StateEntry {
    pub fn is_permission(&self) -> bool {
        matches!(self.kind, EntryKind::PermissionPrompt { .. })
    }

    pub fn tool_use_id(&self) -> Option<&str> {
        match &self.kind {
            EntryKind::PermissionPrompt { tool_use_id, .. } => Some(tool_use_id),
            EntryKind::Idle { .. } => None,
        }
    }

    pub fn transcript_path(&self) -> Option<&Path> {
        match &self.kind {
            EntryKind::PermissionPrompt { transcript_path, .. } => Some(transcript_path),
            EntryKind::Idle { .. } => None,
        }
    }
}

/// Persistent map of Telegram message id -> entry
#[derive(Debug)]
pub struct MessageState {
    path: PathBuf,
    entries: BTreeMap<i64, StateEntry>,
    dirty: bool,
}

impl MessageState {
    /// Load state from disk; unreadable state starts empty (it is runtime
    /// bookkeeping, not ground truth).
    pub fn load(path: PathBuf) -> Self {
        let entries = fs::read(&path)
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok())
            .unwrap_or_default();
        Self { path, entries, dirty: false }
    }

    pub fn get(&self, msg_id: i64) -> Option<&StateEntry> {
        self.entries.get(&msg_id)
    }

    pub fn insert(&mut self, msg_id: i64, entry: StateEntry) {
        self.entries.insert(msg_id, entry);
        self.dirty = true;
    }

    pub fn remove(&mut self, msg_id: i64) -> Option<StateEntry> {
        let removed = self.entries.remove(&msg_id);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn mark_handled(&mut self, msg_id: i64) {
        if let Some(entry) = self.entries.get_mut(&msg_id) {
            entry.handled = true;
            self.dirty = true;
        }
    }

    pub fn mark_superseded(&mut self, msg_id: i64) {
        if let Some(entry) = self.entries.get_mut(&msg_id) {
            entry.superseded = true;
            self.dirty = true;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, &StateEntry)> {
        self.entries.iter().map(|(id, e)| (*id, e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest tracked message id for a pane (any entry, handled or not)
    pub fn latest_for_pane(&self, pane: &str) -> Option<i64> {
        self.entries
            .iter()
            .filter(|(_, e)| e.pane == pane)
            .map(|(id, _)| *id)
            .max()
    }

    /// Unhandled permission prompts for a pane, excluding one message id
    pub fn other_unhandled_permissions(&self, pane: &str, except: i64) -> Vec<i64> {
        self.entries
            .iter()
            .filter(|(id, e)| {
                **id != except && e.pane == pane && e.is_permission() && !e.handled
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drop entries whose pane no longer exists. Returns removed count.
    pub fn retain_live_panes(&mut self, pane_alive: impl Fn(&str) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| pane_alive(&e.pane));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    /// Write to disk if anything changed since the last flush.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        write_json_atomic(&self.path, &self.entries)?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn permission_entry(pane: &str, tool_id: &str, notified_at: f64) -> StateEntry {
        StateEntry {
            pane: pane.into(),
            cwd: PathBuf::from("/w/x"),
            notified_at,
            handled: false,
            superseded: false,
            kind: EntryKind::PermissionPrompt {
                tool_use_id: tool_id.into(),
                tool_name: "Bash".into(),
                transcript_path: PathBuf::from("/t/x.jsonl"),
            },
        }
    }

    fn idle_entry(pane: &str, claude_msg_id: &str, notified_at: f64) -> StateEntry {
        StateEntry {
            pane: pane.into(),
            cwd: PathBuf::from("/w/x"),
            notified_at,
            handled: false,
            superseded: false,
            kind: EntryKind::Idle { claude_msg_id: claude_msg_id.into() },
        }
    }

    #[test]
    fn test_tagged_serialization() {
        let entry = permission_entry("%1", "toolu_01", 100.0);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "permission_prompt");
        assert_eq!(json["tool_use_id"], "toolu_01");

        let idle = idle_entry("%1", "msg_01", 100.0);
        let json = serde_json::to_value(&idle).unwrap();
        assert_eq!(json["type"], "idle");
        assert_eq!(json["claude_msg_id"], "msg_01");
    }

    #[test]
    fn test_persist_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut state = MessageState::load(path.clone());
        state.insert(100, permission_entry("%1", "toolu_01", 50.0));
        state.insert(101, idle_entry("%1", "msg_01", 60.0));
        state.flush().unwrap();

        let reloaded = MessageState::load(path);
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.get(100).unwrap().is_permission());
        assert_eq!(reloaded.get(101).unwrap().tool_use_id(), None);
    }

    #[test]
    fn test_latest_for_pane() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = MessageState::load(dir.path().join("state.json"));
        state.insert(100, permission_entry("%1", "t1", 1.0));
        state.insert(105, idle_entry("%1", "m1", 2.0));
        state.insert(103, permission_entry("%2", "t2", 3.0));
        assert_eq!(state.latest_for_pane("%1"), Some(105));
        assert_eq!(state.latest_for_pane("%2"), Some(103));
        assert_eq!(state.latest_for_pane("%9"), None);
    }

    #[test]
    fn test_other_unhandled_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = MessageState::load(dir.path().join("state.json"));
        state.insert(1, permission_entry("%1", "t1", 1.0));
        state.insert(2, permission_entry("%1", "t2", 2.0));
        state.insert(3, idle_entry("%1", "m1", 3.0));
        state.insert(4, permission_entry("%2", "t3", 4.0));
        state.mark_handled(2);

        let others = state.other_unhandled_permissions("%1", 99);
        assert_eq!(others, vec![1]);
    }

    #[test]
    fn test_retain_live_panes() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = MessageState::load(dir.path().join("state.json"));
        state.insert(1, permission_entry("%1", "t1", 1.0));
        state.insert(2, permission_entry("%2", "t2", 2.0));
        let removed = state.retain_live_panes(|p| p == "%1");
        assert_eq!(removed, 1);
        assert!(state.get(1).is_some());
        assert!(state.get(2).is_none());
    }

    #[test]
    fn test_flush_only_when_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut state = MessageState::load(path.clone());
        state.flush().unwrap();
        // Nothing was dirty, so nothing was written
        assert!(!path.exists());
        state.insert(1, permission_entry("%1", "t1", 1.0));
        state.flush().unwrap();
        assert!(path.exists());
    }
}
