//! Transcript discovery and the watcher collection
//!
//! The manager owns one `TranscriptWatcher` per conversation log, keyed by
//! path, plus a pane -> transcript index. Discovery walks tmux's pane list
//! and attaches a watcher (starting at end-of-file) for every pane whose
//! working directory holds a Claude conversation log. Watchers attached
//! from persisted message-state instead pre-scan the file once so stale
//! notifications can be recognised as handled.

pub mod watcher;

use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::msgstate::MessageState;
use crate::paths::{decode_cwd_from_transcript, Paths};
use crate::tmux::Multiplexer;
use watcher::{
    scan_existing_results, ActivityInfo, CompactionEvent, IdleEvent, PendingTool,
    TranscriptWatcher,
};

/// Combined events from all watchers for one tick
#[derive(Debug, Default)]
pub struct Batch {
    pub tools: Vec<PendingTool>,
    pub compactions: Vec<CompactionEvent>,
    pub idles: Vec<IdleEvent>,
    pub activity: Vec<ActivityInfo>,
}

/// Manages multiple transcript watchers
#[derive(Debug, Default)]
pub struct TranscriptManager {
    watchers: HashMap<PathBuf, TranscriptWatcher>,
    pane_to_transcript: HashMap<String, PathBuf>,
}

impl TranscriptManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find active transcripts from panes running Claude.
    ///
    /// For each pane, the newest `*.jsonl` under the cwd's transcript dir is
    /// the live conversation. New watchers start at end-of-file so restart
    /// does not replay backlog.
    pub fn discover(&mut self, mux: &dyn Multiplexer, paths: &Paths) {
        let panes = match mux.list_panes() {
            Ok(panes) => panes,
            Err(e) => {
                tracing::debug!(error = %e, "Pane listing failed during discovery");
                return;
            }
        };

        for info in panes {
            let Some(transcript) = newest_transcript(&paths.transcript_dir(&info.cwd)) else {
                continue;
            };
            if !self.watchers.contains_key(&transcript) {
                tracing::info!(
                    transcript = %transcript.display(),
                    pane = %info.pane,
                    cwd = %info.cwd.display(),
                    "Watching transcript"
                );
                self.watchers.insert(
                    transcript.clone(),
                    TranscriptWatcher::at_end(transcript.clone(), info.pane.clone(), info.cwd.clone()),
                );
            }
            self.pane_to_transcript.insert(info.pane, transcript);
        }
    }

    /// Add watchers for transcripts referenced by persisted message-state.
    ///
    /// These pre-scan the file for existing tool_results so notifications
    /// whose tool already completed can be expired instead of re-answered.
    pub fn attach_from_state(&mut self, state: &MessageState) {
        for (_, entry) in state.iter() {
            let Some(transcript) = entry.transcript_path() else {
                continue;
            };
            if self.watchers.contains_key(transcript) || !transcript.exists() {
                continue;
            }
            let cwd = if entry.cwd.as_os_str().is_empty() {
                decode_cwd_from_transcript(transcript).unwrap_or_default()
            } else {
                entry.cwd.clone()
            };

            let existing = scan_existing_results(transcript);
            tracing::info!(
                transcript = %transcript.display(),
                pane = %entry.pane,
                existing_results = existing.len(),
                "Watching transcript (from state)"
            );
            let mut watcher = TranscriptWatcher::at_end(
                transcript.to_path_buf(),
                entry.pane.clone(),
                cwd,
            );
            watcher.tool_results = existing;
            self.pane_to_transcript.insert(entry.pane.clone(), transcript.to_path_buf());
            self.watchers.insert(transcript.to_path_buf(), watcher);
        }
    }

    /// Remove watchers for panes that no longer exist.
    pub fn cleanup_dead(&mut self, mux: &dyn Multiplexer) {
        let dead: Vec<PathBuf> = self
            .watchers
            .iter()
            .filter(|(_, w)| !mux.pane_exists(&w.pane))
            .map(|(path, _)| path.clone())
            .collect();
        for path in dead {
            if let Some(watcher) = self.watchers.remove(&path) {
                self.pane_to_transcript.remove(&watcher.pane);
                tracing::info!(transcript = %path.display(), pane = %watcher.pane, "Stopped watching (pane dead)");
            }
        }
    }

    /// Check all watchers, merging their events.
    pub fn check_all(&mut self, now: f64) -> Batch {
        let mut batch = Batch::default();
        for watcher in self.watchers.values_mut() {
            let result = watcher.check(now);
            batch.tools.extend(result.ready_tools);
            batch.compactions.extend(result.compactions);
            batch.idles.extend(result.idle_events);
            if result.had_activity {
                batch.activity.push(ActivityInfo {
                    pane: watcher.pane.clone(),
                    cwd: watcher.cwd.clone(),
                });
            }
        }
        batch
    }

    pub fn watcher_for(&self, transcript: &Path) -> Option<&TranscriptWatcher> {
        self.watchers.get(transcript)
    }

    /// Has any watcher seen a tool_use inside this assistant message?
    pub fn message_has_tool_use(&self, claude_msg_id: &str) -> bool {
        self.watchers.values().any(|w| w.tool_use_msg_ids.contains(claude_msg_id))
    }

    pub fn panes(&self) -> impl Iterator<Item = &str> {
        self.pane_to_transcript.keys().map(String::as_str)
    }
}

/// Newest `*.jsonl` in a transcript directory by mtime
fn newest_transcript(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
        .max_by_key(|p| {
            std::fs::metadata(p)
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        })
}

/// Does this tool_use already have a tool_result in the transcript?
///
/// Used on button presses to catch out-of-band approvals via the TUI.
pub fn tool_already_handled(transcript: &Path, tool_use_id: &str) -> bool {
    let Ok(data) = std::fs::read_to_string(transcript) else {
        return false;
    };
    data.lines().any(|line| {
        line.contains(tool_use_id) && line.contains("\"tool_result\"")
    })
}

/// First pending tool_use (no corresponding tool_result) in a transcript.
///
/// Replies to tracked messages use this to decide between the
/// permission-dialog text path and plain input.
pub fn pending_tool_in_transcript(transcript: &Path) -> Option<String> {
    let data = std::fs::read_to_string(transcript).ok()?;
    let mut uses: Vec<String> = Vec::new();
    let mut results: std::collections::HashSet<String> = std::collections::HashSet::new();
    for line in data.lines() {
        let Ok(entry) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let content = entry.pointer("/message/content").and_then(Value::as_array);
        for block in content.into_iter().flatten() {
            match block.get("type").and_then(Value::as_str) {
                Some("tool_use") => {
                    if let Some(id) = block.get("id").and_then(Value::as_str) {
                        uses.push(id.to_string());
                    }
                }
                Some("tool_result") => {
                    if let Some(id) = block.get("tool_use_id").and_then(Value::as_str) {
                        results.insert(id.to_string());
                    }
                }
                _ => {}
            }
        }
    }
    uses.into_iter().find(|id| !results.contains(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::testmux::FakeMux;
    use std::io::Write;

    fn write_transcript(dir: &Path, name: &str, lines: &[String]) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        path
    }

    fn tool_use(tool_id: &str) -> String {
        serde_json::json!({
            "type": "assistant",
            "message": {"id": "m1", "content": [
                {"type": "tool_use", "id": tool_id, "name": "Bash", "input": {"command": "ls"}}
            ]}
        })
        .to_string()
    }

    fn tool_result(tool_id: &str) -> String {
        serde_json::json!({
            "type": "user",
            "message": {"content": [{"type": "tool_result", "tool_use_id": tool_id}]}
        })
        .to_string()
    }

    #[test]
    fn test_discover_attaches_at_end() {
        let home = tempfile::tempdir().unwrap();
        let paths = Paths::rooted_at(home.path(), home.path());
        let cwd = home.path().join("proj");
        std::fs::create_dir_all(&cwd).unwrap();
        write_transcript(&paths.transcript_dir(&cwd), "s1.jsonl", &[tool_use("t_old")]);

        let mux = FakeMux::new();
        mux.add_pane("%1", cwd.to_str().unwrap());

        let mut mgr = TranscriptManager::new();
        mgr.discover(&mux, &paths);
        assert_eq!(mgr.panes().count(), 1);

        // Backlog is not replayed
        let batch = mgr.check_all(100.0);
        assert!(batch.tools.is_empty());
    }

    #[test]
    fn test_discover_ignores_panes_without_transcripts() {
        let home = tempfile::tempdir().unwrap();
        let paths = Paths::rooted_at(home.path(), home.path());
        let mux = FakeMux::new();
        mux.add_pane("%1", "/nowhere/special");

        let mut mgr = TranscriptManager::new();
        mgr.discover(&mux, &paths);
        assert_eq!(mgr.panes().count(), 0);
    }

    #[test]
    fn test_cleanup_dead_panes() {
        let home = tempfile::tempdir().unwrap();
        let paths = Paths::rooted_at(home.path(), home.path());
        let cwd = home.path().join("proj");
        std::fs::create_dir_all(&cwd).unwrap();
        write_transcript(&paths.transcript_dir(&cwd), "s1.jsonl", &[]);

        let mux = FakeMux::new();
        mux.add_pane("%1", cwd.to_str().unwrap());
        let mut mgr = TranscriptManager::new();
        mgr.discover(&mux, &paths);
        assert_eq!(mgr.panes().count(), 1);

        // Pane vanishes
        mux.panes.lock().unwrap().clear();
        mgr.cleanup_dead(&mux);
        assert_eq!(mgr.panes().count(), 0);
    }

    #[test]
    fn test_tool_already_handled() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_transcript(
            dir.path(),
            "s.jsonl",
            &[tool_use("toolu_01"), tool_result("toolu_01"), tool_use("toolu_02")],
        );
        assert!(tool_already_handled(&path, "toolu_01"));
        assert!(!tool_already_handled(&path, "toolu_02"));
    }

    #[test]
    fn test_pending_tool_in_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_transcript(
            dir.path(),
            "s.jsonl",
            &[tool_use("toolu_01"), tool_result("toolu_01"), tool_use("toolu_02")],
        );
        assert_eq!(pending_tool_in_transcript(&path), Some("toolu_02".to_string()));

        let done = write_transcript(
            dir.path(),
            "done.jsonl",
            &[tool_use("toolu_01"), tool_result("toolu_01")],
        );
        assert_eq!(pending_tool_in_transcript(&done), None);
    }
}
