//! Per-transcript tail-follower
//!
//! Watches one append-only JSONL conversation log and reconstructs the
//! semantic event stream: pending tool permissions, tool completions, idle
//! texts, compactions, and an activity flag.
//!
//! Two properties shape everything here:
//! - A tool whose `tool_result` arrives within `NOTIFY_DELAY` is never
//!   surfaced at all - config-auto-approved tools settle inside the window.
//! - Tool notifications are strictly FIFO per transcript and at most one is
//!   released per check; an announced tool blocks the queue until its
//!   result appears, matching the TUI's own presentation order.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Delay before notifying, allowing a tool_result to arrive for
/// auto-accepted tools. Compared strictly: a result landing exactly at the
/// boundary still suppresses the notification.
pub const NOTIFY_DELAY: f64 = 0.4;

/// Internal/auto-approved tools that never notify
pub const SKIP_TOOLS: &[&str] = &["BashOutput", "KillShell", "AgentOutputTool", "TodoWrite"];

/// A tool_use waiting for permission
#[derive(Debug, Clone)]
pub struct PendingTool {
    pub tool_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub assistant_text: String,
    pub transcript_path: PathBuf,
    pub pane: String,
    pub cwd: PathBuf,
    pub detected_at: f64,
}

/// A context compaction event
#[derive(Debug, Clone)]
pub struct CompactionEvent {
    /// "auto" or "manual"
    pub trigger: String,
    pub pre_tokens: u64,
    pub pane: String,
    pub cwd: PathBuf,
}

/// Claude finished speaking and is waiting for input
#[derive(Debug, Clone)]
pub struct IdleEvent {
    pub text: String,
    pub pane: String,
    pub cwd: PathBuf,
    pub transcript_path: PathBuf,
    /// Assistant message id, for supersession tracking
    pub msg_id: String,
}

/// Info about an active session (drives the typing indicator)
#[derive(Debug, Clone)]
pub struct ActivityInfo {
    pub pane: String,
    pub cwd: PathBuf,
}

/// Result of one watcher check
#[derive(Debug, Default)]
pub struct CheckResult {
    pub ready_tools: Vec<PendingTool>,
    pub compactions: Vec<CompactionEvent>,
    pub idle_events: Vec<IdleEvent>,
    pub had_activity: bool,
}

/// Watches a single transcript file for new entries
#[derive(Debug)]
pub struct TranscriptWatcher {
    pub path: PathBuf,
    pub pane: String,
    pub cwd: PathBuf,
    /// Byte offset of the first unconsumed line
    position: u64,
    /// Tool ids already announced to chat
    pub notified_tools: HashSet<String>,
    /// Tool ids whose result has been seen
    pub tool_results: HashSet<String>,
    /// Detected but not yet announced, keyed by tool id
    pending_tools: HashMap<String, PendingTool>,
    /// Detection order of tool ids (Claude batches tool calls)
    tool_queue: Vec<String>,
    /// Assistant message ids that contained at least one tool_use
    pub tool_use_msg_ids: HashSet<String>,
    /// Last assistant message announced as idle (dedup per message)
    last_idle_msg_id: String,
    compactions: Vec<CompactionEvent>,
    idle_events: Vec<IdleEvent>,
}

impl TranscriptWatcher {
    /// Start watching at the current end of file (no backlog replay).
    pub fn at_end(path: PathBuf, pane: String, cwd: PathBuf) -> Self {
        let position = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self::at_offset(path, pane, cwd, position)
    }

    pub fn at_offset(path: PathBuf, pane: String, cwd: PathBuf, position: u64) -> Self {
        Self {
            path,
            pane,
            cwd,
            position,
            notified_tools: HashSet::new(),
            tool_results: HashSet::new(),
            pending_tools: HashMap::new(),
            tool_queue: Vec::new(),
            tool_use_msg_ids: HashSet::new(),
            last_idle_msg_id: String::new(),
            compactions: Vec::new(),
            idle_events: Vec::new(),
        }
    }

    /// Check for new pending tools, compactions, idle events, and activity.
    ///
    /// `now` is epoch seconds; injected so tests control the delay window.
    pub fn check(&mut self, now: f64) -> CheckResult {
        let had_activity = self.read_new_lines(now);

        let compactions = std::mem::take(&mut self.compactions);
        let idle_events = std::mem::take(&mut self.idle_events);

        // Drop completed tools from queue, pending, and notified
        let results = &self.tool_results;
        self.tool_queue.retain(|id| !results.contains(id));
        self.pending_tools.retain(|id, _| !results.contains(id));
        self.notified_tools.retain(|id| !results.contains(id));

        // Head-of-line release: walk the queue in order; an already-notified
        // tool without a result blocks everything behind it, and at most one
        // tool is released per check so chat order matches TUI order.
        let mut ready_tools = Vec::new();
        for tool_id in self.tool_queue.clone() {
            if self.tool_results.contains(&tool_id) {
                continue;
            }
            if self.notified_tools.contains(&tool_id) {
                break;
            }
            let Some(tool) = self.pending_tools.get(&tool_id) else {
                continue;
            };
            if now - tool.detected_at > NOTIFY_DELAY {
                self.notified_tools.insert(tool_id.clone());
                if let Some(tool) = self.pending_tools.remove(&tool_id) {
                    ready_tools.push(tool);
                }
            }
            break;
        }

        CheckResult { ready_tools, compactions, idle_events, had_activity }
    }

    /// Read and process complete lines past the stored offset.
    ///
    /// The offset only ever advances past newline-terminated lines, so a
    /// partially-written trailing line is re-read on the next tick.
    fn read_new_lines(&mut self, now: f64) -> bool {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return false, // rotated or not yet created
        };
        if file.seek(SeekFrom::Start(self.position)).is_err() {
            return false;
        }
        let mut buf = Vec::new();
        if let Err(e) = file.read_to_end(&mut buf) {
            tracing::warn!(path = %self.path.display(), error = %e, "Transcript read failed");
            return false;
        }

        let mut had_activity = false;
        let mut consumed = 0usize;
        while let Some(nl) = buf[consumed..].iter().position(|&b| b == b'\n') {
            let line = &buf[consumed..consumed + nl];
            if let Ok(text) = std::str::from_utf8(line) {
                self.process_line(text, now);
            }
            consumed += nl + 1;
            had_activity = true;
        }
        self.position += consumed as u64;
        had_activity
    }

    fn process_line(&mut self, line: &str, now: f64) {
        let entry: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                // Terminated but unparseable: corruption, skip it
                tracing::warn!(path = %self.path.display(), "Skipping malformed transcript line");
                return;
            }
        };

        if self.handle_compaction(&entry) {
            return;
        }
        if self.handle_tool_result(&entry) {
            return;
        }
        if entry.get("type").and_then(Value::as_str) != Some("assistant") {
            return;
        }

        let message = entry.get("message").cloned().unwrap_or_default();
        let msg_id = message.get("id").and_then(Value::as_str).unwrap_or("").to_string();

        let mut assistant_text = String::new();
        let mut tool_calls: Vec<Value> = Vec::new();
        let mut has_thinking = false;
        for block in message.get("content").and_then(Value::as_array).into_iter().flatten() {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    assistant_text =
                        block.get("text").and_then(Value::as_str).unwrap_or("").to_string();
                }
                Some("tool_use") => tool_calls.push(block.clone()),
                Some("thinking") => has_thinking = true,
                _ => {}
            }
        }

        // Thinking-only message: actively working, nothing to announce
        if has_thinking && tool_calls.is_empty() && assistant_text.is_empty() {
            return;
        }

        if !tool_calls.is_empty() && !msg_id.is_empty() {
            self.tool_use_msg_ids.insert(msg_id.clone());
            if self.last_idle_msg_id == msg_id {
                self.last_idle_msg_id.clear();
            }
        }

        // Idle: assistant text with no tool_use, announced once per message
        if !assistant_text.is_empty() && tool_calls.is_empty() && !msg_id.is_empty() {
            if msg_id != self.last_idle_msg_id {
                tracing::debug!(pane = %self.pane, "Detected: idle (text-only message)");
                self.idle_events.push(IdleEvent {
                    text: assistant_text,
                    pane: self.pane.clone(),
                    cwd: self.cwd.clone(),
                    transcript_path: self.path.clone(),
                    msg_id: msg_id.clone(),
                });
                self.last_idle_msg_id = msg_id;
            }
            return;
        }

        // Queue each tool_use in order (the TUI shows them sequentially)
        for call in tool_calls {
            let tool_id = call.get("id").and_then(Value::as_str).unwrap_or("").to_string();
            let tool_name = call.get("name").and_then(Value::as_str).unwrap_or("").to_string();
            if SKIP_TOOLS.contains(&tool_name.as_str()) {
                continue;
            }
            if tool_id.is_empty()
                || self.notified_tools.contains(&tool_id)
                || self.tool_results.contains(&tool_id)
                || self.pending_tools.contains_key(&tool_id)
            {
                continue;
            }

            tracing::debug!(pane = %self.pane, tool = %tool_name, "Detected tool_use");
            self.tool_queue.push(tool_id.clone());
            self.pending_tools.insert(
                tool_id.clone(),
                PendingTool {
                    tool_id,
                    tool_name,
                    tool_input: call.get("input").cloned().unwrap_or_default(),
                    assistant_text: assistant_text.clone(),
                    transcript_path: self.path.clone(),
                    pane: self.pane.clone(),
                    cwd: self.cwd.clone(),
                    detected_at: now,
                },
            );
        }
    }

    fn handle_compaction(&mut self, entry: &Value) -> bool {
        if entry.get("type").and_then(Value::as_str) != Some("system")
            || entry.get("subtype").and_then(Value::as_str) != Some("compact_boundary")
        {
            return false;
        }
        let metadata = entry.get("compactMetadata").cloned().unwrap_or_default();
        let trigger = metadata
            .get("trigger")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        tracing::debug!(pane = %self.pane, trigger = %trigger, "Detected: compaction");
        self.compactions.push(CompactionEvent {
            trigger,
            pre_tokens: metadata.get("preTokens").and_then(Value::as_u64).unwrap_or(0),
            pane: self.pane.clone(),
            cwd: self.cwd.clone(),
        });
        true
    }

    fn handle_tool_result(&mut self, entry: &Value) -> bool {
        if entry.get("type").and_then(Value::as_str) != Some("user") {
            return false;
        }
        for block in entry
            .pointer("/message/content")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if block.get("type").and_then(Value::as_str) == Some("tool_result") {
                if let Some(id) = block.get("tool_use_id").and_then(Value::as_str) {
                    self.tool_results.insert(id.to_string());
                    self.notified_tools.remove(id);
                    self.pending_tools.remove(id);
                }
            }
        }
        true
    }
}

/// Scan a whole transcript for tool ids that already have results.
///
/// Used when attaching a watcher from persisted message-state, so
/// notifications whose tool completed while the daemon was down are
/// recognised as handled and expired.
pub fn scan_existing_results(path: &Path) -> HashSet<String> {
    let mut results = HashSet::new();
    let Ok(data) = std::fs::read_to_string(path) else {
        return results;
    };
    for line in data.lines() {
        let Ok(entry) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if entry.get("type").and_then(Value::as_str) != Some("user") {
            continue;
        }
        for block in entry
            .pointer("/message/content")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if block.get("type").and_then(Value::as_str) == Some("tool_result") {
                if let Some(id) = block.get("tool_use_id").and_then(Value::as_str) {
                    results.insert(id.to_string());
                }
            }
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn tool_use_line(msg_id: &str, tool_id: &str, name: &str, input: Value) -> String {
        serde_json::json!({
            "type": "assistant",
            "message": {
                "id": msg_id,
                "content": [{"type": "tool_use", "id": tool_id, "name": name, "input": input}]
            }
        })
        .to_string()
    }

    pub(crate) fn tool_result_line(tool_id: &str) -> String {
        serde_json::json!({
            "type": "user",
            "message": {"content": [{"type": "tool_result", "tool_use_id": tool_id}]}
        })
        .to_string()
    }

    fn text_line(msg_id: &str, text: &str) -> String {
        serde_json::json!({
            "type": "assistant",
            "message": {"id": msg_id, "content": [{"type": "text", "text": text}]}
        })
        .to_string()
    }

    fn watcher_over(lines: &[String]) -> (tempfile::TempDir, TranscriptWatcher) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        let mut f = File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        let watcher =
            TranscriptWatcher::at_offset(path, "%1".into(), PathBuf::from("/w/x"), 0);
        (dir, watcher)
    }

    fn append(watcher: &TranscriptWatcher, line: &str) {
        let mut f = std::fs::OpenOptions::new().append(true).open(&watcher.path).unwrap();
        writeln!(f, "{line}").unwrap();
    }

    #[test]
    fn test_tool_released_after_delay() {
        // Seed scenario 1: tool_use at t=0, no result, check at t=0.5
        let (_dir, mut watcher) = watcher_over(&[tool_use_line(
            "m1",
            "t_1",
            "Write",
            serde_json::json!({"file_path": "/x"}),
        )]);
        let early = watcher.check(0.0);
        assert!(early.ready_tools.is_empty(), "inside the delay window");

        let late = watcher.check(0.5);
        assert_eq!(late.ready_tools.len(), 1);
        assert_eq!(late.ready_tools[0].tool_id, "t_1");
        assert_eq!(late.ready_tools[0].tool_name, "Write");
    }

    #[test]
    fn test_quick_result_suppresses_notification() {
        // Seed scenario 2: result arrives before the delay elapses
        let (_dir, mut watcher) = watcher_over(&[tool_use_line(
            "m1",
            "t_1",
            "Write",
            serde_json::json!({"file_path": "/x"}),
        )]);
        watcher.check(0.0);
        append(&watcher, &tool_result_line("t_1"));

        let result = watcher.check(0.5);
        assert!(result.ready_tools.is_empty(), "no notification ever sent");
        let result = watcher.check(10.0);
        assert!(result.ready_tools.is_empty());
    }

    #[test]
    fn test_result_exactly_at_delay_suppresses() {
        // Boundary: comparison is strictly greater-than
        let (_dir, mut watcher) = watcher_over(&[tool_use_line(
            "m1",
            "t_1",
            "Bash",
            serde_json::json!({"command": "ls"}),
        )]);
        let result = watcher.check(NOTIFY_DELAY);
        assert!(result.ready_tools.is_empty());
    }

    #[test]
    fn test_head_of_line_ordering() {
        // Two batched tools: second never announced before the first's result
        let line = serde_json::json!({
            "type": "assistant",
            "message": {"id": "m1", "content": [
                {"type": "tool_use", "id": "t_1", "name": "Bash", "input": {"command": "a"}},
                {"type": "tool_use", "id": "t_2", "name": "Bash", "input": {"command": "b"}}
            ]}
        })
        .to_string();
        let (_dir, mut watcher) = watcher_over(&[line]);

        let first = watcher.check(1.0);
        assert_eq!(first.ready_tools.len(), 1);
        assert_eq!(first.ready_tools[0].tool_id, "t_1");

        // t_1 announced, no result yet: t_2 stays blocked
        let blocked = watcher.check(2.0);
        assert!(blocked.ready_tools.is_empty());

        append(&watcher, &tool_result_line("t_1"));
        let second = watcher.check(3.0);
        assert_eq!(second.ready_tools.len(), 1);
        assert_eq!(second.ready_tools[0].tool_id, "t_2");
    }

    #[test]
    fn test_skip_tools_never_queue() {
        let (_dir, mut watcher) = watcher_over(&[tool_use_line(
            "m1",
            "t_1",
            "TodoWrite",
            serde_json::json!({}),
        )]);
        let result = watcher.check(10.0);
        assert!(result.ready_tools.is_empty());
    }

    #[test]
    fn test_idle_event_once_per_message() {
        let (_dir, mut watcher) = watcher_over(&[text_line("m1", "All done, want tests?")]);
        let first = watcher.check(0.0);
        assert_eq!(first.idle_events.len(), 1);
        assert_eq!(first.idle_events[0].msg_id, "m1");
        assert_eq!(first.idle_events[0].text, "All done, want tests?");

        // Same message re-streamed (token-by-token rewrites) stays quiet
        append(&watcher, &text_line("m1", "All done, want tests?"));
        let again = watcher.check(1.0);
        assert!(again.idle_events.is_empty());

        append(&watcher, &text_line("m2", "Next question"));
        let next = watcher.check(2.0);
        assert_eq!(next.idle_events.len(), 1);
    }

    #[test]
    fn test_tool_use_marks_supersession_id() {
        let (_dir, mut watcher) = watcher_over(&[
            text_line("m1", "Let me check something"),
            tool_use_line("m1", "t_1", "Read", serde_json::json!({"file_path": "/x"})),
        ]);
        watcher.check(0.0);
        assert!(watcher.tool_use_msg_ids.contains("m1"));
    }

    #[test]
    fn test_compaction_event() {
        let line = serde_json::json!({
            "type": "system",
            "subtype": "compact_boundary",
            "compactMetadata": {"trigger": "auto", "preTokens": 123456}
        })
        .to_string();
        let (_dir, mut watcher) = watcher_over(&[line]);
        let result = watcher.check(0.0);
        assert_eq!(result.compactions.len(), 1);
        assert_eq!(result.compactions[0].trigger, "auto");
        assert_eq!(result.compactions[0].pre_tokens, 123_456);
    }

    #[test]
    fn test_partial_trailing_line_not_consumed() {
        let (_dir, mut watcher) = watcher_over(&[]);
        let mut f = std::fs::OpenOptions::new().append(true).open(&watcher.path).unwrap();
        // Complete line, then a partial write without newline
        writeln!(f, "{}", text_line("m1", "hello")).unwrap();
        write!(f, "{{\"type\": \"assist").unwrap();
        f.flush().unwrap();

        let first = watcher.check(0.0);
        assert_eq!(first.idle_events.len(), 1);
        let offset_after = watcher.position;

        // Complete the partial line; the watcher re-reads from line start
        write!(f, "ant\", \"message\": {{\"id\": \"m2\", \"content\": [{{\"type\": \"text\", \"text\": \"done\"}}]}}}}\n").unwrap();
        f.flush().unwrap();

        let second = watcher.check(1.0);
        assert_eq!(second.idle_events.len(), 1);
        assert_eq!(second.idle_events[0].msg_id, "m2");
        assert!(watcher.position > offset_after);
    }

    #[test]
    fn test_activity_flag_on_new_content() {
        let (_dir, mut watcher) = watcher_over(&[text_line("m1", "hi")]);
        assert!(watcher.check(0.0).had_activity);
        assert!(!watcher.check(1.0).had_activity);
    }

    #[test]
    fn test_scan_existing_results() {
        let (_dir, watcher) = watcher_over(&[
            tool_use_line("m1", "t_1", "Bash", serde_json::json!({"command": "ls"})),
            tool_result_line("t_1"),
            tool_use_line("m2", "t_2", "Bash", serde_json::json!({"command": "pwd"})),
        ]);
        let results = scan_existing_results(&watcher.path);
        assert!(results.contains("t_1"));
        assert!(!results.contains("t_2"));
    }

    #[test]
    fn test_at_end_skips_backlog() {
        let (_dir, watcher) = watcher_over(&[text_line("m1", "old")]);
        let mut fresh = TranscriptWatcher::at_end(
            watcher.path.clone(),
            "%1".into(),
            PathBuf::from("/w/x"),
        );
        let result = fresh.check(0.0);
        assert!(result.idle_events.is_empty());
        assert!(!result.had_activity);
    }
}
