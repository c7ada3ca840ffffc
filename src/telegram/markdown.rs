//! Markdown formatting, tool-permission rendering, and message splitting
//!
//! Telegram's Markdown parser is strict: unbalanced `_`/`*`/`[`/`]` in
//! plain text makes sendMessage fail, and messages over 4096 characters are
//! rejected outright. The helpers here escape user-visible text, render a
//! permission prompt per tool kind, and split long messages on line
//! boundaries while keeping code fences balanced across parts.

use serde_json::Value;
use std::path::Path;

use crate::paths::Paths;

/// Telegram's hard per-message length limit
pub const MESSAGE_LIMIT: usize = 4096;

/// Room reserved per part for the `(i/N) ` prefix and a fence re-open line
const SPLIT_RESERVE: usize = 96;

/// Escape Telegram markdown special characters in plain text.
///
/// Triple backticks are escaped to prevent code block issues; single
/// backticks are left alone.
pub fn escape_markdown(text: &str) -> String {
    let mut out = text.replace("```", "\\`\\`\\`");
    for ch in ['_', '*', '[', ']'] {
        out = out.replace(ch, &format!("\\{ch}"));
    }
    out
}

/// Neutralize embedded fences so tool payloads can sit inside one
fn defang_fences(text: &str) -> String {
    text.replace("```", "'''")
}

/// Format a tool call for a permission prompt, per tool kind.
pub fn format_tool_permission(paths: &Paths, tool_name: &str, tool_input: &Value) -> String {
    let str_field = |key: &str| tool_input.get(key).and_then(Value::as_str).unwrap_or("");
    let short_path = |key: &str| paths.strip_home(Path::new(str_field(key)));

    match tool_name {
        "Bash" => {
            let cmd = defang_fences(str_field("command"));
            let desc = str_field("description");
            let desc_line = if desc.is_empty() {
                String::new()
            } else {
                // Keep underscores readable inside the italic span
                format!("\n\n_{}_", escape_markdown(desc).replace("\\_", "_"))
            };
            format!("Claude is asking permission to run:\n\n```bash\n{cmd}\n```{desc_line}")
        }
        "Edit" => {
            let fp = short_path("file_path");
            let old = str_field("old_string");
            let new = str_field("new_string");
            let diff = defang_fences(&unified_diff(&fp, old, new));
            format!("Claude is asking permission to edit `{fp}`:\n\n```diff\n{diff}\n```")
        }
        "Write" => {
            let fp = short_path("file_path");
            let content = defang_fences(str_field("content"));
            format!("Claude is asking permission to write `{fp}`:\n\n```\n{content}\n```")
        }
        "Read" => {
            format!("Claude is asking permission to read `{}`", short_path("file_path"))
        }
        "AskUserQuestion" => {
            let mut lines = vec!["Claude is asking:\n".to_string()];
            let questions = tool_input
                .get("questions")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for q in &questions {
                let question = q.get("question").and_then(Value::as_str).unwrap_or("");
                let question = escape_markdown(question)
                    .replace("\\_", "_")
                    .replace("\\*", "*");
                lines.push(format!("*{question}*\n"));
                for opt in q.get("options").and_then(Value::as_array).into_iter().flatten() {
                    let label = opt.get("label").and_then(Value::as_str).unwrap_or("");
                    lines.push(format!("\u{2022} {}", escape_markdown(label)));
                }
            }
            lines.join("\n")
        }
        _ => {
            let input = serde_json::to_string_pretty(tool_input).unwrap_or_default();
            format!(
                "Claude is asking permission to use {tool_name}:\n\n```\n{}\n```",
                defang_fences(&input)
            )
        }
    }
}

/// Full-context unified diff for Edit prompts
fn unified_diff(file_path: &str, old: &str, new: &str) -> String {
    similar::TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(9999)
        .header(file_path, file_path)
        .to_string()
        .trim_end()
        .to_string()
}

/// State of code fencing at a line boundary
#[derive(Debug, Clone, Default, PartialEq)]
struct FenceState {
    open: bool,
    /// Info string of the open fence ("bash", "diff", "")
    lang: String,
}

impl FenceState {
    fn observe(&mut self, line: &str) {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("```") {
            if self.open {
                self.open = false;
                self.lang.clear();
            } else {
                self.open = true;
                self.lang = rest.trim().to_string();
            }
        }
    }
}

/// Split a message into Telegram-sized parts.
///
/// Parts carry `(i/N) ` prefixes; an open code fence is closed before a
/// part boundary and re-opened with the same info string on the next part;
/// callers attach buttons only to the last part.
pub fn split_message(text: &str) -> Vec<String> {
    if text.len() <= MESSAGE_LIMIT {
        return vec![text.to_string()];
    }

    let budget = MESSAGE_LIMIT - SPLIT_RESERVE;
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut fence = FenceState::default();
    // Fence state at the start of the current chunk (for re-opening)
    let mut chunk_opening: Option<String> = None;

    let mut flush = |current: &mut String, fence: &FenceState, chunk_opening: &mut Option<String>| {
        if current.is_empty() {
            return;
        }
        let mut chunk = String::new();
        if let Some(lang) = chunk_opening.take() {
            chunk.push_str(&format!("```{lang}\n"));
        }
        chunk.push_str(current);
        if fence.open {
            chunk.push_str("\n```");
            *chunk_opening = Some(fence.lang.clone());
        }
        chunks.push(chunk);
        current.clear();
    };

    for line in text.split('\n') {
        // +1 for the joining newline; +4 for a possible closing fence
        let projected = current.len() + line.len() + 1 + 4;
        if !current.is_empty() && projected > budget {
            flush(&mut current, &fence, &mut chunk_opening);
        }
        if !current.is_empty() {
            current.push('\n');
        }
        // A single line longer than the budget is hard-split on char
        // boundaries; this cannot happen for line-structured agent output
        if line.len() > budget {
            let mut rest = line;
            while rest.len() > budget {
                let split_at = (0..=budget).rev().find(|i| rest.is_char_boundary(*i)).unwrap_or(0);
                current.push_str(&rest[..split_at]);
                flush(&mut current, &fence, &mut chunk_opening);
                rest = &rest[split_at..];
            }
            current.push_str(rest);
        } else {
            current.push_str(line);
        }
        fence.observe(line);
    }
    flush(&mut current, &fence, &mut chunk_opening);

    let total = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| format!("({}/{total}) {chunk}", i + 1))
        .collect()
}
