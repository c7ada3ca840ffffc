//! Notification orchestration
//!
//! Every tick pulls events from the transcript watchers, routes them, and
//! runs the three time-window policies:
//! - completion window: a tool_result arriving quickly deletes the
//!   notification outright (it was noise); arriving slowly flips the
//!   buttons to "⏰ Expired" but leaves the message visible
//! - supersession window: the same split for idle notices overtaken by
//!   tool activity
//! - staleness: an unhandled non-permission entry older than a newer entry
//!   on the same pane expires; permission prompts are exempt because the
//!   agent legitimately queues several at once

use crate::app::App;
use crate::errors::Result;
use crate::msgstate::{EntryKind, MessageState, StateEntry};
use crate::telegram::markdown::{escape_markdown, format_tool_permission};
use crate::telegram::types::InlineKeyboardMarkup;
use crate::transcript::watcher::{CompactionEvent, IdleEvent, PendingTool};

/// A tool_result inside this window deletes the notification entirely
pub const QUICK_RESPONSE_SECS: f64 = 4.0;

/// Supersession inside this window deletes the idle notice
///
/// Shares a value with QUICK_RESPONSE_SECS today but expresses a different
/// property; keep them separately named.
pub const IDLE_SUPERSESSION_SECS: f64 = 4.0;

/// Dead-entry sweep interval
const CLEANUP_INTERVAL_SECS: f64 = 300.0;

/// Transcript discovery interval
const DISCOVER_INTERVAL_SECS: f64 = 30.0;

/// What to do with a notification whose tool completed
#[derive(Debug, PartialEq, Eq)]
pub enum WindowAction {
    /// Finished before the human could reasonably act: delete the message
    Delete,
    /// Already seen: keep it visible, disable the buttons
    Expire,
}

/// Two-branch policy shared by the completion and supersession windows.
/// The boundary lands on Expire: at exactly the threshold the user may
/// already be reading the message.
pub fn window_action(notified_at: f64, now: f64, threshold: f64) -> WindowAction {
    if now - notified_at < threshold {
        WindowAction::Delete
    } else {
        WindowAction::Expire
    }
}

/// Unhandled non-permission entries on `pane` older than its newest entry
pub fn stale_entries(state: &MessageState, pane: &str) -> Vec<i64> {
    let Some(latest) = state.latest_for_pane(pane) else {
        return Vec::new();
    };
    state
        .iter()
        .filter(|(id, e)| {
            *id < latest && e.pane == pane && !e.handled && !e.is_permission()
        })
        .map(|(id, _)| id)
        .collect()
}

impl App {
    /// One orchestration tick.
    pub async fn tick(&mut self, now: f64) -> Result<()> {
        if now - self.last_discover > DISCOVER_INTERVAL_SECS {
            let paths = self.paths.clone();
            self.transcripts.discover(self.mux.as_ref(), &paths);
            self.last_discover = now;
        }

        let batch = self.transcripts.check_all(now);

        if self.config.get().is_configured() {
            for tool in batch.tools {
                if let Err(e) = self.notify_tool(&tool, now).await {
                    tracing::warn!(tool = %tool.tool_name, error = %e, "Tool notification failed");
                }
            }
            for event in batch.compactions {
                if let Err(e) = self.notify_compaction(&event).await {
                    tracing::warn!(error = %e, "Compaction notification failed");
                }
            }
            for event in batch.idles {
                if let Err(e) = self.notify_idle(&event, now).await {
                    tracing::warn!(error = %e, "Idle notification failed");
                }
            }
            for info in batch.activity {
                let pane = info.pane.clone();
                if let Ok(dest) = self.route_event(&pane, &info.cwd).await {
                    let _ = self.tg.send_typing(dest).await;
                }
            }

            self.run_completion_window(now).await?;
            self.run_supersession_window(now).await?;
            self.expire_stale_entries().await?;
        }

        if now - self.last_cleanup > CLEANUP_INTERVAL_SECS {
            let removed = {
                let mux = &self.mux;
                self.msg_state.retain_live_panes(|pane| mux.pane_exists(pane))
            };
            if removed > 0 {
                tracing::info!(removed, "Cleaned dead message-state entries");
            }
            self.transcripts.cleanup_dead(self.mux.as_ref());
            self.last_cleanup = now;
        }

        self.msg_state.flush()
    }

    /// Send a permission notification with Allow/Deny buttons.
    async fn notify_tool(&mut self, tool: &PendingTool, now: f64) -> Result<()> {
        let dest = self.route_event(&tool.pane, &tool.cwd).await?;
        let project = self.paths.strip_home(&tool.cwd);
        let prefix = if tool.assistant_text.is_empty() {
            String::new()
        } else {
            format!("{}\n\n---\n\n", escape_markdown(&tool.assistant_text))
        };
        let tool_desc = format_tool_permission(&self.paths, &tool.tool_name, &tool.tool_input);
        let text = format!("`{project}`\n\n{prefix}{tool_desc}");

        let msg_id = self
            .tg
            .send_message(dest, &text, Some(&InlineKeyboardMarkup::allow_deny()), None)
            .await?;
        self.msg_state.insert(
            msg_id,
            StateEntry {
                pane: tool.pane.clone(),
                cwd: tool.cwd.clone(),
                notified_at: now,
                handled: false,
                superseded: false,
                kind: EntryKind::PermissionPrompt {
                    tool_use_id: tool.tool_id.clone(),
                    tool_name: tool.tool_name.clone(),
                    transcript_path: tool.transcript_path.clone(),
                },
            },
        );
        tracing::info!(tool = %tool.tool_name, msg_id, pane = %tool.pane, "Notified: permission prompt");
        Ok(())
    }

    /// Plain status line for a compaction, no buttons, no state entry.
    async fn notify_compaction(&mut self, event: &CompactionEvent) -> Result<()> {
        let dest = self.route_event(&event.pane, &event.cwd).await?;
        let project = self.paths.strip_home(&event.cwd);
        let text = format!(
            "`{project}`\n\n\u{1f504} Context compacted ({}, {} tokens)",
            event.trigger,
            group_thousands(event.pre_tokens)
        );
        self.tg.send_message(dest, &text, None, None).await?;
        tracing::info!(trigger = %event.trigger, "Notified: compaction");
        Ok(())
    }

    /// Idle notice carrying the assistant text; tracked for supersession.
    async fn notify_idle(&mut self, event: &IdleEvent, now: f64) -> Result<()> {
        let dest = self.route_event(&event.pane, &event.cwd).await?;
        let project = self.paths.strip_home(&event.cwd);
        let text = format!("`{project}`\n\n\u{1f4ac} {}", escape_markdown(&event.text));
        let msg_id = self.tg.send_message(dest, &text, None, None).await?;
        if !event.msg_id.is_empty() {
            self.msg_state.insert(
                msg_id,
                StateEntry {
                    pane: event.pane.clone(),
                    cwd: event.cwd.clone(),
                    notified_at: now,
                    handled: false,
                    superseded: false,
                    kind: EntryKind::Idle { claude_msg_id: event.msg_id.clone() },
                },
            );
        }
        tracing::info!(msg_id, pane = %event.pane, "Notified: idle");
        Ok(())
    }

    /// Delete-or-expire permission notifications whose tool completed.
    async fn run_completion_window(&mut self, now: f64) -> Result<()> {
        let group = self.group_id()?;
        let mut to_delete = Vec::new();
        let mut to_expire = Vec::new();

        for (msg_id, entry) in self.msg_state.iter() {
            if entry.handled {
                continue;
            }
            let (Some(tool_id), Some(transcript)) =
                (entry.tool_use_id(), entry.transcript_path())
            else {
                continue;
            };
            let completed = self
                .transcripts
                .watcher_for(transcript)
                .is_some_and(|w| w.tool_results.contains(tool_id));
            if !completed {
                continue;
            }
            match window_action(entry.notified_at, now, QUICK_RESPONSE_SECS) {
                WindowAction::Delete => to_delete.push(msg_id),
                WindowAction::Expire => to_expire.push(msg_id),
            }
        }

        for msg_id in to_delete {
            match self.tg.delete_message(group, msg_id).await {
                Ok(_) => tracing::info!(msg_id, "Deleted notification (quick completion)"),
                Err(e) => tracing::warn!(msg_id, error = %e, "Delete failed"),
            }
            self.msg_state.remove(msg_id);
        }
        for msg_id in to_expire {
            if let Err(e) = self
                .tg
                .edit_message_buttons(group, msg_id, "\u{23f0} Expired")
                .await
            {
                tracing::warn!(msg_id, error = %e, "Expire edit failed");
            }
            self.msg_state.mark_handled(msg_id);
            tracing::info!(msg_id, "Expired notification (slow completion)");
        }
        Ok(())
    }

    /// Delete-or-retire idle notices overtaken by tool activity.
    async fn run_supersession_window(&mut self, now: f64) -> Result<()> {
        let group = self.group_id()?;
        let superseded: Vec<(i64, f64)> = self
            .msg_state
            .iter()
            .filter(|(_, entry)| !entry.superseded)
            .filter_map(|(msg_id, entry)| match &entry.kind {
                EntryKind::Idle { claude_msg_id }
                    if self.transcripts.message_has_tool_use(claude_msg_id) =>
                {
                    Some((msg_id, entry.notified_at))
                }
                _ => None,
            })
            .collect();

        for (msg_id, notified_at) in superseded {
            match window_action(notified_at, now, IDLE_SUPERSESSION_SECS) {
                WindowAction::Delete => {
                    // The idle was a false positive: the agent kept working
                    match self.tg.delete_message(group, msg_id).await {
                        Ok(_) => tracing::info!(msg_id, "Deleted idle (quick supersession)"),
                        Err(e) => tracing::warn!(msg_id, error = %e, "Idle delete failed"),
                    }
                    self.msg_state.remove(msg_id);
                }
                WindowAction::Expire => {
                    // Already seen: leave the message visible
                    self.msg_state.mark_superseded(msg_id);
                    self.msg_state.mark_handled(msg_id);
                    tracing::info!(msg_id, "Idle superseded after window, leaving visible");
                }
            }
        }
        Ok(())
    }

    /// Expire stale non-permission entries per pane.
    async fn expire_stale_entries(&mut self) -> Result<()> {
        let group = self.group_id()?;
        let panes: Vec<String> = self.transcripts.panes().map(str::to_string).collect();
        for pane in panes {
            for msg_id in stale_entries(&self.msg_state, &pane) {
                if let Err(e) = self
                    .tg
                    .edit_message_buttons(group, msg_id, "\u{23f0} Expired")
                    .await
                {
                    tracing::debug!(msg_id, error = %e, "Stale expire edit failed");
                }
                self.msg_state.mark_handled(msg_id);
                tracing::info!(msg_id, pane = %pane, "Expired stale notification");
            }
        }
        Ok(())
    }

    /// Capture a pane snapshot for /show.
    pub fn pane_snapshot(&mut self, pane: &str, lines: usize) -> Result<String> {
        self.mux.capture_pane(pane, lines)
    }
}

/// 123456 -> "123,456"
fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
