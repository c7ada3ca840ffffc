//! Slash-command handlers
//!
//! Commands are idempotent where possible and always acknowledge. /todo,
//! /spawn, and /cleanup don't act directly: they build rich prompts and
//! forward them to the operator pane, which owns all task decisions.

use serde_json::Value;

use crate::app::App;
use crate::lifecycle::find_markers;
use crate::marker::Marker;
use crate::telegram::markdown::escape_markdown;
use crate::telegram::types::{BotCommand, Message};
use crate::telegram::Destination;
use crate::transcript::tool_already_handled;

/// Menu registered via setMyCommands on /setup
pub const COMMANDS: &[BotCommand] = &[
    BotCommand { command: "setup", description: "Bind this forum group as the control center" },
    BotCommand { command: "reset", description: "Clear the group configuration" },
    BotCommand { command: "status", description: "One line per task with status" },
    BotCommand { command: "todo", description: "Queue a todo for the operator" },
    BotCommand { command: "spawn", description: "Ask the operator to create a task" },
    BotCommand { command: "cleanup", description: "Ask the operator to clean up a task" },
    BotCommand { command: "show", description: "Snapshot of this task's pane" },
    BotCommand { command: "tmux", description: "List army tmux sessions" },
    BotCommand { command: "debug", description: "Dump a notification's state (reply to it)" },
    BotCommand { command: "recover", description: "Rebuild the registry from marker files" },
    BotCommand { command: "help", description: "Show available commands" },
];

/// `/spawn` prompt delivered to the operator pane
pub fn build_spawn_prompt(source_task: Option<&str>, description: &str) -> String {
    [
        "SPAWN REQUEST".to_string(),
        format!("From task: {}", source_task.unwrap_or("general")),
        format!("Description: {description}"),
        "Create an appropriately-named task for this (worktree flavor if the target \
         is a git repository), brief its agent, and report back here."
            .to_string(),
    ]
    .join("\n")
}

/// `/cleanup` prompt delivered to the operator pane
pub fn build_cleanup_prompt(task: Option<&str>) -> String {
    [
        "CLEANUP REQUEST".to_string(),
        format!("Task: {}", task.unwrap_or("(decide from context)")),
        "Verify the work is merged or abandoned, then clean up the task, its \
         topic, and its worktree if it has one."
            .to_string(),
    ]
    .join("\n")
}

/// `/todo` prompt delivered to the operator pane
pub fn build_todo_prompt(from: &str, text: &str) -> String {
    format!("[TODO from {from}] {text}")
}

/// First word of a command, with any @botname suffix dropped
pub fn command_word(text: &str) -> Option<&str> {
    let first = text.trim().split_whitespace().next()?;
    if !first.starts_with('/') {
        return None;
    }
    Some(first.split('@').next().unwrap_or(first))
}

/// Remainder after the command word
fn command_args(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.split_once(char::is_whitespace) {
        Some((_, rest)) => rest.trim().to_string(),
        None => String::new(),
    }
}

impl App {
    /// Handle a slash command. Returns true when the message was consumed.
    pub async fn handle_command(&mut self, message: &Message) -> bool {
        let text = message.text.clone().unwrap_or_default();
        let Some(word) = command_word(&text) else {
            return false;
        };
        let args = command_args(&text);

        match word {
            "/setup" => self.cmd_setup(message).await,
            "/reset" => self.cmd_reset(message).await,
            "/status" => self.cmd_status(message).await,
            "/help" => self.cmd_help(message).await,
            "/todo" => self.cmd_todo(message, &args).await,
            "/spawn" => self.cmd_spawn(message, &args).await,
            "/cleanup" => self.cmd_cleanup(message, &args).await,
            "/tmux" => self.cmd_tmux(message).await,
            "/show" => self.cmd_show(message).await,
            "/debug" => self.cmd_debug(message, &args).await,
            "/recover" | "/rebuild-registry" => self.cmd_recover(message).await,
            _ => return false,
        }
        true
    }

    async fn reply(&mut self, message: &Message, text: &str) {
        let dest = Destination {
            chat_id: message.chat.id,
            thread_id: message.message_thread_id,
        };
        if let Err(e) = self
            .tg
            .send_message(dest, text, None, Some(message.message_id))
            .await
        {
            tracing::warn!(error = %e, "Command reply failed");
        }
    }

    async fn ack(&mut self, message: &Message) {
        let _ = self.tg.react(message.chat.id, message.message_id).await;
    }

    /// Task name for the topic a command was issued in
    fn topic_task_name(&mut self, message: &Message) -> Option<String> {
        let topic = message.message_thread_id?;
        self.registry.get().find_by_topic(topic).map(|(n, _)| n.to_string())
    }

    async fn cmd_setup(&mut self, message: &Message) {
        let chat_id = message.chat.id;
        if !message.chat.is_group() {
            self.reply(message, "This command only works in group chats.").await;
            return;
        }

        let config = self.config_snapshot();
        if config.is_configured() {
            if config.group_id != chat_id {
                self.reply(
                    message,
                    &format!(
                        "Already configured for another group (ID: {}). Run /reset there first.",
                        config.group_id
                    ),
                )
                .await;
            } else {
                // Second /setup in the same group is a no-op
                self.reply(message, "Already set up in this group.").await;
            }
            return;
        }

        match self.tg.is_forum(chat_id).await {
            Ok(true) => {}
            Ok(false) => {
                self.reply(
                    message,
                    "This group needs to be a Forum (supergroup with topics enabled).\n\n\
                     To enable:\n1. Open group settings\n2. Go to 'Topics'\n3. Enable topics\n\n\
                     Then run /setup again.",
                )
                .await;
                return;
            }
            Err(e) => {
                self.reply(message, &format!("Could not inspect this chat: {e}")).await;
                return;
            }
        }

        if let Err(e) = self.config.update(|c| {
            c.group_id = chat_id;
            // Forums use thread_id=1 for the General topic
            c.general_topic_id = 1;
        }) {
            self.reply(message, &format!("Failed to save configuration: {e}")).await;
            return;
        }
        if let Err(e) = self.tg.set_my_commands(COMMANDS).await {
            tracing::warn!(error = %e, "setMyCommands failed");
        }

        let mut reply = String::from(
            "Claude Army initialized!\n\nThis group is now the control center. \
             Send messages here to talk to the operator Claude.\n\nUse /help for commands.",
        );
        if let Ok(admins) = self.tg.get_chat_administrators(chat_id).await {
            if !bot_can_manage_topics(&admins) {
                reply.push_str(
                    "\n\n\u{26a0}\u{fe0f} The bot doesn't have the 'Manage Topics' admin \
                     right yet; per-task topics will fail until it does.",
                );
            }
        }
        self.reply(message, &reply).await;
        tracing::info!(group = chat_id, "Setup complete");
    }

    async fn cmd_reset(&mut self, message: &Message) {
        let config = self.config_snapshot();
        if !config.is_configured() {
            self.reply(message, "Claude Army is not configured.").await;
            return;
        }
        if config.group_id != message.chat.id {
            self.reply(
                message,
                "Claude Army is configured for a different group. Run /reset there.",
            )
            .await;
            return;
        }
        if let Err(e) = self.config.clear() {
            self.reply(message, &format!("Reset failed: {e}")).await;
            return;
        }
        self.reply(
            message,
            "Configuration cleared. Run /setup in any forum group to reconfigure.",
        )
        .await;
        tracing::info!("Reset complete");
    }

    async fn cmd_status(&mut self, message: &Message) {
        let tasks: Vec<(String, crate::registry::Task)> = self
            .registry
            .get()
            .tasks
            .iter()
            .map(|(n, t)| (n.clone(), t.clone()))
            .collect();

        let mut lines: Vec<String> = tasks
            .iter()
            .map(|(name, task)| {
                let pane = task.pane.as_deref().unwrap_or("-");
                format!(
                    "{} `{}` \u{2014} {} (topic {}, pane {})",
                    task.status.emoji(),
                    escape_markdown(name),
                    escape_markdown(&self.paths.strip_home(&task.path)),
                    task.topic_id,
                    pane
                )
            })
            .collect();

        // Abandoned half-spawns need operator eyes; surface them here
        let home = self.paths.home.clone();
        for (dir, marker) in find_markers(&home) {
            if matches!(marker, Ok(Marker::Pending { .. })) {
                lines.push(format!(
                    "\u{23f3} pending spawn at `{}` (review or delete its marker)",
                    escape_markdown(&self.paths.strip_home(&dir))
                ));
            }
        }

        if lines.is_empty() {
            self.reply(message, "No tasks registered.").await;
        } else {
            self.reply(message, &lines.join("\n")).await;
        }
    }

    async fn cmd_help(&mut self, message: &Message) {
        let mut text = String::from("*Claude Army Commands*\n\n");
        for cmd in COMMANDS {
            text.push_str(&format!("/{} \u{2014} {}\n", cmd.command, cmd.description));
        }
        let config = self.config_snapshot();
        if config.is_configured() {
            text.push_str(&format!("\n_Status: configured (group {})_", config.group_id));
        } else {
            text.push_str("\n_Status: not configured_");
        }
        self.reply(message, &text).await;
    }

    async fn cmd_todo(&mut self, message: &Message, args: &str) {
        if args.is_empty() {
            self.reply(message, "Usage: /todo <item>").await;
            return;
        }
        let prompt = build_todo_prompt(message.sender_name(), args);
        match self.send_to_operator(&prompt) {
            Ok(()) => self.ack(message).await,
            Err(e) => self.reply(message, &format!("Failed to reach the operator: {e}")).await,
        }
    }

    async fn cmd_spawn(&mut self, message: &Message, args: &str) {
        if args.is_empty() {
            self.reply(message, "Usage: /spawn <description>").await;
            return;
        }
        let source = self.topic_task_name(message);
        let prompt = build_spawn_prompt(source.as_deref(), args);
        match self.send_to_operator(&prompt) {
            Ok(()) => self.ack(message).await,
            Err(e) => self.reply(message, &format!("Failed to reach the operator: {e}")).await,
        }
    }

    async fn cmd_cleanup(&mut self, message: &Message, args: &str) {
        let task = if args.is_empty() { self.topic_task_name(message) } else { Some(args.to_string()) };
        let prompt = build_cleanup_prompt(task.as_deref());
        match self.send_to_operator(&prompt) {
            Ok(()) => self.ack(message).await,
            Err(e) => self.reply(message, &format!("Failed to reach the operator: {e}")).await,
        }
    }

    async fn cmd_tmux(&mut self, message: &Message) {
        match self.mux.list_sessions() {
            Ok(sessions) => {
                let army: Vec<&String> =
                    sessions.iter().filter(|s| s.starts_with("ca-")).collect();
                if army.is_empty() {
                    self.reply(message, "No army sessions running.").await;
                } else {
                    let lines: Vec<String> = army
                        .iter()
                        .map(|s| format!("`{s}` \u{2014} attach with `tmux attach -t {s}`"))
                        .collect();
                    self.reply(message, &lines.join("\n")).await;
                }
            }
            Err(e) => self.reply(message, &format!("tmux unavailable: {e}")).await,
        }
    }

    async fn cmd_show(&mut self, message: &Message) {
        // Resolve the pane for this topic's task, or the operator pane
        let pane = match self.topic_task_name(message) {
            Some(name) => self
                .registry
                .get()
                .get_task(&name)
                .and_then(|t| t.pane.clone()),
            None => self.config.get().operator_pane.clone(),
        };
        let Some(pane) = pane else {
            self.reply(message, "No pane to show for this topic.").await;
            return;
        };
        match self.pane_snapshot(&pane, 40) {
            Ok(capture) => {
                let body = capture.trim_end().replace("```", "'''");
                self.reply(message, &format!("```\n{body}\n```")).await;
            }
            Err(e) => self.reply(message, &format!("Capture failed: {e}")).await,
        }
    }

    async fn cmd_debug(&mut self, message: &Message, note: &str) {
        let Some(parent) = message.reply_to_message.as_ref().map(|m| m.message_id) else {
            self.reply(message, "Reply to a notification with /debug to inspect it.").await;
            return;
        };

        let Some(entry) = self.msg_state.get(parent).cloned() else {
            // Not tracked (anymore): fall back to grepping the daemon log
            match grep_log(&self.paths.log_file, parent) {
                Some(lines) => {
                    let body = lines.join("\n").replace("```", "'''");
                    self.reply(
                        message,
                        &format!("msg\\_id={parent} not in state; log entries:\n```\n{body}\n```"),
                    )
                    .await;
                }
                None => {
                    self.reply(
                        message,
                        &format!("msg\\_id={parent} not in state, no log entries found"),
                    )
                    .await;
                }
            }
            return;
        };

        let mut lines = vec![format!("[DEBUG] Telegram msg_id={parent}")];
        if !note.is_empty() {
            lines.push(format!("User note: {note}"));
        }
        lines.push(format!("Pane: {}", entry.pane));
        lines.push(format!("CWD: {}", entry.cwd.display()));
        lines.push(format!("Notified: {:.1}s ago", crate::msgstate::now_epoch() - entry.notified_at));
        lines.push(format!("Handled: {}", entry.handled));
        if let (Some(tool_id), Some(transcript)) = (entry.tool_use_id(), entry.transcript_path()) {
            lines.push(format!("Tool ID: {tool_id}"));
            lines.push(format!(
                "Has result in transcript: {}",
                tool_already_handled(transcript, tool_id)
            ));
        }
        lines.push(format!(
            "Full state: {}",
            serde_json::to_string(&entry).unwrap_or_default()
        ));
        let body = lines.join("\n").replace("```", "'''");
        self.reply(message, &format!("```\n{body}\n```")).await;
    }

    async fn cmd_recover(&mut self, message: &Message) {
        match self.recover() {
            Ok(report) => {
                let mut parts = vec![format!(
                    "Registry rebuilt: {} task(s) re-registered.",
                    report.registered.len()
                )];
                if !report.pending.is_empty() {
                    parts.push(format!(
                        "{} pending marker(s) left for review.",
                        report.pending.len()
                    ));
                }
                if !report.corrupt.is_empty() {
                    parts.push(format!(
                        "\u{26a0}\u{fe0f} {} corrupt marker(s) need manual attention.",
                        report.corrupt.len()
                    ));
                }
                self.reply(message, &parts.join(" ")).await;
            }
            Err(e) => self.reply(message, &format!("Recovery failed: {e}")).await,
        }
    }
}

/// Does any bot admin hold the Manage Topics right?
fn bot_can_manage_topics(admins: &Value) -> bool {
    admins
        .as_array()
        .into_iter()
        .flatten()
        .any(|member| {
            member.pointer("/user/is_bot").and_then(Value::as_bool).unwrap_or(false)
                && member
                    .get("can_manage_topics")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
        })
}

/// Last lines of the daemon log mentioning a message id
fn grep_log(log_file: &std::path::Path, msg_id: i64) -> Option<Vec<String>> {
    let needle = format!("msg_id={msg_id}");
    let data = std::fs::read_to_string(log_file).ok()?;
    let lines: Vec<String> = data
        .lines()
        .filter(|l| l.contains(&needle))
        .map(str::to_string)
        .collect();
    if lines.is_empty() {
        return None;
    }
    let start = lines.len().saturating_sub(20);
    Some(lines[start..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_word_parsing() {
        assert_eq!(command_word("/status"), Some("/status"));
        assert_eq!(command_word("/status@army_bot extra"), Some("/status"));
        assert_eq!(command_word("  /todo buy milk"), Some("/todo"));
        assert_eq!(command_word("hello"), None);
    }

    #[test]
    fn test_command_args() {
        assert_eq!(command_args("/todo buy milk"), "buy milk");
        assert_eq!(command_args("/status"), "");
        assert_eq!(command_args("/spawn   fix typo "), "fix typo");
    }

    #[test]
    fn test_spawn_prompt_banner() {
        // Seed scenario 5: banner, source task, description
        let prompt = build_spawn_prompt(Some("auth-task"), "fix typo");
        let lines: Vec<&str> = prompt.lines().collect();
        assert_eq!(lines[0], "SPAWN REQUEST");
        assert_eq!(lines[1], "From task: auth-task");
        assert_eq!(lines[2], "Description: fix typo");
        assert!(lines.len() > 3);
    }

    #[test]
    fn test_spawn_prompt_without_source() {
        let prompt = build_spawn_prompt(None, "try the new linter");
        assert!(prompt.contains("From task: general"));
    }

    #[test]
    fn test_cleanup_prompt() {
        assert!(build_cleanup_prompt(Some("feat")).contains("Task: feat"));
        assert!(build_cleanup_prompt(None).contains("(decide from context)"));
    }

    #[test]
    fn test_bot_can_manage_topics() {
        let admins = serde_json::json!([
            {"user": {"is_bot": false, "first_name": "Ada"}, "status": "creator"},
            {"user": {"is_bot": true, "first_name": "army"}, "can_manage_topics": true}
        ]);
        assert!(bot_can_manage_topics(&admins));

        let no_rights = serde_json::json!([
            {"user": {"is_bot": true, "first_name": "army"}, "can_manage_topics": false}
        ]);
        assert!(!bot_can_manage_topics(&no_rights));
    }

    #[test]
    fn test_grep_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("daemon.log");
        std::fs::write(
            &log,
            "[10:00:00.123] Notified: Bash (msg_id=42, tool_id=t1)\n\
             [10:00:01.456] Something else\n\
             [10:00:02.789] Expired (slow response): msg_id=42\n",
        )
        .unwrap();
        let lines = grep_log(&log, 42).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("Notified"));

        assert_eq!(grep_log(&log, 99), None);
    }
}
