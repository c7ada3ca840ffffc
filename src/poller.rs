//! Telegram long-poll loop and inbound dispatch
//!
//! The poll loop runs on its own task and pushes raw updates over an
//! unbounded channel; dispatch happens on the orchestration loop so every
//! write to message-state and the registry is serial.
//!
//! Callbacks answer permission prompts; messages route four ways: slash
//! commands, operator forwarding (DMs and the General topic), replies to
//! tracked notifications, and task-topic forwarding to worker panes.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::app::App;
use crate::errors::ArmyError;
use crate::inject::{self, PermissionAnswer};
use crate::msgstate::MessageState;
use crate::telegram::types::{CallbackQuery, Message, Update};
use crate::telegram::TelegramClient;
use crate::transcript::{pending_tool_in_transcript, tool_already_handled};

/// Long-poll timeout passed to getUpdates (integer seconds, >= 1)
const POLL_TIMEOUT_SECS: u64 = 30;

/// Sleep after a poll error before retrying
const POLL_ERROR_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);

/// Runs getUpdates in a loop on its own task
pub struct TelegramPoller {
    tg: TelegramClient,
    offset: i64,
}

impl TelegramPoller {
    pub fn new(bot_token: &str) -> Self {
        Self { tg: TelegramClient::new(bot_token), offset: 0 }
    }

    /// Poll until cancelled, pushing updates into the channel.
    pub async fn run(mut self, tx: mpsc::UnboundedSender<Update>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Poller shutting down");
                    return;
                }
                result = self.tg.get_updates(self.offset, POLL_TIMEOUT_SECS) => {
                    match result {
                        Ok(updates) => {
                            if !updates.is_empty() {
                                tracing::debug!(count = updates.len(), "Got updates");
                            }
                            for update in updates {
                                self.offset = self.offset.max(update.update_id + 1);
                                if tx.send(update).is_err() {
                                    return; // orchestration loop is gone
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Telegram poll error");
                            tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }
}

/// Final button label for an action
pub fn action_label(answer: PermissionAnswer, tool_name: &str) -> String {
    match answer {
        PermissionAnswer::Allow => "\u{2713} Allowed".to_string(),
        PermissionAnswer::AllowAlways => format!("\u{2713} Always: {tool_name}"),
        PermissionAnswer::Deny => "\u{274c} Denied".to_string(),
    }
}

/// Why a callback press was rejected, or what it should do
#[derive(Debug, PartialEq)]
pub enum CallbackVerdict {
    /// The placeholder button on already-finalised messages
    Noop,
    /// Message id not tracked
    Unknown,
    AlreadyHandled,
    /// Non-permission entry with a newer entry on the same pane
    Stale,
    /// The tool was answered out-of-band in the TUI
    HandledInTui,
    /// A valid permission answer to inject
    Permission(PermissionAnswer),
    /// y/n/a pressed on a non-permission message
    NotAPrompt,
    /// Arbitrary payload forwarded as plain input
    Forward(String),
}

/// Pure classification of a button press against message-state.
/// `tool_done_in_tui` is the transcript check, supplied by the caller.
pub fn classify_callback(
    state: &MessageState,
    msg_id: i64,
    data: &str,
    tool_done_in_tui: bool,
) -> CallbackVerdict {
    if data == "_" {
        return CallbackVerdict::Noop;
    }
    let Some(entry) = state.get(msg_id) else {
        return CallbackVerdict::Unknown;
    };
    if entry.handled {
        return CallbackVerdict::AlreadyHandled;
    }
    if !entry.is_permission() {
        // Claude queues multiple tool_use, so id-ordering staleness only
        // applies to non-permission entries
        if state.latest_for_pane(&entry.pane).is_some_and(|latest| msg_id < latest) {
            return CallbackVerdict::Stale;
        }
    }
    if entry.is_permission() && tool_done_in_tui {
        return CallbackVerdict::HandledInTui;
    }
    match PermissionAnswer::from_callback(data) {
        Some(answer) if entry.is_permission() => CallbackVerdict::Permission(answer),
        Some(_) => CallbackVerdict::NotAPrompt,
        None => CallbackVerdict::Forward(data.to_string()),
    }
}

/// Mark every other unhandled permission prompt on the pane as handled.
/// Returns the affected message ids (a denial aborts the whole batch in
/// the agent's TUI, so their buttons could never produce a valid answer).
pub fn apply_batch_denial(state: &mut MessageState, pane: &str, except: i64) -> Vec<i64> {
    let others = state.other_unhandled_permissions(pane, except);
    for id in &others {
        state.mark_handled(*id);
    }
    others
}

impl App {
    /// Dispatch one update from the poll task.
    pub async fn handle_update(&mut self, update: Update) {
        if let Some(callback) = update.callback_query {
            self.handle_callback(callback).await;
        } else if let Some(message) = update.message {
            self.handle_message(message).await;
        }
    }

    async fn handle_callback(&mut self, callback: CallbackQuery) {
        let data = callback.data.clone().unwrap_or_default();
        let Some(message) = callback.message.as_ref() else {
            return;
        };
        let msg_id = message.message_id;
        let chat_id = message.chat.id;
        tracing::info!(data = %data, msg_id, "Callback");

        let tool_done = self
            .msg_state
            .get(msg_id)
            .filter(|e| e.is_permission())
            .and_then(|e| e.transcript_path().map(|p| (p.to_path_buf(), e.tool_use_id().unwrap_or("").to_string())))
            .is_some_and(|(path, tool_id)| tool_already_handled(&path, &tool_id));

        let verdict = classify_callback(&self.msg_state, msg_id, &data, tool_done);
        match verdict {
            CallbackVerdict::Noop | CallbackVerdict::AlreadyHandled => {
                self.answer(&callback.id, "Already handled").await;
            }
            CallbackVerdict::Unknown => {
                self.answer(&callback.id, "Session not found").await;
            }
            CallbackVerdict::Stale => {
                self.answer(&callback.id, "Stale prompt").await;
                let _ = self
                    .tg
                    .edit_message_buttons(chat_id, msg_id, "\u{23f0} Expired")
                    .await;
                self.msg_state.mark_handled(msg_id);
            }
            CallbackVerdict::HandledInTui => {
                self.answer(&callback.id, "Already handled in TUI").await;
                let _ = self
                    .tg
                    .edit_message_buttons(chat_id, msg_id, "\u{23f0} Expired")
                    .await;
                self.msg_state.mark_handled(msg_id);
            }
            CallbackVerdict::NotAPrompt => {
                self.answer(&callback.id, "No active prompt").await;
            }
            CallbackVerdict::Permission(answer) => {
                self.answer_permission(&callback, chat_id, msg_id, answer).await;
            }
            CallbackVerdict::Forward(payload) => {
                let pane = self.msg_state.get(msg_id).map(|e| e.pane.clone()).unwrap_or_default();
                match inject::send_plain(self.mux.as_ref(), &pane, &payload) {
                    Ok(()) => self.answer(&callback.id, &format!("Sent: {payload}")).await,
                    Err(_) => self.answer(&callback.id, "Failed").await,
                }
            }
        }
        if let Err(e) = self.msg_state.flush() {
            tracing::warn!(error = %e, "State flush failed after callback");
        }
    }

    async fn answer_permission(
        &mut self,
        callback: &CallbackQuery,
        chat_id: i64,
        msg_id: i64,
        answer: PermissionAnswer,
    ) {
        let Some(entry) = self.msg_state.get(msg_id).cloned() else {
            return;
        };
        let tool_name = match &entry.kind {
            crate::msgstate::EntryKind::PermissionPrompt { tool_name, .. } => tool_name.clone(),
            crate::msgstate::EntryKind::Idle { .. } => String::new(),
        };

        match inject::send_permission_answer(self.mux.as_ref(), &entry.pane, answer) {
            Ok(()) => {
                let toast = match answer {
                    PermissionAnswer::Allow => "Allowed".to_string(),
                    PermissionAnswer::AllowAlways => format!("Always: {tool_name}"),
                    PermissionAnswer::Deny => "Denied".to_string(),
                };
                self.answer(&callback.id, &toast).await;
                let _ = self
                    .tg
                    .edit_message_buttons(chat_id, msg_id, &action_label(answer, &tool_name))
                    .await;
                self.msg_state.mark_handled(msg_id);
                tracing::info!(pane = %entry.pane, answer = ?answer, "Permission answered");

                if answer == PermissionAnswer::Deny {
                    let others = apply_batch_denial(&mut self.msg_state, &entry.pane, msg_id);
                    for other in others {
                        let _ = self
                            .tg
                            .edit_message_buttons(
                                chat_id,
                                other,
                                "\u{274c} Denied via batch denial",
                            )
                            .await;
                        tracing::info!(msg_id = other, "Expired queued prompt after denial");
                    }
                }
            }
            Err(ArmyError::PaneDead(_)) => {
                self.answer(&callback.id, "Failed: pane dead").await;
                self.msg_state.mark_handled(msg_id);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Permission injection failed");
                self.answer(&callback.id, "Failed").await;
            }
        }
    }

    async fn handle_message(&mut self, message: Message) {
        let text = message.text.clone().unwrap_or_default();
        let topic_id = message.message_thread_id;
        tracing::info!(msg_id = message.message_id, topic = ?topic_id, "Message");

        if text.starts_with('/') && self.handle_command(&message).await {
            return;
        }

        if !self.config.get().is_configured() {
            tracing::debug!("Skipping message: not configured");
            return;
        }
        if text.is_empty() {
            return;
        }

        // DMs go straight to the operator
        if message.chat.is_private() {
            self.forward_to_operator(&message).await;
            return;
        }

        let config = self.config_snapshot();
        if message.chat.id != config.group_id {
            tracing::debug!(chat = message.chat.id, "Skipping message: wrong chat");
            return;
        }

        if config.is_general_topic(topic_id) {
            self.forward_to_operator(&message).await;
            return;
        }

        // Reply to a tracked notification?
        if let Some(parent) = message.reply_to_message.as_ref().map(|m| m.message_id) {
            if self.msg_state.get(parent).is_some()
                && self.handle_reply_to_tracked(&message, parent).await
            {
                return;
            }
        }

        // Task topic: forward to the worker, resurrecting its pane if needed
        if let Some(topic) = topic_id {
            match self.worker_pane_for_topic(topic).await {
                Ok(pane) => {
                    let wrapped = format_incoming(&self.msg_state, &message);
                    if inject::send_plain(self.mux.as_ref(), &pane, &wrapped).is_ok() {
                        let _ = self.tg.react(message.chat.id, message.message_id).await;
                        tracing::info!(topic, pane = %pane, "Routed to worker");
                    }
                }
                Err(e) => {
                    tracing::info!(topic, error = %e, "No worker for topic");
                }
            }
        }
    }

    /// Reply to a tracked message. Returns true when the reply was consumed.
    async fn handle_reply_to_tracked(&mut self, message: &Message, parent: i64) -> bool {
        let Some(entry) = self.msg_state.get(parent).cloned() else {
            return false;
        };
        if entry.pane.is_empty() {
            return false;
        }
        let text = message.text.clone().unwrap_or_default();
        let chat_id = message.chat.id;

        // The dialog may have been answered in the TUI (or auto-approved)
        // while the notification sat unread; in that case there is nothing
        // to inject into
        if !entry.handled {
            if let (Some(tool_id), Some(transcript)) =
                (entry.tool_use_id(), entry.transcript_path())
            {
                if tool_already_handled(transcript, tool_id) {
                    let _ = self
                        .tg
                        .edit_message_buttons(chat_id, parent, "Already handled in TUI")
                        .await;
                    self.msg_state.mark_handled(parent);
                    tracing::info!(msg_id = parent, "Reply to a prompt already handled in TUI");
                    return true;
                }
            }
        }

        let pending = entry
            .transcript_path()
            .and_then(pending_tool_in_transcript);

        match pending {
            Some(pending_id) if entry.tool_use_id() == Some(pending_id.as_str()) => {
                // Replying to the live permission prompt: option-3 path
                match inject::send_permission_text(self.mux.as_ref(), &entry.pane, &text) {
                    Ok(()) => {
                        let _ = self
                            .tg
                            .edit_message_buttons(chat_id, parent, "\u{1f4ac} Replied")
                            .await;
                        self.msg_state.mark_handled(parent);
                        let _ = self.tg.react(chat_id, message.message_id).await;
                        tracing::info!(pane = %entry.pane, "Replied to permission prompt");
                    }
                    Err(e) => tracing::warn!(error = %e, "Permission reply failed"),
                }
                true
            }
            Some(_) => {
                // A different prompt is blocking the dialog
                let _ = self
                    .tg
                    .send_message(
                        crate::telegram::Destination {
                            chat_id,
                            thread_id: message.message_thread_id,
                        },
                        "\u{26a0}\u{fe0f} Ignored: there's a pending permission prompt. \
                         Please respond to that first.",
                        None,
                        Some(message.message_id),
                    )
                    .await;
                true
            }
            None => {
                // No dialog in the way: plain input
                if inject::send_plain(self.mux.as_ref(), &entry.pane, &text).is_ok() {
                    let _ = self.tg.react(chat_id, message.message_id).await;
                    tracing::info!(pane = %entry.pane, "Reply sent as plain input");
                }
                true
            }
        }
    }

    async fn forward_to_operator(&mut self, message: &Message) {
        let wrapped = format_incoming(&self.msg_state, message);
        match self.send_to_operator(&wrapped) {
            Ok(()) => {
                let _ = self.tg.react(message.chat.id, message.message_id).await;
                tracing::info!("Routed to operator");
            }
            Err(e) => tracing::warn!(error = %e, "Operator forward failed"),
        }
    }

    async fn answer(&mut self, callback_id: &str, text: &str) {
        if let Err(e) = self.tg.answer_callback(callback_id, text).await {
            tracing::debug!(error = %e, "answerCallbackQuery failed");
        }
    }
}

/// Wrap an inbound message with provenance the agent can use.
pub fn format_incoming(state: &MessageState, message: &Message) -> String {
    let msg_id = message.message_id;
    let from = message.sender_name();
    let mut lines = vec![match message.message_thread_id {
        Some(topic) => format!("[Telegram msg_id={msg_id} topic={topic} from={from}]"),
        None => format!("[Telegram msg_id={msg_id} from={from}]"),
    }];

    if let Some(reply) = message.reply_to_message.as_deref() {
        let reply_text: String = reply.text.clone().unwrap_or_default().chars().take(200).collect();
        lines.push(format!(
            "[Replying to msg_id={} from {}]: {reply_text}",
            reply.message_id,
            reply.sender_name()
        ));
        if let Some(entry) = state.get(reply.message_id) {
            let kind = if entry.is_permission() { "permission_prompt" } else { "idle" };
            lines.push(format!("[State: type={kind}, pane={}]", entry.pane));
        }
    }

    lines.push(message.text.clone().unwrap_or_default());
    lines.join("\n")
}
