//! Typed client for the Telegram Bot API
//!
//! Thin POST-JSON wrappers over the handful of methods the daemon uses.
//! Behavior folded in here rather than at call sites:
//! - messages over the 4096-char limit are split into `(i/N)` parts with
//!   code fences kept balanced; buttons attach to the last part only
//! - a Markdown parse rejection is retried once without parse_mode
//! - "not enough rights" answers map to a distinguished error so topic
//!   creation failures can fall back to the general topic

pub mod markdown;
pub mod types;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;

use crate::errors::{ArmyError, Result};
use types::{ApiResponse, BotCommand, ForumTopic, InlineKeyboardMarkup, SentMessage, Update};

/// Timeout for ordinary (non-long-poll) API calls
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Where to send an outgoing message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub chat_id: i64,
    /// Topic thread; `None` addresses the General topic / plain chats
    pub thread_id: Option<i64>,
}

impl Destination {
    pub fn general(chat_id: i64) -> Self {
        Self { chat_id, thread_id: None }
    }

    pub fn topic(chat_id: i64, thread_id: i64) -> Self {
        Self { chat_id, thread_id: Some(thread_id) }
    }
}

pub struct TelegramClient {
    http: reqwest::Client,
    base: String,
}

impl TelegramClient {
    pub fn new(bot_token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: format!("https://api.telegram.org/bot{bot_token}"),
        }
    }

    /// Point the client at a different server (tests, local bot API)
    #[allow(dead_code)]
    pub fn with_base(base: String) -> Self {
        Self { http: reqwest::Client::new(), base }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<T> {
        let resp = self
            .http
            .post(format!("{}/{method}", self.base))
            .timeout(timeout)
            .json(payload)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body: ApiResponse<T> = resp.json().await?;
        if !body.ok {
            let description = body.description.unwrap_or_else(|| "unknown error".into());
            if is_rights_error(&description) {
                return Err(ArmyError::TopicCreationRefused);
            }
            return Err(ArmyError::ChatApi { status, description });
        }
        body.result.ok_or(ArmyError::ChatApi {
            status,
            description: "ok response with no result".into(),
        })
    }

    /// Send a message, splitting if needed. Returns the id of the last part
    /// (the one carrying any buttons).
    pub async fn send_message(
        &self,
        dest: Destination,
        text: &str,
        markup: Option<&InlineKeyboardMarkup>,
        reply_to: Option<i64>,
    ) -> Result<i64> {
        let parts = markdown::split_message(text);
        let last = parts.len() - 1;
        let mut last_id = 0;
        for (i, part) in parts.iter().enumerate() {
            let part_markup = if i == last { markup } else { None };
            last_id = self.send_single(dest, part, part_markup, reply_to).await?;
        }
        Ok(last_id)
    }

    async fn send_single(
        &self,
        dest: Destination,
        text: &str,
        markup: Option<&InlineKeyboardMarkup>,
        reply_to: Option<i64>,
    ) -> Result<i64> {
        let mut payload = json!({
            "chat_id": dest.chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        if let Some(thread) = dest.thread_id {
            payload["message_thread_id"] = json!(thread);
        }
        if let Some(markup) = markup {
            payload["reply_markup"] = serde_json::to_value(markup)?;
        }
        if let Some(reply_to) = reply_to {
            payload["reply_to_message_id"] = json!(reply_to);
        }

        match self.call::<SentMessage>("sendMessage", &payload, CALL_TIMEOUT).await {
            Ok(sent) => Ok(sent.message_id),
            Err(ArmyError::ChatApi { description, .. })
                if description.contains("can't parse entities") =>
            {
                // Markdown rejection: retry as plain text
                payload.as_object_mut().and_then(|o| o.remove("parse_mode"));
                let sent: SentMessage =
                    self.call("sendMessage", &payload, CALL_TIMEOUT).await?;
                Ok(sent.message_id)
            }
            Err(e) => Err(e),
        }
    }

    /// Replace a message's button row with a single final-state label.
    pub async fn edit_message_buttons(
        &self,
        chat_id: i64,
        message_id: i64,
        label: &str,
    ) -> Result<()> {
        let payload = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "reply_markup": InlineKeyboardMarkup::final_label(label),
        });
        self.call::<Value>("editMessageReplyMarkup", &payload, CALL_TIMEOUT)
            .await
            .map(|_| ())
    }

    pub async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<bool> {
        let payload = json!({"chat_id": chat_id, "message_id": message_id});
        self.call::<bool>("deleteMessage", &payload, CALL_TIMEOUT).await
    }

    /// Acknowledge a routed message with a 👍 reaction.
    pub async fn react(&self, chat_id: i64, message_id: i64) -> Result<()> {
        let payload = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "reaction": [{"type": "emoji", "emoji": "\u{1f44d}"}],
        });
        self.call::<bool>("setMessageReaction", &payload, CALL_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Typing indicator; auto-dismisses when the next real message lands.
    pub async fn send_typing(&self, dest: Destination) -> Result<()> {
        let mut payload = json!({"chat_id": dest.chat_id, "action": "typing"});
        if let Some(thread) = dest.thread_id {
            payload["message_thread_id"] = json!(thread);
        }
        self.call::<bool>("sendChatAction", &payload, CALL_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Answer a callback query (dismisses the button loading spinner).
    pub async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()> {
        let payload = json!({"callback_query_id": callback_id, "text": text});
        self.call::<bool>("answerCallbackQuery", &payload, CALL_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Long-poll for updates. `timeout_secs` must be >= 1 (Telegram rejects
    /// smaller values); the HTTP timeout is two seconds longer.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>> {
        debug_assert!(timeout_secs >= 1);
        let payload = json!({"offset": offset, "timeout": timeout_secs});
        self.call(
            "getUpdates",
            &payload,
            Duration::from_secs(timeout_secs + 2),
        )
        .await
    }

    /// Create a forum topic, returning its thread id.
    pub async fn create_forum_topic(&self, chat_id: i64, name: &str) -> Result<i64> {
        let payload = json!({"chat_id": chat_id, "name": name});
        let topic: ForumTopic = self.call("createForumTopic", &payload, CALL_TIMEOUT).await?;
        tracing::info!(topic_id = topic.message_thread_id, name = %name, "Created forum topic");
        Ok(topic.message_thread_id)
    }

    /// Close a topic (retains history).
    pub async fn close_forum_topic(&self, chat_id: i64, thread_id: i64) -> Result<()> {
        let payload = json!({"chat_id": chat_id, "message_thread_id": thread_id});
        self.call::<bool>("closeForumTopic", &payload, CALL_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Delete a topic and its history.
    pub async fn delete_forum_topic(&self, chat_id: i64, thread_id: i64) -> Result<()> {
        let payload = json!({"chat_id": chat_id, "message_thread_id": thread_id});
        self.call::<bool>("deleteForumTopic", &payload, CALL_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Rename a topic (status emoji prefixes live in the name).
    pub async fn edit_forum_topic(&self, chat_id: i64, thread_id: i64, name: &str) -> Result<()> {
        let payload = json!({
            "chat_id": chat_id,
            "message_thread_id": thread_id,
            "name": name,
        });
        self.call::<bool>("editForumTopic", &payload, CALL_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Does this chat have topics enabled (forum supergroup)?
    pub async fn is_forum(&self, chat_id: i64) -> Result<bool> {
        let payload = json!({"chat_id": chat_id});
        let chat: Value = self.call("getChat", &payload, CALL_TIMEOUT).await?;
        Ok(chat.get("is_forum").and_then(Value::as_bool).unwrap_or(false))
    }

    /// Register the bot's slash-command menu.
    pub async fn set_my_commands(&self, commands: &[BotCommand]) -> Result<()> {
        let payload = json!({"commands": commands});
        self.call::<bool>("setMyCommands", &payload, CALL_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Admin list for the configured group (used to sanity-check /setup).
    pub async fn get_chat_administrators(&self, chat_id: i64) -> Result<Value> {
        let payload = json!({"chat_id": chat_id});
        self.call("getChatAdministrators", &payload, CALL_TIMEOUT).await
    }
}

/// Does an API error description indicate missing topic-management rights?
fn is_rights_error(description: &str) -> bool {
    let lower = description.to_lowercase();
    lower.contains("not enough rights") || lower.contains("chat_admin_required")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rights_error_detection() {
        assert!(is_rights_error("Bad Request: not enough rights to manage topics"));
        assert!(is_rights_error("CHAT_ADMIN_REQUIRED"));
        assert!(!is_rights_error("Bad Request: message to delete not found"));
    }

    #[test]
    fn test_destination_constructors() {
        assert_eq!(Destination::general(-100).thread_id, None);
        assert_eq!(Destination::topic(-100, 7).thread_id, Some(7));
    }
}
