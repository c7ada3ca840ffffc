//! Daemon configuration: bot credentials and group wiring
//!
//! Two files:
//! - `~/telegram.json` holds `{bot_token, chat_id}` and is written by the
//!   user once when creating the bot. Read-only from our side.
//! - `~/.claude-army/config.json` holds the group/topic/operator wiring set
//!   up by `/setup` and mutated by the lifecycle manager. Auto-reloads on
//!   mtime advance so an external agent can edit it underneath us.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::errors::{ArmyError, Result};
use crate::store::JsonStore;

/// Telegram bot credentials, read once at startup
#[derive(Debug, Clone, Deserialize)]
pub struct BotCredentials {
    pub bot_token: String,
    pub chat_id: String,
}

impl BotCredentials {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| {
            tracing::error!(path = %path.display(), "Cannot read credentials file");
            ArmyError::Io(e)
        })?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Group configuration created by /setup and cleared by /reset
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Forum supergroup the daemon is bound to
    #[serde(default)]
    pub group_id: i64,
    /// Thread id of the group-wide General topic (1 in practice)
    #[serde(default)]
    pub general_topic_id: i64,
    /// Pane of the operator Claude session, e.g. "ca-op:0.0"
    #[serde(default)]
    pub operator_pane: Option<String>,
    /// Extra name -> topic mappings maintained by external tooling
    #[serde(default)]
    pub topic_mappings: std::collections::BTreeMap<String, String>,
}

impl Config {
    /// True once /setup has bound the daemon to a group
    pub fn is_configured(&self) -> bool {
        self.group_id != 0
    }

    /// Is this thread id the General topic (or the unthreaded default)?
    pub fn is_general_topic(&self, thread_id: Option<i64>) -> bool {
        match thread_id {
            None => true,
            Some(id) => id == self.general_topic_id,
        }
    }
}

/// Mtime-reloading store for the group configuration
pub type ConfigStore = JsonStore<Config>;
