//! Application context
//!
//! One `App` carries every handle the subsystems need: the chat client, the
//! multiplexer driver, the three persistent stores, and the transcript
//! watcher collection. All mutation happens on the orchestration loop, so
//! nothing here is behind a lock; the long-poll task only touches its own
//! HTTP client and hands updates over a channel.

use crate::config::{BotCredentials, Config, ConfigStore};
use crate::errors::Result;
use crate::msgstate::MessageState;
use crate::paths::Paths;
use crate::registry::RegistryStore;
use crate::telegram::TelegramClient;
use crate::tmux::Multiplexer;
use crate::transcript::TranscriptManager;

pub struct App {
    pub paths: Paths,
    pub tg: TelegramClient,
    pub mux: Box<dyn Multiplexer>,
    pub config: ConfigStore,
    pub registry: RegistryStore,
    pub msg_state: MessageState,
    pub transcripts: TranscriptManager,
    /// One-shot flag: the "falling back to General" admin warning
    pub fallback_warned: bool,
    /// Epoch seconds of the last transcript discovery scan
    pub last_discover: f64,
    /// Epoch seconds of the last dead-pane sweep
    pub last_cleanup: f64,
}

impl App {
    pub fn new(paths: Paths, creds: &BotCredentials, mux: Box<dyn Multiplexer>) -> Result<Self> {
        let config = ConfigStore::open(paths.config_file())?;
        let registry = RegistryStore::open(paths.registry_file())?;
        let msg_state = MessageState::load(paths.state_file.clone());
        Ok(Self {
            paths,
            tg: TelegramClient::new(&creds.bot_token),
            mux,
            config,
            registry,
            msg_state,
            transcripts: TranscriptManager::new(),
            fallback_warned: false,
            last_discover: 0.0,
            last_cleanup: 0.0,
        })
    }

    /// Snapshot of the current group configuration
    pub fn config_snapshot(&mut self) -> Config {
        self.config.get().clone()
    }

    /// Group id, or NotConfigured
    pub fn group_id(&mut self) -> Result<i64> {
        let config = self.config.get();
        if !config.is_configured() {
            return Err(crate::errors::ArmyError::NotConfigured);
        }
        Ok(config.group_id)
    }
}
