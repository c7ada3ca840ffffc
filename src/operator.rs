//! Operator session management
//!
//! The operator is the single privileged Claude instance that mediates user
//! requests. It owns a dedicated tmux session and the group's General
//! topic. DMs, General-topic messages, and the /todo, /spawn, /cleanup
//! prompts all land in its pane, with lazy resurrection when the session
//! has gone away.

use crate::app::App;
use crate::errors::{ArmyError, Result};
use crate::inject;

/// Session name of the operator Claude
pub const OPERATOR_SESSION: &str = "ca-op";

impl App {
    /// Is this pane the operator pane?
    pub fn is_operator_pane(&mut self, pane: &str) -> bool {
        self.config.get().operator_pane.as_deref() == Some(pane)
    }

    /// Start (or adopt) the operator session. Returns its pane.
    pub fn start_operator(&mut self) -> Result<String> {
        if self.mux.session_exists(OPERATOR_SESSION) {
            let pane = self
                .mux
                .first_pane(OPERATOR_SESSION)?
                .ok_or_else(|| ArmyError::PaneDead(OPERATOR_SESSION.into()))?;
            self.config.update(|c| c.operator_pane = Some(pane.clone()))?;
            return Ok(pane);
        }

        tracing::info!("Starting operator session");
        let home = self.paths.home.clone();
        self.mux.create_session(OPERATOR_SESSION, &home)?;
        let pane = self
            .mux
            .first_pane(OPERATOR_SESSION)?
            .ok_or_else(|| ArmyError::PaneDead(OPERATOR_SESSION.into()))?;

        // --resume so it picks up any existing operator conversation
        inject::send_plain(self.mux.as_ref(), &pane, "claude --resume")?;
        self.config.update(|c| c.operator_pane = Some(pane.clone()))?;
        tracing::info!(pane = %pane, "Operator session started");
        Ok(pane)
    }

    /// Send text to the operator pane, resurrecting the session if needed.
    pub fn send_to_operator(&mut self, text: &str) -> Result<()> {
        if !self.config.get().is_configured() {
            return Err(ArmyError::NotConfigured);
        }

        let pane = match self.config.get().operator_pane.clone() {
            Some(pane) if self.mux.session_exists(OPERATOR_SESSION) => pane,
            _ => self.start_operator()?,
        };
        inject::send_plain(self.mux.as_ref(), &pane, text)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::BotCredentials;
    use crate::paths::Paths;
    use crate::tmux::testmux::{FakeMux, Sent};
    use crate::tmux::Multiplexer;
    use std::path::Path;
    use std::sync::Arc;

    /// Shared test harness: an App over a FakeMux the test keeps a handle to
    pub(crate) fn test_app(home: &Path) -> (App, Arc<FakeMux>) {
        let paths = Paths::rooted_at(home, home);
        let creds = BotCredentials { bot_token: "t".into(), chat_id: "c".into() };
        let mux = Arc::new(FakeMux::new());
        let app = App::new(paths, &creds, Box::new(mux.clone())).unwrap();
        (app, mux)
    }

    pub(crate) fn configure(app: &mut App) {
        app.config
            .update(|c| {
                c.group_id = -100;
                c.general_topic_id = 1;
            })
            .unwrap();
    }

    #[test]
    fn test_start_operator_creates_session_and_launches_claude() {
        let home = tempfile::tempdir().unwrap();
        let (mut app, mux) = test_app(home.path());
        configure(&mut app);

        let pane = app.start_operator().unwrap();
        assert_eq!(pane, "ca-op:0.0");
        assert_eq!(app.config.get().operator_pane.as_deref(), Some("ca-op:0.0"));
        assert!(mux
            .sent_to("ca-op:0.0")
            .contains(&Sent::Literal("claude --resume".into())));
    }

    #[test]
    fn test_send_to_operator_resurrects() {
        let home = tempfile::tempdir().unwrap();
        let (mut app, mux) = test_app(home.path());
        configure(&mut app);
        // Pane recorded in config but session never created
        app.config.update(|c| c.operator_pane = Some("ca-op:0.0".into())).unwrap();

        app.send_to_operator("hello operator").unwrap();

        assert!(mux.session_exists(OPERATOR_SESSION));
        assert!(mux
            .sent_to("ca-op:0.0")
            .contains(&Sent::Literal("hello operator".into())));
    }

    #[test]
    fn test_send_unconfigured_is_error() {
        let home = tempfile::tempdir().unwrap();
        let (mut app, _mux) = test_app(home.path());
        assert!(matches!(app.send_to_operator("x"), Err(ArmyError::NotConfigured)));
    }

    #[test]
    fn test_operator_pane_detection() {
        let home = tempfile::tempdir().unwrap();
        let (mut app, _mux) = test_app(home.path());
        configure(&mut app);
        app.config.update(|c| c.operator_pane = Some("ca-op:0.0".into())).unwrap();
        assert!(app.is_operator_pane("ca-op:0.0"));
        assert!(!app.is_operator_pane("ca-x:0.0"));
    }
}
