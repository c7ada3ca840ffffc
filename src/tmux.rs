//! Tmux integration for Claude Code agent orchestration
//!
//! Provides commands for:
//! - Sending input to agent panes (permission answers, custom text)
//! - Capturing pane output for /show snapshots
//! - Creating and killing worker/operator sessions
//! - Discovering panes and their working directories
//!
//! Key patterns from ecosystem research:
//! - Enter must be a separate send-keys argument, never "\n"
//! - `send-keys -l` performs a literal send (no key-name interpretation)
//! - Pane ids have the form `session:window.pane`
//!
//! The `Multiplexer` trait is the seam for tests: everything above this
//! module drives the trait, and integration tests substitute an in-memory
//! fake.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::errors::{ArmyError, Result};

/// Format string resolving a pane to `session:window.pane`
const PANE_FMT: &str = "#{session_name}:#{window_index}.#{pane_index}";

/// One pane and its current working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneInfo {
    pub pane: String,
    pub cwd: PathBuf,
}

/// Capability interface over the terminal multiplexer
pub trait Multiplexer {
    /// Is a tmux server reachable at all?
    fn server_alive(&self) -> bool;
    fn session_exists(&self, session: &str) -> bool;
    fn create_session(&self, session: &str, cwd: &Path) -> Result<()>;
    fn kill_session(&self, session: &str) -> Result<()>;
    /// First pane of a session in `session:window.pane` form
    fn first_pane(&self, session: &str) -> Result<Option<String>>;
    fn pane_exists(&self, pane: &str) -> bool;
    /// Literal send: payload is typed as-is, no key-name interpretation
    fn send_literal(&self, pane: &str, text: &str) -> Result<()>;
    /// Named-key send: "Enter", "Down", "C-u", ...
    fn send_key(&self, pane: &str, key: &str) -> Result<()>;
    /// Capture the last `lines` lines of a pane
    fn capture_pane(&self, pane: &str, lines: usize) -> Result<String>;
    /// All panes across all sessions with their working directories
    fn list_panes(&self) -> Result<Vec<PaneInfo>>;
    fn list_sessions(&self) -> Result<Vec<String>>;

    /// Find a pane whose cwd equals the given directory
    fn find_pane_by_cwd(&self, cwd: &Path) -> Result<Option<String>> {
        Ok(self
            .list_panes()?
            .into_iter()
            .find(|p| p.cwd == cwd)
            .map(|p| p.pane))
    }
}

/// CLI-driven tmux driver (no libvterm/ffi, matching how every tool in this
/// space shells out)
pub struct TmuxCli;

impl TmuxCli {
    fn run(args: &[&str]) -> Result<std::process::Output> {
        Command::new("tmux").args(args).output().map_err(|e| {
            tracing::error!(error = %e, "Failed to execute tmux");
            ArmyError::Io(e)
        })
    }

    fn run_checked(args: &[&str]) -> Result<std::process::Output> {
        let output = Self::run(args)?;
        if !output.status.success() {
            return Err(ArmyError::Tmux {
                command: args.first().unwrap_or(&"?").to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// Parse `list-panes` output lines of the form `<pane> <cwd>`
pub fn parse_pane_listing(output: &str) -> Vec<PaneInfo> {
    output
        .lines()
        .filter_map(|line| {
            let (pane, cwd) = line.split_once(' ')?;
            if pane.is_empty() || cwd.is_empty() {
                return None;
            }
            Some(PaneInfo { pane: pane.to_string(), cwd: PathBuf::from(cwd) })
        })
        .collect()
}

impl Multiplexer for TmuxCli {
    fn server_alive(&self) -> bool {
        Self::run(&["list-sessions"]).map(|o| o.status.success()).unwrap_or(false)
    }

    fn session_exists(&self, session: &str) -> bool {
        Self::run(&["has-session", "-t", session])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn create_session(&self, session: &str, cwd: &Path) -> Result<()> {
        let cwd_str = cwd.to_string_lossy();
        let result = Self::run_checked(&["new-session", "-d", "-s", session, "-c", &cwd_str]);
        match result {
            Ok(_) => {
                tracing::info!(session = %session, cwd = %cwd.display(), "Created tmux session");
                Ok(())
            }
            // Creation race: another actor made the session between our
            // has-session check and now. Treat as success and reuse.
            Err(e) if self.session_exists(session) => {
                tracing::debug!(session = %session, error = %e, "Session appeared concurrently, reusing");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn kill_session(&self, session: &str) -> Result<()> {
        Self::run_checked(&["kill-session", "-t", session])?;
        tracing::info!(session = %session, "Killed tmux session");
        Ok(())
    }

    fn first_pane(&self, session: &str) -> Result<Option<String>> {
        let output = Self::run_checked(&["list-panes", "-t", session, "-F", PANE_FMT])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().map(str::to_string))
    }

    fn pane_exists(&self, pane: &str) -> bool {
        Self::run(&["has-session", "-t", pane])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn send_literal(&self, pane: &str, text: &str) -> Result<()> {
        if !self.pane_exists(pane) {
            return Err(ArmyError::PaneDead(pane.to_string()));
        }
        Self::run_checked(&["send-keys", "-t", pane, "-l", text])?;
        tracing::debug!(pane = %pane, len = text.len(), "Sent literal text to pane");
        Ok(())
    }

    fn send_key(&self, pane: &str, key: &str) -> Result<()> {
        if !self.pane_exists(pane) {
            return Err(ArmyError::PaneDead(pane.to_string()));
        }
        Self::run_checked(&["send-keys", "-t", pane, key])?;
        tracing::debug!(pane = %pane, key = %key, "Sent key to pane");
        Ok(())
    }

    fn capture_pane(&self, pane: &str, lines: usize) -> Result<String> {
        let start = format!("-{lines}");
        let output = Self::run_checked(&["capture-pane", "-t", pane, "-p", "-S", &start])?;
        // Try proper UTF-8 conversion, fall back to lossy with warning
        match String::from_utf8(output.stdout.clone()) {
            Ok(s) => Ok(s),
            Err(_) => {
                tracing::warn!(pane = %pane, "Non-UTF-8 pane capture, using lossy conversion");
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            }
        }
    }

    fn list_panes(&self) -> Result<Vec<PaneInfo>> {
        let fmt = format!("{PANE_FMT} #{{pane_current_path}}");
        let output = Self::run_checked(&["list-panes", "-a", "-F", &fmt])?;
        Ok(parse_pane_listing(&String::from_utf8_lossy(&output.stdout)))
    }

    fn list_sessions(&self) -> Result<Vec<String>> {
        let output = Self::run_checked(&["list-sessions", "-F", "#{session_name}"])?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
pub mod testmux {
    //! In-memory multiplexer fake shared by tests across the crate

    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Everything a test sent to a pane, in order
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Sent {
        Literal(String),
        Key(String),
    }

    #[derive(Default)]
    pub struct FakeMux {
        /// session -> cwd
        pub sessions: Mutex<BTreeMap<String, PathBuf>>,
        /// pane -> cwd
        pub panes: Mutex<BTreeMap<String, PathBuf>>,
        /// pane -> sent inputs
        pub sent: Mutex<BTreeMap<String, Vec<Sent>>>,
        /// pane -> canned capture output
        pub captures: Mutex<BTreeMap<String, String>>,
    }

    impl FakeMux {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_pane(&self, pane: &str, cwd: &str) {
            self.panes.lock().unwrap().insert(pane.into(), PathBuf::from(cwd));
        }

        pub fn sent_to(&self, pane: &str) -> Vec<Sent> {
            self.sent.lock().unwrap().get(pane).cloned().unwrap_or_default()
        }

        fn record(&self, pane: &str, item: Sent) {
            self.sent.lock().unwrap().entry(pane.to_string()).or_default().push(item);
        }

        fn pane_session(pane: &str) -> &str {
            pane.split(':').next().unwrap_or(pane)
        }
    }

    // Tests hand the App a boxed clone and keep the Arc for assertions
    impl Multiplexer for std::sync::Arc<FakeMux> {
        fn server_alive(&self) -> bool {
            self.as_ref().server_alive()
        }
        fn session_exists(&self, session: &str) -> bool {
            self.as_ref().session_exists(session)
        }
        fn create_session(&self, session: &str, cwd: &Path) -> Result<()> {
            self.as_ref().create_session(session, cwd)
        }
        fn kill_session(&self, session: &str) -> Result<()> {
            self.as_ref().kill_session(session)
        }
        fn first_pane(&self, session: &str) -> Result<Option<String>> {
            self.as_ref().first_pane(session)
        }
        fn pane_exists(&self, pane: &str) -> bool {
            self.as_ref().pane_exists(pane)
        }
        fn send_literal(&self, pane: &str, text: &str) -> Result<()> {
            self.as_ref().send_literal(pane, text)
        }
        fn send_key(&self, pane: &str, key: &str) -> Result<()> {
            self.as_ref().send_key(pane, key)
        }
        fn capture_pane(&self, pane: &str, lines: usize) -> Result<String> {
            self.as_ref().capture_pane(pane, lines)
        }
        fn list_panes(&self) -> Result<Vec<PaneInfo>> {
            self.as_ref().list_panes()
        }
        fn list_sessions(&self) -> Result<Vec<String>> {
            self.as_ref().list_sessions()
        }
    }

    impl Multiplexer for FakeMux {
        fn server_alive(&self) -> bool {
            true
        }

        fn session_exists(&self, session: &str) -> bool {
            self.sessions.lock().unwrap().contains_key(session)
        }

        fn create_session(&self, session: &str, cwd: &Path) -> Result<()> {
            self.sessions.lock().unwrap().insert(session.into(), cwd.to_path_buf());
            let pane = format!("{session}:0.0");
            self.panes.lock().unwrap().insert(pane, cwd.to_path_buf());
            Ok(())
        }

        fn kill_session(&self, session: &str) -> Result<()> {
            self.sessions.lock().unwrap().remove(session);
            self.panes
                .lock()
                .unwrap()
                .retain(|pane, _| Self::pane_session(pane) != session);
            Ok(())
        }

        fn first_pane(&self, session: &str) -> Result<Option<String>> {
            Ok(self
                .panes
                .lock()
                .unwrap()
                .keys()
                .find(|p| Self::pane_session(p) == session)
                .cloned())
        }

        fn pane_exists(&self, pane: &str) -> bool {
            let panes = self.panes.lock().unwrap();
            panes.contains_key(pane)
                || panes.keys().any(|p| Self::pane_session(p) == pane)
        }

        fn send_literal(&self, pane: &str, text: &str) -> Result<()> {
            if !self.pane_exists(pane) {
                return Err(ArmyError::PaneDead(pane.to_string()));
            }
            self.record(pane, Sent::Literal(text.to_string()));
            Ok(())
        }

        fn send_key(&self, pane: &str, key: &str) -> Result<()> {
            if !self.pane_exists(pane) {
                return Err(ArmyError::PaneDead(pane.to_string()));
            }
            self.record(pane, Sent::Key(key.to_string()));
            Ok(())
        }

        fn capture_pane(&self, pane: &str, _lines: usize) -> Result<String> {
            Ok(self.captures.lock().unwrap().get(pane).cloned().unwrap_or_default())
        }

        fn list_panes(&self) -> Result<Vec<PaneInfo>> {
            Ok(self
                .panes
                .lock()
                .unwrap()
                .iter()
                .map(|(pane, cwd)| PaneInfo { pane: pane.clone(), cwd: cwd.clone() })
                .collect())
        }

        fn list_sessions(&self) -> Result<Vec<String>> {
            Ok(self.sessions.lock().unwrap().keys().cloned().collect())
        }
    }
}
