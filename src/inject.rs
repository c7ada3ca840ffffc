//! Input injection into agent panes
//!
//! Claude Code's TUI permission dialog is driven with arrow keys from a
//! default highlight on option 1 ("Yes"):
//! - y = Enter
//! - a = Down, Enter            (option 2: don't ask again)
//! - n = Down, Down, Enter      (option 3 aborts the tool)
//!
//! Free-text replies navigate to option 3 ("tell Claude something"), open
//! the text buffer, then type literally.
//!
//! Plain input clears the line first (C-u) and waits for the TUI's input
//! buffer to catch up before pressing Enter; without the settle delay long
//! payloads get partially eaten.

use std::thread;
use std::time::Duration;

use crate::errors::Result;
use crate::tmux::Multiplexer;

/// Pause between arrow keystrokes while navigating the dialog
const KEY_SETTLE: Duration = Duration::from_millis(20);

/// Base settle before Enter after a literal send
const INPUT_SETTLE_BASE_MS: u64 = 100;

/// A permission-dialog answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionAnswer {
    Allow,
    AllowAlways,
    Deny,
}

impl PermissionAnswer {
    /// Parse a callback payload (`y` / `a` / `n`)
    pub fn from_callback(data: &str) -> Option<Self> {
        match data {
            "y" => Some(Self::Allow),
            "a" => Some(Self::AllowAlways),
            "n" => Some(Self::Deny),
            _ => None,
        }
    }

    /// Number of Down presses before Enter
    fn downs(self) -> usize {
        match self {
            Self::Allow => 0,
            Self::AllowAlways => 1,
            Self::Deny => 2,
        }
    }
}

/// Settle duration for a literal payload: 100 ms + 0.1 ms per character
pub fn settle_delay(payload_len: usize) -> Duration {
    Duration::from_micros(INPUT_SETTLE_BASE_MS * 1000 + payload_len as u64 * 100)
}

/// Send plain input to a pane: clear line, type literally, Enter.
pub fn send_plain(mux: &dyn Multiplexer, pane: &str, text: &str) -> Result<()> {
    mux.send_key(pane, "C-u")?;
    mux.send_literal(pane, text)?;
    thread::sleep(settle_delay(text.len()));
    mux.send_key(pane, "Enter")?;
    tracing::debug!(pane = %pane, len = text.len(), "Injected plain input");
    Ok(())
}

/// Answer a permission dialog with arrow-key navigation.
pub fn send_permission_answer(
    mux: &dyn Multiplexer,
    pane: &str,
    answer: PermissionAnswer,
) -> Result<()> {
    for _ in 0..answer.downs() {
        mux.send_key(pane, "Down")?;
        thread::sleep(KEY_SETTLE);
    }
    mux.send_key(pane, "Enter")?;
    tracing::info!(pane = %pane, answer = ?answer, "Answered permission dialog");
    Ok(())
}

/// Reply to a permission dialog with free text (option 3).
pub fn send_permission_text(mux: &dyn Multiplexer, pane: &str, text: &str) -> Result<()> {
    mux.send_key(pane, "C-u")?;
    thread::sleep(KEY_SETTLE);
    mux.send_key(pane, "Down")?;
    thread::sleep(KEY_SETTLE);
    mux.send_key(pane, "Down")?;
    thread::sleep(KEY_SETTLE);
    // Select option 3 to activate the text buffer
    mux.send_key(pane, "Enter")?;
    thread::sleep(settle_delay(0));
    mux.send_literal(pane, text)?;
    thread::sleep(settle_delay(text.len()));
    mux.send_key(pane, "Enter")?;
    tracing::info!(pane = %pane, len = text.len(), "Replied to permission dialog");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::testmux::{FakeMux, Sent};

    fn keys(sent: &[Sent]) -> Vec<String> {
        sent.iter()
            .map(|s| match s {
                Sent::Key(k) => format!("key:{k}"),
                Sent::Literal(t) => format!("lit:{t}"),
            })
            .collect()
    }

    #[test]
    fn test_plain_input_sequence() {
        let mux = FakeMux::new();
        mux.add_pane("%1", "/w");
        send_plain(&mux, "%1", "hello").unwrap();
        assert_eq!(keys(&mux.sent_to("%1")), vec!["key:C-u", "lit:hello", "key:Enter"]);
    }

    #[test]
    fn test_permission_answer_encodings() {
        let cases = [
            (PermissionAnswer::Allow, vec!["key:Enter"]),
            (PermissionAnswer::AllowAlways, vec!["key:Down", "key:Enter"]),
            (PermissionAnswer::Deny, vec!["key:Down", "key:Down", "key:Enter"]),
        ];
        for (answer, expected) in cases {
            let mux = FakeMux::new();
            mux.add_pane("%1", "/w");
            send_permission_answer(&mux, "%1", answer).unwrap();
            assert_eq!(keys(&mux.sent_to("%1")), expected, "answer {answer:?}");
        }
    }

    #[test]
    fn test_permission_text_sequence() {
        let mux = FakeMux::new();
        mux.add_pane("%1", "/w");
        send_permission_text(&mux, "%1", "use the other file").unwrap();
        assert_eq!(
            keys(&mux.sent_to("%1")),
            vec![
                "key:C-u",
                "key:Down",
                "key:Down",
                "key:Enter",
                "lit:use the other file",
                "key:Enter"
            ]
        );
    }

    #[test]
    fn test_dead_pane_is_error() {
        let mux = FakeMux::new();
        assert!(send_plain(&mux, "%9", "x").is_err());
    }

    #[test]
    fn test_settle_delay_scales_with_length() {
        assert_eq!(settle_delay(0), Duration::from_millis(100));
        assert_eq!(settle_delay(1000), Duration::from_millis(200));
    }

    #[test]
    fn test_callback_parsing() {
        assert_eq!(PermissionAnswer::from_callback("y"), Some(PermissionAnswer::Allow));
        assert_eq!(PermissionAnswer::from_callback("a"), Some(PermissionAnswer::AllowAlways));
        assert_eq!(PermissionAnswer::from_callback("n"), Some(PermissionAnswer::Deny));
        assert_eq!(PermissionAnswer::from_callback("_"), None);
    }
}
