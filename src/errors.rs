//! Structured error types for claude-army
//!
//! Uses thiserror for ergonomic error definitions with automatic Display
//! and Error trait implementations.

use std::path::PathBuf;
use thiserror::Error;

/// All possible errors in claude-army
#[derive(Error, Debug)]
pub enum ArmyError {
    /// Another daemon instance holds the PID lockfile
    #[error("daemon already running with PID {0}")]
    AlreadyRunning(i32),

    /// tmux is missing or no server is reachable
    #[error("tmux not available or no server running")]
    TmuxUnavailable,

    /// A tmux subcommand returned a non-zero status
    #[error("tmux {command} failed: {stderr}")]
    Tmux { command: String, stderr: String },

    /// The target pane no longer exists
    #[error("pane {0} is gone")]
    PaneDead(String),

    /// The Telegram API rejected a request
    #[error("telegram API error ({status}): {description}")]
    ChatApi { status: u16, description: String },

    /// The bot lacks topic-management rights in the group
    #[error("not enough rights to manage topics in this group")]
    TopicCreationRefused,

    /// A marker file exists but cannot be parsed; the operator must fix it
    #[error("corrupt marker file at {0} - fix or remove it manually")]
    MarkerCorrupt(PathBuf),

    /// Task name collision on spawn
    #[error("task '{0}' already exists")]
    DuplicateTask(String),

    /// Lookup of a task that is not in the registry
    #[error("no such task '{0}'")]
    UnknownTask(String),

    /// git worktree add/remove failure
    #[error("worktree operation failed: {0}")]
    Worktree(String),

    /// No group has been configured via /setup yet
    #[error("not configured - run /setup in your group first")]
    NotConfigured,

    /// Filesystem or subprocess I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing/serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error (network flake, timeout)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Convenience Result type using ArmyError
pub type Result<T> = std::result::Result<T, ArmyError>;
