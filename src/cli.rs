//! CLI argument parsing
//!
//! Uses clap for argument parsing with derive macros. The default (no
//! subcommand) runs the daemon.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::io;
use std::path::PathBuf;

/// Telegram bridge for fleets of Claude Code agents running in tmux
#[derive(Parser, Debug)]
#[command(name = "claude-army")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "RUST_LOG", default_value = "info", global = true)]
    pub log_level: String,

    /// Orchestration tick interval in milliseconds
    #[arg(long, env = "CLAUDE_ARMY_TICK_MS", default_value_t = 100, global = true)]
    pub tick_ms: u64,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Spawn a task over an existing directory
    ///
    /// Creates the task's topic, attaches to (or creates) its tmux session,
    /// and registers it. The running daemon picks up the registry change on
    /// its next tick. This is the surface the operator agent shells out to.
    Spawn {
        /// Unique task name
        name: String,
        /// Working directory the agent runs in
        dir: PathBuf,
    },

    /// Spawn a task in a fresh git worktree under <repo>/trees/<name>
    SpawnWorktree {
        /// Unique task name (also the branch name)
        name: String,
        /// Repository to create the worktree from
        repo: PathBuf,
    },

    /// Pause a task: stop its session, keep its topic
    Pause {
        name: String,
    },

    /// Resume a paused task
    Resume {
        name: String,
    },

    /// Clean up a task: stop the session, retire the topic, remove the
    /// worktree (worktree flavor) or the marker (session flavor)
    Cleanup {
        name: String,
        /// Delete the topic and its history instead of closing it
        #[arg(long, default_value_t = false)]
        delete_topic: bool,
    },

    /// Rebuild the registry from marker files and exit
    ///
    /// Same walk the daemon performs on startup and on /recover: completed
    /// markers are re-registered, pending markers are reported and left
    /// alone.
    Recover,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Generate shell completions and print to stdout
pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "claude-army", &mut io::stdout());
}
