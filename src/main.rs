// Clippy configuration: enable pedantic but allow overly strict lints
#![allow(clippy::missing_errors_doc)] // Internal functions don't need # Errors docs
#![allow(clippy::missing_panics_doc)] // Internal functions don't need # Panics docs
#![allow(clippy::must_use_candidate)] // Not all getters need #[must_use]
#![allow(clippy::module_name_repetitions)] // e.g., TranscriptWatcher in transcript module
#![allow(clippy::too_many_lines)] // Some dispatch functions are naturally long
#![allow(clippy::cast_possible_truncation)] // We're careful with our casts
#![allow(clippy::cast_precision_loss)] // Epoch-seconds f64 precision loss is acceptable
#![allow(clippy::single_match_else)] // match with else arm is fine for Result handling
#![allow(clippy::option_if_let_else)] // if-let is more readable for Option handling

//! claude-army - Telegram bridge for fleets of Claude Code agents in tmux
//!
//! One long-running daemon with two concurrent activities:
//! - a Telegram long-poll task feeding updates over a channel
//! - a tight orchestration loop that tails transcripts, sends
//!   notifications, and applies button presses and replies to panes
//!
//! Usage:
//!   claude-army              # run the daemon
//!   claude-army recover      # rebuild the registry from markers and exit

mod app;
mod cli;
mod commands;
mod config;
mod errors;
mod git;
mod inject;
mod lifecycle;
mod marker;
mod msgstate;
mod operator;
mod orchestrator;
mod paths;
mod poller;
mod registry;
mod router;
mod store;
mod telegram;
mod tmux;
mod transcript;

use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use std::fs;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use app::App;
use cli::{Cli, Commands};
use config::BotCredentials;
use errors::ArmyError;
use msgstate::now_epoch;
use paths::Paths;
use poller::TelegramPoller;
use tmux::{Multiplexer, TmuxCli};

/// Ensure only one daemon runs: probe the PID in the lockfile with
/// signal 0 and abort if that process is still alive.
fn check_singleton(paths: &Paths) -> Result<(), ArmyError> {
    if let Ok(content) = fs::read_to_string(&paths.pid_file) {
        if let Ok(pid) = content.trim().parse::<i32>() {
            let alive = unsafe { libc::kill(pid, 0) } == 0;
            if alive {
                return Err(ArmyError::AlreadyRunning(pid));
            }
            tracing::debug!(pid, "Stale PID file, taking over");
        }
    }
    fs::write(&paths.pid_file, std::process::id().to_string())?;
    Ok(())
}

fn remove_pid_file(paths: &Paths) {
    if let Err(e) = fs::remove_file(&paths.pid_file) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(error = %e, "Could not remove PID file");
        }
    }
}

/// Offline registry rebuild (same walk as /recover)
fn run_recover(paths: &Paths) -> Result<()> {
    let mut registry = registry::RegistryStore::open(paths.registry_file())
        .map_err(|e| eyre!("registry unreadable: {e}"))?;
    let markers = lifecycle::find_markers(&paths.home);
    let report = registry
        .update(|r| lifecycle::apply_markers(r, markers))
        .map_err(|e| eyre!("registry write failed: {e}"))?;

    println!("Re-registered: {}", report.registered.len());
    for name in &report.registered {
        println!("  + {name}");
    }
    if !report.pending.is_empty() {
        println!("Pending markers left for review:");
        for dir in &report.pending {
            println!("  ? {}", dir.display());
        }
    }
    if !report.corrupt.is_empty() {
        println!("Corrupt markers (fix or remove manually):");
        for dir in &report.corrupt {
            println!("  ! {}", dir.display());
        }
    }
    Ok(())
}

/// One-shot lifecycle operation invoked from the command line (typically by
/// the operator agent). Mutates the shared stores atomically; a running
/// daemon sees the change via mtime auto-reload.
async fn run_task_command(paths: &Paths, log_level: &str, command: Commands) -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!("claude_army={log_level}")))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let mux = TmuxCli;
    if !mux.server_alive() {
        return Err(eyre!("{}", ArmyError::TmuxUnavailable));
    }
    let creds = BotCredentials::load(&paths.credentials_file)
        .map_err(|e| eyre!("cannot read {}: {e}", paths.credentials_file.display()))?;
    let mut app = App::new(paths.clone(), &creds, Box::new(TmuxCli)).map_err(|e| eyre!("{e}"))?;

    match command {
        Commands::Spawn { name, dir } => {
            let pane = app.spawn_session_task(&name, &dir).await.map_err(|e| eyre!("{e}"))?;
            println!("Spawned '{name}' in pane {pane}");
        }
        Commands::SpawnWorktree { name, repo } => {
            let pane = app.spawn_worktree_task(&name, &repo).await.map_err(|e| eyre!("{e}"))?;
            println!("Spawned '{name}' (worktree) in pane {pane}");
        }
        Commands::Pause { name } => {
            app.pause_task(&name).await.map_err(|e| eyre!("{e}"))?;
            println!("Paused '{name}'");
        }
        Commands::Resume { name } => {
            let pane = app.resume_task(&name).await.map_err(|e| eyre!("{e}"))?;
            println!("Resumed '{name}' in pane {pane}");
        }
        Commands::Cleanup { name, delete_topic } => {
            app.cleanup_task(&name, delete_topic).await.map_err(|e| eyre!("{e}"))?;
            println!("Cleaned up '{name}'");
        }
        Commands::Recover | Commands::Completions { .. } => unreachable!("handled by caller"),
    }
    app.msg_state.flush().map_err(|e| eyre!("{e}"))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    color_eyre::install()?;

    let paths = Paths::standard();

    match cli.command {
        Some(Commands::Completions { shell }) => {
            cli::print_completions(shell);
            return Ok(());
        }
        Some(Commands::Recover) => return run_recover(&paths),
        Some(command) => return run_task_command(&paths, &cli.log_level, command).await,
        None => {}
    }

    // File logging with millisecond-precision timestamps
    let log_dir = paths.log_file.parent().unwrap_or(std::path::Path::new("/tmp"));
    let log_name = paths.log_file.file_name().unwrap_or_default();
    let file_appender = tracing_appender::rolling::never(log_dir, log_name);
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let log_filter = format!("claude_army={}", cli.log_level);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_filter))
        .with(tracing_subscriber::fmt::layer().with_target(true).with_writer(non_blocking))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    tracing::info!("Starting claude-army v{}", env!("CARGO_PKG_VERSION"));

    // Startup preflight: singleton, tmux, credentials
    check_singleton(&paths).map_err(|e| eyre!("{e}"))?;
    let mux = TmuxCli;
    if !mux.server_alive() {
        remove_pid_file(&paths);
        return Err(eyre!("{}", ArmyError::TmuxUnavailable));
    }
    let creds = BotCredentials::load(&paths.credentials_file).map_err(|e| {
        remove_pid_file(&paths);
        eyre!("cannot read {}: {e}", paths.credentials_file.display())
    })?;

    let mut app = App::new(paths.clone(), &creds, Box::new(TmuxCli)).map_err(|e| eyre!("{e}"))?;

    // Bootstrap: crash recovery, then watchers from persisted state, then
    // a first discovery pass
    match app.recover() {
        Ok(report) => tracing::info!(
            registered = report.registered.len(),
            pending = report.pending.len(),
            corrupt = report.corrupt.len(),
            "Registry recovery pass complete"
        ),
        Err(e) => tracing::warn!(error = %e, "Registry recovery failed"),
    }
    app.transcripts.attach_from_state(&app.msg_state);
    {
        let paths = app.paths.clone();
        app.transcripts.discover(app.mux.as_ref(), &paths);
    }
    app.last_discover = now_epoch();

    // Long-poll task feeding the orchestration loop
    let (update_tx, mut update_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let poller = TelegramPoller::new(&creds.bot_token);
    let poller_cancel = cancel.clone();
    let poller_handle = tokio::spawn(async move {
        poller.run(update_tx, poller_cancel).await;
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut tick = tokio::time::interval(std::time::Duration::from_millis(cli.tick_ms.max(10)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::info!("Watching transcripts and polling Telegram...");

    loop {
        tokio::select! {
            Some(update) = update_rx.recv() => {
                app.handle_update(update).await;
            }
            _ = tick.tick() => {
                if let Err(e) = app.tick(now_epoch()).await {
                    tracing::error!(error = %e, "Tick failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM, shutting down");
                break;
            }
        }
    }

    // Exit-atomic parts: message-state flush, then the lockfile
    cancel.cancel();
    poller_handle.abort();
    if let Err(e) = app.msg_state.flush() {
        tracing::warn!(error = %e, "Final state flush failed");
    }
    remove_pid_file(&paths);
    Ok(())
}
