//! Git operations for task worktrees
//!
//! Provides worktree management for isolated agent work:
//! - Create worktrees under `<repo>/trees/<task>` for parallel development
//! - Remove worktrees when a task is cleaned up
//! - Run the repo's optional setup hook after worktree creation
//!
//! Uses direct CLI commands (no libgit2) for simplicity and compatibility.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::errors::{ArmyError, Result};

/// Directory under the repository root that holds task worktrees
const WORKTREE_BASE: &str = "trees";

/// Optional per-repo hook run after worktree creation
pub const SETUP_HOOK_NAME: &str = ".claude-army-setup.sh";

/// Hard deadline for the setup hook
const SETUP_HOOK_DEADLINE: Duration = Duration::from_secs(60);

/// Worktree path for a task: `<repo>/trees/<task>`
pub fn worktree_path(repo: &Path, task_name: &str) -> PathBuf {
    repo.join(WORKTREE_BASE).join(task_name)
}

/// Create a git worktree for a task. Fails fast if git refuses (e.g. the
/// path already holds a checkout of a conflicting branch).
///
/// Tries `worktree add -b <task>` first; when the branch already exists,
/// retries as a plain checkout of that branch.
pub fn create_worktree(repo: &Path, task_name: &str) -> Result<PathBuf> {
    let path = worktree_path(repo, task_name);
    if path.exists() {
        tracing::info!(path = %path.display(), "Worktree already exists, reusing");
        return Ok(path);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let path_str = path.to_string_lossy().to_string();
    let output = git(repo, &["worktree", "add", "-b", task_name, &path_str, "HEAD"])?;
    if !output.status.success() {
        // Branch may already exist from an earlier run; check it out instead
        let retry = git(repo, &["worktree", "add", &path_str, task_name])?;
        if !retry.status.success() {
            return Err(ArmyError::Worktree(
                String::from_utf8_lossy(&retry.stderr).trim().to_string(),
            ));
        }
    }

    tracing::info!(repo = %repo.display(), task = %task_name, path = %path.display(), "Created worktree");
    Ok(path)
}

/// Remove a task's worktree. Idempotent: a missing worktree is success.
pub fn remove_worktree(repo: &Path, task_name: &str) -> Result<()> {
    let path = worktree_path(repo, task_name);
    if !path.exists() {
        return Ok(());
    }
    let path_str = path.to_string_lossy().to_string();
    let output = git(repo, &["worktree", "remove", "--force", &path_str])?;
    if !output.status.success() {
        return Err(ArmyError::Worktree(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    tracing::info!(task = %task_name, path = %path.display(), "Removed worktree");
    Ok(())
}

/// Run the repo's setup hook in the new worktree, if present.
///
/// The hook is advisory: failure or timeout is logged and task creation
/// proceeds. Returns false when the hook failed.
pub fn run_setup_hook(repo: &Path, task_name: &str, worktree: &Path) -> bool {
    let hook = repo.join(SETUP_HOOK_NAME);
    if !hook.exists() {
        return true;
    }

    tracing::info!(hook = %hook.display(), "Running setup hook");
    let child = Command::new("bash")
        .arg(&hook)
        .current_dir(worktree)
        .env("TASK_NAME", task_name)
        .env("REPO_PATH", repo)
        .env("WORKTREE_PATH", worktree)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match child {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "Setup hook failed to start");
            return false;
        }
    };

    let deadline = Instant::now() + SETUP_HOOK_DEADLINE;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if status.success() {
                    tracing::info!("Setup hook completed");
                    return true;
                }
                tracing::warn!(status = %status, "Setup hook failed");
                return false;
            }
            Ok(None) if Instant::now() >= deadline => {
                tracing::warn!("Setup hook exceeded 60s deadline, killing");
                let _ = child.kill();
                let _ = child.wait();
                return false;
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(200)),
            Err(e) => {
                tracing::warn!(error = %e, "Setup hook wait failed");
                return false;
            }
        }
    }
}

fn git(repo: &Path, args: &[&str]) -> Result<std::process::Output> {
    let repo_str = repo.to_string_lossy().to_string();
    Command::new("git")
        .arg("-C")
        .arg(&repo_str)
        .args(args)
        .output()
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worktree_path_layout() {
        assert_eq!(
            worktree_path(Path::new("/repos/app"), "fix-auth"),
            PathBuf::from("/repos/app/trees/fix-auth")
        );
    }

    #[test]
    fn test_missing_hook_is_success() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run_setup_hook(dir.path(), "t", dir.path()));
    }

    #[test]
    fn test_failing_hook_reports_false() {
        let repo = tempfile::tempdir().unwrap();
        let tree = tempfile::tempdir().unwrap();
        std::fs::write(repo.path().join(SETUP_HOOK_NAME), "exit 1\n").unwrap();
        assert!(!run_setup_hook(repo.path(), "t", tree.path()));
    }

    #[test]
    fn test_hook_sees_env() {
        let repo = tempfile::tempdir().unwrap();
        let tree = tempfile::tempdir().unwrap();
        std::fs::write(
            repo.path().join(SETUP_HOOK_NAME),
            "[ \"$TASK_NAME\" = mytask ] && [ -n \"$REPO_PATH\" ] && [ -n \"$WORKTREE_PATH\" ]\n",
        )
        .unwrap();
        assert!(run_setup_hook(repo.path(), "mytask", tree.path()));
    }

    #[test]
    fn test_remove_missing_worktree_is_ok() {
        let repo = tempfile::tempdir().unwrap();
        assert!(remove_worktree(repo.path(), "ghost").is_ok());
    }
}
