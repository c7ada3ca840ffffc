//! Task lifecycle: spawn, pause, resume, cleanup, recovery
//!
//! The crash-safe topic-creation protocol is the heart of spawn:
//! 1. write a *pending* marker into the task directory
//! 2. create the forum topic (may fail, leaving the pending marker behind
//!    as evidence for the operator)
//! 3. send the welcome message
//! 4. overwrite the marker with its completed form
//!
//! After step 4 the marker is the ground truth: registry rebuilds walk the
//! filesystem for markers and re-register completed ones. Pending markers
//! are deliberately left alone - auto-registering one could orphan a topic
//! that was half-created.

use chrono::Utc;
use std::path::{Path, PathBuf};

use crate::app::App;
use crate::errors::{ArmyError, Result};
use crate::git;
use crate::inject;
use crate::marker::{read_marker, remove_marker, write_marker, Marker};
use crate::msgstate::now_epoch;
use crate::registry::{Flavor, Registry, Task, TaskStatus};
use crate::telegram::Destination;

/// tmux session name for a worker task
pub fn worker_session(task_name: &str) -> String {
    format!("ca-{task_name}")
}

/// First prompt for a freshly spawned agent
fn first_prompt(task_name: &str, dir: &Path) -> String {
    format!(
        "You are working on task '{task_name}' in {}. \
         Summarise the state of this directory and what you plan to do, \
         then wait for confirmation before changing anything.",
        dir.display()
    )
}

/// Resume command: continue the previous conversation, else start fresh
fn resume_command(task_name: &str) -> String {
    format!(
        "claude --continue || claude \"Resuming task '{task_name}'. \
         Re-read the working directory and summarise where things stand.\""
    )
}

/// Outcome of a registry rebuild from marker files
#[derive(Debug, Default)]
pub struct RecoverReport {
    /// Tasks re-registered from completed markers
    pub registered: Vec<String>,
    /// Pending markers left for operator review
    pub pending: Vec<PathBuf>,
    /// Markers that exist but do not parse
    pub corrupt: Vec<PathBuf>,
}

impl App {
    /// Crash-safe topic creation (steps 1-4 above). Returns the topic id.
    async fn create_task_topic(&mut self, dir: &Path, name: &str) -> Result<i64> {
        let group = self.group_id()?;

        write_marker(
            dir,
            &Marker::Pending {
                pending_topic_name: name.to_string(),
                pending_since: now_epoch(),
            },
        )?;

        let topic_id = self.tg.create_forum_topic(group, name).await?;

        self.tg
            .send_message(
                Destination::topic(group, topic_id),
                &format!(
                    "Task `{name}` created. Reply in this topic to talk to its agent; \
                     permission prompts will show up here with Allow/Deny buttons."
                ),
                None,
                None,
            )
            .await?;

        write_marker(
            dir,
            &Marker::Completed {
                name: name.to_string(),
                flavor: Flavor::Session,
                topic_id,
                created_at: Utc::now(),
                repo: None,
                status: Some(TaskStatus::Active),
            },
        )?;
        Ok(topic_id)
    }

    /// Spawn a session-flavor task over an existing directory.
    pub async fn spawn_session_task(&mut self, name: &str, dir: &Path) -> Result<String> {
        if !dir.is_dir() {
            return Err(ArmyError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such directory: {}", dir.display()),
            )));
        }
        if self.registry.get().get_task(name).is_some() {
            return Err(ArmyError::DuplicateTask(name.to_string()));
        }

        let topic_id = self.create_task_topic(dir, name).await?;
        let pane = self.attach_or_create_pane(name, dir)?;

        self.registry.update(|r| {
            r.add_task(
                name,
                Task {
                    flavor: Flavor::Session,
                    path: dir.to_path_buf(),
                    topic_id,
                    pane: Some(pane.clone()),
                    repo: None,
                    status: TaskStatus::Active,
                },
            );
        })?;
        tracing::info!(task = %name, pane = %pane, topic_id, "Spawned session task");
        Ok(pane)
    }

    /// Spawn a worktree-flavor task: worktree first (fails fast on
    /// conflicts), then setup hook, then the topic protocol, then the pane.
    /// The worktree is rolled back if any later step fails.
    pub async fn spawn_worktree_task(&mut self, name: &str, repo: &Path) -> Result<String> {
        if self.registry.get().get_task(name).is_some() {
            return Err(ArmyError::DuplicateTask(name.to_string()));
        }

        let worktree = git::create_worktree(repo, name)?;
        // Advisory: a failing hook is logged inside run_setup_hook
        git::run_setup_hook(repo, name, &worktree);

        let result = self.finish_worktree_spawn(name, repo, &worktree).await;
        if result.is_err() {
            tracing::warn!(task = %name, "Spawn failed after worktree creation, rolling back");
            if let Err(e) = git::remove_worktree(repo, name) {
                tracing::error!(task = %name, error = %e, "Worktree rollback failed");
            }
        }
        result
    }

    async fn finish_worktree_spawn(
        &mut self,
        name: &str,
        repo: &Path,
        worktree: &Path,
    ) -> Result<String> {
        let topic_id = self.create_task_topic(worktree, name).await?;
        // The topic protocol writes a session-flavor marker; rewrite with
        // the worktree fields so recovery knows how to clean up
        write_marker(
            worktree,
            &Marker::Completed {
                name: name.to_string(),
                flavor: Flavor::Worktree,
                topic_id,
                created_at: Utc::now(),
                repo: Some(repo.to_path_buf()),
                status: Some(TaskStatus::Active),
            },
        )?;

        let pane = self.attach_or_create_pane(name, worktree)?;
        self.registry.update(|r| {
            r.add_task(
                name,
                Task {
                    flavor: Flavor::Worktree,
                    path: worktree.to_path_buf(),
                    topic_id,
                    pane: Some(pane.clone()),
                    repo: Some(repo.to_path_buf()),
                    status: TaskStatus::Active,
                },
            );
        })?;
        tracing::info!(task = %name, pane = %pane, topic_id, "Spawned worktree task");
        Ok(pane)
    }

    /// Attach to a pane already running in `dir`, or create the worker
    /// session and launch the agent with its first prompt.
    fn attach_or_create_pane(&mut self, name: &str, dir: &Path) -> Result<String> {
        if let Some(pane) = self.mux.find_pane_by_cwd(dir)? {
            tracing::info!(task = %name, pane = %pane, "Attached to existing pane");
            return Ok(pane);
        }

        let session = worker_session(name);
        self.mux.create_session(&session, dir)?;
        let pane = self
            .mux
            .first_pane(&session)?
            .ok_or_else(|| ArmyError::PaneDead(session.clone()))?;
        let prompt = first_prompt(name, dir);
        inject::send_plain(self.mux.as_ref(), &pane, &format!("claude \"{prompt}\""))?;
        Ok(pane)
    }

    /// Auto-register a discovered pane whose cwd has neither a registry
    /// entry nor a marker. Returns the new task's topic id.
    pub async fn auto_register(&mut self, pane: &str, cwd: &Path) -> Result<i64> {
        let base = cwd
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "task".to_string());
        let name = self.registry.get().unique_name(&base);

        let topic_id = self.create_task_topic(cwd, &name).await?;
        self.registry.update(|r| {
            r.add_task(
                &name,
                Task {
                    flavor: Flavor::Session,
                    path: cwd.to_path_buf(),
                    topic_id,
                    pane: Some(pane.to_string()),
                    repo: None,
                    status: TaskStatus::Active,
                },
            );
        })?;
        tracing::info!(task = %name, pane = %pane, topic_id, "Auto-registered task");
        Ok(topic_id)
    }

    /// Pause: stop the session, keep the topic, drop the pane.
    pub async fn pause_task(&mut self, name: &str) -> Result<()> {
        let task = self
            .registry
            .get()
            .get_task(name)
            .cloned()
            .ok_or_else(|| ArmyError::UnknownTask(name.to_string()))?;

        let session = worker_session(name);
        if self.mux.session_exists(&session) {
            self.mux.kill_session(&session)?;
        }

        self.set_marker_status(&task.path, TaskStatus::Paused)?;
        self.registry.update(|r| {
            if let Some(t) = r.tasks.get_mut(name) {
                t.pane = None;
                t.status = TaskStatus::Paused;
            }
        })?;
        self.update_topic_title(task.topic_id, name, TaskStatus::Paused.emoji())
            .await;
        tracing::info!(task = %name, "Task paused");
        Ok(())
    }

    /// Resume: recreate the pane (or adopt a racing session) and restore
    /// active status.
    pub async fn resume_task(&mut self, name: &str) -> Result<String> {
        let task = self
            .registry
            .get()
            .get_task(name)
            .cloned()
            .ok_or_else(|| ArmyError::UnknownTask(name.to_string()))?;

        let session = worker_session(name);
        let pane = if self.mux.session_exists(&session) {
            // Race: another actor recreated the session; reuse it and do
            // not relaunch the agent
            self.mux
                .first_pane(&session)?
                .ok_or_else(|| ArmyError::PaneDead(session.clone()))?
        } else {
            self.mux.create_session(&session, &task.path)?;
            let pane = self
                .mux
                .first_pane(&session)?
                .ok_or_else(|| ArmyError::PaneDead(session.clone()))?;
            inject::send_plain(self.mux.as_ref(), &pane, &resume_command(name))?;
            pane
        };

        self.set_marker_status(&task.path, TaskStatus::Active)?;
        self.registry.update(|r| {
            if let Some(t) = r.tasks.get_mut(name) {
                t.pane = Some(pane.clone());
                t.status = TaskStatus::Active;
            }
        })?;
        self.update_topic_title(task.topic_id, name, TaskStatus::Active.emoji())
            .await;
        tracing::info!(task = %name, pane = %pane, "Task resumed");
        Ok(pane)
    }

    /// Cleanup: stop the session, close or delete the topic, remove the
    /// directory (worktree) or just the marker (session), drop from the
    /// registry.
    pub async fn cleanup_task(&mut self, name: &str, delete_topic: bool) -> Result<()> {
        let task = self
            .registry
            .get()
            .get_task(name)
            .cloned()
            .ok_or_else(|| ArmyError::UnknownTask(name.to_string()))?;
        let group = self.group_id()?;

        let session = worker_session(name);
        if self.mux.session_exists(&session) {
            self.mux.kill_session(&session)?;
        }

        if delete_topic {
            if let Err(e) = self.tg.delete_forum_topic(group, task.topic_id).await {
                tracing::warn!(task = %name, error = %e, "Topic deletion failed");
            }
        } else {
            // Closed topics retain history; mark them done first
            self.update_topic_title(task.topic_id, name, "\u{2705}").await;
            if let Err(e) = self.tg.close_forum_topic(group, task.topic_id).await {
                tracing::warn!(task = %name, error = %e, "Topic close failed");
            }
        }

        match task.flavor {
            Flavor::Worktree => {
                let repo = task.repo.as_deref().unwrap_or(&task.path);
                git::remove_worktree(repo, name)?;
            }
            Flavor::Session => {
                remove_marker(&task.path)?;
            }
        }

        self.registry.update(|r| {
            r.remove_task(name);
        })?;
        tracing::info!(task = %name, "Task cleaned up");
        Ok(())
    }

    /// Worker pane for a topic, resurrecting the session when missing.
    /// Paused tasks are not resurrected implicitly.
    pub async fn worker_pane_for_topic(&mut self, topic_id: i64) -> Result<String> {
        let (name, task) = self
            .registry
            .get()
            .find_by_topic(topic_id)
            .map(|(n, t)| (n.to_string(), t.clone()))
            .ok_or_else(|| ArmyError::UnknownTask(format!("topic {topic_id}")))?;

        if task.status == TaskStatus::Paused {
            return Err(ArmyError::PaneDead(format!("task '{name}' is paused")));
        }

        let session = worker_session(&name);
        match task.pane {
            Some(pane) if self.mux.session_exists(&session) => {
                // Opportunistically repair a stale pane id
                if let Ok(Some(live)) = self.mux.first_pane(&session) {
                    if live != pane {
                        self.registry.update(|r| {
                            if let Some(t) = r.tasks.get_mut(&name) {
                                t.pane = Some(live.clone());
                            }
                        })?;
                        return Ok(live);
                    }
                }
                Ok(pane)
            }
            _ => {
                tracing::info!(task = %name, "Worker session missing, resurrecting");
                self.resume_task(&name).await
            }
        }
    }

    /// Rename a topic to carry a status prefix. Best-effort.
    pub async fn update_topic_title(&mut self, topic_id: i64, name: &str, prefix: &str) {
        let Ok(group) = self.group_id() else {
            return;
        };
        let title = format!("{prefix} {name}");
        if let Err(e) = self.tg.edit_forum_topic(group, topic_id, &title).await {
            tracing::debug!(topic_id, error = %e, "Topic rename failed");
        }
    }

    fn set_marker_status(&self, dir: &Path, status: TaskStatus) -> Result<()> {
        match read_marker(dir)? {
            Some(Marker::Completed { name, flavor, topic_id, created_at, repo, .. }) => {
                write_marker(
                    dir,
                    &Marker::Completed {
                        name,
                        flavor,
                        topic_id,
                        created_at,
                        repo,
                        status: Some(status),
                    },
                )
            }
            _ => Ok(()), // pending or missing: nothing to update
        }
    }

    /// Rebuild the registry from marker files under the home directory.
    pub fn recover(&mut self) -> Result<RecoverReport> {
        let home = self.paths.home.clone();
        let markers = find_markers(&home);
        self.registry.update(|r| apply_markers(r, markers))
    }
}

/// Walk for `.claude/army.json` markers, skipping hidden and dependency
/// directories. Depth-capped so a huge home stays cheap.
pub fn find_markers(root: &Path) -> Vec<(PathBuf, std::result::Result<Marker, ArmyError>)> {
    const MAX_DEPTH: usize = 6;
    const SKIP_DIRS: &[&str] = &["node_modules", "target", ".git", ".cache"];

    let mut found = Vec::new();
    let mut stack = vec![(root.to_path_buf(), 0usize)];
    while let Some((dir, depth)) = stack.pop() {
        match read_marker(&dir) {
            Ok(Some(marker)) => found.push((dir.clone(), Ok(marker))),
            Ok(None) => {}
            Err(e) => found.push((dir.clone(), Err(e))),
        }
        if depth >= MAX_DEPTH {
            continue;
        }
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || SKIP_DIRS.contains(&name.as_ref()) {
                continue;
            }
            stack.push((path, depth + 1));
        }
    }
    found
}

/// Apply found markers to a registry. Idempotent: existing entries are
/// never overwritten, pending markers are reported but left alone, corrupt
/// markers are surfaced for the operator.
pub fn apply_markers(
    registry: &mut Registry,
    markers: Vec<(PathBuf, std::result::Result<Marker, ArmyError>)>,
) -> RecoverReport {
    let mut report = RecoverReport::default();
    for (dir, marker) in markers {
        match marker {
            Ok(Marker::Completed { name, flavor, topic_id, repo, status, .. }) => {
                if registry.get_task(&name).is_some() {
                    continue;
                }
                registry.add_task(
                    &name,
                    Task {
                        flavor,
                        path: dir,
                        topic_id,
                        pane: None, // rediscovered or recreated on demand
                        repo,
                        status: status.unwrap_or(TaskStatus::Active),
                    },
                );
                report.registered.push(name);
            }
            Ok(Marker::Pending { .. }) => {
                tracing::warn!(dir = %dir.display(), "Pending marker found, leaving for operator review");
                report.pending.push(dir);
            }
            Err(_) => {
                tracing::error!(dir = %dir.display(), "Corrupt marker file, not touching it");
                report.corrupt.push(dir);
            }
        }
    }
    report
}
