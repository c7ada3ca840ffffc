//! Outbound routing: which topic does an event belong to?
//!
//! Given the `(pane, cwd)` of an originating event:
//! 1. the operator pane maps to the General topic
//! 2. a registered task at that path maps to its topic (repairing the
//!    task's recorded pane if it drifted)
//! 3. a completed marker on disk is imported into the registry and used
//! 4. otherwise the pane is auto-registered as a new task
//! 5. if auto-registration fails (typically missing topic rights) events
//!    fall back to the General topic, with a one-shot admin warning

use std::path::Path;

use crate::app::App;
use crate::errors::{ArmyError, Result};
use crate::marker::{read_marker, Marker};
use crate::registry::{Task, TaskStatus};
use crate::telegram::Destination;

impl App {
    /// Resolve the chat destination for an event from `(pane, cwd)`.
    pub async fn route_event(&mut self, pane: &str, cwd: &Path) -> Result<Destination> {
        let group = self.group_id()?;

        if self.is_operator_pane(pane) {
            return Ok(general(group));
        }

        // Registered task at this path
        if let Some((name, task)) = self
            .registry
            .get()
            .find_by_path(cwd)
            .map(|(n, t)| (n.to_string(), t.clone()))
        {
            if task.pane.as_deref() != Some(pane) {
                self.registry.update(|r| {
                    if let Some(t) = r.tasks.get_mut(&name) {
                        t.pane = Some(pane.to_string());
                    }
                })?;
            }
            return Ok(Destination::topic(group, task.topic_id));
        }

        // Worktree agents sometimes cd below the task root, so the cwd no
        // longer matches the task path; the pane index still resolves them
        if let Some((_, task)) = self.registry.get().find_by_pane(pane) {
            return Ok(Destination::topic(group, task.topic_id));
        }

        // Completed marker on disk: import it
        match read_marker(cwd) {
            Ok(Some(Marker::Completed { name, flavor, topic_id, repo, status, .. })) => {
                tracing::info!(task = %name, cwd = %cwd.display(), "Importing task from marker");
                self.registry.update(|r| {
                    r.add_task(
                        &name,
                        Task {
                            flavor,
                            path: cwd.to_path_buf(),
                            topic_id,
                            pane: Some(pane.to_string()),
                            repo,
                            status: status.unwrap_or(TaskStatus::Active),
                        },
                    );
                })?;
                return Ok(Destination::topic(group, topic_id));
            }
            Ok(Some(Marker::Pending { .. })) => {
                // Mid-creation evidence; do not auto-register on top of it
                tracing::warn!(cwd = %cwd.display(), "Pending marker present, routing to General");
                return Ok(general(group));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(cwd = %cwd.display(), error = %e, "Marker unreadable, routing to General");
                return Ok(general(group));
            }
        }

        // Unknown pane: make a task for it
        match self.auto_register(pane, cwd).await {
            Ok(topic_id) => Ok(Destination::topic(group, topic_id)),
            Err(e) => {
                self.warn_fallback_once(&e).await;
                Ok(general(group))
            }
        }
    }

    /// One-shot human-readable warning when notifications fall back to the
    /// General topic.
    async fn warn_fallback_once(&mut self, cause: &ArmyError) {
        if self.fallback_warned {
            return;
        }
        self.fallback_warned = true;
        let Ok(group) = self.group_id() else {
            return;
        };
        let text = match cause {
            ArmyError::TopicCreationRefused => {
                "\u{26a0}\u{fe0f} I can't create topics in this group (missing \
                 'Manage Topics' admin right), so notifications for new panes \
                 will land here in General until that is fixed."
                    .to_string()
            }
            other => format!(
                "\u{26a0}\u{fe0f} Task registration failed ({other}); notifications \
                 will land here in General."
            ),
        };
        if let Err(e) = self
            .tg
            .send_message(Destination::general(group), &text, None, None)
            .await
        {
            tracing::warn!(error = %e, "Fallback warning could not be sent");
        }
    }

}

/// The General topic is addressed by omitting the thread id entirely
fn general(group: i64) -> Destination {
    Destination::general(group)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::write_marker;
    use crate::operator::tests::{configure, test_app};
    use crate::registry::Flavor;
    use chrono::Utc;

    #[tokio::test]
    async fn test_operator_pane_routes_to_general() {
        let home = tempfile::tempdir().unwrap();
        let (mut app, _mux) = test_app(home.path());
        configure(&mut app);
        app.config.update(|c| c.operator_pane = Some("ca-op:0.0".into())).unwrap();

        let dest = app.route_event("ca-op:0.0", home.path()).await.unwrap();
        assert_eq!(dest, Destination::general(-100));
    }

    #[tokio::test]
    async fn test_registered_path_routes_to_topic_and_repairs_pane() {
        let home = tempfile::tempdir().unwrap();
        let (mut app, _mux) = test_app(home.path());
        configure(&mut app);
        let dir = home.path().join("w");
        app.registry
            .update(|r| {
                r.add_task(
                    "w",
                    Task {
                        flavor: Flavor::Session,
                        path: dir.clone(),
                        topic_id: 77,
                        pane: Some("stale:0.0".into()),
                        repo: None,
                        status: TaskStatus::Active,
                    },
                );
            })
            .unwrap();

        let dest = app.route_event("fresh:0.0", &dir).await.unwrap();
        assert_eq!(dest, Destination::topic(-100, 77));
        assert_eq!(
            app.registry.get().get_task("w").unwrap().pane.as_deref(),
            Some("fresh:0.0")
        );
    }

    #[tokio::test]
    async fn test_pane_index_rescues_subdirectory_cwd() {
        let home = tempfile::tempdir().unwrap();
        let (mut app, _mux) = test_app(home.path());
        configure(&mut app);
        let dir = home.path().join("w");
        app.registry
            .update(|r| {
                r.add_task(
                    "w",
                    Task {
                        flavor: Flavor::Worktree,
                        path: dir.clone(),
                        topic_id: 88,
                        pane: Some("ca-w:0.0".into()),
                        repo: None,
                        status: TaskStatus::Active,
                    },
                );
            })
            .unwrap();

        // Agent cd'ed into a subdirectory: path lookup misses, pane hits
        let sub = dir.join("src/deep");
        let dest = app.route_event("ca-w:0.0", &sub).await.unwrap();
        assert_eq!(dest, Destination::topic(-100, 88));
    }

    #[tokio::test]
    async fn test_completed_marker_is_imported() {
        let home = tempfile::tempdir().unwrap();
        let (mut app, _mux) = test_app(home.path());
        configure(&mut app);
        let dir = home.path().join("imported");
        std::fs::create_dir_all(&dir).unwrap();
        write_marker(
            &dir,
            &Marker::Completed {
                name: "imported".into(),
                flavor: Flavor::Session,
                topic_id: 55,
                created_at: Utc::now(),
                repo: None,
                status: None,
            },
        )
        .unwrap();

        let dest = app.route_event("%3", &dir).await.unwrap();
        assert_eq!(dest, Destination::topic(-100, 55));
        assert_eq!(app.registry.get().get_task("imported").unwrap().topic_id, 55);
    }

    #[tokio::test]
    async fn test_pending_marker_routes_to_general() {
        let home = tempfile::tempdir().unwrap();
        let (mut app, _mux) = test_app(home.path());
        configure(&mut app);
        let dir = home.path().join("half");
        std::fs::create_dir_all(&dir).unwrap();
        write_marker(
            &dir,
            &Marker::Pending { pending_topic_name: "half".into(), pending_since: 1.0 },
        )
        .unwrap();

        let dest = app.route_event("%3", &dir).await.unwrap();
        assert_eq!(dest, Destination::general(-100));
        // Still pending; nothing was registered
        assert!(app.registry.get().tasks.is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_routing_is_error() {
        let home = tempfile::tempdir().unwrap();
        let (mut app, _mux) = test_app(home.path());
        assert!(app.route_event("%1", home.path()).await.is_err());
    }
}
