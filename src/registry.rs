//! Task registry
//!
//! In-memory map of task name -> task, persisted as
//! `~/.claude-army/registry.json` and rebuildable from per-directory marker
//! files. The persisted form carries no derived data; topic/path/pane
//! lookups are linear scans over a map that holds tens of entries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::store::JsonStore;

/// How a task's working directory came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flavor {
    /// A git worktree created (and eventually removed) by the daemon
    Worktree,
    /// A pre-existing directory the daemon only attaches to
    Session,
}

/// Task run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
}

impl TaskStatus {
    /// Emoji used in /status lines and topic titles
    pub fn emoji(self) -> &'static str {
        match self {
            TaskStatus::Active => "\u{25b6}\u{fe0f}",  // ▶️
            TaskStatus::Paused => "\u{23f8}\u{fe0f}",  // ⏸️
        }
    }
}

/// One registered task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub flavor: Flavor,
    /// Working directory the agent runs in
    pub path: PathBuf,
    /// Topic thread id inside the configured group
    pub topic_id: i64,
    /// Current pane, absent while paused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane: Option<String>,
    /// Owning repository (worktree flavor only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<PathBuf>,
    pub status: TaskStatus,
}

/// Persisted registry document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub tasks: BTreeMap<String, Task>,
}

impl Registry {
    /// Insert or overwrite a task
    pub fn add_task(&mut self, name: &str, task: Task) {
        self.tasks.insert(name.to_string(), task);
    }

    pub fn get_task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn remove_task(&mut self, name: &str) -> Option<Task> {
        self.tasks.remove(name)
    }

    pub fn find_by_topic(&self, topic_id: i64) -> Option<(&str, &Task)> {
        self.tasks
            .iter()
            .find(|(_, t)| t.topic_id == topic_id)
            .map(|(n, t)| (n.as_str(), t))
    }

    pub fn find_by_path(&self, path: &Path) -> Option<(&str, &Task)> {
        self.tasks
            .iter()
            .find(|(_, t)| t.path == path)
            .map(|(n, t)| (n.as_str(), t))
    }

    pub fn find_by_pane(&self, pane: &str) -> Option<(&str, &Task)> {
        self.tasks
            .iter()
            .find(|(_, t)| t.pane.as_deref() == Some(pane))
            .map(|(n, t)| (n.as_str(), t))
    }

    /// Synthesize a unique task name from a directory leaf
    ///
    /// `feat` -> `feat`, `feat-1`, `feat-2`, ... on collision.
    pub fn unique_name(&self, base: &str) -> String {
        if !self.tasks.contains_key(base) {
            return base.to_string();
        }
        let mut n = 1;
        loop {
            let candidate = format!("{base}-{n}");
            if !self.tasks.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Mtime-reloading store for the registry
pub type RegistryStore = JsonStore<Registry>;

#[cfg(test)]
mod tests {
    use super::*;

    fn task(path: &str, topic: i64, pane: Option<&str>) -> Task {
        Task {
            flavor: Flavor::Session,
            path: PathBuf::from(path),
            topic_id: topic,
            pane: pane.map(String::from),
            repo: None,
            status: TaskStatus::Active,
        }
    }

    #[test]
    fn test_add_get_readd_overwrites() {
        let mut reg = Registry::default();
        reg.add_task("feat", task("/w/feat", 10, Some("%1")));
        assert_eq!(reg.get_task("feat").unwrap().topic_id, 10);

        reg.add_task("feat", task("/w/feat", 11, None));
        assert_eq!(reg.get_task("feat").unwrap().topic_id, 11);
        assert_eq!(reg.tasks.len(), 1);
    }

    #[test]
    fn test_lookups() {
        let mut reg = Registry::default();
        reg.add_task("a", task("/w/a", 10, Some("ca-a:0.0")));
        reg.add_task("b", task("/w/b", 20, None));

        assert_eq!(reg.find_by_topic(20).unwrap().0, "b");
        assert_eq!(reg.find_by_path(Path::new("/w/a")).unwrap().0, "a");
        assert_eq!(reg.find_by_pane("ca-a:0.0").unwrap().0, "a");
        assert!(reg.find_by_pane("ca-b:0.0").is_none());
    }

    #[test]
    fn test_unique_name_collision() {
        let mut reg = Registry::default();
        assert_eq!(reg.unique_name("feat"), "feat");
        reg.add_task("feat", task("/w/feat", 10, None));
        assert_eq!(reg.unique_name("feat"), "feat-1");
        reg.add_task("feat-1", task("/w/feat1", 11, None));
        assert_eq!(reg.unique_name("feat"), "feat-2");
    }

    #[test]
    fn test_persisted_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let mut store = RegistryStore::open(path.clone()).unwrap();
        store
            .update(|r| r.add_task("feat", task("/w/feat", 10, Some("%1"))))
            .unwrap();

        let mut reopened = RegistryStore::open(path).unwrap();
        let t = reopened.get().get_task("feat").unwrap().clone();
        assert_eq!(t.path, PathBuf::from("/w/feat"));
        assert_eq!(t.pane.as_deref(), Some("%1"));
    }

    #[test]
    fn test_paused_task_serializes_without_pane() {
        let t = Task { status: TaskStatus::Paused, pane: None, ..task("/w/x", 5, None) };
        let json = serde_json::to_string(&t).unwrap();
        assert!(!json.contains("pane"));
        assert!(json.contains("paused"));
    }
}
