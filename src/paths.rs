//! Filesystem layout and path helpers
//!
//! Everything the daemon persists lives in one of three places:
//! - `~/.claude-army/` for configuration and the task registry
//! - `<task-dir>/.claude/army.json` for per-task marker files
//! - `/tmp/` for runtime state (message state, PID lockfile, daemon log)
//!
//! All paths are carried in a `Paths` handle threaded through the app so
//! tests can point everything at a tempdir.

use std::path::{Path, PathBuf};

/// Marker file name inside a task directory's `.claude/` folder
pub const MARKER_FILE_NAME: &str = "army.json";

/// Resolved filesystem layout for one daemon instance
#[derive(Debug, Clone)]
pub struct Paths {
    /// User home directory (recovery walks start here)
    pub home: PathBuf,
    /// App directory holding config.json and registry.json
    pub army_dir: PathBuf,
    /// Message-state file (survives restarts, keyed by Telegram msg id)
    pub state_file: PathBuf,
    /// PID lockfile gating process uniqueness
    pub pid_file: PathBuf,
    /// Line-delimited daemon log
    pub log_file: PathBuf,
    /// Telegram credentials file (`{bot_token, chat_id}`)
    pub credentials_file: PathBuf,
}

impl Paths {
    /// Standard layout rooted at the real home directory
    pub fn standard() -> Self {
        let home = directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        Self::rooted_at(&home, Path::new("/tmp"))
    }

    /// Layout rooted at arbitrary directories (tests use tempdirs)
    pub fn rooted_at(home: &Path, runtime_dir: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
            army_dir: home.join(".claude-army"),
            state_file: runtime_dir.join("claude-army-state.json"),
            pid_file: runtime_dir.join("claude-army-daemon.pid"),
            log_file: runtime_dir.join("claude-army-daemon.log"),
            credentials_file: home.join("telegram.json"),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.army_dir.join("config.json")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.army_dir.join("registry.json")
    }

    /// Marker path for a task directory: `<dir>/.claude/army.json`
    pub fn marker_file(task_dir: &Path) -> PathBuf {
        task_dir.join(".claude").join(MARKER_FILE_NAME)
    }

    /// Directory where Claude Code keeps transcripts for a working directory
    ///
    /// Claude encodes `/home/ubuntu/foo` as `-home-ubuntu-foo` under
    /// `~/.claude/projects/`.
    pub fn transcript_dir(&self, cwd: &Path) -> PathBuf {
        let encoded = cwd.to_string_lossy().replace('/', "-");
        self.home.join(".claude").join("projects").join(encoded)
    }

    /// Strip the home prefix from a path for display
    pub fn strip_home(&self, path: &Path) -> String {
        let s = path.to_string_lossy();
        let prefix = format!("{}/", self.home.to_string_lossy());
        s.strip_prefix(&prefix).unwrap_or(&s).to_string()
    }
}

/// Best-effort reverse of the transcript-dir encoding.
///
/// Path format: `~/.claude/projects/{encoded}/{session}.jsonl` where the
/// encoding replaced `/` with `-`. The mapping is lossy for directory names
/// containing hyphens; only the first three separators are decoded, matching
/// the depth of typical `/home/user/project` paths. Used only as a fallback
/// for persisted entries that predate cwd recording - discovery always takes
/// the authoritative cwd from tmux.
pub fn decode_cwd_from_transcript(transcript_path: &Path) -> Option<PathBuf> {
    let mut components = transcript_path.components();
    while let Some(c) = components.next() {
        if c.as_os_str() == "projects" {
            let encoded = components.next()?.as_os_str().to_string_lossy().into_owned();
            let decoded = format!("/{}", encoded.trim_start_matches('-').replacen('-', "/", 2));
            return Some(PathBuf::from(decoded));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_rooted() {
        let paths = Paths::rooted_at(Path::new("/home/u"), Path::new("/tmp"));
        assert_eq!(paths.config_file(), PathBuf::from("/home/u/.claude-army/config.json"));
        assert_eq!(paths.registry_file(), PathBuf::from("/home/u/.claude-army/registry.json"));
        assert_eq!(paths.state_file, PathBuf::from("/tmp/claude-army-state.json"));
        assert_eq!(paths.pid_file, PathBuf::from("/tmp/claude-army-daemon.pid"));
    }

    #[test]
    fn test_marker_path() {
        assert_eq!(
            Paths::marker_file(Path::new("/w/feat")),
            PathBuf::from("/w/feat/.claude/army.json")
        );
    }

    #[test]
    fn test_transcript_dir_encoding() {
        let paths = Paths::rooted_at(Path::new("/home/u"), Path::new("/tmp"));
        // Slashes become hyphens; hyphens already in the name are preserved
        assert_eq!(
            paths.transcript_dir(Path::new("/home/u/my-project")),
            PathBuf::from("/home/u/.claude/projects/-home-u-my-project")
        );
    }

    #[test]
    fn test_strip_home() {
        let paths = Paths::rooted_at(Path::new("/home/u"), Path::new("/tmp"));
        assert_eq!(paths.strip_home(Path::new("/home/u/work/x")), "work/x");
        assert_eq!(paths.strip_home(Path::new("/opt/other")), "/opt/other");
    }

    #[test]
    fn test_decode_cwd_fallback() {
        let decoded = decode_cwd_from_transcript(Path::new(
            "/home/u/.claude/projects/-home-u-proj/abc.jsonl",
        ));
        assert_eq!(decoded, Some(PathBuf::from("/home/u/proj")));
    }

    #[test]
    fn test_decode_cwd_no_projects_component() {
        assert_eq!(decode_cwd_from_transcript(Path::new("/var/log/x.jsonl")), None);
    }
}
