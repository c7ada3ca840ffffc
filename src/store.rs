//! Atomically-written JSON files with mtime-based auto-reload
//!
//! Both config.json and registry.json are mutated by this daemon *and* read
//! back after external edits (the operator agent rewrites them). `JsonStore`
//! keeps a cached copy and reloads whenever the file's mtime advances past
//! the last observed one, so readers always see the newest snapshot without
//! an inotify dependency.
//!
//! Writes go through write-temp-then-rename in the target directory, so a
//! crash mid-write never leaves a torn file behind.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::errors::Result;

/// Write JSON atomically: serialize to a sibling temp file, then rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    // Per-process temp name: the daemon and one-shot CLI invocations may
    // write the same store concurrently
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    let data = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, data)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// A cached JSON document that reloads when the backing file changes
#[derive(Debug)]
pub struct JsonStore<T> {
    path: PathBuf,
    cached: T,
    last_mtime: Option<SystemTime>,
}

impl<T: Serialize + DeserializeOwned + Default> JsonStore<T> {
    /// Open a store, loading the file if it exists (default value otherwise).
    ///
    /// A file that exists but fails to parse is an error, not a silent
    /// default: overwriting a half-readable registry would lose tasks.
    pub fn open(path: PathBuf) -> Result<Self> {
        let (cached, last_mtime) = match fs::metadata(&path) {
            Ok(meta) => {
                let data = fs::read(&path)?;
                (serde_json::from_slice(&data)?, meta.modified().ok())
            }
            Err(_) => (T::default(), None),
        };
        Ok(Self { path, cached, last_mtime })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current snapshot, reloading first if the file's mtime advanced.
    ///
    /// A reload that fails to parse keeps the cached copy and logs; external
    /// writers may be mid-rename.
    pub fn get(&mut self) -> &T {
        self.maybe_reload();
        &self.cached
    }

    /// Mutate the cached value and persist it atomically.
    pub fn update<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        self.maybe_reload();
        let out = f(&mut self.cached);
        write_json_atomic(&self.path, &self.cached)?;
        self.last_mtime = fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        Ok(out)
    }

    /// Replace the cached value and persist it atomically.
    pub fn replace(&mut self, value: T) -> Result<()> {
        self.cached = value;
        write_json_atomic(&self.path, &self.cached)?;
        self.last_mtime = fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        Ok(())
    }

    /// Delete the backing file and reset to the default value.
    pub fn clear(&mut self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        self.cached = T::default();
        self.last_mtime = None;
        Ok(())
    }

    fn maybe_reload(&mut self) {
        let Ok(meta) = fs::metadata(&self.path) else {
            return;
        };
        let Ok(mtime) = meta.modified() else {
            return;
        };
        if self.last_mtime == Some(mtime) {
            return;
        }
        match fs::read(&self.path).map_err(crate::errors::ArmyError::from).and_then(|data| {
            serde_json::from_slice::<T>(&data).map_err(Into::into)
        }) {
            Ok(value) => {
                self.cached = value;
                self.last_mtime = Some(mtime);
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Reload failed, keeping cached copy");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    type Doc = BTreeMap<String, i64>;

    #[test]
    fn test_open_missing_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonStore<Doc> = JsonStore::open(dir.path().join("doc.json")).unwrap();
        assert!(store.cached.is_empty());
    }

    #[test]
    fn test_update_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let mut store: JsonStore<Doc> = JsonStore::open(path.clone()).unwrap();
        store.update(|d| d.insert("a".into(), 1)).unwrap();

        let mut reopened: JsonStore<Doc> = JsonStore::open(path).unwrap();
        assert_eq!(reopened.get().get("a"), Some(&1));
    }

    #[test]
    fn test_external_write_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let mut store: JsonStore<Doc> = JsonStore::open(path.clone()).unwrap();
        store.update(|d| d.insert("a".into(), 1)).unwrap();

        // Simulate an external writer; sleep past filesystem mtime granularity
        let mut doc = Doc::new();
        doc.insert("b".into(), 2);
        std::thread::sleep(std::time::Duration::from_millis(20));
        write_json_atomic(&path, &doc).unwrap();

        assert_eq!(store.get().get("b"), Some(&2));
        assert_eq!(store.get().get("a"), None);
    }

    #[test]
    fn test_corrupt_open_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(JsonStore::<Doc>::open(path).is_err());
    }

    #[test]
    fn test_clear_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let mut store: JsonStore<Doc> = JsonStore::open(path.clone()).unwrap();
        store.update(|d| d.insert("a".into(), 1)).unwrap();
        store.clear().unwrap();
        assert!(!path.exists());
        assert!(store.get().is_empty());
    }
}
