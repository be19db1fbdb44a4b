use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::store::Store;

/// Tombstones for paths that failed to parse or turned out to be
/// non-interactive: "do not retry until the mtime changes."
///
/// The in-memory map is hydrated from the store at startup and replaced
/// back wholesale when a sync completes, so restarts keep the set.
#[derive(Debug, Default)]
pub struct SkipCache {
    entries: RwLock<HashMap<PathBuf, i64>>,
}

impl SkipCache {
    pub fn hydrate(store: &Store) -> Result<Self> {
        let persisted = store.load_skipped_files()?;
        let entries = persisted
            .into_iter()
            .map(|(path, mtime)| (PathBuf::from(path), mtime))
            .collect::<HashMap<_, _>>();
        if !entries.is_empty() {
            tracing::debug!("hydrated {} skip entries", entries.len());
        }
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    /// True when `path` is tombstoned at exactly this mtime. A changed
    /// mtime means the file deserves another look.
    pub fn has(&self, path: &Path, mtime_ns: i64) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .is_some_and(|&cached| cached == mtime_ns)
    }

    pub fn add(&self, path: &Path, mtime_ns: i64) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_path_buf(), mtime_ns);
    }

    pub fn remove(&self, path: &Path) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Replace the persisted set with the current in-memory one. The
    /// snapshot is copied out under the read lock; the store write
    /// happens after it is released.
    pub fn persist(&self, store: &Store) -> Result<()> {
        let snapshot: HashMap<String, i64> = {
            let guard = self.entries.read().unwrap_or_else(|e| e.into_inner());
            guard
                .iter()
                .map(|(path, &mtime)| (path.to_string_lossy().to_string(), mtime))
                .collect()
        };
        store.replace_skipped_files(&snapshot)
    }
}
