//! A [`FileIndex`] persisted as a JSON manifest inside the project.
//!
//! Paths are stored relative to the project root. While a batch scope is
//! open, manifest writes are deferred and flushed once when the outermost
//! scope ends, so observers of the manifest see one change per batch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::FileIndex;
use crate::models::ArtifactId;

/// Relative location of the manifest inside the project root.
pub const MANIFEST_PATH: &str = ".assetsync/file-index.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    entries: HashMap<PathBuf, ArtifactId>,
}

#[derive(Debug, Default)]
struct State {
    by_path: HashMap<PathBuf, ArtifactId>,
    by_id: HashMap<ArtifactId, PathBuf>,
    batch_depth: u32,
    dirty: bool,
    flushes: u64,
}

/// Project file index backed by `<project_root>/.assetsync/file-index.json`.
pub struct ManifestFileIndex {
    root: PathBuf,
    state: Mutex<State>,
}

impl ManifestFileIndex {
    /// Open the manifest under `project_root`, starting empty if absent.
    pub fn open(project_root: impl Into<PathBuf>) -> Self {
        let root = project_root.into();
        let manifest_path = root.join(MANIFEST_PATH);
        let manifest: Manifest = match std::fs::read_to_string(&manifest_path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(path = %manifest_path.display(), error = %e, "file index manifest is corrupt, starting empty");
                Manifest::default()
            }),
            Err(_) => Manifest::default(),
        };

        let mut state = State::default();
        for (path, id) in manifest.entries {
            state.by_id.insert(id.clone(), path.clone());
            state.by_path.insert(path, id);
        }
        debug!(root = %root.display(), entries = state.by_path.len(), "opened file index");

        Self {
            root,
            state: Mutex::new(state),
        }
    }

    /// Artifact id currently bound to `path`.
    pub fn artifact_at(&self, path: &Path) -> Option<ArtifactId> {
        let rel = self.relative(path);
        self.lock().by_path.get(&rel).cloned()
    }

    /// Number of manifest writes performed so far.
    pub fn flush_count(&self) -> u64 {
        self.lock().flushes
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("file index mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }

    fn mark_dirty(&self, state: &mut State) {
        state.dirty = true;
        if state.batch_depth == 0 {
            self.flush(state);
        }
    }

    fn flush(&self, state: &mut State) {
        if !state.dirty {
            return;
        }
        let manifest = Manifest {
            entries: state.by_path.clone(),
        };
        let path = self.root.join(MANIFEST_PATH);
        let result = path
            .parent()
            .map(std::fs::create_dir_all)
            .transpose()
            .and_then(|_| {
                let text = serde_json::to_string_pretty(&manifest)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                std::fs::write(&path, text)
            });
        match result {
            Ok(()) => {
                state.dirty = false;
                state.flushes += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to write file index manifest"),
        }
    }
}

impl FileIndex for ManifestFileIndex {
    fn begin_batch(&self) {
        self.lock().batch_depth += 1;
    }

    fn end_batch(&self) {
        let mut state = self.lock();
        state.batch_depth = state.batch_depth.saturating_sub(1);
        if state.batch_depth == 0 {
            self.flush(&mut state);
        }
    }

    fn path_of(&self, id: &ArtifactId) -> Option<PathBuf> {
        let rel = self.lock().by_id.get(id).cloned()?;
        let abs = self.root.join(rel);
        abs.exists().then_some(abs)
    }

    fn register(&self, path: &Path, preferred: Option<&ArtifactId>) -> ArtifactId {
        let rel = self.relative(path);
        let mut state = self.lock();

        let id = match preferred {
            Some(id) => id.clone(),
            None => state
                .by_path
                .get(&rel)
                .cloned()
                .unwrap_or_else(|| ArtifactId(uuid::Uuid::new_v4().simple().to_string())),
        };

        // Unbind whatever the id or the path pointed at before.
        if let Some(old_path) = state.by_id.remove(&id) {
            state.by_path.remove(&old_path);
        }
        if let Some(old_id) = state.by_path.remove(&rel) {
            state.by_id.remove(&old_id);
        }
        state.by_path.insert(rel.clone(), id.clone());
        state.by_id.insert(id.clone(), rel);
        self.mark_dirty(&mut state);
        id
    }

    fn forget(&self, path: &Path) {
        let rel = self.relative(path);
        let mut state = self.lock();
        if let Some(id) = state.by_path.remove(&rel) {
            state.by_id.remove(&id);
            self.mark_dirty(&mut state);
        }
    }

    fn refresh(&self) {
        let mut state = self.lock();
        let missing: Vec<PathBuf> = state
            .by_path
            .keys()
            .filter(|rel| !self.root.join(rel).exists())
            .cloned()
            .collect();
        for rel in &missing {
            if let Some(id) = state.by_path.remove(rel) {
                state.by_id.remove(&id);
            }
        }
        if !missing.is_empty() {
            debug!(count = missing.len(), "file index dropped missing files");
            state.dirty = true;
        }
        if state.batch_depth == 0 {
            self.flush(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::IndexBatchScope;

    #[test]
    fn test_register_reuses_preferred_identity() {
        let dir = tempfile::tempdir().unwrap();
        let index = ManifestFileIndex::open(dir.path());
        let old = dir.path().join("Assets/old/a.png");
        let new = dir.path().join("Assets/new/a.png");
        std::fs::create_dir_all(new.parent().unwrap()).unwrap();
        std::fs::write(&new, b"x").unwrap();

        let id = index.register(&old, None);
        let moved = index.register(&new, Some(&id));
        assert_eq!(id, moved);
        assert_eq!(index.artifact_at(&old), None);
        assert_eq!(index.path_of(&id), Some(new));
    }

    #[test]
    fn test_batch_scope_defers_writes() {
        let dir = tempfile::tempdir().unwrap();
        let index = ManifestFileIndex::open(dir.path());
        {
            let _scope = IndexBatchScope::begin(&index);
            index.register(&dir.path().join("a"), None);
            index.register(&dir.path().join("b"), None);
            assert_eq!(index.flush_count(), 0);
        }
        assert_eq!(index.flush_count(), 1);

        let reopened = ManifestFileIndex::open(dir.path());
        assert!(reopened.artifact_at(&dir.path().join("a")).is_some());
    }

    #[test]
    fn test_path_of_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let index = ManifestFileIndex::open(dir.path());
        let id = index.register(&dir.path().join("ghost.txt"), None);
        assert_eq!(index.path_of(&id), None);
    }
}
