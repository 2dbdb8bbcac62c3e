//! Durable mapping from remote asset identity to the local artifacts that
//! represent it.
//!
//! One small JSON record per artifact id lives at
//! `<root>/<first two chars of id>/<id>.json`. On load every shard is
//! resolved against the project's file index; records whose file is gone are
//! deleted, so the index never reports an import that is not present.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::IndexError;
use crate::host::FileIndex;
use crate::models::{ArtifactId, AssetIdentifier, LocalArtifactRecord};

/// On-disk body of one shard file. The artifact id is the file stem.
#[derive(Debug, Serialize, Deserialize)]
struct ShardRecord {
    asset: AssetIdentifier,
    original_relative_path: PathBuf,
    #[serde(default)]
    fingerprint: Option<String>,
}

#[derive(Debug, Default)]
struct IndexState {
    by_asset: HashMap<AssetIdentifier, Vec<LocalArtifactRecord>>,
    by_artifact: HashMap<ArtifactId, AssetIdentifier>,
}

impl IndexState {
    fn insert(&mut self, record: LocalArtifactRecord) {
        self.by_artifact
            .insert(record.artifact_id.clone(), record.asset.clone());
        self.by_asset
            .entry(record.asset.clone())
            .or_default()
            .push(record);
    }

    fn remove_asset(&mut self, asset: &AssetIdentifier) -> Vec<LocalArtifactRecord> {
        let records = self.by_asset.remove(asset).unwrap_or_default();
        for r in &records {
            self.by_artifact.remove(&r.artifact_id);
        }
        records
    }
}

pub struct LocalImportIndex {
    root: PathBuf,
    state: Mutex<IndexState>,
}

fn shard_path(root: &Path, id: &ArtifactId) -> PathBuf {
    let prefix: String = id.as_str().chars().take(2).collect();
    let prefix = if prefix.is_empty() { "__".to_string() } else { prefix };
    root.join(prefix).join(format!("{}.json", id))
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> IndexError + '_ {
    move |source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl LocalImportIndex {
    /// Load all shards under `root`, pruning records the file index can no
    /// longer resolve.
    pub fn load(root: impl Into<PathBuf>, files: &dyn FileIndex) -> Result<Self, IndexError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(io_err(&root))?;

        let mut state = IndexState::default();
        let mut pruned = 0usize;

        for shard_dir in std::fs::read_dir(&root).map_err(io_err(&root))?.flatten() {
            let shard_dir = shard_dir.path();
            if !shard_dir.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&shard_dir).map_err(io_err(&shard_dir))?.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let artifact_id = ArtifactId(stem.to_string());

                let parsed = std::fs::read_to_string(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|text| {
                        serde_json::from_str::<ShardRecord>(&text).map_err(|e| e.to_string())
                    });
                let record = match parsed {
                    Ok(r) => r,
                    Err(detail) => {
                        warn!(path = %path.display(), %detail, "dropping malformed import record");
                        if let Err(e) = std::fs::remove_file(&path) {
                            warn!(path = %path.display(), error = %e, "failed to delete malformed import record");
                        }
                        pruned += 1;
                        continue;
                    }
                };

                if files.path_of(&artifact_id).is_none() {
                    debug!(artifact = %artifact_id, asset = %record.asset, "pruning record for missing file");
                    std::fs::remove_file(&path).map_err(io_err(&path))?;
                    pruned += 1;
                    continue;
                }

                state.insert(LocalArtifactRecord {
                    artifact_id,
                    asset: record.asset,
                    original_relative_path: record.original_relative_path,
                    fingerprint: record.fingerprint,
                });
            }
        }

        info!(
            assets = state.by_asset.len(),
            artifacts = state.by_artifact.len(),
            pruned,
            "loaded local import index"
        );
        Ok(Self {
            root,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("import index mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write_shard(&self, record: &LocalArtifactRecord) -> Result<(), IndexError> {
        let path = shard_path(&self.root, &record.artifact_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let body = ShardRecord {
            asset: record.asset.clone(),
            original_relative_path: record.original_relative_path.clone(),
            fingerprint: record.fingerprint.clone(),
        };
        let text = serde_json::to_string(&body).map_err(|e| IndexError::Malformed {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        std::fs::write(&path, text).map_err(io_err(&path))
    }

    fn delete_shard(&self, id: &ArtifactId) -> Result<(), IndexError> {
        let path = shard_path(&self.root, id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(IndexError::Io { path, source }),
        }
    }

    /// Record the placed files of every asset in a finalized batch.
    ///
    /// Any records previously tracked for the same remote asset (in any
    /// version) are replaced.
    pub fn track_batch(
        &self,
        batch: Vec<(AssetIdentifier, Vec<LocalArtifactRecord>)>,
    ) -> Result<(), IndexError> {
        let mut state = self.lock();
        for (asset, records) in batch {
            let stale: Vec<AssetIdentifier> = state
                .by_asset
                .keys()
                .filter(|a| a.same_asset(&asset))
                .cloned()
                .collect();
            for old in stale {
                for r in state.remove_asset(&old) {
                    if !records.iter().any(|n| n.artifact_id == r.artifact_id) {
                        self.delete_shard(&r.artifact_id)?;
                    }
                }
            }
            for record in records {
                self.write_shard(&record)?;
                // An artifact belongs to exactly one asset.
                if let Some(previous) = state.by_artifact.get(&record.artifact_id).cloned() {
                    if let Some(list) = state.by_asset.get_mut(&previous) {
                        list.retain(|r| r.artifact_id != record.artifact_id);
                    }
                }
                state.insert(record);
            }
            debug!(%asset, "tracked import");
        }
        state.by_asset.retain(|_, records| !records.is_empty());
        Ok(())
    }

    /// Put back records that were pruned while their files were temporarily
    /// out of the project. Records already present are left alone; returns
    /// how many were added.
    pub fn reinstate(&self, records: &[LocalArtifactRecord]) -> Result<usize, IndexError> {
        let mut state = self.lock();
        let mut added = 0usize;
        for record in records {
            if state.by_artifact.contains_key(&record.artifact_id) {
                continue;
            }
            self.write_shard(record)?;
            state.insert(record.clone());
            added += 1;
        }
        if added > 0 {
            debug!(records = added, "reinstated import records");
        }
        Ok(added)
    }

    /// Forget an asset entirely, returning its records.
    pub fn untrack(&self, asset: &AssetIdentifier) -> Result<Vec<LocalArtifactRecord>, IndexError> {
        let mut state = self.lock();
        let records = state.remove_asset(asset);
        for r in &records {
            self.delete_shard(&r.artifact_id)?;
        }
        if !records.is_empty() {
            info!(%asset, files = records.len(), "untracked import");
        }
        Ok(records)
    }

    /// Drop records for artifacts the host reports as deleted. Returns the
    /// assets that lost records.
    pub fn remove_artifacts(&self, ids: &[ArtifactId]) -> Result<Vec<AssetIdentifier>, IndexError> {
        let mut state = self.lock();
        let mut touched = Vec::new();
        for id in ids {
            let Some(asset) = state.by_artifact.remove(id) else {
                continue;
            };
            self.delete_shard(id)?;
            if let Some(list) = state.by_asset.get_mut(&asset) {
                list.retain(|r| &r.artifact_id != id);
                if list.is_empty() {
                    state.by_asset.remove(&asset);
                }
            }
            if !touched.contains(&asset) {
                touched.push(asset);
            }
        }
        Ok(touched)
    }

    /// Locally imported version of the same remote asset, if any.
    pub fn local_version_of(&self, asset: &AssetIdentifier) -> Option<AssetIdentifier> {
        self.lock()
            .by_asset
            .keys()
            .find(|a| a.same_asset(asset))
            .cloned()
    }

    /// `true` if any version of `asset` is imported.
    pub fn is_local(&self, asset: &AssetIdentifier) -> bool {
        self.local_version_of(asset).is_some()
    }

    /// Records of the locally imported version of `asset`, any version.
    pub fn records_for(&self, asset: &AssetIdentifier) -> Vec<LocalArtifactRecord> {
        let state = self.lock();
        state
            .by_asset
            .iter()
            .filter(|(a, _)| a.same_asset(asset))
            .flat_map(|(_, records)| records.iter().cloned())
            .collect()
    }

    pub fn asset_of(&self, id: &ArtifactId) -> Option<AssetIdentifier> {
        self.lock().by_artifact.get(id).cloned()
    }

    /// Every tracked asset, sorted.
    pub fn tracked_assets(&self) -> Vec<AssetIdentifier> {
        let mut assets: Vec<_> = self.lock().by_asset.keys().cloned().collect();
        assets.sort();
        assets
    }
}
