//! Dependency collection and Replace/Ignore conflict resolution.
//!
//! Given the assets a user asked for, the resolver walks their transitive
//! dependencies, checks which of them are already imported, looks for remote
//! drift on those, and only then asks a human which ones to replace.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::ConflictError;
use crate::host::{AssetSource, Prompter};
use crate::index::LocalImportIndex;
use crate::models::{AssetIdentifier, AssetLineage, SyncMode};

/// One asset found while walking a requested asset's dependency tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedAsset {
    /// Identifier as resolved by the sync.
    pub asset: AssetIdentifier,
    pub name: String,
    pub fingerprint: Option<String>,
    /// Explicitly requested, as opposed to pulled in as a dependency.
    pub requested: bool,
}

/// An already-imported asset the incoming import would overwrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEntry {
    /// Incoming identifier.
    pub asset: AssetIdentifier,
    pub name: String,
    /// Locally imported identifier.
    pub local: AssetIdentifier,
    pub requested: bool,
    /// Remote content changed since the local import.
    pub drifted: bool,
    /// Folder imports are placed under.
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Replace,
    Ignore,
}

pub struct ConflictResolver {
    source: Arc<dyn AssetSource>,
    index: Arc<LocalImportIndex>,
    prompter: Arc<dyn Prompter>,
}

impl ConflictResolver {
    pub fn new(
        source: Arc<dyn AssetSource>,
        index: Arc<LocalImportIndex>,
        prompter: Arc<dyn Prompter>,
    ) -> Self {
        Self {
            source,
            index,
            prompter,
        }
    }

    /// Sync every requested asset and walk its dependencies, one task per
    /// requested asset.
    ///
    /// A dependency that fails to sync is logged and skipped. A requested
    /// asset that fails to sync is still returned (named after its id) so the
    /// failure surfaces on its import operation.
    pub async fn collect_dependencies(
        &self,
        requested: &[AssetIdentifier],
        mode: SyncMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<CollectedAsset>, ConflictError> {
        let mut tasks = JoinSet::new();
        for (order, root) in requested.iter().enumerate() {
            let source = Arc::clone(&self.source);
            let root = root.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { (order, collect_tree(source, root, mode, cancel).await) });
        }

        let mut trees = Vec::with_capacity(requested.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(tree) => trees.push(tree),
                Err(e) => return Err(ConflictError::TaskFailed(e.to_string())),
            }
        }
        trees.sort_by_key(|(order, _)| *order);

        // Union, keyed by lineage; requested wins over dependency-only.
        let mut union: Vec<CollectedAsset> = Vec::new();
        let mut positions: HashMap<AssetLineage, usize> = HashMap::new();
        for (_, tree) in trees {
            for found in tree {
                match positions.get(&found.asset.lineage()) {
                    Some(&i) => union[i].requested |= found.requested,
                    None => {
                        positions.insert(found.asset.lineage(), union.len());
                        union.push(found);
                    }
                }
            }
        }
        debug!(count = union.len(), "collected assets");
        Ok(union)
    }

    /// Compute the assets that should be imported.
    ///
    /// Cancellation at any step yields an empty list. A dismissed prompt is
    /// [`ConflictError::Unresolved`].
    pub async fn resolve(
        &self,
        requested: &[AssetIdentifier],
        mode: SyncMode,
        destination: &Path,
        cancel: CancellationToken,
    ) -> Result<Vec<CollectedAsset>, ConflictError> {
        let collected = self.collect_dependencies(requested, mode, &cancel).await?;
        if cancel.is_cancelled() {
            info!("conflict resolution cancelled during dependency collection");
            return Ok(Vec::new());
        }

        let local: Vec<(usize, AssetIdentifier)> = collected
            .iter()
            .enumerate()
            .filter_map(|(i, c)| self.index.local_version_of(&c.asset).map(|l| (i, l)))
            .collect();
        if local.is_empty() {
            debug!("fresh import, nothing to resolve");
            return Ok(collected);
        }

        let drifted = tokio::select! {
            _ = cancel.cancelled() => {
                info!("conflict resolution cancelled during drift check");
                return Ok(Vec::new());
            }
            d = self.detect_drift(&collected, &local) => d?,
        };
        let any_requested_local = local.iter().any(|(i, _)| collected[*i].requested);
        if drifted.is_empty() && !any_requested_local {
            debug!("local copies are current and only dependencies overlap");
            return Ok(collected);
        }

        let conflicts: Vec<ConflictEntry> = local
            .iter()
            .filter(|(i, _)| collected[*i].requested || drifted.contains(i))
            .map(|(i, local_id)| ConflictEntry {
                asset: collected[*i].asset.clone(),
                name: collected[*i].name.clone(),
                local: local_id.clone(),
                requested: collected[*i].requested,
                drifted: drifted.contains(i),
                destination: destination.to_path_buf(),
            })
            .collect();
        let local_positions: HashSet<usize> = local.iter().map(|(i, _)| *i).collect();

        info!(conflicts = conflicts.len(), "asking for conflict resolution");
        let decisions = tokio::select! {
            _ = cancel.cancelled() => {
                info!("conflict resolution cancelled at the prompt");
                return Ok(Vec::new());
            }
            d = self.prompter.resolve_conflicts(&conflicts) => d,
        };
        let Some(decisions) = decisions else {
            info!("conflict resolution dismissed");
            return Err(ConflictError::Unresolved);
        };
        let replace: HashSet<AssetIdentifier> = decisions
            .into_iter()
            .filter(|(_, r)| *r == Resolution::Replace)
            .map(|(a, _)| a)
            .collect();

        Ok(collected
            .into_iter()
            .enumerate()
            .filter(|(i, c)| !local_positions.contains(i) || replace.contains(&c.asset))
            .map(|(_, c)| c)
            .collect())
    }

    /// Indices into `collected` whose remote content differs from the local
    /// import.
    async fn detect_drift(
        &self,
        collected: &[CollectedAsset],
        local: &[(usize, AssetIdentifier)],
    ) -> Result<HashSet<usize>, ConflictError> {
        let mut tasks = JoinSet::new();
        for (i, _) in local {
            let source = Arc::clone(&self.source);
            let asset = collected[*i].asset.clone();
            let i = *i;
            tasks.spawn(async move { (i, source.sync(&asset, SyncMode::Pinned).await) });
        }

        let mut drifted = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            let (i, refreshed) = joined.map_err(|e| ConflictError::TaskFailed(e.to_string()))?;
            let local_id = local
                .iter()
                .find(|(j, _)| *j == i)
                .map(|(_, l)| l.clone())
                .unwrap_or_else(|| collected[i].asset.clone());
            match refreshed {
                Ok(meta) => {
                    let local_fingerprint = self
                        .index
                        .records_for(&local_id)
                        .into_iter()
                        .find_map(|r| r.fingerprint);
                    let fingerprint_changed = matches!(
                        (&meta.fingerprint, &local_fingerprint),
                        (Some(remote), Some(local)) if remote != local
                    );
                    if meta.asset != local_id || fingerprint_changed {
                        debug!(asset = %meta.asset, local = %local_id, "remote drift detected");
                        drifted.insert(i);
                    }
                }
                Err(e) => {
                    warn!(asset = %collected[i].asset, error = %e, "drift check failed, assuming unchanged");
                }
            }
        }
        Ok(drifted)
    }
}

async fn collect_tree(
    source: Arc<dyn AssetSource>,
    root: AssetIdentifier,
    mode: SyncMode,
    cancel: CancellationToken,
) -> Vec<CollectedAsset> {
    let mut found = Vec::new();
    let mut visited: HashSet<AssetLineage> = HashSet::new();
    let mut queue = VecDeque::from([(root, true)]);

    while let Some((asset, is_root)) = queue.pop_front() {
        if !visited.insert(asset.lineage()) {
            continue;
        }
        let synced = tokio::select! {
            _ = cancel.cancelled() => break,
            r = source.sync(&asset, mode) => r,
        };
        match synced {
            Ok(meta) => {
                for dep in &meta.dependencies {
                    if !visited.contains(&dep.lineage()) {
                        queue.push_back((dep.clone(), false));
                    }
                }
                found.push(CollectedAsset {
                    asset: meta.asset,
                    name: meta.name,
                    fingerprint: meta.fingerprint,
                    requested: is_root,
                });
            }
            Err(e) if is_root => {
                warn!(%asset, error = %e, "failed to sync requested asset");
                found.push(CollectedAsset {
                    name: asset.source_asset_id.clone(),
                    asset,
                    fingerprint: None,
                    requested: true,
                });
            }
            Err(e) => {
                warn!(%asset, error = %e, "skipping unavailable dependency");
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SourceError;
    use crate::host::{
        AssetMetadata, FileCollisionChoice, FolderCollisionChoice, ManifestFileIndex, RemoteFile,
    };
    use crate::models::{ArtifactId, LocalArtifactRecord};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn id(name: &str, version: &str) -> AssetIdentifier {
        AssetIdentifier::new("acme", "props", name, version)
    }

    #[derive(Default)]
    struct FakeSource {
        assets: HashMap<AssetLineage, AssetMetadata>,
    }

    impl FakeSource {
        fn with(mut self, asset: AssetIdentifier, deps: Vec<AssetIdentifier>, fp: &str) -> Self {
            self.assets.insert(
                asset.lineage(),
                AssetMetadata {
                    name: asset.source_asset_id.to_uppercase(),
                    asset,
                    dependencies: deps,
                    fingerprint: Some(fp.into()),
                },
            );
            self
        }
    }

    #[async_trait]
    impl AssetSource for FakeSource {
        async fn sync(&self, asset: &AssetIdentifier, _mode: SyncMode) -> Result<AssetMetadata, SourceError> {
            self.assets
                .get(&asset.lineage())
                .cloned()
                .ok_or_else(|| SourceError::NotFound(asset.to_string()))
        }
        async fn list_files(&self, _asset: &AssetIdentifier) -> Result<Vec<RemoteFile>, SourceError> {
            Ok(vec![])
        }
        async fn download_url(&self, _a: &AssetIdentifier, f: &RemoteFile) -> Result<String, SourceError> {
            Ok(f.path.clone())
        }
    }

    struct ScriptedPrompter {
        answer: Option<Resolution>,
        seen: Mutex<Vec<ConflictEntry>>,
    }

    impl ScriptedPrompter {
        fn answering(answer: Option<Resolution>) -> Arc<Self> {
            Arc::new(Self {
                answer,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Prompter for ScriptedPrompter {
        async fn resolve_conflicts(
            &self,
            conflicts: &[ConflictEntry],
        ) -> Option<Vec<(AssetIdentifier, Resolution)>> {
            self.seen.lock().unwrap().extend_from_slice(conflicts);
            let answer = self.answer?;
            Some(conflicts.iter().map(|c| (c.asset.clone(), answer)).collect())
        }
        async fn confirm_overwrite(&self, _r: &AssetIdentifier, _e: &AssetIdentifier) -> bool {
            true
        }
        async fn folder_collision(&self, _p: &Path) -> FolderCollisionChoice {
            FolderCollisionChoice::Cancel
        }
        async fn file_collision(&self, _p: &Path) -> FileCollisionChoice {
            FileCollisionChoice::Cancel
        }
        async fn confirm_remove(&self, _a: &AssetIdentifier, _p: &[PathBuf]) -> bool {
            false
        }
    }

    struct Fixture {
        _project: tempfile::TempDir,
        _data: tempfile::TempDir,
        index: Arc<LocalImportIndex>,
    }

    fn fixture(local: &[(AssetIdentifier, &str)]) -> Fixture {
        let project = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let files = ManifestFileIndex::open(project.path());
        let index = Arc::new(LocalImportIndex::load(data.path(), &files).unwrap());
        let batch = local
            .iter()
            .map(|(asset, fp)| {
                (
                    asset.clone(),
                    vec![LocalArtifactRecord {
                        artifact_id: ArtifactId(format!("{}-file", asset.source_asset_id)),
                        asset: asset.clone(),
                        original_relative_path: PathBuf::from("file.bin"),
                        fingerprint: Some(fp.to_string()),
                    }],
                )
            })
            .collect();
        index.track_batch(batch).unwrap();
        Fixture {
            _project: project,
            _data: data,
            index,
        }
    }

    fn names(assets: &[CollectedAsset]) -> Vec<String> {
        let mut n: Vec<String> = assets.iter().map(|c| c.asset.source_asset_id.clone()).collect();
        n.sort();
        n
    }

    #[tokio::test]
    async fn test_fresh_import_returns_union_and_skips_broken_dependency() {
        let source = FakeSource::default()
            .with(id("chair", "3"), vec![id("wood", "1"), id("missing", "1")], "a")
            .with(id("wood", "1"), vec![id("chair", "3")], "b");
        let fx = fixture(&[]);
        let prompter = ScriptedPrompter::answering(Some(Resolution::Replace));
        let resolver = ConflictResolver::new(Arc::new(source), fx.index.clone(), prompter.clone());

        let approved = resolver
            .resolve(&[id("chair", "3")], SyncMode::Pinned, Path::new("/p/Assets"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(names(&approved), vec!["chair", "wood"]);
        assert!(approved.iter().find(|c| c.asset.source_asset_id == "chair").unwrap().requested);
        assert!(prompter.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_current_local_dependency_needs_no_prompt() {
        let source = FakeSource::default()
            .with(id("chair", "3"), vec![id("wood", "1")], "a")
            .with(id("wood", "1"), vec![], "b");
        let fx = fixture(&[(id("wood", "1"), "b")]);
        let prompter = ScriptedPrompter::answering(Some(Resolution::Ignore));
        let resolver = ConflictResolver::new(Arc::new(source), fx.index.clone(), prompter.clone());

        let approved = resolver
            .resolve(&[id("chair", "3")], SyncMode::Pinned, Path::new("/p"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(names(&approved), vec!["chair", "wood"]);
        assert!(prompter.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drifted_dependency_is_prompted() {
        let source = FakeSource::default()
            .with(id("chair", "3"), vec![id("wood", "1")], "a")
            .with(id("wood", "1"), vec![], "new-etag");
        let fx = fixture(&[(id("wood", "1"), "old-etag")]);
        let prompter = ScriptedPrompter::answering(Some(Resolution::Ignore));
        let resolver = ConflictResolver::new(Arc::new(source), fx.index.clone(), prompter.clone());

        let approved = resolver
            .resolve(&[id("chair", "3")], SyncMode::Pinned, Path::new("/p"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(names(&approved), vec!["chair"]);
        let seen = prompter.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].drifted);
        assert!(!seen[0].requested);
    }

    #[tokio::test]
    async fn test_requested_local_asset_replace() {
        let source = FakeSource::default().with(id("chair", "4"), vec![], "a");
        let fx = fixture(&[(id("chair", "3"), "a")]);
        let prompter = ScriptedPrompter::answering(Some(Resolution::Replace));
        let resolver = ConflictResolver::new(Arc::new(source), fx.index.clone(), prompter.clone());

        let approved = resolver
            .resolve(&[id("chair", "4")], SyncMode::Pinned, Path::new("/p"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(names(&approved), vec!["chair"]);
        let seen = prompter.seen.lock().unwrap();
        assert_eq!(seen[0].local, id("chair", "3"));
        assert!(seen[0].drifted);
    }

    #[tokio::test]
    async fn test_dismissed_prompt_is_unresolved_and_cancellation_yields_nothing() {
        let source = Arc::new(FakeSource::default().with(id("chair", "3"), vec![], "a"));
        let fx = fixture(&[(id("chair", "3"), "a")]);

        let dismissed = ConflictResolver::new(source.clone(), fx.index.clone(), ScriptedPrompter::answering(None));
        let result = dismissed
            .resolve(&[id("chair", "3")], SyncMode::Pinned, Path::new("/p"), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ConflictError::Unresolved)));

        let token = CancellationToken::new();
        token.cancel();
        let cancelled = ConflictResolver::new(
            source,
            fx.index.clone(),
            ScriptedPrompter::answering(Some(Resolution::Replace)),
        );
        let approved = cancelled
            .resolve(&[id("chair", "3")], SyncMode::Pinned, Path::new("/p"), token)
            .await
            .unwrap();
        assert!(approved.is_empty());
    }
}
