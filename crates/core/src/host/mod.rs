//! Interfaces to the collaborators the import pipeline consumes.
//!
//! The pipeline never talks to the network, the disk, the project's file
//! index, or the user directly; it goes through these traits so the object
//! graph can be assembled once at startup and swapped for fakes in tests.

pub mod file_index;
pub mod fs;
pub mod http;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::conflict::{ConflictEntry, Resolution};
use crate::errors::SourceError;
use crate::models::{ArtifactId, AssetIdentifier, SyncMode};

pub use file_index::ManifestFileIndex;
pub use fs::LocalFileSystem;
pub use http::{HttpAssetSource, HttpTransport};

// ---------------------------------------------------------------------------
// Remote asset metadata
// ---------------------------------------------------------------------------

/// Remote metadata for one asset version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMetadata {
    /// Identifier as resolved by the sync (the latest version in
    /// [`SyncMode::Latest`]).
    pub asset: AssetIdentifier,
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<AssetIdentifier>,
    /// Opaque content fingerprint (etag, hash, or modification stamp).
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// A downloadable source file of an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Path relative to the asset root, forward-slash separated.
    pub path: String,
    /// Size in bytes; `<= 0` when the API does not report it.
    #[serde(default)]
    pub size: i64,
}

/// Remote asset-metadata source.
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Refresh metadata for `asset`.
    async fn sync(
        &self,
        asset: &AssetIdentifier,
        mode: SyncMode,
    ) -> Result<AssetMetadata, SourceError>;

    /// Enumerate the asset's source files.
    async fn list_files(&self, asset: &AssetIdentifier) -> Result<Vec<RemoteFile>, SourceError>;

    /// Resolve the URL one file is downloaded from.
    async fn download_url(
        &self,
        asset: &AssetIdentifier,
        file: &RemoteFile,
    ) -> Result<String, SourceError>;
}

// ---------------------------------------------------------------------------
// File system
// ---------------------------------------------------------------------------

/// Synchronous file-system operations used for placement and removal.
pub trait FileSystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    /// Size of a regular file, `None` if it does not exist.
    fn file_size(&self, path: &Path) -> Option<u64>;
    /// Move a file, creating the destination's parent directories.
    fn move_file(&self, from: &Path, to: &Path) -> std::io::Result<()>;
    fn remove_file(&self, path: &Path) -> std::io::Result<()>;
    /// Remove an empty directory.
    fn remove_dir(&self, path: &Path) -> std::io::Result<()>;
    fn remove_dir_all(&self, path: &Path) -> std::io::Result<()>;
    /// Immediate children of a directory.
    fn list_dir(&self, path: &Path) -> std::io::Result<Vec<PathBuf>>;
    /// All regular files below a directory, recursively.
    fn walk_files(&self, path: &Path) -> std::io::Result<Vec<PathBuf>>;
    fn dir_size(&self, path: &Path) -> u64;
}

// ---------------------------------------------------------------------------
// Project file index
// ---------------------------------------------------------------------------

/// The host project's file index: assigns artifact ids to files and lets
/// callers group many moves into one observable change.
pub trait FileIndex: Send + Sync {
    fn begin_batch(&self);
    fn end_batch(&self);
    /// Live path of an artifact, `None` if the file is gone.
    fn path_of(&self, id: &ArtifactId) -> Option<PathBuf>;
    /// Record a file at `path`, reusing `preferred` as its identity when
    /// given so a re-imported file keeps its artifact id.
    fn register(&self, path: &Path, preferred: Option<&ArtifactId>) -> ArtifactId;
    fn forget(&self, path: &Path);
    /// Re-scan after external changes.
    fn refresh(&self);
}

/// Holds a file-index batch open until dropped.
pub struct IndexBatchScope<'a> {
    index: &'a dyn FileIndex,
}

impl<'a> IndexBatchScope<'a> {
    pub fn begin(index: &'a dyn FileIndex) -> Self {
        index.begin_batch();
        Self { index }
    }
}

impl Drop for IndexBatchScope<'_> {
    fn drop(&mut self) {
        self.index.end_batch();
    }
}

// ---------------------------------------------------------------------------
// Human decisions
// ---------------------------------------------------------------------------

/// Answer to a folder-name collision with unrelated content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderCollisionChoice {
    ContinueInPlace,
    CreateNewFolder,
    Cancel,
}

/// Answer to a file-name collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCollisionChoice {
    CreateNewFolder,
    Cancel,
}

/// Human-decision collaborator.
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Per-asset Replace/Ignore decisions; `None` if the prompt was dismissed.
    async fn resolve_conflicts(
        &self,
        conflicts: &[ConflictEntry],
    ) -> Option<Vec<(AssetIdentifier, Resolution)>>;

    /// Confirm overwriting an asset that already exists locally.
    async fn confirm_overwrite(&self, requested: &AssetIdentifier, existing: &AssetIdentifier)
        -> bool;

    async fn folder_collision(&self, path: &Path) -> FolderCollisionChoice;

    async fn file_collision(&self, path: &Path) -> FileCollisionChoice;

    /// Confirm deleting an imported asset's files.
    async fn confirm_remove(&self, asset: &AssetIdentifier, paths: &[PathBuf]) -> bool;
}
