//! Domain model types used throughout AssetSync.
//!
//! These types bridge the transfer engine, the orchestrator, the persistence
//! layer, and the CLI.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Asset identity
// ---------------------------------------------------------------------------

/// Composite key naming one version of one remote asset.
///
/// Rendered and parsed as `org/project/asset@version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetIdentifier {
    pub organization_id: String,
    pub project_id: String,
    pub source_asset_id: String,
    pub version: String,
}

impl AssetIdentifier {
    pub fn new(
        organization_id: impl Into<String>,
        project_id: impl Into<String>,
        source_asset_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            project_id: project_id.into(),
            source_asset_id: source_asset_id.into(),
            version: version.into(),
        }
    }

    /// The version-independent part of the identifier.
    pub fn lineage(&self) -> AssetLineage {
        AssetLineage {
            organization_id: self.organization_id.clone(),
            project_id: self.project_id.clone(),
            source_asset_id: self.source_asset_id.clone(),
        }
    }

    /// `true` if both identifiers name the same remote asset, in any version.
    pub fn same_asset(&self, other: &AssetIdentifier) -> bool {
        self.organization_id == other.organization_id
            && self.project_id == other.project_id
            && self.source_asset_id == other.source_asset_id
    }

    /// Stable string key used for persistence.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for AssetIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.organization_id, self.project_id, self.source_asset_id, self.version
        )
    }
}

impl FromStr for AssetIdentifier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, version) = s
            .rsplit_once('@')
            .ok_or_else(|| format!("missing '@version' in asset identifier '{}'", s))?;
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) || version.is_empty() {
            return Err(format!(
                "asset identifier '{}' must look like org/project/asset@version",
                s
            ));
        }
        Ok(Self::new(parts[0], parts[1], parts[2], version))
    }
}

/// An asset independent of its version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetLineage {
    pub organization_id: String,
    pub project_id: String,
    pub source_asset_id: String,
}

/// Whether metadata sync targets the pinned version or the newest one.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Use exactly the version named by the identifier.
    #[default]
    Pinned,
    /// Follow the asset to its latest version.
    Latest,
}

// ---------------------------------------------------------------------------
// Transfers
// ---------------------------------------------------------------------------

/// Process-unique, monotonically increasing transfer job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(pub u64);

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle status of a transfer job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Success,
    Error,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One resumable, cancellable file transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferJob {
    pub id: TransferId,
    pub source_url: String,
    pub dest_path: PathBuf,
    /// Expected size in bytes; `<= 0` means unknown.
    pub total_bytes: i64,
    /// Fraction complete in `[0, 1]`.
    pub progress: f64,
    pub status: TransferStatus,
    pub error: Option<String>,
}

impl TransferJob {
    pub fn new(id: TransferId, source_url: impl Into<String>, dest_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            source_url: source_url.into(),
            dest_path: dest_path.into(),
            total_bytes: 0,
            progress: 0.0,
            status: TransferStatus::Pending,
            error: None,
        }
    }

    pub fn with_total_bytes(mut self, total_bytes: i64) -> Self {
        self.total_bytes = total_bytes;
        self
    }
}

// ---------------------------------------------------------------------------
// Imports
// ---------------------------------------------------------------------------

/// State of an import for one asset.
///
/// `Idle` is the absence of an operation; `DependencyCollection` is transient
/// and never persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    DependencyCollection,
    Queued,
    InProgress,
    Success,
    Error,
    Cancelled,
}

impl ImportStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }
}

impl std::fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DependencyCollection => write!(f, "collecting_dependencies"),
            Self::Queued => write!(f, "queued"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Previously imported files moved aside while an asset is re-imported to
/// its old location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelocationStash {
    /// Unique temporary directory holding the moved files.
    pub stash_dir: PathBuf,
    /// Where the files came from (and go back to on failure).
    pub original_dir: PathBuf,
    /// Paths relative to both directories.
    pub files: Vec<PathBuf>,
    /// Index records of the stashed primaries. The project file index cannot
    /// resolve them while they sit in the stash.
    #[serde(default)]
    pub artifacts: Vec<StashedArtifact>,
}

/// A stashed primary file and the record that tracked it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StashedArtifact {
    /// Relative to `stash_dir` and `original_dir`.
    pub path: PathBuf,
    pub record: LocalArtifactRecord,
}

/// Unit of work importing one asset and its files locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportOperation {
    pub asset: AssetIdentifier,
    /// Display name from the remote metadata.
    pub name: String,
    /// Folder the asset's files are placed into.
    pub destination_path: PathBuf,
    /// Temporary download directory the transfers write into.
    pub staging_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub status: ImportStatus,
    pub error: Option<String>,
    /// Batch this operation belongs to.
    pub batch_id: String,
    #[serde(default)]
    pub stash: Option<RelocationStash>,
    /// Remote fingerprint captured at sync time, kept for drift detection.
    #[serde(default)]
    pub fingerprint: Option<String>,
    pub jobs: Vec<TransferJob>,
}

impl ImportOperation {
    /// Mean progress of all child transfers, `0.0` before any exist.
    pub fn progress(&self) -> f64 {
        if self.jobs.is_empty() {
            return if self.status == ImportStatus::Success { 1.0 } else { 0.0 };
        }
        self.jobs.iter().map(|j| j.progress).sum::<f64>() / self.jobs.len() as f64
    }

    /// Short human-readable status line for UI polling.
    pub fn status_line(&self) -> String {
        match (&self.status, &self.error) {
            (_, Some(err)) => format!("{}: {}", self.status, err),
            (ImportStatus::InProgress, None) => {
                format!("downloading {:.0}%", self.progress() * 100.0)
            }
            (status, None) => status.to_string(),
        }
    }

    /// File path relative to the staging directory for the given job.
    pub fn relative_path_of(&self, job: &TransferJob) -> Option<PathBuf> {
        job.dest_path
            .strip_prefix(&self.staging_path)
            .ok()
            .map(Path::to_path_buf)
    }
}

/// Persisted marker that an asset belongs to a batch that has not finalized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingImport {
    pub asset: AssetIdentifier,
    pub name: String,
    pub batch_id: String,
}

/// Derived status of a batch of import operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    InProgress,
    Success,
    Error,
    Cancelled,
}

impl BatchStatus {
    /// Error outranks Cancelled, which outranks Success; any non-terminal
    /// child keeps the batch in progress.
    pub fn derive<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = ImportStatus>,
    {
        let mut any_error = false;
        let mut any_cancelled = false;
        let mut all_terminal = true;
        for status in statuses {
            match status {
                ImportStatus::Error => any_error = true,
                ImportStatus::Cancelled => any_cancelled = true,
                ImportStatus::Success => {}
                _ => all_terminal = false,
            }
        }
        if !all_terminal {
            Self::InProgress
        } else if any_error {
            Self::Error
        } else if any_cancelled {
            Self::Cancelled
        } else {
            Self::Success
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "in_progress"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Local artifacts
// ---------------------------------------------------------------------------

/// Local identity the project's file index assigns to a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(pub String);

impl ArtifactId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One imported file and the asset it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalArtifactRecord {
    pub artifact_id: ArtifactId,
    pub asset: AssetIdentifier,
    /// Path relative to the asset's import destination.
    pub original_relative_path: PathBuf,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Everything that must survive a process restart for interrupted batches to
/// resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ImportSnapshot {
    pub operations: Vec<ImportOperation>,
    pub pending: Vec<PendingImport>,
    pub next_transfer_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_identifier_parse_and_display() {
        let id: AssetIdentifier = "acme/props/chair@3".parse().unwrap();
        assert_eq!(id.organization_id, "acme");
        assert_eq!(id.project_id, "props");
        assert_eq!(id.source_asset_id, "chair");
        assert_eq!(id.version, "3");
        assert_eq!(id.to_string(), "acme/props/chair@3");

        assert!("acme/props/chair".parse::<AssetIdentifier>().is_err());
        assert!("acme//chair@1".parse::<AssetIdentifier>().is_err());
        assert!("acme/props/chair@".parse::<AssetIdentifier>().is_err());
    }

    #[test]
    fn test_same_asset_ignores_version() {
        let v1 = AssetIdentifier::new("acme", "props", "chair", "1");
        let v2 = AssetIdentifier::new("acme", "props", "chair", "2");
        let other = AssetIdentifier::new("acme", "props", "table", "1");
        assert!(v1.same_asset(&v2));
        assert_ne!(v1, v2);
        assert!(!v1.same_asset(&other));
        assert_eq!(v1.lineage(), v2.lineage());
    }

    #[test]
    fn test_batch_status_precedence() {
        use ImportStatus::*;
        assert_eq!(BatchStatus::derive([Success, Success]), BatchStatus::Success);
        assert_eq!(BatchStatus::derive([Success, Error]), BatchStatus::Error);
        assert_eq!(BatchStatus::derive([Cancelled, Success]), BatchStatus::Cancelled);
        assert_eq!(BatchStatus::derive([Cancelled, Error]), BatchStatus::Error);
        assert_eq!(BatchStatus::derive([Success, InProgress]), BatchStatus::InProgress);
        assert_eq!(BatchStatus::derive([Queued]), BatchStatus::InProgress);
    }

    #[test]
    fn test_operation_progress_is_mean_of_jobs() {
        let mut op = ImportOperation {
            asset: AssetIdentifier::new("a", "b", "c", "1"),
            name: "c".into(),
            destination_path: PathBuf::from("/p/Assets/c"),
            staging_path: PathBuf::from("/d/stage"),
            started_at: Utc::now(),
            status: ImportStatus::InProgress,
            error: None,
            batch_id: "b1".into(),
            stash: None,
            fingerprint: None,
            jobs: Vec::new(),
        };
        assert_eq!(op.progress(), 0.0);

        let mut a = TransferJob::new(TransferId(1), "u1", "/d/stage/x.png");
        a.progress = 1.0;
        let mut b = TransferJob::new(TransferId(2), "u2", "/d/stage/sub/y.png");
        b.progress = 0.5;
        op.jobs = vec![a, b];
        assert!((op.progress() - 0.75).abs() < f64::EPSILON);
        assert_eq!(
            op.relative_path_of(&op.jobs[1]),
            Some(PathBuf::from("sub/y.png"))
        );
        assert_eq!(op.status_line(), "downloading 75%");
    }
}
