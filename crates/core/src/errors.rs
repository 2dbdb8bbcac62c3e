//! Error types for the AssetSync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Import(#[from] ImportError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A persisted payload could not be encoded or decoded.
    #[error("database payload error: {0}")]
    PayloadError(#[from] serde_json::Error),

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Remote asset metadata errors
// ---------------------------------------------------------------------------

/// Errors from the remote asset-metadata source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// HTTP-level transport error (network, TLS, etc.).
    #[error("asset source HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The API returned a non-success status code.
    #[error("asset source API error (HTTP {status}): {body}")]
    ApiError { status: u16, body: String },

    /// The requested asset or version does not exist remotely.
    #[error("remote asset not found: {0}")]
    NotFound(String),

    /// The response body could not be parsed.
    #[error("asset source response parse error: {0}")]
    ParseError(String),

    /// Local cache write failed.
    #[error("asset source cache I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Byte transport errors
// ---------------------------------------------------------------------------

/// Transport-level failures of a single byte transfer.
///
/// These never escape the transfer engine: they are rendered into
/// `TransferJob::error` and surface as `TransferStatus::Error`.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not reach the server or the connection dropped.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server answered with something other than the requested content.
    #[error("protocol error (HTTP {status}): {detail}")]
    Protocol { status: u16, detail: String },

    /// The response body could not be decoded.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// Writing the destination file failed.
    #[error("transfer I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() || err.is_body() {
            Self::Decoding(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Protocol {
                status: status.as_u16(),
                detail: err.to_string(),
            }
        } else {
            Self::Connection(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Local import index errors
// ---------------------------------------------------------------------------

/// Errors from the durable local import index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// A shard record could not be read or written.
    #[error("import index I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A shard record is malformed.
    #[error("import index record '{path}' is malformed: {detail}")]
    Malformed { path: PathBuf, detail: String },
}

// ---------------------------------------------------------------------------
// Cache errors
// ---------------------------------------------------------------------------

/// Errors from the cache evictor.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache root could not be scanned.
    #[error("cache scan failed at '{path}': {source}")]
    ScanFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// Errors from the conflict resolver.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// The local import index could not be consulted.
    #[error("conflict index error: {0}")]
    Index(#[from] IndexError),

    /// A dependency-collection task panicked or was aborted.
    #[error("dependency collection task failed: {0}")]
    TaskFailed(String),

    /// The Replace/Ignore prompt was dismissed without a decision.
    #[error("conflict prompt dismissed")]
    Unresolved,
}

// ---------------------------------------------------------------------------
// Import errors
// ---------------------------------------------------------------------------

/// Errors from the import orchestrator.
///
/// Most of these are recorded on the failing `ImportOperation` as a string
/// rather than returned; only unexpected placement/removal failures are
/// propagated to the caller of `tick`/`remove_import`.
#[derive(Debug, Error)]
pub enum ImportError {
    /// A child transfer failed (network, protocol, decoding).
    #[error("transfer failed for '{path}': {detail}")]
    Transfer { path: String, detail: String },

    /// The remote asset lists no downloadable files.
    #[error("nothing to import: asset {0} has no downloadable files")]
    NothingToImport(String),

    /// The user (or a shutdown) cancelled the import.
    #[error("import cancelled")]
    Cancelled,

    /// A move/delete failed during placement or removal.
    #[error("file system error at '{path}': {source}")]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The conflict prompt was dismissed without a decision.
    #[error("conflict resolution dismissed")]
    ConflictUnresolved,

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = ImportError::NothingToImport("acme/props/chair@3".into());
        assert_eq!(
            err.to_string(),
            "nothing to import: asset acme/props/chair@3 has no downloadable files"
        );

        let err = TransportError::Protocol {
            status: 416,
            detail: "range not satisfiable".into(),
        };
        assert!(err.to_string().contains("416"));

        let err = ConfigError::InvalidValue {
            field: "transfer.max_concurrent".into(),
            detail: "must be > 0".into(),
        };
        assert!(err.to_string().contains("transfer.max_concurrent"));
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let import_err = ImportError::Cancelled;
        let core_err: CoreError = import_err.into();
        assert!(matches!(core_err, CoreError::Import(_)));

        let cache_err = CacheError::ScanFailed {
            path: PathBuf::from("/tmp/cache"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        let core_err: CoreError = cache_err.into();
        assert!(matches!(core_err, CoreError::Cache(_)));
    }
}
