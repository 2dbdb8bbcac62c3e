//! Size-bounded LRU eviction over the local cache directory.
//!
//! The evictor keeps a running aggregate of the cache size. The first call
//! scans the directory; later calls only add the size of the file that was
//! just written. When the aggregate passes the budget, the directory is
//! rescanned and files are deleted oldest-access-first. Files accessed within
//! the look-back window are never candidates, which protects files that are
//! still being written.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::errors::CacheError;

/// Budget and thresholds for one cache directory.
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub max_bytes: u64,
    /// Whether `max_bytes` is the built-in default rather than user-chosen.
    pub default_max: bool,
    pub shrink_delta: u64,
    pub lookback: Duration,
}

impl From<&CacheConfig> for CacheSettings {
    fn from(config: &CacheConfig) -> Self {
        let (max_bytes, default_max) = config.effective_max();
        Self {
            max_bytes,
            default_max,
            shrink_delta: config.shrink_delta_bytes,
            lookback: Duration::from_secs(config.lookback_secs),
        }
    }
}

/// Outcome of one [`CacheEvictor::check_and_evict`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Aggregate size after the call.
    pub size_after: u64,
    pub evicted: Vec<PathBuf>,
    pub freed_bytes: u64,
}

#[derive(Debug)]
struct CacheFile {
    path: PathBuf,
    size: u64,
    last_access: SystemTime,
}

pub struct CacheEvictor {
    root: PathBuf,
    settings: CacheSettings,
    aggregate: Mutex<Option<u64>>,
}

impl CacheEvictor {
    pub fn new(root: impl Into<PathBuf>, settings: CacheSettings) -> Self {
        Self {
            root: root.into(),
            settings,
            aggregate: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current running aggregate, `None` before the first check.
    pub fn aggregate(&self) -> Option<u64> {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, Option<u64>> {
        self.aggregate.lock().unwrap_or_else(|poisoned| {
            warn!("cache evictor mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Account for `just_added` (if any) and evict least-recently-used files
    /// when the cache is over budget.
    pub fn check_and_evict(&self, just_added: Option<&Path>) -> Result<EvictionReport, CacheError> {
        let mut aggregate = self.lock();

        let current = match *aggregate {
            None => self.scan()?.iter().map(|f| f.size).sum(),
            Some(size) => {
                let added = just_added
                    .and_then(|p| std::fs::metadata(p).ok())
                    .filter(|m| m.is_file())
                    .map(|m| m.len())
                    .unwrap_or(0);
                size + added
            }
        };
        *aggregate = Some(current);

        if current <= self.settings.max_bytes {
            return Ok(EvictionReport {
                size_after: current,
                ..EvictionReport::default()
            });
        }

        // Over budget: rescan so the running total cannot drift.
        let files = self.scan()?;
        let mut size: u64 = files.iter().map(|f| f.size).sum();
        if size <= self.settings.max_bytes {
            *aggregate = Some(size);
            return Ok(EvictionReport {
                size_after: size,
                ..EvictionReport::default()
            });
        }

        let target = if self.settings.default_max {
            self.settings.max_bytes.saturating_sub(self.settings.shrink_delta)
        } else {
            size.saturating_sub(self.settings.shrink_delta)
        };
        info!(
            size,
            max = self.settings.max_bytes,
            target,
            "cache over budget, evicting"
        );

        let cutoff = SystemTime::now()
            .checked_sub(self.settings.lookback)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut candidates: Vec<CacheFile> = files
            .into_iter()
            .filter(|f| f.last_access < cutoff)
            .filter(|f| just_added.map_or(true, |p| f.path.as_path() != p))
            .collect();
        candidates.sort_by_key(|f| f.last_access);

        let mut report = EvictionReport::default();
        for file in candidates {
            if size <= target {
                break;
            }
            match std::fs::remove_file(&file.path) {
                Ok(()) => {
                    debug!(path = %file.path.display(), bytes = file.size, "evicted cache file");
                    size = size.saturating_sub(file.size);
                    report.freed_bytes += file.size;
                    report.evicted.push(file.path);
                }
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "failed to evict cache file");
                }
            }
        }

        if size > target {
            warn!(size, target, "cache still over target after eviction");
        }
        *aggregate = Some(size);
        report.size_after = size;
        Ok(report)
    }

    fn scan(&self) -> Result<Vec<CacheFile>, CacheError> {
        let mut files = Vec::new();
        if !self.root.exists() {
            return Ok(files);
        }
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = std::fs::read_dir(&dir).map_err(|source| CacheError::ScanFailed {
                path: dir.clone(),
                source,
            })?;
            for entry in entries.flatten() {
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                if meta.is_dir() {
                    stack.push(entry.path());
                } else if meta.is_file() {
                    let last_access = meta
                        .accessed()
                        .or_else(|_| meta.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    files.push(CacheFile {
                        path: entry.path(),
                        size: meta.len(),
                        last_access,
                    });
                }
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{File, FileTimes};

    fn write_aged(dir: &Path, name: &str, bytes: usize, age: Duration) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, vec![0u8; bytes]).unwrap();
        let at = SystemTime::now() - age;
        let times = FileTimes::new().set_accessed(at).set_modified(at);
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_times(times)
            .unwrap();
        path
    }

    fn settings(max: u64, default_max: bool) -> CacheSettings {
        CacheSettings {
            max_bytes: max,
            default_max,
            shrink_delta: 30,
            lookback: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_under_budget_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        write_aged(dir.path(), "a", 40, Duration::from_secs(600));
        let evictor = CacheEvictor::new(dir.path(), settings(100, true));
        let report = evictor.check_and_evict(None).unwrap();
        assert!(report.evicted.is_empty());
        assert_eq!(report.size_after, 40);
    }

    #[test]
    fn test_default_max_shrinks_below_max_minus_delta() {
        let dir = tempfile::tempdir().unwrap();
        for (i, age) in [500u64, 400, 300, 200, 100].iter().enumerate() {
            write_aged(dir.path(), &format!("f{}", i), 30, Duration::from_secs(*age));
        }
        let evictor = CacheEvictor::new(dir.path(), settings(100, true));
        let report = evictor.check_and_evict(None).unwrap();

        assert!(report.size_after <= 70);
        assert_eq!(report.evicted.len(), 3);
        assert!(!dir.path().join("f0").exists());
        assert!(!dir.path().join("f2").exists());
        assert!(dir.path().join("f3").exists());
        assert!(dir.path().join("f4").exists());
    }

    #[test]
    fn test_custom_max_shrinks_by_delta() {
        let dir = tempfile::tempdir().unwrap();
        for (i, age) in [500u64, 400, 300, 200, 100].iter().enumerate() {
            write_aged(dir.path(), &format!("f{}", i), 30, Duration::from_secs(*age));
        }
        let evictor = CacheEvictor::new(dir.path(), settings(100, false));
        let report = evictor.check_and_evict(None).unwrap();
        assert_eq!(report.evicted, vec![dir.path().join("f0")]);
        assert_eq!(report.size_after, 120);
    }

    #[test]
    fn test_recently_accessed_files_survive() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = write_aged(dir.path(), "fresh", 200, Duration::from_secs(5));
        write_aged(dir.path(), "old", 10, Duration::from_secs(900));
        let evictor = CacheEvictor::new(dir.path(), settings(100, true));

        let report = evictor.check_and_evict(None).unwrap();
        assert!(fresh.exists());
        assert_eq!(report.evicted, vec![dir.path().join("old")]);
        assert_eq!(report.size_after, 200);
    }

    #[test]
    fn test_aggregate_is_incremental() {
        let dir = tempfile::tempdir().unwrap();
        write_aged(dir.path(), "a", 10, Duration::from_secs(600));
        let evictor = CacheEvictor::new(dir.path(), settings(1000, true));
        assert_eq!(evictor.aggregate(), None);

        evictor.check_and_evict(None).unwrap();
        assert_eq!(evictor.aggregate(), Some(10));

        let added = write_aged(dir.path(), "b", 25, Duration::from_secs(0));
        evictor.check_and_evict(Some(&added)).unwrap();
        assert_eq!(evictor.aggregate(), Some(35));
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let evictor = CacheEvictor::new(dir.path().join("nope"), settings(10, true));
        assert_eq!(evictor.check_and_evict(None).unwrap().size_after, 0);
    }
}
