use crate::error::CacheError;
use crate::util::{safe_makedirs, RetryPolicy};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const METADATA_FILENAME: &str = "metadata.json";
pub const FINISHED_DIRNAME: &str = "finished";
pub const TEMP_DIRNAME: &str = "temp";

/// Default time to wait for the cache lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(600);
/// Default pause between attempts of a retried filesystem operation.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Whether the host filesystem may keep recently closed files locked.
///
/// On Windows a virus scanner or indexer can hold a just-written file open for
/// a moment, making renames and deletes fail transiently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilesystemLocking {
    Mandatory,
    Advisory,
}

impl FilesystemLocking {
    pub fn detect() -> Self {
        if cfg!(windows) {
            Self::Mandatory
        } else {
            Self::Advisory
        }
    }
}

/// Configuration for the on-disk book cache.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Use this directory as the cache root instead of the OS cache directory.
    pub cache_root_override: Option<PathBuf>,
    pub locking: FilesystemLocking,
    pub lock_timeout: Duration,
    pub retry_delay: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_root_override: None,
            locking: FilesystemLocking::detect(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl CacheConfig {
    /// Defaults, with the root taken from `VIEWER_CACHE_DIR` when set.
    pub fn from_env() -> Self {
        Self {
            cache_root_override: std::env::var_os("VIEWER_CACHE_DIR")
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
            ..Self::default()
        }
    }

    /// Defaults, rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root_override: Some(root.into()),
            ..Self::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let attempts = match self.locking {
            FilesystemLocking::Mandatory => RetryPolicy::MANDATORY_LOCKING_ATTEMPTS,
            FilesystemLocking::Advisory => RetryPolicy::ADVISORY_LOCKING_ATTEMPTS,
        };
        RetryPolicy::new(attempts, self.retry_delay)
    }
}

/// Resolved locations inside the cache root.
///
/// Every accessor creates the directory it returns (or, for the metadata
/// file, its parent) so callers never race on a missing directory.
#[derive(Clone, Debug)]
pub struct CachePaths {
    root: PathBuf,
}

impl CachePaths {
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        let root = match &config.cache_root_override {
            Some(root) => root.clone(),
            None => default_cache_root()?,
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn finished_dir(&self) -> Result<PathBuf, CacheError> {
        ensure_dir(self.root.join(FINISHED_DIRNAME))
    }

    pub fn temp_dir(&self) -> Result<PathBuf, CacheError> {
        ensure_dir(self.root.join(TEMP_DIRNAME))
    }

    pub fn metadata_file(&self) -> Result<PathBuf, CacheError> {
        safe_makedirs(&self.root)?;
        Ok(self.root.join(METADATA_FILENAME))
    }
}

fn ensure_dir(dir: PathBuf) -> Result<PathBuf, CacheError> {
    safe_makedirs(&dir)?;
    Ok(dir)
}

pub(crate) fn default_cache_root() -> Result<PathBuf, CacheError> {
    let base = dirs::cache_dir().ok_or(CacheError::MissingCacheDir)?;
    Ok(base.join("viewer-cache").join("book-cache"))
}
