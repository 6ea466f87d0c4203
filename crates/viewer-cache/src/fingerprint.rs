use crate::error::CacheError;
use crate::util::system_time_secs;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

/// Version of the renderer's output format. Bumping it invalidates every entry.
pub const RENDER_VERSION: u32 = 1;
/// Version of the on-disk cache layout. Bumping it invalidates every entry.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Size and modification time of a source book, as captured by `stat`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceStat {
    pub size: u64,
    /// Seconds since the unix epoch.
    pub mtime: f64,
}

impl SourceStat {
    pub fn of(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path)?;
        let mtime = match meta.modified().ok().and_then(system_time_secs) {
            Some(mtime) => mtime,
            None => {
                static REPORTED: OnceLock<()> = OnceLock::new();
                if REPORTED.set(()).is_ok() {
                    tracing::debug!(
                        target = "viewer.cache",
                        path = %path.display(),
                        "file mtime unavailable or before unix epoch; using 0"
                    );
                }
                0.0
            }
        };
        Ok(Self {
            size: meta.len(),
            mtime,
        })
    }
}

/// The cache key of one version of one book: a lowercase SHA-1 hex digest.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash an already-normalized book path together with its stat and the
    /// format versions.
    pub fn compute(normalized_path: &str, size: u64, mtime: f64) -> Self {
        let raw = serde_json::json!([
            normalized_path,
            size,
            mtime,
            RENDER_VERSION,
            CACHE_FORMAT_VERSION
        ])
        .to_string();
        let mut hasher = Sha1::new();
        hasher.update(raw.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn for_book(path: &Path, stat: &SourceStat) -> Result<Self, CacheError> {
        let normalized = normalize_book_path(path)?;
        Ok(Self::compute(&normalized, stat.size, stat.mtime))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Absolute, lexically normalized form of `path`. Symlinks are not resolved.
///
/// Case is folded on Windows only. macOS volumes are usually case-insensitive
/// too, but their paths are left as given, so two spellings of one book there
/// get two keys.
pub fn normalize_book_path(path: &Path) -> Result<String, CacheError> {
    let absolute = std::path::absolute(path)?;
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Ok(normcase(normalized.to_string_lossy().into_owned()))
}

#[cfg(windows)]
fn normcase(path: String) -> String {
    path.replace('/', "\\").to_lowercase()
}

#[cfg(not(windows))]
fn normcase(path: String) -> String {
    path
}
