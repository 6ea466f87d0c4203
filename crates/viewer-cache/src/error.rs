use std::path::PathBuf;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the book cache.
///
/// Transient filesystem contention is retried internally and never shows up
/// here; what remains is either a failure the caller has to report or an
/// unexpected I/O problem.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to determine the OS cache directory for the default cache path")]
    MissingCacheDir,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to convert {book_path}:\n{log}")]
    ConversionFailure { book_path: PathBuf, log: String },

    #[error("conversion of {book_path} was cancelled")]
    RenderCancelled { book_path: PathBuf },

    #[error("failed to run renderer `{command}`: {source}")]
    SpawnRenderer {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "failed to rename {src} to {dst}; another program (antivirus, file sync) may be holding files in it"
    )]
    RenameFailed {
        src: PathBuf,
        dst: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {timeout:?} waiting for the cache lock on {path}")]
    LockTimeout { path: PathBuf, timeout: Duration },
}
