//! On-disk cache of rendered books for the viewer.
//!
//! A book file is rendered once into a directory of display-ready files; later
//! opens of the same, unchanged file reuse that directory. Any number of
//! threads and processes may share one cache root: every read-modify-write of
//! the metadata document happens under an exclusive file lock, while the
//! (slow) rendering itself runs without the lock.
//!
//! ## On-disk layout
//!
//! Under the cache root (by default `<os cache dir>/viewer-cache/book-cache`,
//! overridable with `VIEWER_CACHE_DIR`):
//! - `metadata.json`: [`CacheMetadata`]; also the lock file
//! - `finished/<name>/`: installed renders, one directory per [`CacheEntry`]
//! - `temp/<name>/`: scratch directories of renders in progress, plus renderer
//!   logs
//!
//! Entries are keyed by a [`Fingerprint`] of the book's normalized path, size
//! and modification time, so editing a book makes the old render unreachable.
//! Stale renders are reclaimed by a sweep that runs at most daily, piggybacked
//! on installs.

mod book_cache;
mod cache_dir;
mod error;
mod fingerprint;
mod gc;
mod lock;
mod metadata;
mod renderer;
mod util;

pub use book_cache::{BookCache, CacheStats, PrepareOptions};
pub use cache_dir::{
    CacheConfig, CachePaths, FilesystemLocking, DEFAULT_LOCK_TIMEOUT, DEFAULT_RETRY_DELAY,
    FINISHED_DIRNAME, METADATA_FILENAME, TEMP_DIRNAME,
};
pub use error::{CacheError, Result};
pub use fingerprint::{
    normalize_book_path, Fingerprint, SourceStat, CACHE_FORMAT_VERSION, RENDER_VERSION,
};
pub use gc::{SweepReport, DAY_SECS, DEFAULT_MAX_AGE_SECS, TEMP_MAX_AGE_SECS};
pub use lock::CacheLock;
pub use metadata::{CacheEntry, CacheMetadata, EntryStatus};
pub use renderer::{BookDescriptor, RenderJob, RenderMessage, Renderer, SubprocessRenderer};
pub use util::{now_secs, RetryPolicy};
pub use viewer_process::{CancellationToken, CommandSpec, RunOptions, WorkerRegistry};
