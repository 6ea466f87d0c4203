use crate::error::CacheError;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch, with sub-second precision.
pub fn now_secs() -> f64 {
    system_time_secs(SystemTime::now()).unwrap_or_else(|| {
        // Clock set before 1970. Log once; callers in hot paths would spam otherwise.
        static REPORTED: OnceLock<()> = OnceLock::new();
        if REPORTED.set(()).is_ok() {
            tracing::debug!(
                target = "viewer.cache",
                "system time is before unix epoch; using 0 for now_secs"
            );
        }
        0.0
    })
}

pub(crate) fn system_time_secs(time: SystemTime) -> Option<f64> {
    time.duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs_f64())
}

/// How often a filesystem operation is attempted before giving up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Values below 1 behave like 1.
    pub attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub const MANDATORY_LOCKING_ATTEMPTS: u32 = 2;
    pub const ADVISORY_LOCKING_ATTEMPTS: u32 = 1;

    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    fn attempts(&self) -> u32 {
        self.attempts.max(1)
    }
}

/// Create `path` and its parents; a directory that already exists is success.
pub fn safe_makedirs(path: &Path) -> io::Result<()> {
    match fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        // Lost a creation race with another process.
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(err) => Err(err),
    }
}

/// Recursively delete `path`, retrying per `policy`.
///
/// A path that does not exist counts as removed. Returns `false` when the tree
/// could not be removed; the error is logged and never propagated.
pub fn robust_remove_tree(path: &Path, policy: &RetryPolicy) -> bool {
    let attempts = policy.attempts();
    for attempt in 1..=attempts {
        match remove_dir_all_nofollow(path) {
            Ok(()) => return true,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return true,
            Err(err) if attempt < attempts => {
                tracing::debug!(
                    target = "viewer.cache",
                    path = %path.display(),
                    attempt,
                    error = %err,
                    "failed to remove directory; retrying"
                );
                thread::sleep(policy.delay);
            }
            Err(err) => {
                tracing::warn!(
                    target = "viewer.cache",
                    path = %path.display(),
                    attempts,
                    error = %err,
                    "failed to remove directory"
                );
            }
        }
    }
    false
}

/// Rename `src` to `dst`, retrying per `policy`.
///
/// Unlike [`robust_remove_tree`], exhausting the retries is an error: callers
/// rely on the rename having happened.
pub fn robust_rename(src: &Path, dst: &Path, policy: &RetryPolicy) -> Result<(), CacheError> {
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match fs::rename(src, dst) {
            Ok(()) => {
                if let Some(parent) = dst.parent() {
                    sync_dir_best_effort(parent, "robust_rename.sync_parent_dir");
                }
                return Ok(());
            }
            Err(err) if attempt < attempts => {
                tracing::debug!(
                    target = "viewer.cache",
                    src = %src.display(),
                    dst = %dst.display(),
                    attempt,
                    error = %err,
                    "rename failed; retrying"
                );
                attempt += 1;
                thread::sleep(policy.delay);
            }
            Err(err) => {
                return Err(CacheError::RenameFailed {
                    src: src.to_path_buf(),
                    dst: dst.to_path_buf(),
                    source: err,
                });
            }
        }
    }
}

/// Replace the contents of `path` without readers ever seeing a partial file.
pub fn atomic_write(path: &Path, bytes: &[u8], policy: &RetryPolicy) -> Result<(), CacheError> {
    let Some(parent) = path.parent() else {
        return Err(io::Error::other("path has no parent").into());
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };
    safe_makedirs(parent)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    // Dropping `tmp_path` on the error path removes the temporary file.
    let tmp_path = tmp.into_temp_path();
    robust_rename(&tmp_path, path, policy)?;
    if let Err(err) = tmp_path.keep() {
        tracing::debug!(
            target = "viewer.cache",
            path = %path.display(),
            error = %err,
            "failed to release temporary path after rename"
        );
    }
    Ok(())
}

#[track_caller]
fn sync_dir_best_effort(dir: &Path, reason: &'static str) {
    #[cfg(unix)]
    static SYNC_DIR_ERROR_LOGGED: OnceLock<()> = OnceLock::new();

    #[cfg(unix)]
    {
        match fs::File::open(dir).and_then(|dir| dir.sync_all()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                if SYNC_DIR_ERROR_LOGGED.set(()).is_ok() {
                    let loc = std::panic::Location::caller();
                    tracing::debug!(
                        target = "viewer.cache",
                        dir = %dir.display(),
                        reason,
                        file = loc.file(),
                        line = loc.line(),
                        error = %err,
                        "failed to sync directory (best effort)"
                    );
                }
            }
        }
    }

    #[cfg(not(unix))]
    let _ = (dir, reason);
}

/// Modification time of `path` in seconds, without following symlinks.
pub(crate) fn modified_secs(path: &Path) -> Option<f64> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) => {
            // Entries race with deletion; only log unexpected errors.
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "viewer.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to stat path while reading modified time"
                );
            }
            return None;
        }
    };
    meta.modified().ok().and_then(system_time_secs)
}

/// Total size of regular files (and symlinks themselves) under `root`.
pub fn dir_size_bytes_nofollow(root: &Path) -> u64 {
    let mut total = 0_u64;
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let should_log = match err.io_error() {
                    Some(io_err) => io_err.kind() != io::ErrorKind::NotFound,
                    None => true,
                };
                if should_log {
                    tracing::debug!(
                        target = "viewer.cache",
                        path = err.path().map(|p| p.display().to_string()),
                        error = %err,
                        "failed to walk directory while computing size"
                    );
                }
                continue;
            }
        };
        let ty = entry.file_type();
        if !(ty.is_file() || ty.is_symlink()) {
            continue;
        }
        if let Ok(meta) = fs::symlink_metadata(entry.path()) {
            total = total.saturating_add(meta.len());
        }
    }
    total
}

fn remove_dir_all_nofollow(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        // Symlinks and stray files are removed themselves, never followed.
        return remove_file_or_link(path);
    }

    for entry in walkdir::WalkDir::new(path)
        .follow_links(false)
        .contents_first(true)
    {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())?;
        } else {
            remove_file_or_link(entry.path())?;
        }
    }
    Ok(())
}

fn remove_file_or_link(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::IsADirectory => fs::remove_dir(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
