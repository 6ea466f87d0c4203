//! Eviction of cache entries.
//!
//! Three independent policies run together in one global sweep, always while
//! the cache lock is held:
//! - age expiry: finished entries not accessed within `max_age_secs`
//! - per-source retention: only the most recently accessed finished entry of
//!   each book survives
//! - temp sweep: anything in `temp/` older than a day, whether or not the
//!   metadata still mentions it
//!
//! A directory that cannot be removed keeps its metadata record so the next
//! sweep can try again.

use crate::fingerprint::Fingerprint;
use crate::metadata::{CacheEntry, CacheMetadata, EntryStatus};
use crate::util::{modified_secs, robust_remove_tree, RetryPolicy};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};

pub const DAY_SECS: f64 = 24.0 * 60.0 * 60.0;
/// Default `max_age_secs` for finished entries.
pub const DEFAULT_MAX_AGE_SECS: f64 = 30.0 * DAY_SECS;
/// Anything in `temp/` older than this is removed by the temp sweep.
pub const TEMP_MAX_AGE_SECS: f64 = DAY_SECS;

/// What a global sweep removed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub superseded: usize,
    pub temp_removed: usize,
    pub dangling_pruned: usize,
    pub orphans_removed: usize,
}

/// Directories a sweep operates on.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SweepDirs<'a> {
    pub finished: &'a Path,
    pub temp: &'a Path,
}

/// Whether the global sweep should run as part of an install.
pub(crate) fn expiry_due(metadata: &CacheMetadata, now: f64, max_age_secs: f64, force: bool) -> bool {
    force || max_age_secs < 0.0 || now - metadata.last_clear_at >= DAY_SECS
}

/// Run every eviction policy and stamp `last_clear_at`.
pub(crate) fn sweep(
    metadata: &mut CacheMetadata,
    dirs: SweepDirs<'_>,
    max_age_secs: f64,
    now: f64,
    policy: &RetryPolicy,
) -> SweepReport {
    metadata.last_clear_at = now;
    let report = SweepReport {
        expired: expire_cache(metadata, dirs.finished, max_age_secs, now, policy),
        superseded: expire_old_versions(metadata, dirs.finished, policy),
        temp_removed: clear_temp(dirs.temp, now, policy),
        dangling_pruned: prune_dangling_working(metadata, dirs.temp),
        orphans_removed: remove_orphaned_finished(metadata, dirs.finished, policy),
    };
    tracing::debug!(target = "viewer.cache", ?report, "cache sweep finished");
    report
}

/// Remove finished entries whose last access is more than `max_age_secs` ago.
///
/// A negative `max_age_secs` makes every finished entry eligible.
pub(crate) fn expire_cache(
    metadata: &mut CacheMetadata,
    finished_dir: &Path,
    max_age_secs: f64,
    now: f64,
    policy: &RetryPolicy,
) -> usize {
    let mut expired = 0;
    for list in metadata.entries.values_mut() {
        list.retain(|entry| {
            if !entry.is_finished() || now - entry.atime <= max_age_secs {
                return true;
            }
            let removed = remove_entry_dir(finished_dir, entry, policy);
            if removed {
                expired += 1;
            }
            !removed
        });
    }
    metadata.drop_empty_lists();
    expired
}

/// Keep only the most recently accessed finished entry of every book.
pub(crate) fn expire_old_versions(
    metadata: &mut CacheMetadata,
    finished_dir: &Path,
    policy: &RetryPolicy,
) -> usize {
    let mut by_book: BTreeMap<&str, Vec<&CacheEntry>> = BTreeMap::new();
    for entry in metadata.iter_entries().filter(|entry| entry.is_finished()) {
        by_book.entry(entry.book_path.as_str()).or_default().push(entry);
    }

    let mut stale: Vec<(Fingerprint, String)> = Vec::new();
    for versions in by_book.values_mut() {
        versions.sort_by(|a, b| {
            b.atime
                .total_cmp(&a.atime)
                .then_with(|| b.mtime.total_cmp(&a.mtime))
                .then_with(|| a.id.cmp(&b.id))
        });
        for entry in versions.iter().skip(1) {
            if remove_entry_dir(finished_dir, entry, policy) {
                stale.push((entry.key.clone(), entry.id.clone()));
            }
        }
    }

    for (key, id) in &stale {
        metadata.remove_entry(key, id);
    }
    stale.len()
}

/// Remove direct children of `temp_dir` last modified more than a day ago.
///
/// The metadata is deliberately not consulted: this is what cleans up after
/// renderers that crashed, whatever state their records are in.
pub(crate) fn clear_temp(temp_dir: &Path, now: f64, policy: &RetryPolicy) -> usize {
    let read_dir = match std::fs::read_dir(temp_dir) {
        Ok(read_dir) => read_dir,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "viewer.cache",
                    path = %temp_dir.display(),
                    error = %err,
                    "failed to list temp directory"
                );
            }
            return 0;
        }
    };

    let mut removed = 0;
    for child in read_dir.flatten() {
        let path = child.path();
        let Some(mtime) = modified_secs(&path) else {
            continue;
        };
        if now - mtime > TEMP_MAX_AGE_SECS && robust_remove_tree(&path, policy) {
            removed += 1;
        }
    }
    removed
}

/// Drop `working` records whose scratch directory no longer exists.
pub(crate) fn prune_dangling_working(metadata: &mut CacheMetadata, temp_dir: &Path) -> usize {
    let mut pruned = 0;
    for list in metadata.entries.values_mut() {
        list.retain(|entry| {
            if entry.status != EntryStatus::Working {
                return true;
            }
            let exists = entry_dir(temp_dir, &entry.path)
                .is_some_and(|dir| std::fs::symlink_metadata(dir).is_ok());
            if !exists {
                pruned += 1;
            }
            exists
        });
    }
    metadata.drop_empty_lists();
    pruned
}

/// Remove directories in `finished/` that no finished entry refers to.
///
/// These are left behind when a process dies between installing a directory
/// and recording it.
pub(crate) fn remove_orphaned_finished(
    metadata: &CacheMetadata,
    finished_dir: &Path,
    policy: &RetryPolicy,
) -> usize {
    let referenced: HashSet<&str> = metadata
        .iter_entries()
        .filter(|entry| entry.is_finished())
        .map(|entry| entry.path.as_str())
        .collect();

    let Ok(read_dir) = std::fs::read_dir(finished_dir) else {
        return 0;
    };
    let mut removed = 0;
    for child in read_dir.flatten() {
        let name = child.file_name();
        if name.to_str().is_some_and(|name| referenced.contains(name)) {
            continue;
        }
        let path = child.path();
        tracing::debug!(
            target = "viewer.cache",
            path = %path.display(),
            "removing unreferenced finished directory"
        );
        if robust_remove_tree(&path, policy) {
            removed += 1;
        }
    }
    removed
}

/// `base/name`, provided `name` is a single plain path component.
pub(crate) fn entry_dir(base: &Path, name: &str) -> Option<PathBuf> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(base.join(name)),
        _ => None,
    }
}

fn remove_entry_dir(finished_dir: &Path, entry: &CacheEntry, policy: &RetryPolicy) -> bool {
    match entry_dir(finished_dir, &entry.path) {
        Some(dir) => robust_remove_tree(&dir, policy),
        None => {
            tracing::warn!(
                target = "viewer.cache",
                path = %entry.path,
                "ignoring cache entry with an invalid directory name"
            );
            true
        }
    }
}
