use crate::cache_dir::{CacheConfig, CachePaths};
use crate::error::CacheError;
use crate::fingerprint::{normalize_book_path, Fingerprint, SourceStat};
use crate::gc::{self, entry_dir, expiry_due, SweepDirs, DEFAULT_MAX_AGE_SECS};
use crate::lock::CacheLock;
use crate::metadata::{CacheEntry, CacheMetadata, EntryStatus};
use crate::renderer::{BookDescriptor, RenderJob, Renderer, SubprocessRenderer};
use crate::util::{atomic_write, now_secs, robust_remove_tree, robust_rename, RetryPolicy};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use viewer_process::{CommandSpec, WorkerRegistry};

const WORKER_KILL_GRACE: Duration = Duration::from_millis(250);

/// Per-call knobs for [`BookCache::prepare_book`].
pub struct PrepareOptions<'a> {
    /// Finished entries not accessed for this long are evicted by the next
    /// sweep. Negative values evict every finished entry.
    pub max_age_secs: f64,
    /// Discard any finished entry for this exact book version and render again.
    pub force: bool,
    /// Run the global sweep after installing, even if one ran recently.
    pub force_expire: bool,
    /// Called once, before rendering starts, when there is no usable entry.
    pub prepare_notify: Option<&'a dyn Fn()>,
}

impl Default for PrepareOptions<'_> {
    fn default() -> Self {
        Self {
            max_age_secs: DEFAULT_MAX_AGE_SECS,
            force: false,
            force_expire: false,
            prepare_notify: None,
        }
    }
}

/// Counts read from the metadata document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub fingerprints: usize,
    pub finished: usize,
    pub working: usize,
    /// Sum of `cache_size` over finished entries.
    pub total_cache_size: u64,
}

/// Content-addressed cache of rendered books.
///
/// A `BookCache` is cheap to create; any number of them, in any number of
/// processes, may share one root. Renderer subprocesses started through
/// [`BookCache::subprocess_renderer`] are terminated by [`BookCache::close`]
/// or when the cache is dropped.
#[derive(Debug)]
pub struct BookCache {
    config: CacheConfig,
    paths: CachePaths,
    retry: RetryPolicy,
    workers: Arc<WorkerRegistry>,
}

impl BookCache {
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        let paths = CachePaths::new(&config)?;
        let retry = config.retry_policy();
        Ok(Self {
            config,
            paths,
            retry,
            workers: Arc::new(WorkerRegistry::new()),
        })
    }

    pub fn from_env() -> Result<Self, CacheError> {
        Self::new(CacheConfig::from_env())
    }

    pub fn root(&self) -> &Path {
        self.paths.root()
    }

    pub fn paths(&self) -> &CachePaths {
        &self.paths
    }

    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.workers
    }

    /// A renderer that runs `command`, logging into this cache's `temp/`.
    pub fn subprocess_renderer(&self, command: CommandSpec) -> Result<SubprocessRenderer, CacheError> {
        Ok(SubprocessRenderer::new(
            command,
            self.paths.temp_dir()?,
            self.workers.clone(),
        ))
    }

    /// Return the directory holding the rendered form of `book_path`,
    /// rendering it first if no finished entry matches its current size and
    /// modification time.
    pub fn prepare_book(
        &self,
        book_path: &Path,
        renderer: &dyn Renderer,
        options: &PrepareOptions<'_>,
    ) -> Result<PathBuf, CacheError> {
        let stat = SourceStat::of(book_path)?;
        let normalized = normalize_book_path(book_path)?;
        let key = Fingerprint::compute(&normalized, stat.size, stat.mtime);
        let finished_dir = self.paths.finished_dir()?;
        let temp_dir = self.paths.temp_dir()?;

        let mut entry = {
            let mut lock = self.lock()?;
            let mut metadata = lock.read_metadata()?;
            if let Some(dir) = self.lookup(&mut metadata, &key, &finished_dir, options.force) {
                lock.write_metadata(&metadata)?;
                tracing::debug!(
                    target = "viewer.cache",
                    book = %book_path.display(),
                    dir = %dir.display(),
                    "cache hit"
                );
                return Ok(dir);
            }

            if let Some(notify) = options.prepare_notify {
                notify();
            }

            let scratch = tempfile::Builder::new()
                .prefix("w")
                .tempdir_in(&temp_dir)?
                .keep();
            let entry = CacheEntry::new_working(key.clone(), normalized, &stat, basename(&scratch)?);
            metadata.upsert_entry(entry.clone());
            lock.write_metadata(&metadata)?;
            entry
        };
        tracing::debug!(
            target = "viewer.cache",
            book = %book_path.display(),
            key = %key,
            scratch = %entry.path,
            "cache miss; rendering"
        );

        // The lock is not held while rendering.
        let scratch_dir = temp_dir.join(&entry.path);
        let descriptor = BookDescriptor {
            size: stat.size,
            mtime: stat.mtime,
            hash: key,
        };
        let cache_size = renderer.render(&RenderJob {
            book_path,
            output_dir: &scratch_dir,
            descriptor: &descriptor,
        })?;

        let mut lock = self.lock()?;
        let mut metadata = lock.read_metadata()?;
        let installed = reserve_dir_name(&finished_dir)?;
        robust_rename(&scratch_dir, &installed, &self.retry)?;

        let now = now_secs();
        entry.path = basename(&installed)?;
        entry.status = EntryStatus::Finished;
        entry.cache_size = cache_size;
        entry.atime = now;
        metadata.upsert_entry(entry);

        if expiry_due(&metadata, now, options.max_age_secs, options.force_expire) {
            let dirs = SweepDirs {
                finished: &finished_dir,
                temp: &temp_dir,
            };
            gc::sweep(&mut metadata, dirs, options.max_age_secs, now, &self.retry);
        }
        lock.write_metadata(&metadata)?;
        tracing::debug!(
            target = "viewer.cache",
            book = %book_path.display(),
            dir = %installed.display(),
            cache_size,
            "installed rendered book"
        );
        Ok(installed)
    }

    /// Move the finished entries of a book from its old version to its current
    /// one without rendering again, overwriting the given files in each.
    ///
    /// Use this when the book file changed in a way that does not affect the
    /// rendered output, e.g. after annotations were written into it.
    pub fn update_book(
        &self,
        book_path: &Path,
        old_stat: &SourceStat,
        name_data_map: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), CacheError> {
        let normalized = normalize_book_path(book_path)?;
        let old_key = Fingerprint::compute(&normalized, old_stat.size, old_stat.mtime);
        let finished_dir = self.paths.finished_dir()?;

        let mut lock = self.lock()?;
        let stat = SourceStat::of(book_path)?;
        let new_key = Fingerprint::compute(&normalized, stat.size, stat.mtime);
        if old_key == new_key {
            return Ok(());
        }

        let mut metadata = lock.read_metadata()?;
        let Some(list) = metadata.entries.remove(&old_key) else {
            return Ok(());
        };
        let (moved, kept): (Vec<_>, Vec<_>) = list.into_iter().partition(CacheEntry::is_finished);
        if moved.is_empty() {
            return Ok(());
        }
        if !kept.is_empty() {
            metadata.entries.insert(old_key, kept);
        }

        for mut entry in moved {
            // Patching a missing directory would recreate it holding only the
            // patched files, which a later lookup would serve as a full render.
            let Some(dir) = entry_dir(&finished_dir, &entry.path).filter(|dir| dir.is_dir()) else {
                tracing::warn!(
                    target = "viewer.cache",
                    book = %book_path.display(),
                    path = %entry.path,
                    "cached book directory has disappeared; dropping it instead of updating"
                );
                continue;
            };
            for (name, data) in name_data_map {
                atomic_write(&entry_file(&dir, name)?, data, &self.retry)?;
            }
            entry.key = new_key.clone();
            entry.file_mtime = stat.mtime;
            entry.file_size = stat.size;
            metadata.upsert_entry(entry);
        }
        lock.write_metadata(&metadata)?;
        tracing::debug!(
            target = "viewer.cache",
            book = %book_path.display(),
            key = %new_key,
            "updated cached book in place"
        );
        Ok(())
    }

    /// A snapshot of the metadata document, read under the cache lock.
    pub fn metadata(&self) -> Result<CacheMetadata, CacheError> {
        self.lock()?.read_metadata()
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let metadata = self.metadata()?;
        let mut stats = CacheStats {
            fingerprints: metadata.entries.len(),
            ..CacheStats::default()
        };
        for entry in metadata.iter_entries() {
            match entry.status {
                EntryStatus::Finished => {
                    stats.finished += 1;
                    stats.total_cache_size = stats.total_cache_size.saturating_add(entry.cache_size);
                }
                EntryStatus::Working => stats.working += 1,
            }
        }
        Ok(stats)
    }

    /// Terminate renderer subprocesses that are still running.
    pub fn close(&self) {
        let killed = self.workers.kill_all(WORKER_KILL_GRACE);
        if killed > 0 {
            tracing::debug!(target = "viewer.cache", killed, "terminated running renderers");
        }
    }

    fn lock(&self) -> Result<CacheLock, CacheError> {
        CacheLock::acquire(&self.paths.metadata_file()?, self.config.lock_timeout)
    }

    /// Find a usable finished entry for `key`, bumping its access time.
    ///
    /// With `force`, finished entries are deleted instead. Finished entries
    /// whose directory has disappeared are dropped.
    fn lookup(
        &self,
        metadata: &mut CacheMetadata,
        key: &Fingerprint,
        finished_dir: &Path,
        force: bool,
    ) -> Option<PathBuf> {
        let list = metadata.entries.get_mut(key)?;
        let mut hit = None;
        list.retain_mut(|entry| {
            if hit.is_some() || !entry.is_finished() {
                return true;
            }
            let Some(dir) = entry_dir(finished_dir, &entry.path) else {
                return false;
            };
            if force {
                robust_remove_tree(&dir, &self.retry);
                return false;
            }
            if !dir.is_dir() {
                tracing::warn!(
                    target = "viewer.cache",
                    dir = %dir.display(),
                    "cached book directory has disappeared; rendering again"
                );
                return false;
            }
            entry.atime = now_secs();
            hit = Some(dir);
            true
        });
        metadata.drop_empty_lists();
        hit
    }
}

impl Drop for BookCache {
    fn drop(&mut self) {
        self.close();
    }
}

/// A fresh, currently unused name under `parent`.
///
/// The directory is created to claim the name and removed again so that a
/// rename can land on it; callers hold the cache lock in between.
fn reserve_dir_name(parent: &Path) -> Result<PathBuf, CacheError> {
    let reserved = tempfile::Builder::new()
        .prefix("c")
        .tempdir_in(parent)?
        .keep();
    std::fs::remove_dir(&reserved)?;
    Ok(reserved)
}

fn basename(path: &Path) -> Result<String, CacheError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| {
            io::Error::other(format!("{} has no UTF-8 file name", path.display())).into()
        })
}

/// `dir/name` for a relative `name` that stays inside `dir`.
fn entry_file(dir: &Path, name: &str) -> Result<PathBuf, CacheError> {
    let relative = Path::new(name);
    let valid = !name.is_empty()
        && relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !valid {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to write outside the cached book: {name}"),
        )
        .into());
    }
    Ok(dir.join(relative))
}
