use crate::error::CacheError;
use crate::metadata::CacheMetadata;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Exclusive lock on the metadata file, shared across processes and threads.
///
/// Holding a `CacheLock` is what grants the right to read and rewrite the
/// metadata document and to move directories into `finished/`. The lock is
/// released when the value is dropped.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    path: PathBuf,
    // `fs2` locks do not exclude other threads of the same process on every
    // platform, so an in-process mutex is held alongside the file lock.
    _guard: MutexGuard<'static, ()>,
}

impl CacheLock {
    /// Lock `path` (creating it if needed), waiting at most `timeout`.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, CacheError> {
        let deadline = Instant::now() + timeout;
        let mutex = process_lock_for_path(path);
        let guard = loop {
            match mutex.try_lock() {
                Ok(guard) => break guard,
                Err(TryLockError::Poisoned(poisoned)) => break poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => wait_until(deadline, path, timeout)?,
            }
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let contended = fs2::lock_contended_error().raw_os_error();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(err) if err.raw_os_error() == contended => {
                    wait_until(deadline, path, timeout)?
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            _guard: guard,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the metadata document; a missing or corrupt document reads as empty.
    pub fn read_metadata(&mut self) -> Result<CacheMetadata, CacheError> {
        let mut bytes = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut bytes)?;
        Ok(CacheMetadata::parse(&bytes, &self.path))
    }

    /// Replace the metadata document.
    ///
    /// The file is rewritten in place: replacing it by rename would hand other
    /// processes a new inode that this lock does not cover.
    pub fn write_metadata(&mut self, metadata: &CacheMetadata) -> Result<(), CacheError> {
        let bytes = metadata.to_json()?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.set_len(0)?;
        self.file.write_all(&bytes)?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn wait_until(deadline: Instant, path: &Path, timeout: Duration) -> Result<(), CacheError> {
    let now = Instant::now();
    if now >= deadline {
        return Err(CacheError::LockTimeout {
            path: path.to_path_buf(),
            timeout,
        });
    }
    thread::sleep(POLL_INTERVAL.min(deadline - now));
    Ok(())
}

fn process_lock_for_path(path: &Path) -> &'static Mutex<()> {
    static PROCESS_LOCKS: OnceLock<Mutex<HashMap<PathBuf, &'static Mutex<()>>>> = OnceLock::new();
    let locks = PROCESS_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));

    let mut map = locks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = map.get(path) {
        return existing;
    }

    let mutex: &'static Mutex<()> = Box::leak(Box::new(Mutex::new(())));
    map.insert(path.to_path_buf(), mutex);
    mutex
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{Fingerprint, SourceStat};
    use crate::metadata::CacheEntry;

    #[test]
    fn metadata_written_under_the_lock_reads_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("metadata.json");

        let mut metadata = CacheMetadata::default();
        metadata.last_clear_at = 42.0;
        metadata.upsert_entry(CacheEntry::new_working(
            Fingerprint::compute("/b.epub", 1, 1.0),
            "/b.epub".to_string(),
            &SourceStat {
                size: 1,
                mtime: 1.0,
            },
            "tmp1".to_string(),
        ));

        {
            let mut lock = CacheLock::acquire(&path, Duration::from_secs(5)).unwrap();
            assert_eq!(lock.read_metadata().unwrap(), CacheMetadata::default());
            lock.write_metadata(&metadata).unwrap();
        }

        // A shorter document must not leave trailing bytes from the longer one.
        {
            let mut lock = CacheLock::acquire(&path, Duration::from_secs(5)).unwrap();
            assert_eq!(lock.read_metadata().unwrap(), metadata);
            lock.write_metadata(&CacheMetadata::default()).unwrap();
        }

        let mut lock = CacheLock::acquire(&path, Duration::from_secs(5)).unwrap();
        assert_eq!(lock.read_metadata().unwrap(), CacheMetadata::default());
    }

    #[test]
    fn waiting_thread_times_out_while_lock_is_held() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("metadata.json");
        let _held = CacheLock::acquire(&path, Duration::from_secs(5)).unwrap();

        let waiter = {
            let path = path.clone();
            thread::spawn(move || CacheLock::acquire(&path, Duration::from_millis(100)).map(drop))
        };
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, CacheError::LockTimeout { .. }), "{err}");
    }

    #[test]
    fn foreign_file_lock_blocks_acquisition() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("metadata.json");
        let foreign = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        foreign.lock_exclusive().unwrap();

        let err = CacheLock::acquire(&path, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, CacheError::LockTimeout { .. }), "{err}");

        FileExt::unlock(&foreign).unwrap();
        CacheLock::acquire(&path, Duration::from_millis(500)).unwrap();
    }

    #[test]
    fn lock_is_released_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("metadata.json");
        drop(CacheLock::acquire(&path, Duration::from_secs(5)).unwrap());
        CacheLock::acquire(&path, Duration::from_millis(100)).unwrap();
    }
}
