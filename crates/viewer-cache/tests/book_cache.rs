use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use tracing_subscriber::fmt::MakeWriter;
use viewer_cache::{
    now_secs, BookCache, CacheConfig, CacheEntry, CacheError, CacheLock, CacheMetadata, CacheStats,
    EntryStatus, Fingerprint, PrepareOptions, RenderJob, Renderer, SourceStat,
};

/// Writes `sentinel` = `test` and counts invocations.
#[derive(Default)]
struct StubRenderer {
    calls: AtomicUsize,
}

impl StubRenderer {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Renderer for StubRenderer {
    fn render(&self, job: &RenderJob<'_>) -> Result<u64, CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        fs::write(job.output_dir.join("sentinel"), b"test")?;
        Ok(4)
    }
}

#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

struct Fixture {
    tmp: tempfile::TempDir,
    cache: BookCache,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let cache = BookCache::new(CacheConfig::with_root(tmp.path().join("cache"))).unwrap();
        Self { tmp, cache }
    }

    fn book(&self, name: &str, body: &str) -> PathBuf {
        let path = self.tmp.path().join(name);
        fs::write(&path, body).unwrap();
        path
    }

    fn finished_names(&self) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(self.cache.paths().finished_dir().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    fn prepare(&self, book: &Path, renderer: &dyn Renderer, options: &PrepareOptions<'_>) -> PathBuf {
        self.cache.prepare_book(book, renderer, options).unwrap()
    }
}

fn force() -> PrepareOptions<'static> {
    PrepareOptions {
        force: true,
        ..PrepareOptions::default()
    }
}

fn force_expire() -> PrepareOptions<'static> {
    PrepareOptions {
        force_expire: true,
        ..PrepareOptions::default()
    }
}

#[test]
fn unchanged_book_is_rendered_once() {
    let fx = Fixture::new();
    let renderer = StubRenderer::default();
    let book = fx.book("book.epub", "a");

    let first = fx.prepare(&book, &renderer, &PrepareOptions::default());
    assert_eq!(fs::read(first.join("sentinel")).unwrap(), b"test");
    let second = fx.prepare(&book, &renderer, &PrepareOptions::default());

    assert_eq!(first, second);
    assert_eq!(renderer.calls(), 1);
    assert!(first.starts_with(fx.cache.paths().finished_dir().unwrap()));
}

#[test]
fn hit_bumps_access_time() {
    let fx = Fixture::new();
    let renderer = StubRenderer::default();
    let book = fx.book("book.epub", "a");
    fx.prepare(&book, &renderer, &PrepareOptions::default());
    let installed_at = fx.cache.metadata().unwrap().iter_entries().next().unwrap().atime;

    thread::sleep(std::time::Duration::from_millis(20));
    fx.prepare(&book, &renderer, &PrepareOptions::default());

    let atime = fx.cache.metadata().unwrap().iter_entries().next().unwrap().atime;
    assert!(atime > installed_at, "{atime} <= {installed_at}");
}

#[test]
fn lifecycle_of_one_book() {
    let fx = Fixture::new();
    let renderer = StubRenderer::default();
    let book = fx.book("book.epub", "a");
    let notified = AtomicUsize::new(0);
    let notify = || {
        notified.fetch_add(1, Ordering::SeqCst);
    };
    let with_notify = PrepareOptions {
        prepare_notify: Some(&notify),
        ..PrepareOptions::default()
    };

    let p1 = fx.prepare(&book, &renderer, &with_notify);
    assert_eq!(fx.prepare(&book, &renderer, &with_notify), p1);
    assert_eq!(notified.load(Ordering::SeqCst), 1);

    // A changed file is a different version.
    fs::write(&book, "bc").unwrap();
    let p2 = fx.prepare(&book, &renderer, &with_notify);
    assert_ne!(p2, p1);
    assert_eq!(notified.load(Ordering::SeqCst), 2);

    // Forcing discards the render of the current version.
    let p3 = fx.prepare(&book, &renderer, &force());
    assert_ne!(p3, p2);
    assert!(!p2.exists());
    assert!(p3.is_dir());

    // A negative max age evicts everything, including the new install.
    fs::write(&book, "bcd").unwrap();
    let expire_all = PrepareOptions {
        max_age_secs: -1000.0,
        ..PrepareOptions::default()
    };
    fx.prepare(&book, &renderer, &expire_all);
    assert!(fx.finished_names().is_empty(), "{:?}", fx.finished_names());
    assert_eq!(fx.cache.stats().unwrap().finished, 0);
    assert_eq!(renderer.calls(), 4);
}

#[test]
fn repeated_edits_keep_a_single_version() {
    let fx = Fixture::new();
    let renderer = StubRenderer::default();
    let book = fx.book("book.epub", "");

    for i in 1..=5 {
        fs::write(&book, "x".repeat(i)).unwrap();
        let dir = fx.prepare(&book, &renderer, &force_expire());

        assert!(dir.is_dir());
        assert_eq!(fx.finished_names().len(), 1, "iteration {i}");
        let metadata = fx.cache.metadata().unwrap();
        assert_eq!(metadata.entries.len(), 1, "iteration {i}");
        assert!(metadata.last_clear_at > 0.0);
    }
}

#[test]
fn update_moves_the_render_to_the_new_version() {
    let fx = Fixture::new();
    let renderer = StubRenderer::default();
    let book = fx.book("book2.epub", "abc");
    let dir = fx.prepare(&book, &renderer, &PrepareOptions::default());
    let old_stat = SourceStat::of(&book).unwrap();

    fs::write(&book, "abcdef").unwrap();
    let new_stat = SourceStat::of(&book).unwrap();
    let files = BTreeMap::from([("sentinel".to_string(), b"updated".to_vec())]);
    fx.cache.update_book(&book, &old_stat, &files).unwrap();

    assert_eq!(fs::read(dir.join("sentinel")).unwrap(), b"updated");
    let metadata = fx.cache.metadata().unwrap();
    let entries: Vec<_> = metadata.iter_entries().collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, EntryStatus::Finished);
    assert_eq!(entries[0].file_size, new_stat.size);
    assert_eq!(entries[0].file_mtime, new_stat.mtime);
    assert_eq!(entries[0].key, Fingerprint::for_book(&book, &new_stat).unwrap());

    // The updated render is served for the new version without rendering.
    assert_eq!(fx.prepare(&book, &renderer, &PrepareOptions::default()), dir);
    assert_eq!(renderer.calls(), 1);
}

#[test]
fn update_drops_a_render_whose_directory_vanished() {
    let fx = Fixture::new();
    let renderer = |job: &RenderJob<'_>| -> Result<u64, CacheError> {
        fs::write(job.output_dir.join("sentinel"), b"test")?;
        fs::write(job.output_dir.join("index.html"), b"<html/>")?;
        Ok(11)
    };
    let book = fx.book("book.epub", "abc");
    let dir = fx.prepare(&book, &renderer, &PrepareOptions::default());
    let old_stat = SourceStat::of(&book).unwrap();

    fs::remove_dir_all(&dir).unwrap();
    fs::write(&book, "abcdef").unwrap();
    let files = BTreeMap::from([("sentinel".to_string(), b"new".to_vec())]);
    fx.cache.update_book(&book, &old_stat, &files).unwrap();

    assert!(!dir.exists());
    assert_eq!(fx.cache.stats().unwrap().finished, 0);

    let rendered = fx.prepare(&book, &renderer, &PrepareOptions::default());
    assert_ne!(rendered, dir);
    assert_eq!(fs::read(rendered.join("sentinel")).unwrap(), b"test");
    assert!(rendered.join("index.html").is_file());
}

#[test]
fn update_of_an_unchanged_book_is_a_no_op() {
    let fx = Fixture::new();
    let renderer = StubRenderer::default();
    let book = fx.book("book.epub", "abc");
    let dir = fx.prepare(&book, &renderer, &PrepareOptions::default());
    let stat = SourceStat::of(&book).unwrap();

    let files = BTreeMap::from([("sentinel".to_string(), b"updated".to_vec())]);
    fx.cache.update_book(&book, &stat, &files).unwrap();

    assert_eq!(fs::read(dir.join("sentinel")).unwrap(), b"test");
}

#[test]
fn update_refuses_names_outside_the_entry() {
    let fx = Fixture::new();
    let renderer = StubRenderer::default();
    let book = fx.book("book.epub", "abc");
    fx.prepare(&book, &renderer, &PrepareOptions::default());
    let old_stat = SourceStat::of(&book).unwrap();
    fs::write(&book, "abcd").unwrap();

    let files = BTreeMap::from([("../escape".to_string(), b"x".to_vec())]);
    let err = fx.cache.update_book(&book, &old_stat, &files).unwrap_err();

    assert!(matches!(err, CacheError::Io(_)), "{err}");
    assert!(!fx.cache.paths().finished_dir().unwrap().join("escape").exists());
}

#[test]
fn concurrent_installs_both_succeed_and_settle() {
    let fx = Fixture::new();
    let book = fx.book("book.epub", "shared");
    let root = fx.cache.root().to_path_buf();
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let root = root.clone();
            let book = book.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let cache = BookCache::new(CacheConfig::with_root(root)).unwrap();
                // Both callers are past the lookup before either installs.
                let renderer = |job: &RenderJob<'_>| -> Result<u64, CacheError> {
                    barrier.wait();
                    fs::write(job.output_dir.join("sentinel"), b"test")?;
                    Ok(4)
                };
                cache
                    .prepare_book(&book, &renderer, &PrepareOptions::default())
                    .unwrap()
            })
        })
        .collect();
    let dirs: Vec<PathBuf> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_ne!(dirs[0], dirs[1]);
    for dir in &dirs {
        assert_eq!(fs::read(dir.join("sentinel")).unwrap(), b"test");
    }
    assert_eq!(fx.cache.stats().unwrap().finished, 2);

    let other = fx.book("other.epub", "other");
    fx.prepare(&other, &StubRenderer::default(), &force_expire());

    let metadata = fx.cache.metadata().unwrap();
    let book_path = viewer_cache::normalize_book_path(&book).unwrap();
    let survivors: Vec<_> = metadata
        .iter_entries()
        .filter(|entry| entry.book_path == book_path)
        .collect();
    assert_eq!(survivors.len(), 1);
    assert_eq!(fx.finished_names().len(), 2);
}

#[test]
fn leftovers_of_an_interrupted_install_are_reclaimed() {
    let fx = Fixture::new();
    let renderer = StubRenderer::default();
    let finished = fx.cache.paths().finished_dir().unwrap();

    // A directory renamed into place whose metadata write never happened, and
    // a working record whose scratch directory is gone.
    fs::create_dir(finished.join("corphan")).unwrap();
    fs::write(finished.join("corphan").join("sentinel"), b"test").unwrap();
    let stale = fx.book("stale.epub", "s");
    let stat = SourceStat::of(&stale).unwrap();
    let key = Fingerprint::for_book(&stale, &stat).unwrap();
    {
        let mut lock =
            CacheLock::acquire(&fx.cache.paths().metadata_file().unwrap(), std::time::Duration::from_secs(5))
                .unwrap();
        let mut metadata = lock.read_metadata().unwrap();
        let entry = CacheEntry::new_working(
            key.clone(),
            viewer_cache::normalize_book_path(&stale).unwrap(),
            &stat,
            "wgone".to_string(),
        );
        metadata.entries.entry(key.clone()).or_default().push(entry);
        lock.write_metadata(&metadata).unwrap();
    }

    let book = fx.book("book.epub", "a");
    let dir = fx.prepare(&book, &renderer, &PrepareOptions::default());
    assert!(dir.is_dir());

    fs::write(&book, "ab").unwrap();
    let dir = fx.prepare(&book, &renderer, &force_expire());
    assert!(dir.is_dir());

    assert!(!finished.join("corphan").exists());
    let metadata = fx.cache.metadata().unwrap();
    assert!(!metadata.entries.contains_key(&key));
    assert_eq!(fx.finished_names().len(), 1);
}

#[test]
fn vanished_render_is_rendered_again() {
    let fx = Fixture::new();
    let renderer = StubRenderer::default();
    let book = fx.book("book.epub", "a");
    let first = fx.prepare(&book, &renderer, &PrepareOptions::default());

    fs::remove_dir_all(&first).unwrap();
    let second = fx.prepare(&book, &renderer, &PrepareOptions::default());

    assert!(second.is_dir());
    assert_eq!(renderer.calls(), 2);
    assert_eq!(fx.cache.stats().unwrap().finished, 1);
}

#[test]
fn failed_render_leaves_a_working_entry() {
    let fx = Fixture::new();
    let book = fx.book("book.epub", "a");
    let failing = |job: &RenderJob<'_>| -> Result<u64, CacheError> {
        Err(CacheError::ConversionFailure {
            book_path: job.book_path.to_path_buf(),
            log: "boom".to_string(),
        })
    };

    let err = fx
        .cache
        .prepare_book(&book, &failing, &PrepareOptions::default())
        .unwrap_err();
    match err {
        CacheError::ConversionFailure { log, .. } => assert_eq!(log, "boom"),
        other => panic!("unexpected error: {other}"),
    }

    let stats = fx.cache.stats().unwrap();
    assert_eq!(stats.working, 1);
    assert_eq!(stats.finished, 0);
    assert!(fx.finished_names().is_empty());

    // The next attempt renders from scratch.
    let dir = fx.prepare(&book, &StubRenderer::default(), &PrepareOptions::default());
    assert!(dir.is_dir());
}

#[test]
fn failed_install_rename_keeps_the_working_entry() {
    let fx = Fixture::new();
    let book = fx.book("book.epub", "a");
    // Leaves nothing behind to rename into `finished/`.
    let vanishing = |job: &RenderJob<'_>| -> Result<u64, CacheError> {
        fs::remove_dir(job.output_dir)?;
        Ok(0)
    };

    let err = fx
        .cache
        .prepare_book(&book, &vanishing, &PrepareOptions::default())
        .unwrap_err();

    assert!(matches!(err, CacheError::RenameFailed { .. }), "{err}");
    let metadata = fx.cache.metadata().unwrap();
    let entries: Vec<_> = metadata.iter_entries().collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, EntryStatus::Working);
    assert!(fx.finished_names().is_empty());
}

#[test]
fn corrupt_metadata_is_replaced() {
    let fx = Fixture::new();
    let metadata_file = fx.cache.paths().metadata_file().unwrap();
    fs::write(&metadata_file, b"{ not json").unwrap();
    let book = fx.book("book.epub", "a");

    let logs = LogCapture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .finish();
    let dir = tracing::subscriber::with_default(subscriber, || {
        fx.prepare(&book, &StubRenderer::default(), &PrepareOptions::default())
    });

    assert!(dir.is_dir());
    let logged = logs.text();
    assert!(logged.contains("WARN"), "{logged}");
    assert!(logged.contains("cache metadata is corrupt"), "{logged}");
    let raw = fs::read(&metadata_file).unwrap();
    let parsed: CacheMetadata = serde_json::from_slice(&raw).unwrap();
    assert_eq!(parsed.iter_entries().count(), 1);
}

#[test]
fn unknown_metadata_fields_are_preserved() {
    let fx = Fixture::new();
    let finished = fx.cache.paths().finished_dir().unwrap();
    fs::create_dir(finished.join("ckept")).unwrap();
    let metadata_file = fx.cache.paths().metadata_file().unwrap();
    let now = now_secs();
    let doc = serde_json::json!({
        "entries": {
            "0123456789abcdef0123456789abcdef01234567": [{
                "path": "ckept",
                "id": "kept",
                "status": "finished",
                "mtime": now,
                "atime": now,
                "key": "0123456789abcdef0123456789abcdef01234567",
                "file_mtime": 1.0,
                "file_size": 1,
                "cache_size": 0,
                "book_path": "/elsewhere/kept.epub",
                "reading_position": 12
            }]
        },
        "last_clear_at": 0.0,
        "written_by": "a newer viewer"
    });
    fs::write(&metadata_file, serde_json::to_vec(&doc).unwrap()).unwrap();

    let book = fx.book("book.epub", "a");
    fx.prepare(&book, &StubRenderer::default(), &force_expire());

    let raw: serde_json::Value = serde_json::from_slice(&fs::read(&metadata_file).unwrap()).unwrap();
    assert_eq!(raw["written_by"], "a newer viewer");
    let kept = &raw["entries"]["0123456789abcdef0123456789abcdef01234567"][0];
    assert_eq!(kept["reading_position"], 12);
    assert!(finished.join("ckept").is_dir());
}

#[test]
fn stats_count_entries() {
    let fx = Fixture::new();
    let renderer = StubRenderer::default();
    assert_eq!(fx.cache.stats().unwrap(), CacheStats::default());

    fx.prepare(&fx.book("a.epub", "a"), &renderer, &PrepareOptions::default());
    fx.prepare(&fx.book("b.epub", "b"), &renderer, &PrepareOptions::default());

    let stats = fx.cache.stats().unwrap();
    assert_eq!(stats.fingerprints, 2);
    assert_eq!(stats.finished, 2);
    assert_eq!(stats.working, 0);
    assert_eq!(stats.total_cache_size, 8);
}

#[test]
fn missing_book_is_an_io_error() {
    let fx = Fixture::new();
    let err = fx
        .cache
        .prepare_book(
            &fx.tmp.path().join("missing.epub"),
            &StubRenderer::default(),
            &PrepareOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, CacheError::Io(_)), "{err}");
}
