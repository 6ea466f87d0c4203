//! Runs one `prepare_book` call from a separate process, for the multi-process
//! integration tests.
//!
//! The in-process renderer touches `--ready` and then waits for `--wait-for`
//! to appear, so two callers can be held inside their renders at once. The
//! installed directory is printed on stdout.

use std::{
    env, fs,
    path::{Path, PathBuf},
    process, thread,
    time::{Duration, Instant},
};
use viewer_cache::{BookCache, CacheConfig, CacheError, PrepareOptions, RenderJob};

const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(30);

fn required(value: Option<String>, flag: &str) -> PathBuf {
    value.map(PathBuf::from).unwrap_or_else(|| {
        eprintln!("missing value for {flag}");
        process::exit(2);
    })
}

fn wait_for(path: &Path) -> Result<(), CacheError> {
    let deadline = Instant::now() + RENDEZVOUS_TIMEOUT;
    while !path.exists() {
        if Instant::now() >= deadline {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{} never appeared", path.display()),
            )
            .into());
        }
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

fn main() {
    let (mut root, mut book, mut ready, mut peer) = (None, None, None, None);
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--root" => root = Some(required(args.next(), "--root")),
            "--book" => book = Some(required(args.next(), "--book")),
            "--ready" => ready = Some(required(args.next(), "--ready")),
            "--wait-for" => peer = Some(required(args.next(), "--wait-for")),
            other => {
                eprintln!("unknown argument: {other}");
                process::exit(2);
            }
        }
    }
    let (Some(root), Some(book)) = (root, book) else {
        eprintln!("--root and --book are required");
        process::exit(2);
    };

    let renderer = |job: &RenderJob<'_>| -> Result<u64, CacheError> {
        if let Some(ready) = &ready {
            fs::write(ready, b"")?;
        }
        if let Some(peer) = &peer {
            wait_for(peer)?;
        }
        fs::write(job.output_dir.join("sentinel"), b"test")?;
        Ok(4)
    };

    let result = BookCache::new(CacheConfig::with_root(root))
        .and_then(|cache| cache.prepare_book(&book, &renderer, &PrepareOptions::default()));
    match result {
        Ok(dir) => println!("{}", dir.display()),
        Err(err) => {
            eprintln!("prepare_book failed: {err}");
            process::exit(1);
        }
    }
}
