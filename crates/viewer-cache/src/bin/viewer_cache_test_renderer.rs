//! Minimal renderer used by the integration tests.
//!
//! Reads a [`RenderMessage`] from stdin and writes a couple of small files into
//! the destination directory.

use std::{env, fs, io, process, thread, time::Duration};
use viewer_cache::RenderMessage;

fn parse_u64(value: Option<String>, flag: &str) -> u64 {
    let value = value.unwrap_or_else(|| {
        eprintln!("missing value for {flag}");
        process::exit(2);
    });
    value.parse().unwrap_or_else(|_| {
        eprintln!("invalid u64 for {flag}: {value}");
        process::exit(2);
    })
}

fn main() {
    let mut fail = false;
    let mut sleep_ms = 0;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--fail" => fail = true,
            "--sleep-ms" => sleep_ms = parse_u64(args.next(), "--sleep-ms"),
            other => {
                eprintln!("unknown argument: {other}");
                process::exit(2);
            }
        }
    }

    let message: RenderMessage = serde_json::from_reader(io::stdin()).unwrap_or_else(|err| {
        eprintln!("invalid render message: {err}");
        process::exit(2);
    });
    let RenderMessage(book_path, dest, descriptor) = message;
    println!("rendering {} into {}", book_path.display(), dest.display());

    if sleep_ms > 0 {
        thread::sleep(Duration::from_millis(sleep_ms));
    }
    if fail {
        eprintln!("unsupported book format: {}", book_path.display());
        process::exit(1);
    }

    let written = fs::write(dest.join("sentinel"), b"test").and_then(|()| {
        fs::write(
            dest.join("index.html"),
            format!("<html data-hash=\"{}\"></html>", descriptor.hash),
        )
    });
    if let Err(err) = written {
        eprintln!("failed to write output: {err}");
        process::exit(1);
    }
}
