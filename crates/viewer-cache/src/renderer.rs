use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use crate::util::{dir_size_bytes_nofollow, safe_makedirs};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use viewer_process::{run_worker, CommandSpec, RunOptions, WorkerRegistry};

/// The version of the book a render was started for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BookDescriptor {
    pub size: u64,
    pub mtime: f64,
    pub hash: Fingerprint,
}

/// Message a renderer subprocess reads from stdin, encoded as the JSON array
/// `[source_path, destination_dir, {size, mtime, hash}]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RenderMessage(pub PathBuf, pub PathBuf, pub BookDescriptor);

/// One render request.
#[derive(Clone, Copy, Debug)]
pub struct RenderJob<'a> {
    pub book_path: &'a Path,
    /// Empty scratch directory the output must be written into.
    pub output_dir: &'a Path,
    pub descriptor: &'a BookDescriptor,
}

/// Turns a book into a directory of rendered files.
pub trait Renderer {
    /// Render `job.book_path` into `job.output_dir` and return the number of
    /// bytes written.
    fn render(&self, job: &RenderJob<'_>) -> Result<u64, CacheError>;
}

impl<F> Renderer for F
where
    F: Fn(&RenderJob<'_>) -> Result<u64, CacheError>,
{
    fn render(&self, job: &RenderJob<'_>) -> Result<u64, CacheError> {
        self(job)
    }
}

/// Runs an external renderer program once per job.
///
/// The program gets a [`RenderMessage`] on stdin; its stdout and stderr are
/// captured in a log file under `log_dir` that is deleted once the run is
/// over. A non-zero exit becomes [`CacheError::ConversionFailure`] carrying the
/// log.
#[derive(Clone, Debug)]
pub struct SubprocessRenderer {
    command: CommandSpec,
    log_dir: PathBuf,
    workers: Arc<WorkerRegistry>,
    options: RunOptions,
}

impl SubprocessRenderer {
    pub fn new(command: CommandSpec, log_dir: PathBuf, workers: Arc<WorkerRegistry>) -> Self {
        Self {
            command,
            log_dir,
            workers,
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }
}

impl Renderer for SubprocessRenderer {
    fn render(&self, job: &RenderJob<'_>) -> Result<u64, CacheError> {
        let message = RenderMessage(
            job.book_path.to_path_buf(),
            job.output_dir.to_path_buf(),
            job.descriptor.clone(),
        );
        let input = serde_json::to_vec(&message)?;

        safe_makedirs(&self.log_dir)?;
        // Removed on drop, whichever way this function returns.
        let log = tempfile::Builder::new()
            .prefix("render-")
            .suffix(".log")
            .tempfile_in(&self.log_dir)?;

        let exit = run_worker(
            &self.command,
            &input,
            log.as_file(),
            &self.workers,
            &self.options,
        )
        .map_err(|source| CacheError::SpawnRenderer {
            command: self.command.to_string(),
            source,
        })?;

        if exit.cancelled {
            return Err(CacheError::RenderCancelled {
                book_path: job.book_path.to_path_buf(),
            });
        }
        if !exit.success() {
            let log_text = match std::fs::read(log.path()) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(err) => format!("failed to read renderer log: {err}"),
            };
            tracing::warn!(
                target = "viewer.cache",
                book = %job.book_path.display(),
                command = %self.command,
                status = %exit.status,
                "renderer failed"
            );
            return Err(CacheError::ConversionFailure {
                book_path: job.book_path.to_path_buf(),
                log: log_text,
            });
        }

        Ok(dir_size_bytes_nofollow(job.output_dir))
    }
}
