//! Helpers for running renderer workers as child processes.
//!
//! A worker receives a single message on stdin and everything it prints
//! (stdout and stderr) lands in a log file owned by the caller, so a failed
//! conversion can be reported with the worker's own output.
//!
//! Running workers are tracked in a [`WorkerRegistry`]. The owner of a registry
//! can terminate every worker that is still alive when it shuts down, which
//! keeps long conversions from outliving the process that asked for them.

use std::{
    collections::HashMap,
    fmt,
    fs::File,
    io::{self, Write},
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread,
    time::{Duration, Instant},
};

pub use tokio_util::sync::CancellationToken;

/// Options controlling how a worker is supervised.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Optional cancellation token. When cancelled, the worker's process tree is
    /// terminated and `cancelled` is set on the result.
    pub cancellation: Option<CancellationToken>,
    /// How long to wait after sending a graceful termination signal before
    /// force-killing the process tree.
    pub kill_grace: Duration,
    /// How often the worker is polled for exit.
    pub poll_interval: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cancellation: None,
            kill_grace: Duration::from_millis(250),
            poll_interval: Duration::from_millis(20),
        }
    }
}

/// A full command invocation (optional cwd + program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub cwd: Option<PathBuf>,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            cwd: None,
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Human-readable only; not a round-trippable shell snippet.
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.contains(' ') || arg.contains('\t') {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// How a worker finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub status: ExitStatus,
    /// Set when the worker was stopped through [`RunOptions::cancellation`].
    pub cancelled: bool,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        !self.cancelled && self.status.success()
    }
}

/// Tracks running workers so they can be terminated together.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    next_id: AtomicU64,
    workers: Mutex<HashMap<u64, Arc<Mutex<Child>>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `child` and track it until the returned [`Worker`] is dropped.
    pub fn register(self: &Arc<Self>, child: Child) -> Worker {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();
        let child = Arc::new(Mutex::new(child));
        lock(&self.workers).insert(id, child.clone());
        tracing::debug!(target = "viewer.process", pid, "registered worker");
        Worker {
            id,
            pid,
            child,
            registry: self.clone(),
        }
    }

    /// Number of workers currently registered.
    pub fn len(&self) -> usize {
        lock(&self.workers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Terminate every registered worker that is still running.
    ///
    /// Returns the number of workers that had to be terminated.
    pub fn kill_all(&self, grace: Duration) -> usize {
        let workers: Vec<_> = lock(&self.workers).drain().collect();
        let mut killed = 0;
        for (_, child) in workers {
            let mut child = lock(&child);
            match child.try_wait() {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(
                        target = "viewer.process",
                        pid = child.id(),
                        error = %err,
                        "failed to poll worker before termination"
                    );
                }
            }
            let pid = child.id();
            match terminate_process_tree(&mut child, grace) {
                Ok(status) => {
                    killed += 1;
                    tracing::debug!(target = "viewer.process", pid, %status, "terminated worker");
                }
                Err(err) => {
                    tracing::warn!(
                        target = "viewer.process",
                        pid,
                        error = %err,
                        "failed to terminate worker"
                    );
                }
            }
        }
        killed
    }
}

/// A running child process tracked by a [`WorkerRegistry`].
#[derive(Debug)]
pub struct Worker {
    id: u64,
    pid: u32,
    child: Arc<Mutex<Child>>,
    registry: Arc<WorkerRegistry>,
}

impl Worker {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn try_wait(&self) -> io::Result<Option<ExitStatus>> {
        lock(&self.child).try_wait()
    }

    /// Terminate the worker's process tree, waiting up to `grace` for a clean exit.
    pub fn terminate(&self, grace: Duration) -> io::Result<ExitStatus> {
        let mut child = lock(&self.child);
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        terminate_process_tree(&mut child, grace)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        lock(&self.registry.workers).remove(&self.id);
    }
}

/// Spawn `command`, write `input` to its stdin, and wait for it to exit.
///
/// Stdout and stderr are both appended to `log`. The worker is registered in
/// `registry` for as long as it runs.
pub fn run_worker(
    command: &CommandSpec,
    input: &[u8],
    log: &File,
    registry: &Arc<WorkerRegistry>,
    opts: &RunOptions,
) -> io::Result<WorkerExit> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log.try_clone()?));
    if let Some(cwd) = &command.cwd {
        cmd.current_dir(cwd);
    }

    // Own process group on Unix so termination reaches grandchildren too.
    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;

        cmd.pre_exec(|| {
            // SAFETY: `setpgid` is async-signal-safe and does not allocate.
            // This is executed after `fork` in the child process.
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;
    let stdin = child.stdin.take();
    let worker = registry.register(child);

    if let Some(mut stdin) = stdin {
        match stdin.write_all(input).and_then(|()| stdin.flush()) {
            Ok(()) => {}
            // The worker may exit without reading its input; its exit status tells the story.
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                tracing::debug!(
                    target = "viewer.process",
                    pid = worker.pid(),
                    "worker closed stdin before reading its input"
                );
            }
            Err(err) => {
                let _ = worker.terminate(opts.kill_grace);
                return Err(err);
            }
        }
    }

    loop {
        if let Some(status) = worker.try_wait()? {
            tracing::debug!(
                target = "viewer.process",
                pid = worker.pid(),
                %status,
                "worker exited"
            );
            return Ok(WorkerExit {
                status,
                cancelled: false,
            });
        }

        if let Some(token) = opts.cancellation.as_ref() {
            if token.is_cancelled() {
                let status = worker.terminate(opts.kill_grace)?;
                return Ok(WorkerExit {
                    status,
                    cancelled: true,
                });
            }
        }

        thread::sleep(opts.poll_interval);
    }
}

fn terminate_process_tree(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        let pid = child.id() as i32;
        // Negative pid targets the process group set up in `pre_exec`.
        unsafe {
            let _ = libc::kill(-pid, libc::SIGTERM);
        }

        let start = Instant::now();
        while start.elapsed() < grace {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            thread::sleep(Duration::from_millis(25));
        }

        unsafe {
            let _ = libc::kill(-pid, libc::SIGKILL);
        }
        child.wait()
    }

    #[cfg(windows)]
    {
        let _ = grace;
        // `Child::kill()` only reaches the immediate process; `taskkill /T` takes the tree.
        let pid = child.id().to_string();
        let _ = Command::new("taskkill")
            .args(["/PID", &pid, "/T", "/F"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        let _ = child.kill();
        child.wait()
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = grace;
        let _ = child.kill();
        child.wait()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
