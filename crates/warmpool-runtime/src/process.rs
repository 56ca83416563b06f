//! ProcessWorker: a pooled worker backed by an OS child process.
//!
//! The process is launched with piped stdin/stdout. When the config names a
//! ready marker, construction blocks until the engine prints a line
//! containing it, so a worker only reaches the ready queue once it can
//! actually take commands. The wait is bounded by `startup_timeout`; an
//! engine that stays silent past it is killed.

use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;
use warmpool_core::{ProcessConfig, now_millis};

use crate::error::{PoolError, PoolResult};
use crate::worker::{Worker, WorkerFactory};

/// How long `close()` waits for the engine to exit on stdin EOF.
const CLOSE_GRACE: Duration = Duration::from_millis(100);
const CLOSE_POLL: Duration = Duration::from_millis(10);

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// The child's stdio, handed to the leasing caller.
pub struct WorkerStdio {
    pub stdin: ChildStdin,
    pub stdout: BufReader<ChildStdout>,
}

pub struct ProcessWorker {
    id: u64,
    pid: u32,
    created_at: u64,
    /// 0 while the worker has never been leased.
    activated_at: AtomicU64,
    idle_timeout_ms: u64,
    lease_timeout_ms: u64,
    child: Mutex<Option<Child>>,
    stdio: Mutex<Option<WorkerStdio>>,
}

impl ProcessWorker {
    /// Process-unique worker id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// OS process id of the child.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// When the worker became ready (ms since the Unix epoch).
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Take the child's stdin/stdout. Returns `None` after the first call
    /// or once the worker has been terminated.
    pub fn take_stdio(&self) -> Option<WorkerStdio> {
        lock(&self.stdio).take()
    }

    pub fn is_terminated(&self) -> bool {
        lock(&self.child).is_none()
    }
}

impl Worker for ProcessWorker {
    fn activate(&self) {
        self.activated_at.store(now_millis(), Ordering::Relaxed);
    }

    fn kill(&self) {
        let Some(mut child) = lock(&self.child).take() else {
            return;
        };
        lock(&self.stdio).take();
        let _ = child.kill();
        let _ = child.wait();
        debug!(worker = self.id, pid = self.pid, "worker killed");
    }

    fn close(&self) {
        let Some(mut child) = lock(&self.child).take() else {
            return;
        };
        // Dropping stdin lets the engine see EOF and exit on its own.
        lock(&self.stdio).take();

        let deadline = Instant::now() + CLOSE_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(worker = self.id, pid = self.pid, %status, "worker exited on close");
                    return;
                }
                Ok(None) if Instant::now() < deadline => std::thread::sleep(CLOSE_POLL),
                _ => break,
            }
        }

        let _ = child.kill();
        let _ = child.wait();
        debug!(worker = self.id, pid = self.pid, "worker terminated on close");
    }

    fn is_overdue(&self, now_ms: u64) -> bool {
        match self.activated_at.load(Ordering::Relaxed) {
            0 => now_ms >= self.created_at.saturating_add(self.idle_timeout_ms),
            activated => now_ms >= activated.saturating_add(self.lease_timeout_ms),
        }
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Launches [`ProcessWorker`]s from a [`ProcessConfig`].
#[derive(Debug, Clone)]
pub struct ProcessFactory {
    config: ProcessConfig,
}

impl ProcessFactory {
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }
}

impl WorkerFactory for ProcessFactory {
    type Worker = ProcessWorker;

    fn create(&self) -> PoolResult<ProcessWorker> {
        let config = &self.config;
        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| PoolError::Launch {
            program: config.program.clone(),
            source,
        })?;
        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(BufReader::new);

        // Owning the child from here on means any early return kills it.
        let mut worker = ProcessWorker {
            id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
            pid,
            created_at: 0,
            activated_at: AtomicU64::new(0),
            idle_timeout_ms: config.idle_timeout.as_millis() as u64,
            lease_timeout_ms: config.lease_timeout.as_millis() as u64,
            child: Mutex::new(Some(child)),
            stdio: Mutex::new(None),
        };

        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            return Err(PoolError::Io(std::io::Error::other(
                "worker stdio was not captured",
            )));
        };

        // Dropping `worker` on a timeout kills the child, which also ends
        // the reader thread.
        let stdout = match &config.ready_marker {
            Some(marker) => wait_for_marker(stdout, marker, config.startup_timeout)?,
            None => stdout,
        };

        worker.created_at = now_millis();
        *lock(&worker.stdio) = Some(WorkerStdio { stdin, stdout });
        debug!(worker = worker.id, pid, program = %config.program, "worker process ready");
        Ok(worker)
    }
}

/// Scan stdout for `marker` on a helper thread, giving up after `timeout`.
/// Hands the reader back positioned just past the marker line.
fn wait_for_marker(
    stdout: BufReader<ChildStdout>,
    marker: &str,
    timeout: Duration,
) -> PoolResult<BufReader<ChildStdout>> {
    let (tx, rx) = mpsc::sync_channel(1);
    let wanted = marker.to_string();
    std::thread::Builder::new()
        .name("warmpool-ready-marker".to_string())
        .spawn(move || {
            let mut stdout = stdout;
            let result = scan_for_marker(&mut stdout, &wanted).map(|()| stdout);
            let _ = tx.send(result);
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            debug!(marker, timeout_ms = timeout.as_millis() as u64, "ready marker timed out");
            Err(PoolError::StartupTimeout {
                marker: marker.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
        Err(RecvTimeoutError::Disconnected) => Err(PoolError::Io(std::io::Error::other(
            "ready marker reader exited without a result",
        ))),
    }
}

fn scan_for_marker(stdout: &mut BufReader<ChildStdout>, marker: &str) -> PoolResult<()> {
    let mut line = String::new();
    loop {
        line.clear();
        if stdout.read_line(&mut line)? == 0 {
            return Err(PoolError::StartupExited {
                marker: marker.to_string(),
            });
        }
        if line.contains(marker) {
            return Ok(());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
