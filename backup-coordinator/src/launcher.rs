//! How the scheduler starts workers and watches them die.

use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::worker::{self, WorkerJob};

/// Starts one worker per job.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, job: &WorkerJob) -> io::Result<Box<dyn WorkerHandle>>;
}

/// A running worker as seen by the scheduler: poll it, or kill it.
pub trait WorkerHandle: Send {
    /// Non-blocking liveness check.
    fn is_alive(&mut self) -> bool;

    /// Ask the worker to stop; it may still look alive for a moment.
    fn terminate(&mut self);
}

// ---------------------------------------------------------------------------
// Worker processes
// ---------------------------------------------------------------------------

/// Re-executes a binary as `<program> worker --job <json>`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Launch workers from the binary that is currently running.
    pub fn current_exe() -> io::Result<Self> {
        std::env::current_exe().map(Self::new)
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, job: &WorkerJob) -> io::Result<Box<dyn WorkerHandle>> {
        let payload = serde_json::to_string(job).map_err(io::Error::other)?;
        let child = Command::new(&self.program)
            .arg("worker")
            .arg("--job")
            .arg(payload)
            .stdin(Stdio::null())
            .spawn()?;
        tracing::debug!(pid = child.id(), write_path = %job.write_path.display(), "worker process spawned");
        Ok(Box::new(ProcessHandle { child }))
    }
}

struct ProcessHandle {
    child: Child,
}

impl WorkerHandle for ProcessHandle {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self) {
        if let Err(err) = self.child.kill() {
            tracing::debug!(pid = self.child.id(), error = %err, "worker kill failed");
        }
    }
}

// ---------------------------------------------------------------------------
// In-process workers
// ---------------------------------------------------------------------------

/// Runs workers as tasks on a tokio runtime instead of child processes.
#[derive(Debug, Clone)]
pub struct InProcessLauncher {
    runtime: Handle,
}

impl InProcessLauncher {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Use the runtime of the calling task. Panics outside a runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl WorkerLauncher for InProcessLauncher {
    fn launch(&self, job: &WorkerJob) -> io::Result<Box<dyn WorkerHandle>> {
        let job = job.clone();
        let task = self.runtime.spawn(async move {
            worker::execute(&job).await;
        });
        Ok(Box::new(TaskHandle { task }))
    }
}

struct TaskHandle {
    task: JoinHandle<()>,
}

impl WorkerHandle for TaskHandle {
    fn is_alive(&mut self) -> bool {
        !self.task.is_finished()
    }

    fn terminate(&mut self) {
        self.task.abort();
    }
}
