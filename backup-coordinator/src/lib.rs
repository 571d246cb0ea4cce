//! Backup coordinator: scheduler loop, worker lifecycle, control server.
//!
//! Task layout inside one coordinator process:
//!
//! ```text
//!   control server ──ControlEnvelope──► scheduler ──launch──► workers
//!         ▲                                 │                   │
//!         └──────── oneshot reply ──────────┘      sentinel files (.WIP/.CORRECT/.SAME)
//! ```

pub mod command;
pub mod config;
pub mod control;
mod error;
pub mod launcher;
pub mod paths;
mod runtime;
pub mod scheduler;
pub mod sentinel;
pub mod worker;

pub use command::{Command, Dispatch, DispatchError};
pub use config::CoordinatorConfig;
pub use error::CoordinatorError;
pub use launcher::{InProcessLauncher, ProcessLauncher, WorkerHandle, WorkerLauncher};
pub use runtime::{init_tracing, run, run_until, run_worker_blocking, start_blocking};
pub use scheduler::{ControlEnvelope, ScheduledTask, Scheduler, SchedulerOptions};
pub use worker::{WorkerError, WorkerExit, WorkerJob};
