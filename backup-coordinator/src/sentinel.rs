//! Sentinel files: the only channel from a worker back to the scheduler.
//!
//! A worker writing `<archive>` leaves zero-byte markers next to it:
//!
//! | marker      | written when                          |
//! |-------------|---------------------------------------|
//! | `.WIP`      | download started                      |
//! | `.CORRECT`  | download finished and checksum agreed |
//! | `.SAME`     | sidecar reported unchanged content    |
//!
//! The scheduler only reads markers after the worker has exited, so the
//! outcome depends on nothing but `(alive, markers present)`.

use std::fs::{self, File};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sentinel {
    Wip,
    Correct,
    Same,
}

impl Sentinel {
    pub const ALL: [Sentinel; 3] = [Sentinel::Wip, Sentinel::Correct, Sentinel::Same];

    pub fn suffix(self) -> &'static str {
        match self {
            Sentinel::Wip => ".WIP",
            Sentinel::Correct => ".CORRECT",
            Sentinel::Same => ".SAME",
        }
    }
}

/// `<write_path><suffix>`.
pub fn sentinel_path(write_path: &Path, sentinel: Sentinel) -> PathBuf {
    let mut name = write_path.as_os_str().to_owned();
    name.push(sentinel.suffix());
    PathBuf::from(name)
}

/// True if `path` names a sentinel rather than an archive.
pub fn is_sentinel(path: &Path) -> bool {
    let name = path.to_string_lossy();
    Sentinel::ALL
        .iter()
        .any(|sentinel| name.ends_with(sentinel.suffix()))
}

/// Which markers exist next to one archive path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SentinelProbe {
    pub wip: bool,
    pub correct: bool,
    pub same: bool,
}

impl SentinelProbe {
    pub fn scan(write_path: &Path) -> Self {
        Self {
            wip: sentinel_path(write_path, Sentinel::Wip).exists(),
            correct: sentinel_path(write_path, Sentinel::Correct).exists(),
            same: sentinel_path(write_path, Sentinel::Same).exists(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    InProgress,
    /// Fresh archive verified; it lives at the write path.
    Committed,
    /// Sidecar content unchanged; no archive body was written.
    Deduplicated,
    Failed,
}

pub fn classify(alive: bool, probe: SentinelProbe) -> WorkerOutcome {
    if alive {
        WorkerOutcome::InProgress
    } else if probe.correct {
        WorkerOutcome::Committed
    } else if probe.same {
        WorkerOutcome::Deduplicated
    } else {
        WorkerOutcome::Failed
    }
}

/// Create (or truncate) an empty marker file.
pub fn touch(path: &Path) -> io::Result<()> {
    File::create(path).map(|_| ())
}

/// Remove `path`; a missing file is not an error. Returns whether it existed.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
