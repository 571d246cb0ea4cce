//! One backup attempt: pull an archive of `path` from a sidecar.
//!
//! The worker reports back only through sentinel files next to
//! `write_path`; its exit status is informational.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::OpenOptions;

use backup_core::digest::{same_digest, sha256_file};
use backup_wire::{BackupReply, BackupRequest, FrameTransport, WireError};

use crate::sentinel::{remove_if_exists, sentinel_path, touch, Sentinel};

/// Everything a worker needs; passed to worker processes as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerJob {
    pub node: String,
    pub address: String,
    pub port: u16,
    pub path: String,
    pub write_path: PathBuf,
    /// Checksum of the newest catalogued archive, or empty.
    #[serde(default)]
    pub previous_checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// New archive stored and verified (`.CORRECT`).
    Stored,
    /// Sidecar content matched the previous checksum (`.SAME`).
    Unchanged,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("sidecar refused to archive the path")]
    Rejected,

    #[error("{0}")]
    UnexpectedReply(String),

    #[error("checksum mismatch: sidecar sent {expected}, archive hashes to {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("hashing task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn io_err(path: &Path, source: std::io::Error) -> WorkerError {
    WorkerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Run the sidecar protocol for `job`, leaving sentinels behind.
pub async fn run(job: &WorkerJob) -> Result<WorkerExit, WorkerError> {
    let mut transport = FrameTransport::connect(&job.address, job.port).await?;
    let request = BackupRequest {
        path: job.path.clone(),
        checksum: job.previous_checksum.clone(),
    };
    transport
        .send_text(&serde_json::to_string(&request)?)
        .await?;

    let reply = transport.receive_text().await?;
    match reply.parse::<BackupReply>().map_err(WorkerError::UnexpectedReply)? {
        BackupReply::Same => {
            transport.abort();
            let marker = sentinel_path(&job.write_path, Sentinel::Same);
            touch(&marker).map_err(|e| io_err(&marker, e))?;
            return Ok(WorkerExit::Unchanged);
        }
        BackupReply::Abort => {
            transport.abort();
            return Err(WorkerError::Rejected);
        }
        BackupReply::Diff => {}
    }

    let wip = sentinel_path(&job.write_path, Sentinel::Wip);
    touch(&wip).map_err(|e| io_err(&wip, e))?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&job.write_path)
        .await
        .map_err(|e| io_err(&job.write_path, e))?;
    let received = transport.receive_file(&mut file).await?;
    file.sync_all()
        .await
        .map_err(|e| io_err(&job.write_path, e))?;
    drop(file);

    let expected = transport.receive_text().await?;
    transport.abort();

    let archive = job.write_path.clone();
    let actual = tokio::task::spawn_blocking(move || sha256_file(&archive))
        .await?
        .map_err(|e| io_err(&job.write_path, e))?;
    if !same_digest(&expected, &actual) {
        return Err(WorkerError::ChecksumMismatch {
            expected: expected.trim().to_string(),
            actual,
        });
    }

    let correct = sentinel_path(&job.write_path, Sentinel::Correct);
    touch(&correct).map_err(|e| io_err(&correct, e))?;
    remove_if_exists(&wip).map_err(|e| io_err(&wip, e))?;
    tracing::debug!(
        write_path = %job.write_path.display(),
        bytes = received,
        "archive verified",
    );
    Ok(WorkerExit::Stored)
}

/// Run `job`, log its outcome, and return the process exit code.
pub async fn execute(job: &WorkerJob) -> i32 {
    match run(job).await {
        Ok(exit) => {
            tracing::info!(
                node = %job.node,
                path = %job.path,
                write_path = %job.write_path.display(),
                outcome = ?exit,
                "worker finished",
            );
            0
        }
        Err(err) => {
            tracing::warn!(
                node = %job.node,
                path = %job.path,
                error = %err,
                "worker failed",
            );
            1
        }
    }
}
