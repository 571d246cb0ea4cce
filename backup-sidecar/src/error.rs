use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("nothing to archive at {0}")]
    MissingSource(PathBuf),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("wire error: {0}")]
    Wire(#[from] backup_wire::WireError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("archive task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("runtime error: {0}")]
    Runtime(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SidecarError {
    SidecarError::Io {
        path: path.into(),
        source,
    }
}
