use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the scheduler, control server and runtime wiring.
///
/// Anything of this type escaping the scheduler loop is fatal: live workers
/// are terminated and the coordinator exits non-zero.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("catalog error: {0}")]
    Catalog(#[from] backup_core::CatalogError),

    #[error("wire error: {0}")]
    Wire(#[from] backup_wire::WireError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("failed to launch worker for {task}: {source}")]
    Launch {
        task: String,
        #[source]
        source: std::io::Error,
    },

    #[error("runtime error: {0}")]
    Runtime(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CoordinatorError {
    CoordinatorError::Io {
        path: path.into(),
        source,
    }
}
