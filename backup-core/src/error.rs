//! Error types for backup-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The node is not registered.
    #[error("unknown node '{0}'")]
    UnknownNode(String),

    /// The node exists but `path` is not currently scheduled on it.
    #[error("unknown node task '{node}:{path}'")]
    UnknownTask { node: String, path: String },

    /// Underlying I/O failure, annotated with the file involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The snapshot file exists but does not decode.
    #[error("failed to parse catalog snapshot at {path}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A log record that is not the torn tail failed to decode.
    #[error("corrupt write-ahead log at {path}, line {line}: {reason}")]
    CorruptLog {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CatalogError {
    /// True for both "no such node" and "no such scheduled path".
    /// WAL replay skips these; the dispatcher reports them to clients.
    pub fn is_unknown_node(&self) -> bool {
        matches!(
            self,
            CatalogError::UnknownNode(_) | CatalogError::UnknownTask { .. }
        )
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CatalogError {
    CatalogError::Io {
        path: path.into(),
        source,
    }
}
