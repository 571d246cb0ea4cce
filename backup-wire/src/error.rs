use std::net::SocketAddr;
use std::path::PathBuf;

use serde_json::Value;
use thiserror::Error;

/// Error surface for framing, message decoding and socket setup.
#[derive(Debug, Error)]
pub enum WireError {
    /// The peer went away before a header arrived, or reset the connection.
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("payload of {len} bytes does not fit the 8-digit frame header")]
    FrameTooLarge { len: u64 },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("socket error: {0}")]
    Socket(#[source] std::io::Error),

    #[error("failed to store received payload: {0}")]
    Sink(#[source] std::io::Error),

    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A control response whose status is not `OK`.
    #[error("server replied {message}: {data}")]
    Rejected { message: String, data: Value },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> WireError {
    WireError::Io {
        path: path.into(),
        source,
    }
}

/// Socket errors that mean the other side is gone map to `PeerClosed`.
pub(crate) fn socket_err(source: std::io::Error) -> WireError {
    use std::io::ErrorKind;
    match source.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
            WireError::PeerClosed
        }
        _ => WireError::Socket(source),
    }
}
