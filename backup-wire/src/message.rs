//! Message shapes carried inside frames.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const STATUS_OK: &str = "OK";
pub const STATUS_ERROR: &str = "ERROR";
pub const STATUS_ABORT: &str = "ABORT";

// ---------------------------------------------------------------------------
// Control protocol
// ---------------------------------------------------------------------------

/// `{"command": "...", "args": {...}}`, nothing more.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlRequest {
    pub command: String,
    pub args: Map<String, Value>,
}

impl ControlRequest {
    pub fn new(command: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// `{"message": status, "data": any}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl ControlResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            message: STATUS_OK.to_string(),
            data,
        }
    }

    /// Reply to a request that could not be parsed.
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            message: STATUS_ERROR.to_string(),
            data: Value::String(reason.into()),
        }
    }

    /// Reply sent when the scheduler is gone.
    pub fn abort() -> Self {
        Self {
            message: STATUS_ABORT.to_string(),
            data: Value::Null,
        }
    }

    /// Reply to a command the dispatcher refused.
    pub fn failure(reason: impl fmt::Display) -> Self {
        Self {
            message: format!("Error {reason}"),
            data: Value::Null,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.message == STATUS_OK
    }
}

// ---------------------------------------------------------------------------
// Sidecar protocol
// ---------------------------------------------------------------------------

/// Sent by a worker: which path to archive and the checksum it already holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRequest {
    pub path: String,
    /// Empty when no previous backup exists.
    #[serde(default)]
    pub checksum: String,
}

/// The sidecar's one-word verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupReply {
    /// Archive hashes to the checksum the worker sent.
    Same,
    /// The sidecar could not produce an archive.
    Abort,
    /// A fresh archive and its checksum follow.
    Diff,
}

impl BackupReply {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupReply::Same => "SAME",
            BackupReply::Abort => "ABORT",
            BackupReply::Diff => "DIFF",
        }
    }
}

impl fmt::Display for BackupReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupReply {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SAME" => Ok(BackupReply::Same),
            "ABORT" => Ok(BackupReply::Abort),
            "DIFF" => Ok(BackupReply::Diff),
            other => Err(format!("unexpected sidecar reply {other:?}")),
        }
    }
}
