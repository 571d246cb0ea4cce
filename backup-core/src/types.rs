//! Domain types for the backup catalog.
//!
//! All path fields that point at the coordinator's own filesystem use
//! `PathBuf`; remote paths stay `String` since they name locations on
//! another machine.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Identifies one backup target: a path on a registered node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub node: String,
    pub path: String,
}

impl TaskKey {
    pub fn new(node: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.path)
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// A path scheduled for periodic backup on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub path: String,
    /// Minimum minutes between two backups of `path`.
    pub frequency: u32,
}

/// A committed backup: one archive on the coordinator's disk.
///
/// Serializes to `{result_path, kb_size, timestamp, checksum}` with an
/// RFC 3339 UTC timestamp, which is the shape `query_backups` returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedTask {
    pub result_path: PathBuf,
    pub kb_size: f64,
    pub timestamp: DateTime<Utc>,
    /// Hex SHA-256 of the archive at `result_path`.
    pub checksum: String,
}

impl FinishedTask {
    pub fn new(
        result_path: impl Into<PathBuf>,
        kb_size: f64,
        timestamp: DateTime<Utc>,
        checksum: impl Into<String>,
    ) -> Self {
        Self {
            result_path: result_path.into(),
            kb_size,
            timestamp,
            checksum: checksum.into(),
        }
    }

    /// JSON object form used on the control channel.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "result_path": self.result_path.display().to_string(),
            "kb_size": self.kb_size,
            "timestamp": self.timestamp.to_rfc3339(),
            "checksum": self.checksum,
        })
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Everything the catalog knows about one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub address: String,
    pub port: u16,
    /// Scheduled paths in insertion order.
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    /// Per-path backup history, most recent first.
    ///
    /// Survives removal of the scheduled task so old backups stay queryable.
    #[serde(default)]
    pub history: BTreeMap<String, Vec<FinishedTask>>,
}

impl NodeEntry {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            tasks: Vec::new(),
            history: BTreeMap::new(),
        }
    }

    pub fn is_scheduled(&self, path: &str) -> bool {
        self.tasks.iter().any(|task| task.path == path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
