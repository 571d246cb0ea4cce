//! Durable catalog of nodes, scheduled paths and backup histories.
//!
//! # Storage layout
//!
//! ```text
//! <dir>/
//!   database       (JSON snapshot of CatalogState, replaced atomically)
//!   database.tmp   (transient, only during a commit)
//!   log            (write-ahead log: one JSON record per line + COMMIT markers)
//! ```
//!
//! # Write protocol
//!
//! 1. Append `{"func": ..., "params": [...]}` to `log` and fsync.
//! 2. Apply the mutation to the in-memory state.
//! 3. Every `max_uncommitted` applied records: snapshot → `COMMIT` line → fsync.
//! 4. After a commit, once `log` holds `max_log_lines` lines it is truncated.
//!
//! On open, records after the last `COMMIT` are replayed on top of the
//! snapshot and committed immediately. Exactly one `DiskCatalog` may own a
//! directory at a time; nothing else touches these files.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{io_err, CatalogError};
use crate::types::{FinishedTask, NodeEntry, TaskSpec};

pub const SNAPSHOT_FILE: &str = "database";
pub const LOG_FILE: &str = "log";
pub const COMMIT_MARKER: &str = "COMMIT";

/// Applied records between two snapshots.
pub const MAX_UNCOMMITTED: usize = 200;
/// Log length (lines) at which a commit also truncates the log.
pub const MAX_LOG_LINES: usize = 4000;
/// Finished backups kept per `(node, path)`.
pub const HISTORY_LIMIT: usize = 10;

// ---------------------------------------------------------------------------
// 1. Options and state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogOptions {
    pub max_uncommitted: usize,
    pub max_log_lines: usize,
    pub history_limit: usize,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self {
            max_uncommitted: MAX_UNCOMMITTED,
            max_log_lines: MAX_LOG_LINES,
            history_limit: HISTORY_LIMIT,
        }
    }
}

/// The whole catalog as it lives in memory and in the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogState {
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeEntry>,
}

// ---------------------------------------------------------------------------
// 2. Log records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Mutation {
    RegisterNode {
        name: String,
        address: String,
        port: u16,
    },
    AddScheduledTask {
        name: String,
        path: String,
        frequency: u32,
    },
    DeleteScheduledTask {
        name: String,
        path: String,
    },
    DeleteNode {
        name: String,
    },
    RegisterFinishedTask {
        name: String,
        path: String,
        task: FinishedTask,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    func: String,
    params: Vec<Value>,
}

impl Mutation {
    fn to_record(&self) -> LogRecord {
        let (func, params) = match self {
            Mutation::RegisterNode {
                name,
                address,
                port,
            } => ("register_node", vec![json!(name), json!(address), json!(port)]),
            Mutation::AddScheduledTask {
                name,
                path,
                frequency,
            } => (
                "add_scheduled_task",
                vec![json!(name), json!(path), json!(frequency)],
            ),
            Mutation::DeleteScheduledTask { name, path } => {
                ("delete_scheduled_task", vec![json!(name), json!(path)])
            }
            Mutation::DeleteNode { name } => ("delete_node", vec![json!(name)]),
            Mutation::RegisterFinishedTask { name, path, task } => (
                "register_finished_task",
                vec![json!(name), json!(path), task.to_value()],
            ),
        };
        LogRecord {
            func: func.to_string(),
            params,
        }
    }

    fn from_record(record: LogRecord) -> Result<Self, String> {
        let params = Value::Array(record.params);
        let bad = |err: serde_json::Error| format!("bad params for '{}': {err}", record.func);
        let mutation = match record.func.as_str() {
            "register_node" => {
                let (name, address, port): (String, String, u16) =
                    serde_json::from_value(params).map_err(bad)?;
                Mutation::RegisterNode {
                    name,
                    address,
                    port,
                }
            }
            "add_scheduled_task" => {
                let (name, path, frequency): (String, String, u32) =
                    serde_json::from_value(params).map_err(bad)?;
                Mutation::AddScheduledTask {
                    name,
                    path,
                    frequency,
                }
            }
            "delete_scheduled_task" => {
                let (name, path): (String, String) =
                    serde_json::from_value(params).map_err(bad)?;
                Mutation::DeleteScheduledTask { name, path }
            }
            "delete_node" => {
                let (name,): (String,) = serde_json::from_value(params).map_err(bad)?;
                Mutation::DeleteNode { name }
            }
            "register_finished_task" => {
                let (name, path, task): (String, String, FinishedTask) =
                    serde_json::from_value(params).map_err(bad)?;
                Mutation::RegisterFinishedTask { name, path, task }
            }
            other => return Err(format!("unknown operation '{other}'")),
        };
        Ok(mutation)
    }
}

/// Apply one mutation. Returns history entries evicted by the cap.
fn apply(
    state: &mut CatalogState,
    mutation: Mutation,
    history_limit: usize,
) -> Result<Vec<FinishedTask>, CatalogError> {
    match mutation {
        Mutation::RegisterNode {
            name,
            address,
            port,
        } => {
            let node = state
                .nodes
                .entry(name)
                .or_insert_with(|| NodeEntry::new(address.clone(), port));
            node.address = address;
            node.port = port;
        }
        Mutation::AddScheduledTask {
            name,
            path,
            frequency,
        } => {
            let node = state
                .nodes
                .get_mut(&name)
                .ok_or_else(|| CatalogError::UnknownNode(name.clone()))?;
            match node.tasks.iter_mut().find(|task| task.path == path) {
                Some(task) => task.frequency = frequency,
                None => node.tasks.push(TaskSpec { path, frequency }),
            }
        }
        Mutation::DeleteScheduledTask { name, path } => {
            if let Some(node) = state.nodes.get_mut(&name) {
                node.tasks.retain(|task| task.path != path);
            }
        }
        Mutation::DeleteNode { name } => {
            state.nodes.remove(&name);
        }
        Mutation::RegisterFinishedTask { name, path, task } => {
            let node = state
                .nodes
                .get_mut(&name)
                .ok_or_else(|| CatalogError::UnknownNode(name.clone()))?;
            if !node.is_scheduled(&path) {
                return Err(CatalogError::UnknownTask { node: name, path });
            }
            let history = node.history.entry(path).or_default();
            if history.contains(&task) {
                return Ok(Vec::new());
            }
            history.insert(0, task);
            if history.len() > history_limit {
                return Ok(history.split_off(history_limit));
            }
        }
    }
    Ok(Vec::new())
}

// ---------------------------------------------------------------------------
// 3. DiskCatalog
// ---------------------------------------------------------------------------

/// Write-ahead-logged catalog rooted at one directory.
#[derive(Debug)]
pub struct DiskCatalog {
    dir: PathBuf,
    options: CatalogOptions,
    state: CatalogState,
    log: File,
    log_lines: usize,
    uncommitted: usize,
}

impl DiskCatalog {
    /// Open (or create) the catalog in `dir` with default limits.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        Self::open_with(dir, CatalogOptions::default())
    }

    /// Open (or create) the catalog in `dir`, recovering from the log.
    pub fn open_with(dir: impl Into<PathBuf>, options: CatalogOptions) -> Result<Self, CatalogError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

        let state = load_snapshot(&dir.join(SNAPSHOT_FILE))?;
        let log_path = dir.join(LOG_FILE);
        let scan = scan_log(&log_path)?;

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| io_err(&log_path, e))?;
        if scan.torn_tail {
            log.set_len(scan.valid_len)
                .map_err(|e| io_err(&log_path, e))?;
        }

        let mut catalog = Self {
            dir,
            options,
            state,
            log,
            log_lines: scan.lines,
            uncommitted: 0,
        };

        let replayed = scan.pending.len();
        for mutation in scan.pending {
            match apply(&mut catalog.state, mutation, options.history_limit) {
                Ok(_) => {}
                Err(err) if err.is_unknown_node() => {
                    tracing::debug!(error = %err, "skipping replayed record");
                }
                Err(err) => return Err(err),
            }
        }

        if replayed > 0 {
            tracing::info!(records = replayed, "replayed write-ahead log");
            catalog.commit()?;
        } else if catalog.log_lines >= options.max_log_lines {
            catalog.truncate_log()?;
        }
        Ok(catalog)
    }

    // -- mutations ----------------------------------------------------------

    /// Upsert a node, keeping its tasks and history.
    pub fn register_node(&mut self, name: &str, address: &str, port: u16) -> Result<(), CatalogError> {
        self.write(Mutation::RegisterNode {
            name: name.to_string(),
            address: address.to_string(),
            port,
        })
        .map(|_| ())
    }

    /// Schedule `path` on `name`, overriding the frequency if already scheduled.
    pub fn add_scheduled_task(
        &mut self,
        name: &str,
        path: &str,
        frequency: u32,
    ) -> Result<(), CatalogError> {
        if !self.state.nodes.contains_key(name) {
            return Err(CatalogError::UnknownNode(name.to_string()));
        }
        self.write(Mutation::AddScheduledTask {
            name: name.to_string(),
            path: path.to_string(),
            frequency,
        })
        .map(|_| ())
    }

    /// Stop backing up `path`. History is kept. No error if absent.
    pub fn delete_scheduled_task(&mut self, name: &str, path: &str) -> Result<(), CatalogError> {
        self.write(Mutation::DeleteScheduledTask {
            name: name.to_string(),
            path: path.to_string(),
        })
        .map(|_| ())
    }

    /// Remove a node with its tasks and histories. No error if absent.
    pub fn delete_node(&mut self, name: &str) -> Result<(), CatalogError> {
        self.write(Mutation::DeleteNode {
            name: name.to_string(),
        })
        .map(|_| ())
    }

    /// Record a finished backup as the most recent entry of `(name, path)`.
    ///
    /// Fails with `UnknownNode`/`UnknownTask` unless `path` is currently
    /// scheduled on `name`. An entry equal to one already in the history is
    /// not inserted again. Returns the entries pushed out by the history cap.
    pub fn register_finished_task(
        &mut self,
        name: &str,
        path: &str,
        task: FinishedTask,
    ) -> Result<Vec<FinishedTask>, CatalogError> {
        let node = self
            .state
            .nodes
            .get(name)
            .ok_or_else(|| CatalogError::UnknownNode(name.to_string()))?;
        if !node.is_scheduled(path) {
            return Err(CatalogError::UnknownTask {
                node: name.to_string(),
                path: path.to_string(),
            });
        }
        self.write(Mutation::RegisterFinishedTask {
            name: name.to_string(),
            path: path.to_string(),
            task,
        })
    }

    // -- queries ------------------------------------------------------------

    pub fn node_names(&self) -> BTreeSet<String> {
        self.state.nodes.keys().cloned().collect()
    }

    pub fn node_address(&self, name: &str) -> Result<(String, u16), CatalogError> {
        self.state
            .nodes
            .get(name)
            .map(|node| (node.address.clone(), node.port))
            .ok_or_else(|| CatalogError::UnknownNode(name.to_string()))
    }

    /// Scheduled paths of `name`; empty for an unknown node.
    pub fn tasks_for_node(&self, name: &str) -> Vec<TaskSpec> {
        self.state
            .nodes
            .get(name)
            .map(|node| node.tasks.clone())
            .unwrap_or_default()
    }

    /// History of `(name, path)`, most recent first; empty if unknown.
    pub fn node_finished_tasks(&self, name: &str, path: &str) -> Vec<FinishedTask> {
        self.state
            .nodes
            .get(name)
            .and_then(|node| node.history.get(path))
            .cloned()
            .unwrap_or_default()
    }

    /// Every archive path referenced by any history.
    pub fn result_paths(&self) -> BTreeSet<PathBuf> {
        self.state
            .nodes
            .values()
            .flat_map(|node| node.history.values())
            .flatten()
            .map(|task| task.result_path.clone())
            .collect()
    }

    pub fn state(&self) -> &CatalogState {
        &self.state
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// Lines currently in the log file.
    pub fn log_lines(&self) -> usize {
        self.log_lines
    }

    // -- durability ---------------------------------------------------------

    /// Snapshot the state, mark the log committed, and truncate the log if
    /// it has grown past `max_log_lines`.
    pub fn commit(&mut self) -> Result<(), CatalogError> {
        write_snapshot(&self.dir, &self.state)?;
        self.append_line(COMMIT_MARKER)?;
        self.uncommitted = 0;
        if self.log_lines >= self.options.max_log_lines {
            self.truncate_log()?;
        }
        Ok(())
    }

    fn write(&mut self, mutation: Mutation) -> Result<Vec<FinishedTask>, CatalogError> {
        let line = serde_json::to_string(&mutation.to_record())?;
        self.append_line(&line)?;
        let evicted = apply(&mut self.state, mutation, self.options.history_limit)?;
        self.uncommitted += 1;
        if self.uncommitted >= self.options.max_uncommitted {
            self.commit()?;
        }
        Ok(evicted)
    }

    fn append_line(&mut self, line: &str) -> Result<(), CatalogError> {
        let path = self.log_path();
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        self.log
            .write_all(buf.as_bytes())
            .map_err(|e| io_err(&path, e))?;
        self.log.sync_data().map_err(|e| io_err(&path, e))?;
        self.log_lines += 1;
        Ok(())
    }

    fn truncate_log(&mut self) -> Result<(), CatalogError> {
        let path = self.log_path();
        self.log.set_len(0).map_err(|e| io_err(&path, e))?;
        self.log.sync_all().map_err(|e| io_err(&path, e))?;
        tracing::debug!(lines = self.log_lines, "write-ahead log truncated");
        self.log_lines = 0;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 4. Snapshot and log files
// ---------------------------------------------------------------------------

fn load_snapshot(path: &Path) -> Result<CatalogState, CatalogError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(CatalogState::default()),
        Err(err) => return Err(io_err(path, err)),
    };
    serde_json::from_str(&contents).map_err(|source| CatalogError::Snapshot {
        path: path.to_path_buf(),
        source,
    })
}

/// Write `<dir>/database.tmp`, fsync, rename over `<dir>/database`.
fn write_snapshot(dir: &Path, state: &CatalogState) -> Result<(), CatalogError> {
    let path = dir.join(SNAPSHOT_FILE);
    let tmp = dir.join(format!("{SNAPSHOT_FILE}.tmp"));
    let bytes = serde_json::to_vec(state)?;

    let mut file = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
    file.write_all(&bytes).map_err(|e| io_err(&tmp, e))?;
    file.sync_all().map_err(|e| io_err(&tmp, e))?;
    drop(file);

    if let Err(err) = fs::rename(&tmp, &path) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(&path, err));
    }
    sync_dir(dir)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), CatalogError> {
    File::open(dir)
        .and_then(|handle| handle.sync_all())
        .map_err(|e| io_err(dir, e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), CatalogError> {
    Ok(())
}

enum LogLine {
    Blank,
    Commit,
    Record(Mutation),
}

fn parse_line(text: &str) -> Result<LogLine, String> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(LogLine::Blank);
    }
    if text == COMMIT_MARKER {
        return Ok(LogLine::Commit);
    }
    let record: LogRecord = serde_json::from_str(text).map_err(|e| e.to_string())?;
    Mutation::from_record(record).map(LogLine::Record)
}

#[derive(Default)]
struct LogScan {
    /// Records after the most recent `COMMIT`.
    pending: Vec<Mutation>,
    /// Newline-terminated lines.
    lines: usize,
    /// Byte length of the terminated prefix.
    valid_len: u64,
    torn_tail: bool,
}

fn scan_log(path: &Path) -> Result<LogScan, CatalogError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(LogScan::default()),
        Err(err) => return Err(io_err(path, err)),
    };

    let mut scan = LogScan::default();
    let segments: Vec<&[u8]> = bytes.split(|byte| *byte == b'\n').collect();
    let last = segments.len().saturating_sub(1);

    for (index, raw) in segments.into_iter().enumerate() {
        if index == last {
            // Bytes after the final newline: a record whose append never finished.
            if !raw.is_empty() {
                tracing::warn!(
                    path = %path.display(),
                    bytes = raw.len(),
                    "discarding torn write-ahead log tail",
                );
                scan.torn_tail = true;
            }
            break;
        }

        let text = String::from_utf8_lossy(raw);
        match parse_line(&text) {
            Ok(LogLine::Blank) => {}
            Ok(LogLine::Commit) => scan.pending.clear(),
            Ok(LogLine::Record(mutation)) => scan.pending.push(mutation),
            Err(reason) => {
                return Err(CatalogError::CorruptLog {
                    path: path.to_path_buf(),
                    line: index + 1,
                    reason,
                })
            }
        }
        scan.lines += 1;
        scan.valid_len += raw.len() as u64 + 1;
    }
    Ok(scan)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
