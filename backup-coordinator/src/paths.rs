//! On-disk layout of the coordinator's state directory and archive naming.
//!
//! ```text
//! <data_root>/
//!   database, log                                 (catalog)
//!   data/backup_<unix_ts>_<node>_<b64(path)>[.N]  (archives)
//!   data/<archive>.WIP | .CORRECT | .SAME         (worker sentinels)
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, Utc};

use crate::sentinel::{sentinel_path, Sentinel};

pub const DATA_DIR: &str = "data";
pub const ARCHIVE_PREFIX: &str = "backup_";

pub fn catalog_dir(data_root: &Path) -> PathBuf {
    data_root.to_path_buf()
}

pub fn backup_root(data_root: &Path) -> PathBuf {
    data_root.join(DATA_DIR)
}

/// Padded URL-safe base64 (`-_` alphabet) of the path's UTF-8 bytes.
pub fn encode_remote_path(path: &str) -> String {
    URL_SAFE.encode(path.as_bytes())
}

pub fn decode_remote_path(encoded: &str) -> Option<String> {
    let bytes = URL_SAFE.decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

pub fn archive_name(timestamp: i64, node: &str, path: &str) -> String {
    format!(
        "{ARCHIVE_PREFIX}{timestamp}_{node}_{}",
        encode_remote_path(path)
    )
}

/// One reading of an archive file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveName {
    pub timestamp: i64,
    pub node: String,
    pub path: String,
}

/// Every `(node, path)` reading of `file_name`.
///
/// Node names and the base64 alphabet may both contain `_`, so a name can
/// split more than one way; callers pick the reading the catalog knows.
pub fn parse_archive_name(file_name: &str) -> Vec<ArchiveName> {
    let Some(rest) = file_name.strip_prefix(ARCHIVE_PREFIX) else {
        return Vec::new();
    };
    let Some((ts, rest)) = rest.split_once('_') else {
        return Vec::new();
    };
    if ts.is_empty() || !ts.bytes().all(|b| b.is_ascii_digit()) {
        return Vec::new();
    }
    let Ok(timestamp) = ts.parse::<i64>() else {
        return Vec::new();
    };

    // Optional `.N` counter; `.` never occurs in base64 output.
    let rest = match rest.rsplit_once('.') {
        Some((body, counter))
            if !counter.is_empty() && counter.bytes().all(|b| b.is_ascii_digit()) =>
        {
            body
        }
        _ => rest,
    };

    rest.match_indices('_')
        .filter_map(|(idx, _)| {
            let (node, encoded) = (&rest[..idx], &rest[idx + 1..]);
            if node.is_empty() || encoded.is_empty() {
                return None;
            }
            let path = decode_remote_path(encoded)?;
            Some(ArchiveName {
                timestamp,
                node: node.to_string(),
                path,
            })
        })
        .collect()
}

/// Hands out archive paths that are unique for the life of the process.
#[derive(Debug)]
pub struct ArchiveNamer {
    root: PathBuf,
    second: i64,
    issued: HashSet<PathBuf>,
}

impl ArchiveNamer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            second: i64::MIN,
            issued: HashSet::new(),
        }
    }

    /// `backup_<ts>_<node>_<b64>`, with a `.N` suffix when that name was
    /// already issued this second or something already sits on disk there.
    pub fn next(&mut self, now: DateTime<Utc>, node: &str, path: &str) -> PathBuf {
        let timestamp = now.timestamp();
        if timestamp != self.second {
            self.second = timestamp;
            self.issued.clear();
        }

        let base = archive_name(timestamp, node, path);
        let mut candidate = self.root.join(&base);
        let mut counter = 0u32;
        while self.issued.contains(&candidate) || occupied(&candidate) {
            counter += 1;
            candidate = self.root.join(format!("{base}.{counter}"));
        }
        self.issued.insert(candidate.clone());
        candidate
    }
}

fn occupied(write_path: &Path) -> bool {
    write_path.exists()
        || Sentinel::ALL
            .iter()
            .any(|sentinel| sentinel_path(write_path, *sentinel).exists())
}
