//! Deterministic `tar.gz` snapshots of a file or directory tree.
//!
//! Entries are written in sorted order with normalized headers and a zero
//! gzip mtime, so unchanged content always yields identical bytes and the
//! archive checksum can stand in for a content checksum.

use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use flate2::{Compression, GzBuilder};
use tar::{Builder, HeaderMode};

use backup_core::digest::sha256_file;

use crate::error::{io_err, SidecarError};

/// A finished archive on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub path: PathBuf,
    /// Hex SHA-256 of the archive bytes.
    pub checksum: String,
    pub size: u64,
}

/// Archive `source` into `destination`, rooted at the source's base name.
pub fn build(source: &Path, destination: &Path) -> Result<Archive, SidecarError> {
    match fs::symlink_metadata(source) {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(SidecarError::MissingSource(source.to_path_buf()));
        }
        Err(err) => return Err(io_err(source, err)),
    }

    let file = File::create(destination).map_err(|e| io_err(destination, e))?;
    let encoder = GzBuilder::new()
        .mtime(0)
        .write(file, Compression::default());
    let mut builder = Builder::new(encoder);
    builder.mode(HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    append_tree(&mut builder, source, &root_name(source))?;

    let file = builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(|e| io_err(destination, e))?;
    file.sync_all().map_err(|e| io_err(destination, e))?;
    drop(file);

    let size = fs::metadata(destination)
        .map_err(|e| io_err(destination, e))?
        .len();
    let checksum = sha256_file(destination).map_err(|e| io_err(destination, e))?;
    tracing::debug!(
        source = %source.display(),
        archive = %destination.display(),
        size,
        "archive built",
    );
    Ok(Archive {
        path: destination.to_path_buf(),
        checksum,
        size,
    })
}

fn root_name(source: &Path) -> PathBuf {
    source
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn append_tree<W: Write>(
    builder: &mut Builder<W>,
    path: &Path,
    name: &Path,
) -> Result<(), SidecarError> {
    let kind = fs::symlink_metadata(path)
        .map_err(|e| io_err(path, e))?
        .file_type();

    if kind.is_dir() {
        builder
            .append_path_with_name(path, name)
            .map_err(|e| io_err(path, e))?;
        let mut children = fs::read_dir(path)
            .map_err(|e| io_err(path, e))?
            .map(|entry| entry.map(|entry| entry.file_name()))
            .collect::<io::Result<Vec<_>>>()
            .map_err(|e| io_err(path, e))?;
        children.sort();
        for child in children {
            append_tree(builder, &path.join(&child), &name.join(&child))?;
        }
    } else if kind.is_file() || kind.is_symlink() {
        builder
            .append_path_with_name(path, name)
            .map_err(|e| io_err(path, e))?;
    } else {
        tracing::debug!(path = %path.display(), "skipping special file");
    }
    Ok(())
}
