//! Verified whole-file transfers
//!
//! Received content is written to a temp file beside its target, checked
//! against the declared record, and renamed into place. Readers see either
//! the old file or the complete new one, never a partial write.

use crate::error::TransferError;
use crate::protocol::{MAX_CONTENT_SIZE, RESERVED_PREFIX};
use crate::protocol_core::{ensure_parent_exists, normalize_under_root};
use crate::registry::{hash_bytes, record_for_bytes, FileRecord, ModTime};
use anyhow::{Context, Result};
use std::io::Write as _;
use std::path::{Component, Path};
use tracing::{debug, warn};

const TEMP_PREFIX: &str = ".treesync-";
const TEMP_SUFFIX: &str = ".tmp";

/// Canonical wire form of an already-validated path (`./a//b` -> `a/b`)
pub fn clean_wire_path(wire: &str) -> String {
    Path::new(wire)
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Commit `content` for `path` under `root`, verifying it against `record`.
///
/// Returns the record as published. On any error the target is untouched
/// and no temp file is left behind.
pub fn write_atomic(
    root: &Path,
    path: &str,
    content: &[u8],
    record: &FileRecord,
) -> std::result::Result<FileRecord, TransferError> {
    let target = normalize_under_root(root, path).map_err(|e| TransferError::InvalidPath {
        path: path.to_string(),
        reason: e.to_string(),
    })?;

    if content.len() as u64 != record.size {
        return Err(TransferError::SizeMismatch {
            path: path.to_string(),
            declared: record.size,
            received: content.len() as u64,
        });
    }
    let computed = hash_bytes(content);
    if computed != record.content_hash {
        return Err(TransferError::HashMismatch {
            path: path.to_string(),
            declared: record.content_hash.clone(),
            computed,
        });
    }

    ensure_parent_exists(&target)?;
    let dir = target.parent().unwrap_or(root);
    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)?;
    tmp.write_all(content)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;

    let on_disk = tmp.as_file().metadata()?.len();
    if on_disk != record.size {
        return Err(TransferError::WrittenSizeMismatch {
            path: path.to_string(),
            declared: record.size,
            on_disk,
        });
    }

    filetime::set_file_mtime(tmp.path(), record.modified_time.to_file_time())?;
    tmp.persist(&target).map_err(|e| TransferError::Io(e.error))?;

    Ok(FileRecord {
        relative_path: clean_wire_path(path),
        content_hash: computed,
        modified_time: record.modified_time,
        size: on_disk,
    })
}

/// Read `path` under `root` in one pass and build its record from the same
/// bytes. `None` when the file does not exist (or is not a regular file).
pub fn read_for_send(root: &Path, path: &str) -> Result<Option<(Vec<u8>, FileRecord)>> {
    let target = normalize_under_root(root, path)?;
    let md = match std::fs::metadata(&target) {
        Ok(md) if md.is_file() => md,
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("stat {}", target.display())),
    };
    check_sendable(path, md.len())?;
    let data = match std::fs::read(&target) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read {}", target.display())),
    };
    // The file may have grown between stat and read
    check_sendable(path, data.len() as u64)?;
    let record = record_for_bytes(&clean_wire_path(path), &data, ModTime::from_metadata(&md));
    Ok(Some((data, record)))
}

/// Reject content that cannot fit in one content frame
pub fn check_sendable(path: &str, size: u64) -> std::result::Result<(), TransferError> {
    if size > MAX_CONTENT_SIZE as u64 {
        return Err(TransferError::TooLarge {
            path: path.to_string(),
            size,
            max: MAX_CONTENT_SIZE as u64,
        });
    }
    Ok(())
}

/// Remove temp files left behind by an interrupted transfer
pub fn sweep_temp_files(root: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || e.file_type().is_file()
                || !e.file_name().to_string_lossy().starts_with(RESERVED_PREFIX)
        })
        .filter_map(|e| e.ok())
    {
        let name = entry.file_name().to_string_lossy();
        if entry.file_type().is_file() && name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX) {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!(path = %entry.path().display(), "removed stale temp file");
                    removed += 1;
                }
                Err(e) => warn!(path = %entry.path().display(), error = %e, "cannot remove stale temp file"),
            }
        }
    }
    Ok(removed)
}
