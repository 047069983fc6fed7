//! File records, registries, and reconciliation
//!
//! A [`Registry`] is a point-in-time snapshot of a sync root: one
//! [`FileRecord`] per regular file, keyed by its wire path.

use crate::protocol_core::wire_path;
use crate::protocol::{MAX_CONTENT_SIZE, RESERVED_PREFIX};
use anyhow::{Context, Result};
use filetime::FileTime;
use rayon::prelude::*;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::btree_map::{self, BTreeMap};
use std::fs::{File, Metadata};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Modification time with nanosecond precision since the Unix epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModTime {
    pub secs: i64,
    pub nanos: u32,
}

impl ModTime {
    pub fn from_metadata(md: &Metadata) -> Self {
        FileTime::from_last_modification_time(md).into()
    }

    pub fn to_file_time(self) -> FileTime {
        FileTime::from_unix_time(self.secs, self.nanos)
    }
}

impl From<FileTime> for ModTime {
    fn from(ft: FileTime) -> Self {
        Self {
            secs: ft.unix_seconds(),
            nanos: ft.nanoseconds(),
        }
    }
}

/// Snapshot of one file: identity is `relative_path`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub relative_path: String,
    pub content_hash: String,
    pub modified_time: ModTime,
    pub size: u64,
}

/// Map of wire path to record for every file under a sync root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Registry {
    records: BTreeMap<String, FileRecord>,
}

// Keys come off the wire, so each must name its own record
impl<'de> Deserialize<'de> for Registry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let records = BTreeMap::<String, FileRecord>::deserialize(deserializer)?;
        if let Some((key, record)) = records.iter().find(|(k, r)| **k != r.relative_path) {
            return Err(D::Error::custom(format!(
                "registry key {key:?} holds a record for {:?}",
                record.relative_path
            )));
        }
        Ok(Self { records })
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.records.get(path)
    }

    pub fn hash_of(&self, path: &str) -> Option<&str> {
        self.records.get(path).map(|r| r.content_hash.as_str())
    }

    /// Insert or replace the record for `record.relative_path`
    pub fn insert(&mut self, record: FileRecord) -> Option<FileRecord> {
        self.records.insert(record.relative_path.clone(), record)
    }

    pub fn remove(&mut self, path: &str) -> Option<FileRecord> {
        self.records.remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.records.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> btree_map::Values<'_, String, FileRecord> {
        self.records.values()
    }

    pub fn total_bytes(&self) -> u64 {
        self.records.values().map(|r| r.size).sum()
    }
}

impl FromIterator<FileRecord> for Registry {
    fn from_iter<I: IntoIterator<Item = FileRecord>>(iter: I) -> Self {
        let mut registry = Registry::new();
        for record in iter {
            registry.insert(record);
        }
        registry
    }
}

/// Hex BLAKE3 digest of a buffer
pub fn hash_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Hex BLAKE3 digest of a file, streamed in 64KB chunks
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut file = File::open(path)?;

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Build a record from bytes already in memory so record and content agree
pub fn record_for_bytes(relative_path: &str, data: &[u8], modified: ModTime) -> FileRecord {
    FileRecord {
        relative_path: relative_path.to_string(),
        content_hash: hash_bytes(data),
        modified_time: modified,
        size: data.len() as u64,
    }
}

/// Full recursive scan of `root`
pub fn scan(root: &Path) -> Result<Registry> {
    scan_with_previous(root, &Registry::new())
}

/// Scan `root`, reusing hashes from `previous` for files whose size and
/// mtime are unchanged
pub fn scan_with_previous(root: &Path, previous: &Registry) -> Result<Registry> {
    use walkdir::WalkDir;

    let mut candidates: Vec<(String, PathBuf, u64, ModTime)> = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0 || !e.file_name().to_string_lossy().starts_with(RESERVED_PREFIX)
        })
    {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = wire_path(root, entry.path()) else {
            continue;
        };
        // Skip entries that vanish between readdir and stat
        let Ok(md) = entry.metadata() else {
            continue;
        };
        if md.len() > MAX_CONTENT_SIZE as u64 {
            warn!(path = %rel, size = md.len(), "skipping file too large to transfer");
            continue;
        }
        candidates.push((rel, entry.into_path(), md.len(), ModTime::from_metadata(&md)));
    }

    let records: Vec<FileRecord> = candidates
        .into_par_iter()
        .filter_map(|(rel, path, size, modified)| {
            if let Some(prev) = previous.get(&rel) {
                if prev.size == size && prev.modified_time == modified {
                    return Some(prev.clone());
                }
            }
            let content_hash = hash_file(&path).ok()?;
            Some(FileRecord {
                relative_path: rel,
                content_hash,
                modified_time: modified,
                size,
            })
        })
        .collect();

    Ok(records.into_iter().collect())
}

/// Outcome of reconciling a local registry against a remote one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    pub to_download: Vec<String>,
    pub to_upload: Vec<String>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.to_download.is_empty() && self.to_upload.is_empty()
    }
}

/// Decide which paths move in which direction.
///
/// Paths missing on one side always move toward it. Paths with differing
/// hashes go up only when the local copy is strictly newer, otherwise
/// down, so no path ever lands in both lists.
pub fn diff(local: &Registry, remote: &Registry) -> Diff {
    let mut out = Diff::default();

    for remote_rec in remote.iter() {
        match local.get(&remote_rec.relative_path) {
            None => out.to_download.push(remote_rec.relative_path.clone()),
            Some(local_rec) if local_rec.content_hash != remote_rec.content_hash => {
                if local_rec.modified_time > remote_rec.modified_time {
                    out.to_upload.push(remote_rec.relative_path.clone());
                } else {
                    out.to_download.push(remote_rec.relative_path.clone());
                }
            }
            Some(_) => {}
        }
    }

    for local_rec in local.iter() {
        if !remote.contains(&local_rec.relative_path) {
            out.to_upload.push(local_rec.relative_path.clone());
        }
    }

    out.to_download.sort();
    out.to_upload.sort();
    out
}
