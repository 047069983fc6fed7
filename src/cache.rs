//! Persisted registry cache
//!
//! Lets a restarting node skip rehashing files whose size and mtime are
//! unchanged. The cache is advisory: a missing or unreadable file just means
//! a full scan.

use crate::protocol::CACHE_DIR;
use crate::registry::Registry;
use anyhow::{Context, Result};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::debug;

const CACHE_FILE: &str = "registry.bin";

pub fn cache_path(root: &Path) -> PathBuf {
    root.join(CACHE_DIR).join(CACHE_FILE)
}

/// Load the cached registry for `root`, if one is readable
pub fn load(root: &Path) -> Option<Registry> {
    let path = cache_path(root);
    let data = match std::fs::read(&path) {
        Ok(d) => d,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "no registry cache");
            return None;
        }
    };
    match bincode::deserialize::<Registry>(&data) {
        Ok(registry) => Some(registry),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "discarding unreadable registry cache");
            None
        }
    }
}

/// Atomically replace the cached registry for `root`
pub fn store(root: &Path, registry: &Registry) -> Result<()> {
    let path = cache_path(root);
    let dir = root.join(CACHE_DIR);
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let data = bincode::serialize(registry).context("serialize registry cache")?;
    // atomic write
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(&data)?;
    tmp.flush()?;
    tmp.persist(&path)
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::scan;
    use tempfile::TempDir;

    #[test]
    fn store_then_load() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a"), b"one").unwrap();
        std::fs::create_dir_all(tmp.path().join("d")).unwrap();
        std::fs::write(tmp.path().join("d/b"), b"two").unwrap();
        let registry = scan(tmp.path()).unwrap();

        store(tmp.path(), &registry).unwrap();
        assert_eq!(load(tmp.path()), Some(registry));
    }

    #[test]
    fn cache_is_not_scanned() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a"), b"one").unwrap();
        store(tmp.path(), &scan(tmp.path()).unwrap()).unwrap();
        assert_eq!(scan(tmp.path()).unwrap().len(), 1);
    }

    #[test]
    fn missing_or_corrupt_cache_is_none() {
        let tmp = TempDir::new().unwrap();
        assert!(load(tmp.path()).is_none());

        std::fs::create_dir_all(tmp.path().join(CACHE_DIR)).unwrap();
        std::fs::write(cache_path(tmp.path()), b"\xff\xff\xff\xff\xff\xff\xff\xff\xff").unwrap();
        assert!(load(tmp.path()).is_none());
    }
}
