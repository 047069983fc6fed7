//! Path and frame helpers shared by the server and the client
//!
//! Wire paths are root-relative and always use `/` as separator. These
//! helpers convert between wire paths and filesystem paths and keep every
//! incoming path under its sync root.

use crate::error::CodecError;
use crate::protocol::RESERVED_PREFIX;
use anyhow::{anyhow, bail, Result};
use std::path::{Component, Path, PathBuf};

/// Normalize a wire path to be safely under a root directory.
/// This prevents path traversal attacks by:
/// 1. Rejecting absolute paths, parent directory components, and root/prefix components
/// 2. Rejecting NUL bytes and empty paths
/// 3. Rejecting reserved `.treesync*` components
/// 4. Canonicalizing the deepest existing ancestor to resolve symlinks
/// 5. Ensuring the result is under the root
pub fn normalize_under_root(root: &Path, wire: &str) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if wire.contains('\0') {
        bail!("path contains NUL byte");
    }

    let mut safe = PathBuf::new();
    for component in Path::new(wire).components() {
        match component {
            CurDir => {}
            Normal(s) => {
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    bail!("path component contains colon (potential ADS attack)");
                }
                if s.to_string_lossy().starts_with(RESERVED_PREFIX) {
                    bail!("path names a reserved entry");
                }
                safe.push(s);
            }
            ParentDir | RootDir | Prefix(_) => {
                bail!("path contains disallowed component: {:?}", component);
            }
        }
    }
    if safe.as_os_str().is_empty() {
        bail!("path is empty");
    }

    let canon_root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    let joined = canon_root.join(&safe);

    // For existing paths, canonicalize to resolve symlinks
    // For new files, canonicalize parent then append filename
    let final_path = if joined.exists() {
        joined
            .canonicalize()
            .map_err(|e| anyhow!("failed to canonicalize {:?}: {}", joined, e))?
    } else if let Some(parent) = joined.parent().filter(|p| p.exists()) {
        let canonical_parent = parent
            .canonicalize()
            .map_err(|e| anyhow!("failed to canonicalize parent {:?}: {}", parent, e))?;
        match joined.file_name() {
            Some(name) => canonical_parent.join(name),
            None => canonical_parent,
        }
    } else {
        joined
    };

    if !final_path.starts_with(&canon_root) {
        bail!("path {:?} escapes root {:?}", wire, canon_root);
    }

    Ok(final_path)
}

/// Convert a path under `root` into its wire form (`/`-separated, relative).
/// Returns `None` for paths outside the root, the root itself, and reserved
/// entries.
pub fn wire_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(s) => {
                let s = s.to_str()?;
                if s.starts_with(RESERVED_PREFIX) {
                    return None;
                }
                parts.push(s);
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Validate a declared frame length against the limit for its frame kind
pub fn validate_frame_size(size: usize, max: usize) -> std::result::Result<(), CodecError> {
    if size > max {
        return Err(CodecError::FrameTooLarge { len: size, max });
    }
    Ok(())
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir_exists(parent)?;
    }
    Ok(())
}
