//! Node configuration
//!
//! Both node kinds read an optional TOML file; every field has a default so
//! a file only needs the keys it changes. Command-line flags are applied on
//! top (see `cli.rs`).

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::DEFAULT_PORT;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (host:port)
    pub bind: String,
    /// Sync root; created when missing
    pub root: PathBuf,
    /// Persist the registry between runs to skip rehashing unchanged files
    pub cache: bool,
    /// Outgoing messages buffered per connection before it counts as stalled
    pub queue_depth: usize,
    pub journal: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: format!("0.0.0.0:{DEFAULT_PORT}"),
            root: PathBuf::from("server_sync_folder"),
            cache: true,
            queue_depth: 256,
            journal: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address (host:port)
    pub server: String,
    pub root: PathBuf,
    /// Identity label used in logs; defaults to the host name
    pub name: Option<String>,
    /// Quiet period before a changed file is read
    pub settle_ms: u64,
    /// Minimum spacing between two uploads of the same path
    pub cooldown_ms: u64,
    pub queue_depth: usize,
    pub backoff: BackoffConfig,
    pub journal: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("localhost:{DEFAULT_PORT}"),
            root: PathBuf::from("client_sync_folder"),
            name: None,
            settle_ms: 100,
            cooldown_ms: 1000,
            queue_depth: 256,
            backoff: BackoffConfig::default(),
            journal: None,
        }
    }
}

impl ClientConfig {
    pub fn identity(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "treesync-client".to_string())
    }
}

/// Reconnect policy: exponential, capped, optionally bounded in attempts
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    /// Delay before reconnect attempt `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        let ms = self.initial_ms.saturating_mul(factor).min(self.max_ms);
        Duration::from_millis(ms)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// Read a TOML config file, or defaults when no file is given
pub fn load_file<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    match path {
        Some(p) => {
            let data = std::fs::read_to_string(p)
                .with_context(|| format!("read config {}", p.display()))?;
            toml::from_str(&data).with_context(|| format!("parse config {}", p.display()))
        }
        None => Ok(T::default()),
    }
}

/// Validate a sync root and return its canonical form. With `create`, a
/// missing root is created first.
pub fn prepare_root(root: &Path, create: bool) -> Result<PathBuf> {
    if !root.exists() {
        if create {
            std::fs::create_dir_all(root)
                .with_context(|| format!("create root {}", root.display()))?;
        } else {
            bail!("Root directory does not exist: {}", root.display());
        }
    }
    if !root.is_dir() {
        bail!("Root path is not a directory: {}", root.display());
    }
    std::fs::canonicalize(root)
        .with_context(|| format!("Failed to canonicalize root path: {}", root.display()))
}
