use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber used by both binaries. `RUST_LOG` wins over
/// the verbosity flag.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Append-only journal of transfers, separate from diagnostic logging
pub trait SyncLogger: Send + Sync {
    fn connected(&self, _peer: &str) {}
    fn disconnected(&self, _peer: &str, _reason: &str) {}
    fn sent(&self, _path: &str, _peer: &str, _bytes: u64) {}
    fn received(&self, _path: &str, _peer: &str, _bytes: u64) {}
    fn rejected(&self, _path: &str, _peer: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl SyncLogger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl SyncLogger for TextLogger {
    fn connected(&self, peer: &str) {
        self.line(&format!("CONNECT peer={peer}"));
    }
    fn disconnected(&self, peer: &str, reason: &str) {
        self.line(&format!("DISCONNECT peer={peer} reason={reason}"));
    }
    fn sent(&self, path: &str, peer: &str, bytes: u64) {
        self.line(&format!("SEND path={path} peer={peer} bytes={bytes}"));
    }
    fn received(&self, path: &str, peer: &str, bytes: u64) {
        self.line(&format!("RECV path={path} peer={peer} bytes={bytes}"));
    }
    fn rejected(&self, path: &str, peer: &str, msg: &str) {
        self.line(&format!("REJECT path={path} peer={peer} msg={msg}"));
    }
}

/// Journal selected by a `--journal` flag; no file means no journal
pub fn open_journal(path: Option<&Path>) -> Result<std::sync::Arc<dyn SyncLogger>> {
    Ok(match path {
        Some(p) => std::sync::Arc::new(TextLogger::new(p)?),
        None => std::sync::Arc::new(NoopLogger),
    })
}
