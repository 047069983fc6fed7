//! Command-line options for treesyncd and treesync

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use crate::config::{load_file, ClientConfig, ServerConfig};

/// Daemon options; flags override the config file
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "treesync server - holds the canonical copy of a directory tree")]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Root directory to serve
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Do not read or write the registry cache
    #[arg(long)]
    pub no_cache: bool,

    /// Append transfer events to this file
    #[arg(long)]
    pub journal: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl DaemonOpts {
    pub fn resolve(&self) -> Result<ServerConfig> {
        let mut cfg: ServerConfig = load_file(self.config.as_deref())?;
        if let Some(bind) = &self.bind {
            cfg.bind = bind.clone();
        }
        if let Some(root) = &self.root {
            cfg.root = root.clone();
        }
        if self.no_cache {
            cfg.cache = false;
        }
        if self.journal.is_some() {
            cfg.journal = self.journal.clone();
        }
        Ok(cfg)
    }
}

/// Client options; flags override the config file
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "treesync client - keeps a local directory in sync with a treesyncd server")]
pub struct ClientOpts {
    /// Server address (host:port)
    #[arg(long)]
    pub server: Option<String>,

    /// Local directory to keep in sync
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Identity label for logs (defaults to the host name)
    #[arg(long)]
    pub name: Option<String>,

    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Append transfer events to this file
    #[arg(long)]
    pub journal: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl ClientOpts {
    pub fn resolve(&self) -> Result<ClientConfig> {
        let mut cfg: ClientConfig = load_file(self.config.as_deref())?;
        if let Some(server) = &self.server {
            cfg.server = server.clone();
        }
        if let Some(root) = &self.root {
            cfg.root = root.clone();
        }
        if self.name.is_some() {
            cfg.name = self.name.clone();
        }
        if self.journal.is_some() {
            cfg.journal = self.journal.clone();
        }
        Ok(cfg)
    }
}
