use anyhow::{Context, Result};
use clap::Parser;
use tracing::warn;

use treesync::cli::DaemonOpts;
use treesync::logger::{init_tracing, open_journal};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    init_tracing(opts.verbose);
    let cfg = opts.resolve()?;

    // The protocol has no authentication or encryption
    if cfg.bind.starts_with("0.0.0.0") {
        warn!(bind = %cfg.bind, "listening on all interfaces; only use on trusted networks");
    }

    let journal = open_journal(cfg.journal.as_deref())?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(treesync::server::serve(cfg, journal))
}
