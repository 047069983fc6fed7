//! treesync - keeps a local directory in sync with a treesyncd server

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use treesync::cli::ClientOpts;
use treesync::logger::{init_tracing, open_journal};
use treesync::Client;

fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    init_tracing(opts.verbose);
    let cfg = opts.resolve()?;
    let journal = open_journal(cfg.journal.as_deref())?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        let client = Client::new(cfg, journal)?;
        info!(root = %client.root().display(), "treesync starting");
        tokio::select! {
            res = client.run() => res,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                Ok(())
            }
        }
    })
}
