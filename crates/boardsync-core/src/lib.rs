pub mod cli;
pub mod commands;
pub mod config;
pub mod counter;
pub mod error;
pub mod events;
pub mod gateway;
pub mod loader;
pub mod model;
pub mod provision;
pub mod session;
pub mod store;
pub mod subscription;

use std::ffi::OsString;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};

pub use error::{SyncError, SyncResult};
pub use session::{Session, SessionOptions};

#[tracing::instrument(skip_all)]
pub fn run(raw_args: Vec<OsString>) -> anyhow::Result<()> {
    let cli = cli::GlobalCli::parse_from(raw_args);

    cli::init_tracing(cli.verbose, cli.quiet)?;

    info!(
        verbose = cli.verbose,
        quiet = cli.quiet,
        offline = cli.offline,
        "starting boardsync"
    );

    let mut cfg = config::Config::load(cli.config.as_deref())?;
    cfg.apply_overrides(cli.overrides.into_iter().map(|kv| (kv.key, kv.value)))?;
    debug!(files = ?cfg.loaded_files, "config ready");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let mut out = std::io::stdout().lock();
    runtime.block_on(commands::dispatch(&cfg, cli.offline, cli.command, &mut out))?;

    info!("done");
    Ok(())
}
