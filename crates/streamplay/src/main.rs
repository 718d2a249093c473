//! streamplay: plays a queue of tracks streamed from a media server.
//!
//! Reads settings from a TOML file, queues an optional JSON playlist and accepts
//! transport commands on stdin (`toggle`, `next`, `vol 40`, `queue`, `quit`, ...).

use anyhow::Result;
use clap::Parser;
use streamplay::{cli, config::Settings, runtime};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,streamplay=info")),
        )
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    let settings = Settings::load(&args.config)?;
    runtime::run(settings, &args)
}
