//! Command-line interface definitions.
//!
//! Flags given here override the settings file.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "streamplay", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// Settings file (TOML)
    #[arg(long, short, default_value = "streamplay.toml")]
    pub config: PathBuf,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Discard audio instead of opening an output device
    #[arg(long)]
    pub null_output: bool,

    /// Initial volume in percent (0-100)
    #[arg(long)]
    pub volume: Option<u8>,

    /// Keep the output rate fixed and resample tracks to it
    #[arg(long)]
    pub resample: bool,

    /// Do not send playback progress reports
    #[arg(long)]
    pub no_report: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Queue the tracks of a JSON playlist and start playing
    Play {
        /// JSON array of tracks
        playlist: PathBuf,

        /// Start with shuffle enabled
        #[arg(long)]
        shuffle: bool,
    },
}
