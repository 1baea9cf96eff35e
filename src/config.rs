//! CLI configuration surface.
use clap::Parser;
use std::path::PathBuf;

/// A single-torrent BitTorrent leech client.
#[derive(Debug, Parser)]
#[command(name = "rstc", version, about)]
pub struct Cli {
    /// Path to the `.torrent` metainfo file to download.
    pub torrent: PathBuf,

    /// Directory the downloaded files are written into.
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Local TCP port advertised to the tracker.
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// Log level passed to `tracing_subscriber`'s `EnvFilter`.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
