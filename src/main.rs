use anyhow::Result;
use clap::Parser;
use rstc::config::Cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    rstc::client::download(cli.torrent, cli.output_dir, cli.port).await
}
