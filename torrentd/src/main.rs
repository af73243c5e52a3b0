use anyhow::Context;
use clap::Parser;

use crate::cli::*;

mod cli;
mod commands;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Cli::parse();

    match args.command {
        Command::Info { torrent_path } => {
            commands::info::invoke(torrent_path).context("failed to read torrent info")?;
        }
        Command::Peers { torrent_path } => {
            commands::peers::search(torrent_path, args.port)
                .await
                .context("failed to fetch peers")?;
        }
        Command::Handshake {
            torrent_path,
            peer_address,
        } => {
            commands::peers::handshake(torrent_path, peer_address)
                .await
                .context("handshake failed")?;
        }
        Command::Download { torrent_path } => {
            commands::download::invoke(torrent_path, args.download_dir, args.session_file, args.port)
                .await
                .context("download failed")?;
        }
    }
    Ok(())
}
