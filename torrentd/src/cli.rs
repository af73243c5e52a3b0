use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(clap::Parser)]
#[command(version, about, long_about = None)]
pub(crate) struct Cli {
    /// Directory new torrents download into.
    #[arg(long, env = "TORRENTD_DOWNLOAD_DIR", default_value = ".")]
    pub(crate) download_dir: PathBuf,

    /// Session file listing previously added torrents.
    #[arg(long, env = "TORRENTD_SESSION_FILE", default_value = "session.json")]
    pub(crate) session_file: PathBuf,

    /// TCP port this client listens on for incoming peer connections.
    #[arg(long, env = "TORRENTD_PORT", default_value_t = 6881)]
    pub(crate) port: u16,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(clap::Subcommand)]
#[clap(rename_all = "snake_case")]
pub(crate) enum Command {
    /// Print the metainfo fields of a torrent file.
    Info { torrent_path: PathBuf },
    /// Query the torrent's trackers and print the discovered peer list.
    Peers { torrent_path: PathBuf },
    /// Perform a handshake with a single peer and print its peer id.
    Handshake {
        torrent_path: PathBuf,
        peer_address: SocketAddr,
    },
    /// Download a torrent to completion, printing periodic progress.
    Download { torrent_path: PathBuf },
}
