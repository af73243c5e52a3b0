use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::Context;

use torrentd_core::engine::generate_peer_id;
use torrentd_core::peer::connection;
use torrentd_core::tracker::manager::TrackerManager;
use torrentd_core::tracker::{AnnounceParams, Event};
use torrentd_core::Metainfo;

/// Announces to every tracker tier for `path` and prints the discovered,
/// deduplicated peer list.
pub async fn search(path: impl AsRef<Path>, port: u16) -> anyhow::Result<()> {
    let meta = Metainfo::from_file(&path).context("failed to parse torrent file")?;
    let peer_id = generate_peer_id("-PC0001-");
    let mut tracker_manager = TrackerManager::new(&meta);

    let params = AnnounceParams {
        info_hash: &meta.info_hash,
        peer_id: &peer_id,
        port,
        uploaded: 0,
        downloaded: 0,
        left: meta.total_length,
        event: Event::Started,
    };
    let (addrs, interval) = tracker_manager.get_all_peers(&params).await;

    let stdout = std::io::stdout();
    let mut stdout = stdout.lock();
    for addr in &addrs {
        writeln!(stdout, "{addr}")?;
    }
    writeln!(
        stdout,
        "-- {} peers, next announce in {}s",
        addrs.len(),
        interval.as_secs()
    )?;
    Ok(())
}

/// Performs a bare handshake with a single peer and prints its remote peer
/// id in hex.
pub async fn handshake(path: impl AsRef<Path>, address: SocketAddr) -> anyhow::Result<()> {
    let meta = Metainfo::from_file(&path).context("failed to parse torrent file")?;
    let local_peer_id = generate_peer_id("-PC0001-");

    let conn = connection::connect(
        address,
        &meta.info_hash,
        &local_peer_id,
        meta.num_pieces(),
        std::time::Duration::from_secs(1),
    )
    .await
    .context("handshake failed")?;

    let stdout = std::io::stdout();
    let mut stdout = stdout.lock();
    writeln!(stdout, "Peer ID: {}", hex::encode(conn.remote_peer_id))?;
    Ok(())
}
