use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use torrentd_core::config::Configuration;
use torrentd_core::engine::TorrentEngine;
use torrentd_core::Metainfo;

/// Downloads a single torrent to completion, printing progress every few
/// seconds. Exits once every piece has verified and the store has switched
/// to seeding.
pub async fn invoke(
    torrent_path: impl AsRef<Path>,
    download_dir: PathBuf,
    session_file: PathBuf,
    port: u16,
) -> anyhow::Result<()> {
    let meta = Metainfo::from_file(&torrent_path).context("failed to parse torrent file")?;
    let name = meta.name.clone();

    let config = Configuration {
        download_dir,
        session_file,
        listen_port: port,
        ..Configuration::default()
    };
    let added_on = now_unix();
    let engine = TorrentEngine::new(meta, config, added_on, false)
        .context("failed to open piece store")?;

    engine.verify_existing().await.context("verify pass failed")?;
    engine.bootstrap().await.context("bootstrap failed")?;

    let engine = std::sync::Arc::new(engine);
    engine.start_retry_worker().await;
    let loop_engine = std::sync::Arc::clone(&engine);
    let loop_handle = tokio::spawn(async move { loop_engine.run().await });

    print_progress_until_done(std::sync::Arc::clone(&engine), &name).await;
    engine.shutdown().await;
    loop_handle.abort();
    Ok(())
}

async fn print_progress_until_done(engine: std::sync::Arc<TorrentEngine>, name: &str) {
    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    loop {
        ticker.tick().await;
        let completion = engine.completion_bitmap().await;
        let done = completion.iter().filter(|&&c| c).count();
        let total = completion.len();
        let downloaded = engine.downloaded_bytes().await;
        let peers = engine.peer_snapshots().await;
        println!(
            "{name}: {done}/{total} pieces, {downloaded} bytes downloaded, {} peers",
            peers.len()
        );
        if total > 0 && done == total {
            println!("{name}: download complete, now seeding");
            break;
        }
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
