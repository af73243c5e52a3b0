//! Explicit registry of running torrents, replacing the process-wide
//! mutable list an external control surface would otherwise reach into
//! directly. All session-file I/O is routed through here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::Configuration;
use crate::engine::TorrentEngine;
use crate::error::InvalidMetainfo;
use crate::metainfo::Metainfo;
use crate::session::{self, SessionRecord};

pub struct TorrentRegistry {
    session_path: PathBuf,
    entries: HashMap<[u8; 20], RegistryEntry>,
}

struct RegistryEntry {
    engine: Arc<TorrentEngine>,
    run_task: JoinHandle<()>,
    torrent_path: PathBuf,
    download_dir: PathBuf,
}

impl TorrentRegistry {
    pub fn new(session_path: PathBuf) -> Self {
        TorrentRegistry {
            session_path,
            entries: HashMap::new(),
        }
    }

    /// Reloads the session file and starts an engine for every record.
    /// `is_finished` records skip the verify pass (it's already done);
    /// `paused` records start with scheduling suspended.
    pub async fn reload(&mut self, config: &Configuration) -> Result<(), InvalidMetainfo> {
        let records = session::load(&self.session_path)?;
        for record in records {
            let meta = Metainfo::from_file(&record.torrent_path)?;
            let mut per_torrent_config = Configuration {
                download_dir: record.download_dir.clone(),
                ..Configuration::default()
            };
            per_torrent_config.listen_port = config.listen_port;
            per_torrent_config.session_file = config.session_file.clone();

            self.add_internal(
                meta,
                record.torrent_path,
                per_torrent_config,
                record.added_on,
                record.is_finished,
                record.paused,
            )
            .await;
        }
        Ok(())
    }

    /// Adds a new torrent: constructs its engine, runs the verify pass
    /// unless `already_finished`, and spawns the event loop.
    pub async fn add(
        &mut self,
        torrent_path: PathBuf,
        config: Configuration,
        added_on: i64,
    ) -> Result<[u8; 20], anyhow::Error> {
        let meta = Metainfo::from_file(&torrent_path)?;
        let info_hash = self.add_internal(meta, torrent_path, config, added_on, false, false).await;
        self.persist().await?;
        Ok(info_hash)
    }

    async fn add_internal(
        &mut self,
        meta: Metainfo,
        torrent_path: PathBuf,
        config: Configuration,
        added_on: i64,
        already_finished: bool,
        start_paused: bool,
    ) -> [u8; 20] {
        let info_hash = meta.info_hash;
        let download_dir = config.download_dir.clone();
        let engine = match TorrentEngine::new(meta, config, added_on, already_finished) {
            Ok(e) => Arc::new(e),
            Err(e) => {
                tracing::warn!(error = %e, "failed to open piece store for torrent");
                return info_hash;
            }
        };

        if !already_finished {
            if let Err(e) = engine.verify_existing().await {
                tracing::warn!(error = %e, "verify pass failed");
            }
        }
        if start_paused {
            engine.pause();
        } else {
            if let Err(e) = engine.bootstrap().await {
                tracing::warn!(error = %e, "bootstrap failed");
            }
            engine.start_retry_worker().await;
        }

        let run_engine = Arc::clone(&engine);
        let run_task = tokio::spawn(async move {
            run_engine.run().await;
        });

        self.entries.insert(
            info_hash,
            RegistryEntry {
                engine,
                run_task,
                torrent_path,
                download_dir,
            },
        );
        info_hash
    }

    pub fn get(&self, info_hash: &[u8; 20]) -> Option<Arc<TorrentEngine>> {
        self.entries.get(info_hash).map(|e| Arc::clone(&e.engine))
    }

    pub fn list(&self) -> Vec<Arc<TorrentEngine>> {
        self.entries.values().map(|e| Arc::clone(&e.engine)).collect()
    }

    /// Pauses, shuts down, and detaches the torrent; the session file no
    /// longer lists it.
    pub async fn remove(&mut self, info_hash: &[u8; 20]) -> anyhow::Result<()> {
        if let Some(entry) = self.entries.remove(info_hash) {
            entry.engine.pause();
            entry.engine.shutdown().await;
            entry.run_task.abort();
        }
        self.persist().await
    }

    pub async fn persist(&self) -> anyhow::Result<()> {
        let mut records = Vec::with_capacity(self.entries.len());
        for entry in self.entries.values() {
            let completed_on = *entry.engine.completed_on.lock().await;
            let completion = entry.engine.completion_bitmap().await;
            records.push(SessionRecord {
                torrent_path: entry.torrent_path.clone(),
                download_dir: entry.download_dir.clone(),
                paused: entry.engine.is_paused(),
                is_finished: !completion.is_empty() && completion.iter().all(|&c| c),
                added_on: entry.engine.added_on,
                completed_on,
            });
        }
        session::save(&self.session_path, &records)?;
        Ok(())
    }
}
