//! Session file: a JSON list of previously added torrents, reloaded on
//! startup so finished/paused state survives a restart.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub torrent_path: PathBuf,
    pub download_dir: PathBuf,
    pub paused: bool,
    pub is_finished: bool,
    pub added_on: i64,
    pub completed_on: Option<i64>,
}

/// Loads the session file; a missing file is treated as an empty session
/// (first run), not an error.
pub fn load(path: impl AsRef<Path>) -> Result<Vec<SessionRecord>, std::io::Error> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

pub fn save(path: impl AsRef<Path>, records: &[SessionRecord]) -> Result<(), std::io::Error> {
    let bytes = serde_json::to_vec_pretty(records)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, bytes)
}
