use std::io::Write;
use std::path::Path;

use anyhow::Context;

use torrentd_core::Metainfo;

/// Prints the metainfo fields of a torrent file to standard output.
///
/// # Errors
///
/// Returns an error if the file cannot be read, fails to parse as a valid
/// metainfo dictionary, or writing to stdout fails.
pub fn invoke(path: impl AsRef<Path>) -> anyhow::Result<()> {
    let meta = Metainfo::from_file(&path).context("failed to parse torrent file")?;

    let stdout = std::io::stdout();
    let mut stdout = stdout.lock();
    writeln!(stdout, "Name: {}", meta.name)?;
    writeln!(stdout, "Tracker URL: {}", meta.announce)?;
    if let Some(tiers) = &meta.announce_list {
        writeln!(stdout, "Announce tiers:")?;
        for (i, tier) in tiers.iter().enumerate() {
            writeln!(stdout, "  [{i}] {}", tier.join(", "))?;
        }
    }
    writeln!(stdout, "Length: {}", meta.total_length)?;
    writeln!(stdout, "Info Hash: {}", hex::encode(meta.info_hash))?;
    writeln!(stdout, "Piece Length: {}", meta.piece_length)?;
    writeln!(stdout, "Piece Count: {}", meta.num_pieces())?;
    if meta.is_multifile {
        writeln!(stdout, "Files:")?;
        for (path, length, offset) in meta.file_layout() {
            writeln!(stdout, "  {} ({length} bytes, offset {offset})", path.join("/"))?;
        }
    }
    writeln!(stdout, "Piece Hashes:")?;
    for hash in &meta.pieces {
        writeln!(stdout, "{}", hex::encode(hash))?;
    }
    Ok(())
}
