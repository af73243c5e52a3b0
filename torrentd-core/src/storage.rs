//! Memory-mapped piece storage. Holds the download as a single `.part` file
//! while in progress, then scatters it into the final file layout and
//! reopens it read-only for seeding.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};

use crate::error::StorageError;
use crate::metainfo::Metainfo;

enum Map {
    Writable(MmapMut),
    ReadOnly(Mmap),
    Closed,
}

fn out_of_range(global_offset: u64, length: u64) -> StorageError {
    StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("read of {length} bytes at offset {global_offset} is out of range"),
    ))
}

/// Backing store for one torrent's downloaded bytes.
pub struct PieceStore {
    download_dir: PathBuf,
    name: String,
    piece_length: u64,
    total_length: u64,
    files: Vec<(Vec<String>, u64, u64)>,
    is_multifile: bool,
    part_path: PathBuf,
    file: Option<File>,
    map: Map,
}

impl PieceStore {
    /// Creates (or opens) the backing `.part` file read-write.
    pub fn open(meta: &Metainfo, download_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let download_dir = download_dir.as_ref().to_path_buf();
        let output_dir = if meta.is_multifile {
            let dir = download_dir.join(&meta.name);
            std::fs::create_dir_all(&dir)?;
            dir
        } else {
            std::fs::create_dir_all(&download_dir)?;
            download_dir.clone()
        };
        let part_path = output_dir.join(format!("{}.part", meta.name));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&part_path)?;
        file.set_len(meta.total_length)?;
        let map = unsafe { MmapMut::map_mut(&file)? };

        let files = meta
            .file_layout()
            .map(|(path, len, off)| (path.to_vec(), len, off))
            .collect();

        Ok(PieceStore {
            download_dir,
            name: meta.name.clone(),
            piece_length: meta.piece_length,
            total_length: meta.total_length,
            files,
            is_multifile: meta.is_multifile,
            part_path,
            file: Some(file),
            map: Map::Writable(map),
        })
    }

    /// Writes `data` at `piece_index * piece_length + piece_offset`.
    pub fn write(&mut self, piece_index: u32, piece_offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let start = piece_index as u64 * self.piece_length + piece_offset as u64;
        match &mut self.map {
            Map::Writable(mmap) => {
                let end = start as usize + data.len();
                mmap[start as usize..end].copy_from_slice(data);
                Ok(())
            }
            _ => Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "piece store is not writable",
            ))),
        }
    }

    /// Returns a copy of `length` bytes starting at `global_offset`. Valid
    /// in both writable and seeding states. Errors rather than panicking
    /// when the requested range runs past the end of the backing map —
    /// callers may be passing through peer-supplied offsets.
    pub fn read(&self, global_offset: u64, length: u64) -> Result<Vec<u8>, StorageError> {
        let start = global_offset as usize;
        let end = start
            .checked_add(length as usize)
            .ok_or_else(|| out_of_range(global_offset, length))?;
        let map_len = match &self.map {
            Map::Writable(mmap) => mmap.len(),
            Map::ReadOnly(mmap) => mmap.len(),
            Map::Closed => {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "piece store is closed",
                )))
            }
        };
        if end > map_len {
            return Err(out_of_range(global_offset, length));
        }
        match &self.map {
            Map::Writable(mmap) => Ok(mmap[start..end].to_vec()),
            Map::ReadOnly(mmap) => Ok(mmap[start..end].to_vec()),
            Map::Closed => unreachable!("handled above"),
        }
    }

    /// Flushes and closes the writable map, scatters the bytes into the
    /// final layout (multi-file) or renames the `.part` file (single-file),
    /// then reopens the result read-only. Idempotent: a second call is a
    /// no-op.
    pub fn switch_to_seeding(&mut self) -> Result<(), StorageError> {
        if matches!(self.map, Map::ReadOnly(_)) {
            return Ok(());
        }

        if let Map::Writable(mmap) = &self.map {
            mmap.flush()?;
        }
        self.map = Map::Closed;
        self.file = None;

        let final_path = if self.is_multifile {
            self.scatter_into_files()?;
            self.part_path.clone()
        } else {
            let final_path = self.download_dir.join(&self.name);
            std::fs::rename(&self.part_path, &final_path)?;
            final_path
        };

        let file = OpenOptions::new().read(true).open(&final_path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        self.file = Some(file);
        self.map = Map::ReadOnly(mmap);
        Ok(())
    }

    fn scatter_into_files(&self) -> Result<(), StorageError> {
        let mut source = File::open(&self.part_path)?;
        let base_dir = self.download_dir.join(&self.name);
        for (path_components, length, offset) in &self.files {
            let target = base_dir.join(path_components.join(std::path::MAIN_SEPARATOR_STR));
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            source.seek(SeekFrom::Start(*offset))?;
            let mut out = File::create(&target)?;
            let mut remaining = *length;
            let mut buf = vec![0u8; self.piece_length.min(1024 * 1024).max(1) as usize];
            while remaining > 0 {
                let chunk = remaining.min(buf.len() as u64) as usize;
                source.read_exact(&mut buf[..chunk])?;
                out.write_all(&buf[..chunk])?;
                remaining -= chunk as u64;
            }
        }
        Ok(())
    }

    /// Closes the map and file. Tolerates being called after an earlier
    /// close, or after [`switch_to_seeding`](Self::switch_to_seeding).
    pub fn cleanup(&mut self) {
        self.map = Map::Closed;
        self.file = None;
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn is_seeding(&self) -> bool {
        matches!(self.map, Map::ReadOnly(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, Value};
    use std::collections::BTreeMap;

    fn single_file_meta(total_length: u64, piece_length: u64) -> Metainfo {
        let num_pieces = ((total_length + piece_length - 1) / piece_length) as usize;
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::Text("movie.bin".into()));
        info.insert(b"piece length".to_vec(), Value::Int(piece_length as i64));
        info.insert(
            b"pieces".to_vec(),
            Value::Bytes(vec![0u8; num_pieces * crate::metainfo::SHA1_LEN]),
        );
        info.insert(b"length".to_vec(), Value::Int(total_length as i64));
        let mut top = BTreeMap::new();
        top.insert(b"announce".to_vec(), Value::Text("http://t/a".into()));
        top.insert(b"info".to_vec(), Value::Dict(info));
        let bytes = bencode::encode(&Value::Dict(top));
        Metainfo::from_bytes(&bytes).unwrap()
    }

    fn multi_file_meta() -> Metainfo {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::Text("pack".into()));
        info.insert(b"piece length".to_vec(), Value::Int(16));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; 3 * crate::metainfo::SHA1_LEN]));
        let mut file_a = BTreeMap::new();
        file_a.insert(b"length".to_vec(), Value::Int(10));
        file_a.insert(b"path".to_vec(), Value::List(vec![Value::Text("a.txt".into())]));
        let mut file_b = BTreeMap::new();
        file_b.insert(b"length".to_vec(), Value::Int(30));
        file_b.insert(
            b"path".to_vec(),
            Value::List(vec![Value::Text("sub".into()), Value::Text("b.txt".into())]),
        );
        info.insert(
            b"files".to_vec(),
            Value::List(vec![Value::Dict(file_a), Value::Dict(file_b)]),
        );
        let mut top = BTreeMap::new();
        top.insert(b"announce".to_vec(), Value::Text("http://t/a".into()));
        top.insert(b"info".to_vec(), Value::Dict(info));
        Metainfo::from_bytes(&bencode::encode(&Value::Dict(top))).unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let meta = single_file_meta(32, 16);
        let mut store = PieceStore::open(&meta, dir.path()).unwrap();
        store.write(0, 0, &[1u8; 16]).unwrap();
        store.write(1, 0, &[2u8; 16]).unwrap();
        assert_eq!(store.read(0, 16).unwrap(), vec![1u8; 16]);
        assert_eq!(store.read(16, 16).unwrap(), vec![2u8; 16]);
    }

    #[test]
    fn single_file_seeding_renames_part() {
        let dir = tempfile::tempdir().unwrap();
        let meta = single_file_meta(16, 16);
        let mut store = PieceStore::open(&meta, dir.path()).unwrap();
        store.write(0, 0, &[9u8; 16]).unwrap();
        store.switch_to_seeding().unwrap();
        assert!(store.is_seeding());
        assert!(dir.path().join("movie.bin").exists());
        assert!(!dir.path().join("movie.bin.part").exists());
        // idempotent
        store.switch_to_seeding().unwrap();
        assert!(store.is_seeding());
    }

    #[test]
    fn multifile_seeding_scatters_into_files() {
        let dir = tempfile::tempdir().unwrap();
        let meta = multi_file_meta();
        let mut store = PieceStore::open(&meta, dir.path()).unwrap();
        let payload: Vec<u8> = (0u8..40).collect();
        store.write(0, 0, &payload[0..16]).unwrap();
        store.write(1, 0, &payload[16..32]).unwrap();
        store.write(2, 0, &payload[32..40]).unwrap();
        store.switch_to_seeding().unwrap();

        let a = std::fs::read(dir.path().join("pack").join("a.txt")).unwrap();
        assert_eq!(a, payload[0..10]);
        let b = std::fs::read(dir.path().join("pack").join("sub").join("b.txt")).unwrap();
        assert_eq!(b, payload[10..40]);
        // .part is retained for continued seeding
        assert!(dir.path().join("pack").join("pack.part").exists());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let meta = single_file_meta(16, 16);
        let mut store = PieceStore::open(&meta, dir.path()).unwrap();
        store.cleanup();
        store.cleanup();
    }
}
