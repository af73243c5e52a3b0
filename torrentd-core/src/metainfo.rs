//! Parses `.torrent` metainfo files and exposes the info-hash and file
//! layout. Immutable after [`Metainfo::from_bytes`] / [`Metainfo::from_file`]
//! returns.

use std::path::Path;

use sha1::{Digest, Sha1};

use crate::bencode::{self, Value};
use crate::error::InvalidMetainfo;

pub const SHA1_LEN: usize = 20;

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub length: u64,
}

#[derive(Debug, Clone)]
pub struct Metainfo {
    pub name: String,
    pub announce: String,
    pub announce_list: Option<Vec<Vec<String>>>,
    pub piece_length: u64,
    pub pieces: Vec<[u8; SHA1_LEN]>,
    pub total_length: u64,
    pub files: Vec<FileEntry>,
    pub is_multifile: bool,
    pub info_hash: [u8; SHA1_LEN],
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
}

impl Metainfo {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, InvalidMetainfo> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, InvalidMetainfo> {
        let top = bencode::decode(data)?;
        let top_dict = top.as_dict().ok_or(InvalidMetainfo::NotADict)?;

        let announce = top_dict
            .get(b"announce".as_slice())
            .and_then(Value::as_text)
            .ok_or(InvalidMetainfo::MissingField("announce"))?
            .to_string();

        let announce_list = top_dict
            .get(b"announce-list".as_slice())
            .map(parse_announce_list)
            .transpose()?;

        let info_value = top_dict
            .get(b"info".as_slice())
            .ok_or(InvalidMetainfo::MissingField("info"))?;
        let info_dict = info_value
            .as_dict()
            .ok_or(InvalidMetainfo::WrongType("info"))?;

        let canonical_info = bencode::encode(info_value);
        let mut hasher = Sha1::new();
        hasher.update(&canonical_info);
        let info_hash: [u8; SHA1_LEN] = hasher.finalize().into();

        let name = info_dict
            .get(b"name".as_slice())
            .and_then(Value::as_text)
            .ok_or(InvalidMetainfo::MissingField("info.name"))?
            .to_string();

        let piece_length = info_dict
            .get(b"piece length".as_slice())
            .and_then(Value::as_int)
            .ok_or(InvalidMetainfo::MissingField("info.piece length"))? as u64;

        let pieces_raw = info_dict
            .get(b"pieces".as_slice())
            .and_then(Value::as_raw_bytes)
            .ok_or(InvalidMetainfo::MissingField("info.pieces"))?;
        if pieces_raw.len() % SHA1_LEN != 0 {
            return Err(InvalidMetainfo::BadPiecesLength(pieces_raw.len()));
        }
        let pieces: Vec<[u8; SHA1_LEN]> = pieces_raw
            .chunks_exact(SHA1_LEN)
            .map(|chunk| chunk.try_into().expect("chunk is exactly SHA1_LEN"))
            .collect();

        let (files, is_multifile, total_length) = if let Some(files_value) =
            info_dict.get(b"files".as_slice())
        {
            let entries = files_value
                .as_list()
                .ok_or(InvalidMetainfo::WrongType("info.files"))?;
            let mut files = Vec::with_capacity(entries.len());
            let mut total = 0u64;
            for entry in entries {
                let entry_dict = entry.as_dict().ok_or(InvalidMetainfo::WrongType("info.files[]"))?;
                let length = entry_dict
                    .get(b"length".as_slice())
                    .and_then(Value::as_int)
                    .ok_or(InvalidMetainfo::MissingField("info.files[].length"))?
                    as u64;
                let path_list = entry_dict
                    .get(b"path".as_slice())
                    .and_then(Value::as_list)
                    .ok_or(InvalidMetainfo::MissingField("info.files[].path"))?;
                let path = path_list
                    .iter()
                    .map(|v| v.as_text().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
                    .ok_or(InvalidMetainfo::WrongType("info.files[].path"))?;
                total += length;
                files.push(FileEntry { path, length });
            }
            (files, true, total)
        } else {
            let length = info_dict
                .get(b"length".as_slice())
                .and_then(Value::as_int)
                .ok_or(InvalidMetainfo::MissingField("info.length"))? as u64;
            (
                vec![FileEntry {
                    path: vec![name.clone()],
                    length,
                }],
                false,
                length,
            )
        };

        let expected_pieces = ceil_div(total_length, piece_length.max(1)) as usize;
        if pieces.len() != expected_pieces {
            return Err(InvalidMetainfo::LengthMismatch {
                total: total_length,
                sum: pieces.len() as u64 * piece_length,
            });
        }

        let comment = top_dict
            .get(b"comment".as_slice())
            .and_then(Value::as_text)
            .map(str::to_string);
        let created_by = top_dict
            .get(b"created by".as_slice())
            .and_then(Value::as_text)
            .map(str::to_string);
        let creation_date = top_dict
            .get(b"creation date".as_slice())
            .and_then(Value::as_int);

        Ok(Metainfo {
            name,
            announce,
            announce_list,
            piece_length,
            pieces,
            total_length,
            files,
            is_multifile,
            info_hash,
            comment,
            created_by,
            creation_date,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Length of piece `index`, shorter than `piece_length` only for the
    /// last piece.
    pub fn piece_len(&self, index: usize) -> u64 {
        let start = index as u64 * self.piece_length;
        (self.total_length - start).min(self.piece_length)
    }

    /// `(path_components, length, global_start_offset)` in declaration order.
    pub fn file_layout(&self) -> impl Iterator<Item = (&[String], u64, u64)> {
        let mut offset = 0u64;
        self.files.iter().map(move |f| {
            let start = offset;
            offset += f.length;
            (f.path.as_slice(), f.length, start)
        })
    }
}

fn parse_announce_list(value: &Value) -> Result<Vec<Vec<String>>, InvalidMetainfo> {
    let tiers = value
        .as_list()
        .ok_or(InvalidMetainfo::WrongType("announce-list"))?;
    tiers
        .iter()
        .map(|tier| {
            tier.as_list()
                .ok_or(InvalidMetainfo::WrongType("announce-list[]"))?
                .iter()
                .map(|url| {
                    url.as_text()
                        .map(str::to_string)
                        .ok_or(InvalidMetainfo::WrongType("announce-list[][]"))
                })
                .collect()
        })
        .collect()
}

fn ceil_div(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::Value;
    use std::collections::BTreeMap;

    fn sample_bytes(total_length: u64, piece_length: u64, num_pieces: usize) -> Vec<u8> {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::Text("sample.bin".into()));
        info.insert(b"piece length".to_vec(), Value::Int(piece_length as i64));
        info.insert(
            b"pieces".to_vec(),
            Value::Bytes(vec![0u8; num_pieces * SHA1_LEN]),
        );
        info.insert(b"length".to_vec(), Value::Int(total_length as i64));

        let mut top = BTreeMap::new();
        top.insert(
            b"announce".to_vec(),
            Value::Text("http://tracker.example/announce".into()),
        );
        top.insert(b"info".to_vec(), Value::Dict(info));
        bencode::encode(&Value::Dict(top))
    }

    #[test]
    fn parses_single_file_torrent() {
        let bytes = sample_bytes(40, 16, 3);
        let meta = Metainfo::from_bytes(&bytes).unwrap();
        assert!(!meta.is_multifile);
        assert_eq!(meta.total_length, 40);
        assert_eq!(meta.num_pieces(), 3);
        assert_eq!(meta.piece_len(0), 16);
        assert_eq!(meta.piece_len(1), 16);
        assert_eq!(meta.piece_len(2), 8);
    }

    #[test]
    fn rejects_piece_count_mismatch() {
        let bytes = sample_bytes(40, 16, 2); // should be 3 pieces
        assert!(Metainfo::from_bytes(&bytes).is_err());
    }

    #[test]
    fn multifile_layout_concatenates_in_order() {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::Text("pack".into()));
        info.insert(b"piece length".to_vec(), Value::Int(16));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; 3 * SHA1_LEN]));

        let mut file_a = BTreeMap::new();
        file_a.insert(b"length".to_vec(), Value::Int(10));
        file_a.insert(
            b"path".to_vec(),
            Value::List(vec![Value::Text("a.txt".into())]),
        );
        let mut file_b = BTreeMap::new();
        file_b.insert(b"length".to_vec(), Value::Int(30));
        file_b.insert(
            b"path".to_vec(),
            Value::List(vec![
                Value::Text("sub".into()),
                Value::Text("b.txt".into()),
            ]),
        );
        info.insert(
            b"files".to_vec(),
            Value::List(vec![Value::Dict(file_a), Value::Dict(file_b)]),
        );

        let mut top = BTreeMap::new();
        top.insert(b"announce".to_vec(), Value::Text("http://t/a".into()));
        top.insert(b"info".to_vec(), Value::Dict(info));
        let bytes = bencode::encode(&Value::Dict(top));

        let meta = Metainfo::from_bytes(&bytes).unwrap();
        assert!(meta.is_multifile);
        assert_eq!(meta.total_length, 40);
        let layout: Vec<_> = meta.file_layout().collect();
        assert_eq!(layout[0].2, 0);
        assert_eq!(layout[1].2, 10);
    }
}
