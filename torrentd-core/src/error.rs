//! Error kinds and policy, per the error handling design: each kind is
//! fatal, per-peer, or per-tracker as noted on the variant.

use thiserror::Error;

use crate::bencode::BencodeError;

/// Fatal for the torrent it concerns; the torrent is rejected at add-time.
#[derive(Debug, Error)]
pub enum InvalidMetainfo {
    #[error("malformed bencode in torrent file: {0}")]
    Bencode(#[from] BencodeError),
    #[error("top-level value is not a dictionary")]
    NotADict,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` has the wrong type")]
    WrongType(&'static str),
    #[error("`pieces` length {0} is not a multiple of 20")]
    BadPiecesLength(usize),
    #[error("total length {total} does not match sum of file lengths {sum}")]
    LengthMismatch { total: u64, sum: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Surfaced per-tracker; other tiers are still tried.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker returned HTTP status {0}")]
    HttpStatus(u16),
    #[error("unsupported tracker scheme: {0}")]
    UnsupportedScheme(String),
    #[error("udp tracker timed out after all retries")]
    UdpTimeout,
    #[error("udp tracker transaction id mismatch")]
    TransactionMismatch,
    #[error("udp tracker action mismatch: expected {expected}, got {got}")]
    ActionMismatch { expected: u32, got: u32 },
    #[error("malformed tracker response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Bencode(#[from] BencodeError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The peer is dropped and counted against the retry budget.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake response was {0} bytes, expected 68")]
    WrongLength(usize),
    #[error("unexpected protocol string in handshake")]
    BadProtocol,
    #[error("info hash mismatch in handshake")]
    InfoHashMismatch,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("handshake timed out")]
    Timeout,
}

/// The peer is marked inactive; the engine removes it from its active set.
#[derive(Debug, Error)]
pub enum PeerIoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error("frame of length {0} exceeds the maximum message size")]
    FrameTooLarge(usize),
    #[error("unknown message id {0}")]
    UnknownMessageId(u8),
    #[error("malformed message payload for id {0}")]
    MalformedPayload(u8),
}

/// Disk I/O errors from the piece store; fatal on the write path, swallowed
/// on cleanup.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
