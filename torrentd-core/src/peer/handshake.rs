//! BEP 3 handshake: a fixed 68-byte exchange that precedes all framed
//! messages on a peer connection.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::HandshakeError;
use crate::metainfo::SHA1_LEN;

pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;
pub const PEER_ID_LEN: usize = 20;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

pub fn build(info_hash: &[u8; SHA1_LEN], peer_id: &[u8; PEER_ID_LEN]) -> [u8; HANDSHAKE_LEN] {
    let mut buf = [0u8; HANDSHAKE_LEN];
    buf[0] = 19;
    buf[1..20].copy_from_slice(PROTOCOL);
    // buf[20..28] reserved, left zero.
    buf[28..48].copy_from_slice(info_hash);
    buf[48..68].copy_from_slice(peer_id);
    buf
}

/// Validates a received handshake against the info-hash we expect, and
/// extracts the remote peer id.
pub fn parse(
    buf: &[u8],
    expected_info_hash: &[u8; SHA1_LEN],
) -> Result<[u8; PEER_ID_LEN], HandshakeError> {
    if buf.len() != HANDSHAKE_LEN {
        return Err(HandshakeError::WrongLength(buf.len()));
    }
    if buf[0] != 19 || &buf[1..20] != PROTOCOL.as_slice() {
        return Err(HandshakeError::BadProtocol);
    }
    if &buf[28..48] != expected_info_hash.as_slice() {
        return Err(HandshakeError::InfoHashMismatch);
    }
    let mut remote_id = [0u8; PEER_ID_LEN];
    remote_id.copy_from_slice(&buf[48..68]);
    Ok(remote_id)
}

/// Performs the handshake over an already-connected socket: sends our
/// handshake, reads exactly 68 bytes within `timeout_duration`, validates,
/// and returns the remote peer id.
pub async fn perform(
    stream: &mut TcpStream,
    info_hash: &[u8; SHA1_LEN],
    local_peer_id: &[u8; PEER_ID_LEN],
    timeout_duration: Duration,
) -> Result<[u8; PEER_ID_LEN], HandshakeError> {
    let outgoing = build(info_hash, local_peer_id);
    stream.write_all(&outgoing).await?;

    let mut incoming = [0u8; HANDSHAKE_LEN];
    timeout(timeout_duration, stream.read_exact(&mut incoming))
        .await
        .map_err(|_| HandshakeError::Timeout)??;

    parse(&incoming, info_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};

    fn dummy_info_hash() -> [u8; SHA1_LEN] {
        let mut hasher = Sha1::new();
        hasher.update(b"dummy_info");
        hasher.finalize().into()
    }

    #[test]
    fn handshake_round_trip_matches_spec_scenario() {
        let info_hash = dummy_info_hash();
        let peer_id: [u8; PEER_ID_LEN] = *b"-PC0001-abcdefghijkl";
        let built = build(&info_hash, &peer_id);

        assert_eq!(built.len(), HANDSHAKE_LEN);
        assert_eq!(built[0], 19);
        assert_eq!(&built[1..20], PROTOCOL.as_slice());
        assert_eq!(&built[28..48], info_hash.as_slice());
        assert_eq!(&built[48..68], peer_id.as_slice());

        let remote_id = parse(&built, &info_hash).unwrap();
        assert_eq!(remote_id, peer_id);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            parse(&[0u8; 67], &dummy_info_hash()),
            Err(HandshakeError::WrongLength(67))
        ));
    }

    #[test]
    fn rejects_bad_protocol_string() {
        let mut buf = build(&dummy_info_hash(), &[0u8; PEER_ID_LEN]);
        buf[1] = b'X';
        assert!(matches!(
            parse(&buf, &dummy_info_hash()),
            Err(HandshakeError::BadProtocol)
        ));
    }

    #[test]
    fn rejects_info_hash_mismatch() {
        let built = build(&dummy_info_hash(), &[0u8; PEER_ID_LEN]);
        let other_hash = [1u8; SHA1_LEN];
        assert!(matches!(
            parse(&built, &other_hash),
            Err(HandshakeError::InfoHashMismatch)
        ));
    }
}
