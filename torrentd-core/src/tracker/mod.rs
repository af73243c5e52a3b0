pub mod http;
pub mod manager;
pub mod udp;

use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    None,
    Started,
    Completed,
    Stopped,
}

impl Event {
    pub fn as_http_str(&self) -> &'static str {
        match self {
            Event::None => "",
            Event::Started => "started",
            Event::Completed => "completed",
            Event::Stopped => "stopped",
        }
    }

    pub fn as_udp_code(&self) -> u32 {
        match self {
            Event::None => 0,
            Event::Completed => 1,
            Event::Started => 2,
            Event::Stopped => 3,
        }
    }
}

/// Parameters common to both tracker protocols.
pub struct AnnounceParams<'a> {
    pub info_hash: &'a [u8; 20],
    pub peer_id: &'a [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
}

/// Uniform result of an announce to either protocol.
#[derive(Debug, Clone)]
pub struct AnnounceResult {
    pub peers: Vec<SocketAddr>,
    pub interval: u32,
}

/// Unpacks BEP 3 compact peer bytes: 6 bytes per peer, 4-byte IPv4 then
/// 2-byte big-endian port.
pub fn parse_compact_peers(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::from((ip, port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_compact_peer() {
        // Scenario 6 from the spec.
        let bytes = [0x7f, 0x00, 0x00, 0x01, 0x1a, 0xe1];
        let peers = parse_compact_peers(&bytes);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].ip().to_string(), "127.0.0.1");
        assert_eq!(peers[0].port(), 6881);
    }
}
