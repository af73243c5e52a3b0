//! Read-only status DTOs exposed to an external control surface (a web UI
//! or CLI), plus the small bits of derived arithmetic (ETA, aggregate
//! speed, client-string decoding) that surface lives on.

use std::net::SocketAddr;

pub struct PeerStatus {
    pub addr: SocketAddr,
    pub remote_id: [u8; 20],
    pub bitmap_len: usize,
    pub pieces_have: usize,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub down_bps: f64,
    pub up_bps: f64,
    pub total_downloaded: u64,
    pub total_uploaded: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerDisplayStatus {
    Unknown,
    Working,
    Error,
}

pub struct TrackerStatus {
    pub url: String,
    pub tier: usize,
    pub status: TrackerDisplayStatus,
    pub last_peers: usize,
    pub last_seeds: usize,
    pub last_msg: Option<String>,
    pub seconds_to_next_announce: i64,
}

pub struct TorrentStatus {
    pub name: String,
    pub info_hash_hex: String,
    pub total_length: u64,
    pub download_path: String,
    pub num_pieces: usize,
    pub piece_length: u64,
    pub added_on: i64,
    pub completed_on: Option<i64>,
    pub paused: bool,
    pub piece_completion: Vec<bool>,
    pub downloaded_bytes: u64,
    pub peers: Vec<PeerStatus>,
    pub trackers: Vec<TrackerStatus>,
}

impl TorrentStatus {
    pub fn percent_done(&self) -> f64 {
        if self.total_length == 0 {
            return 100.0;
        }
        (self.downloaded_bytes.min(self.total_length) as f64 / self.total_length as f64) * 100.0
    }

    pub fn is_finished(&self) -> bool {
        !self.piece_completion.is_empty() && self.piece_completion.iter().all(|&c| c)
    }

    pub fn seeds_count(&self) -> usize {
        self.peers.iter().filter(|p| p.pieces_have == self.num_pieces).count()
    }

    pub fn leechers_count(&self) -> usize {
        self.peers.len() - self.seeds_count()
    }

    /// Peers we are actively exchanging data with: unchoked in at least one
    /// direction and showing non-zero throughput.
    pub fn transmitting_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| (!p.am_choking || !p.peer_choking) && (p.down_bps > 0.0 || p.up_bps > 0.0))
            .count()
    }

    pub fn aggregate_down_bps(&self) -> f64 {
        self.peers.iter().map(|p| p.down_bps).sum()
    }

    pub fn aggregate_up_bps(&self) -> f64 {
        self.peers.iter().map(|p| p.up_bps).sum()
    }

    /// Seconds to completion at the current aggregate download rate; `None`
    /// if already done or the rate is zero (no meaningful estimate).
    pub fn eta_seconds(&self) -> Option<u64> {
        if self.is_finished() {
            return None;
        }
        let remaining = self.total_length.saturating_sub(self.downloaded_bytes);
        let rate = self.aggregate_down_bps();
        if rate <= 0.0 {
            return None;
        }
        Some((remaining as f64 / rate).ceil() as u64)
    }
}

/// Decodes the azureus-style client id convention (`-XX####-` followed by
/// random bytes) used by `peer_id`s such as our own `-PC0001-`. Returns
/// `None` for ids that don't follow the convention (pure-ASCII shadow's
/// bencoding or very old clients).
pub fn parse_peer_client(peer_id: &[u8; 20]) -> Option<(String, String)> {
    if peer_id[0] != b'-' || peer_id[7] != b'-' {
        return None;
    }
    let tag = std::str::from_utf8(&peer_id[1..3]).ok()?;
    let version = std::str::from_utf8(&peer_id[3..7]).ok()?;
    let name = client_name_for_tag(tag)?;
    Some((name.to_string(), version.to_string()))
}

fn client_name_for_tag(tag: &str) -> Option<&'static str> {
    Some(match tag {
        "PC" => "this client",
        "UT" => "uTorrent",
        "TR" => "Transmission",
        "DE" => "Deluge",
        "LT" => "libtorrent",
        "qB" => "qBittorrent",
        "AZ" => "Azureus/Vuze",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(down_bps: f64, up_bps: f64, pieces_have: usize) -> PeerStatus {
        PeerStatus {
            addr: "127.0.0.1:6881".parse().unwrap(),
            remote_id: [0u8; 20],
            bitmap_len: 4,
            pieces_have,
            am_choking: false,
            am_interested: true,
            peer_choking: false,
            peer_interested: false,
            down_bps,
            up_bps,
            total_downloaded: 0,
            total_uploaded: 0,
        }
    }

    fn status(total_length: u64, downloaded: u64, peers: Vec<PeerStatus>) -> TorrentStatus {
        TorrentStatus {
            name: "sample".into(),
            info_hash_hex: "00".repeat(20),
            total_length,
            download_path: "/tmp".into(),
            num_pieces: 4,
            piece_length: 16,
            added_on: 0,
            completed_on: None,
            paused: false,
            piece_completion: vec![false; 4],
            downloaded_bytes: downloaded,
            peers,
            trackers: vec![],
        }
    }

    #[test]
    fn eta_uses_aggregate_download_rate() {
        let st = status(1000, 200, vec![peer(100.0, 0.0, 0)]);
        assert_eq!(st.eta_seconds(), Some(8));
    }

    #[test]
    fn eta_is_none_when_rate_is_zero() {
        let st = status(1000, 200, vec![peer(0.0, 0.0, 0)]);
        assert_eq!(st.eta_seconds(), None);
    }

    #[test]
    fn seeds_vs_leechers_split() {
        let st = status(1000, 0, vec![peer(1.0, 0.0, 4), peer(1.0, 0.0, 2)]);
        assert_eq!(st.seeds_count(), 1);
        assert_eq!(st.leechers_count(), 1);
    }

    #[test]
    fn parses_known_client_tags() {
        let id = b"-UT3530-abcdefghijkl";
        let (name, version) = parse_peer_client(id).unwrap();
        assert_eq!(name, "uTorrent");
        assert_eq!(version, "3530");
    }

    #[test]
    fn unknown_convention_returns_none() {
        let id = [0u8; 20];
        assert!(parse_peer_client(&id).is_none());
    }
}
