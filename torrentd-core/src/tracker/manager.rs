//! Multi-tier tracker fan-out: builds a flat entry list from `announce` +
//! `announce-list`, announces to all of them with bounded concurrency, and
//! aggregates peers and the next announce interval.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::warn;

use crate::metainfo::Metainfo;

use super::{http, udp, AnnounceParams, AnnounceResult, Event};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1800);
const FANOUT_CONCURRENCY: usize = 10;
const DEFAULT_UDP_TIMEOUT: Duration = udp::SOCKET_TIMEOUT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerStatus {
    Unknown,
    Working,
    Error,
}

pub struct TrackerEntry {
    pub url: String,
    pub tier: usize,
    pub last_status: TrackerStatus,
    pub last_msg: Option<String>,
    pub last_peers: usize,
    pub last_seeds: usize,
    pub interval: Duration,
    pub next_announce: Instant,
}

impl TrackerEntry {
    fn new(url: String, tier: usize) -> Self {
        TrackerEntry {
            url,
            tier,
            last_status: TrackerStatus::Unknown,
            last_msg: None,
            last_peers: 0,
            last_seeds: 0,
            interval: DEFAULT_INTERVAL,
            next_announce: Instant::now(),
        }
    }

    fn supported_scheme(url: &str) -> bool {
        url.starts_with("http://") || url.starts_with("https://") || url.starts_with("udp://")
    }
}

pub struct TrackerManager {
    entries: Vec<TrackerEntry>,
    http_client: reqwest::Client,
    fanout_concurrency: usize,
    udp_timeout: Duration,
}

impl TrackerManager {
    pub fn new(meta: &Metainfo) -> Self {
        Self::with_limits(meta, FANOUT_CONCURRENCY, DEFAULT_UDP_TIMEOUT)
    }

    /// Like [`Self::new`], but with a caller-supplied fan-out concurrency
    /// and UDP socket timeout instead of the defaults — lets the engine
    /// honor `Configuration::tracker_fanout_concurrency`/`udp_tracker_timeout`.
    pub fn with_limits(meta: &Metainfo, fanout_concurrency: usize, udp_timeout: Duration) -> Self {
        let mut urls = vec![(meta.announce.clone(), 0usize)];
        if let Some(tiers) = &meta.announce_list {
            for (tier_idx, tier) in tiers.iter().enumerate() {
                for url in tier {
                    urls.push((url.clone(), tier_idx));
                }
            }
        }

        let mut seen = HashSet::new();
        let entries = urls
            .into_iter()
            .filter(|(url, _)| TrackerEntry::supported_scheme(url))
            .filter(|(url, _)| seen.insert(url.clone()))
            .map(|(url, tier)| TrackerEntry::new(url, tier))
            .collect();

        TrackerManager {
            entries,
            http_client: reqwest::Client::new(),
            fanout_concurrency,
            udp_timeout,
        }
    }

    pub fn entries(&self) -> &[TrackerEntry] {
        &self.entries
    }

    /// Announces to every tracker with bounded concurrency, deduplicates
    /// peers by `(ip, port)`, and returns the aggregate list plus the
    /// minimum reported interval. A failure at one tracker only taints that
    /// entry's status; it never aborts the fan-out.
    pub async fn get_all_peers(
        &mut self,
        params: &AnnounceParams<'_>,
    ) -> (Vec<SocketAddr>, Duration) {
        let semaphore = std::sync::Arc::new(Semaphore::new(self.fanout_concurrency));
        let mut tasks = Vec::with_capacity(self.entries.len());

        for (idx, entry) in self.entries.iter().enumerate() {
            let url = entry.url.clone();
            let semaphore = semaphore.clone();
            let client = self.http_client.clone();
            let params_owned = OwnedAnnounceParams::from(params);
            let udp_timeout = self.udp_timeout;
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let result = announce_one(&client, &url, &params_owned, udp_timeout).await;
                (idx, result)
            }));
        }

        let mut aggregate = HashSet::new();
        let mut min_interval = DEFAULT_INTERVAL;
        for task in tasks {
            let (idx, result) = match task.await {
                Ok(pair) => pair,
                Err(join_err) => {
                    warn!(error = %join_err, "tracker announce task panicked");
                    continue;
                }
            };
            let entry = &mut self.entries[idx];
            match result {
                Ok(announce_result) => {
                    entry.last_status = TrackerStatus::Working;
                    entry.last_msg = None;
                    entry.last_peers = announce_result.peers.len();
                    entry.interval = Duration::from_secs(announce_result.interval as u64);
                    entry.next_announce = Instant::now() + entry.interval;
                    min_interval = min_interval.min(entry.interval);
                    for peer in announce_result.peers {
                        aggregate.insert(peer);
                    }
                }
                Err(e) => {
                    entry.last_status = TrackerStatus::Error;
                    entry.last_msg = Some(e.to_string());
                }
            }
        }

        (aggregate.into_iter().collect(), min_interval)
    }
}

/// `AnnounceParams` borrows a `&[u8; 20]` pair that must outlive the spawned
/// tasks; this owned copy is what actually crosses the `tokio::spawn`
/// boundary.
struct OwnedAnnounceParams {
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    event: Event,
}

impl From<&AnnounceParams<'_>> for OwnedAnnounceParams {
    fn from(p: &AnnounceParams<'_>) -> Self {
        OwnedAnnounceParams {
            info_hash: *p.info_hash,
            peer_id: *p.peer_id,
            port: p.port,
            uploaded: p.uploaded,
            downloaded: p.downloaded,
            left: p.left,
            event: p.event,
        }
    }
}

async fn announce_one(
    client: &reqwest::Client,
    url: &str,
    params: &OwnedAnnounceParams,
    udp_timeout: Duration,
) -> Result<AnnounceResult, crate::error::TrackerError> {
    let borrowed = AnnounceParams {
        info_hash: &params.info_hash,
        peer_id: &params.peer_id,
        port: params.port,
        uploaded: params.uploaded,
        downloaded: params.downloaded,
        left: params.left,
        event: params.event,
    };

    if let Some(host_port) = url.strip_prefix("udp://") {
        udp::announce(host_port, &borrowed, udp_timeout).await
    } else if url.starts_with("http://") || url.starts_with("https://") {
        http::announce(client, url, &borrowed).await
    } else {
        Err(crate::error::TrackerError::UnsupportedScheme(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, Value};
    use std::collections::BTreeMap;

    fn meta_with_tiers() -> Metainfo {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::Text("t".into()));
        info.insert(b"piece length".to_vec(), Value::Int(16));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; 20]));
        info.insert(b"length".to_vec(), Value::Int(16));

        let mut top = BTreeMap::new();
        top.insert(
            b"announce".to_vec(),
            Value::Text("http://primary.example/announce".into()),
        );
        top.insert(
            b"announce-list".to_vec(),
            Value::List(vec![
                Value::List(vec![Value::Text("http://primary.example/announce".into())]),
                Value::List(vec![
                    Value::Text("udp://backup.example:80".into()),
                    Value::Text("not-a-real-scheme://x".into()),
                ]),
            ]),
        );
        top.insert(b"info".to_vec(), Value::Dict(info));
        Metainfo::from_bytes(&bencode::encode(&Value::Dict(top))).unwrap()
    }

    #[test]
    fn builds_deduplicated_supported_entry_list() {
        let meta = meta_with_tiers();
        let manager = TrackerManager::new(&meta);
        let urls: Vec<&str> = manager.entries().iter().map(|e| e.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["http://primary.example/announce", "udp://backup.example:80"]
        );
    }
}
