//! Connection pool: bounded-parallelism connect bursts, per-peer failure
//! tracking with exponential backoff, and a background retry loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::metainfo::SHA1_LEN;
use crate::peer::connection::{self, PeerConnection};

/// Roughly the concurrency the source's thread pool used for the initial
/// connect burst.
pub const CONNECT_PARALLELISM: usize = 120;
pub const MAX_FAILURES: u32 = 5;
pub const RETRY_CHECK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default)]
struct FailureState {
    count: u32,
    next_retry_at: Option<Instant>,
}

impl FailureState {
    fn record_failure(&mut self, now: Instant) {
        self.count += 1;
        let backoff = backoff_seconds(self.count);
        self.next_retry_at = Some(now + Duration::from_secs(backoff));
    }

    fn is_retryable(&self, now: Instant, max_failures: u32) -> bool {
        self.count < max_failures && self.next_retry_at.map(|t| now >= t).unwrap_or(true)
    }

    fn clear(&mut self) {
        self.count = 0;
        self.next_retry_at = None;
    }
}

/// `10 * 2^(failcount - 1)` seconds, per §4.7.
fn backoff_seconds(failcount: u32) -> u64 {
    10u64.saturating_mul(1u64 << (failcount.saturating_sub(1)))
}

pub struct PeerManager {
    info_hash: [u8; SHA1_LEN],
    local_peer_id: [u8; 20],
    num_pieces: usize,
    handshake_timeout: Duration,
    max_failures: u32,
    connect_parallelism: usize,
    failures: HashMap<SocketAddr, FailureState>,
}

impl PeerManager {
    pub fn new(
        info_hash: [u8; SHA1_LEN],
        local_peer_id: [u8; 20],
        num_pieces: usize,
        handshake_timeout: Duration,
    ) -> Self {
        Self::with_limits(
            info_hash,
            local_peer_id,
            num_pieces,
            handshake_timeout,
            MAX_FAILURES,
            CONNECT_PARALLELISM,
        )
    }

    /// Like [`Self::new`], but with caller-supplied retry/concurrency
    /// limits instead of the defaults — lets the engine honor
    /// `Configuration::max_peer_failures`/`connect_parallelism`.
    pub fn with_limits(
        info_hash: [u8; SHA1_LEN],
        local_peer_id: [u8; 20],
        num_pieces: usize,
        handshake_timeout: Duration,
        max_failures: u32,
        connect_parallelism: usize,
    ) -> Self {
        PeerManager {
            info_hash,
            local_peer_id,
            num_pieces,
            handshake_timeout,
            max_failures,
            connect_parallelism,
            failures: HashMap::new(),
        }
    }

    /// Attempts every address with bounded parallelism; retains only the
    /// connections whose handshake succeeded. Failures are recorded for the
    /// retry loop to pick up later.
    pub async fn connect_all(&mut self, addrs: Vec<SocketAddr>) -> Vec<PeerConnection> {
        let semaphore = Arc::new(Semaphore::new(self.connect_parallelism));
        let info_hash = self.info_hash;
        let local_peer_id = self.local_peer_id;
        let num_pieces = self.num_pieces;
        let timeout = self.handshake_timeout;

        let mut tasks = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let semaphore = Arc::clone(&semaphore);
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let result = connection::connect(addr, &info_hash, &local_peer_id, num_pieces, timeout).await;
                (addr, result)
            }));
        }

        let mut connected = Vec::new();
        let now = Instant::now();
        for task in tasks {
            match task.await {
                Ok((addr, Ok(peer))) => {
                    self.failures.remove(&addr);
                    connected.push(peer);
                }
                Ok((addr, Err(e))) => {
                    debug!(%addr, error = %e, "handshake failed");
                    self.failures.entry(addr).or_default().record_failure(now);
                }
                Err(join_err) => warn!(error = %join_err, "connect task panicked"),
            }
        }
        connected
    }

    /// Addresses whose retry time has elapsed and whose failure count is
    /// still below the configured maximum.
    pub fn due_for_retry(&self, now: Instant) -> Vec<SocketAddr> {
        self.failures
            .iter()
            .filter(|(_, state)| state.is_retryable(now, self.max_failures))
            .map(|(addr, _)| *addr)
            .collect()
    }

    /// Attempts the given (presumably due-for-retry) addresses; on success
    /// clears that address's failure state.
    pub async fn retry(&mut self, addrs: Vec<SocketAddr>) -> Vec<PeerConnection> {
        self.connect_all(addrs).await
    }

    pub fn failure_count(&self, addr: &SocketAddr) -> u32 {
        self.failures.get(addr).map(|s| s.count).unwrap_or(0)
    }

    pub fn is_permanently_failed(&self, addr: &SocketAddr) -> bool {
        self.failure_count(addr) >= self.max_failures
    }

    pub fn forget(&mut self, addr: &SocketAddr) {
        self.failures.remove(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_matches_spec_scenario() {
        // Scenario 7: after k consecutive failures, next retry is
        // now + 10 * 2^(k-1) seconds.
        assert_eq!(backoff_seconds(1), 10);
        assert_eq!(backoff_seconds(2), 20);
        assert_eq!(backoff_seconds(3), 40);
        assert_eq!(backoff_seconds(4), 80);
        assert_eq!(backoff_seconds(5), 160);
    }

    #[test]
    fn peer_is_never_retried_past_max_failures() {
        let mut state = FailureState::default();
        let now = Instant::now();
        for _ in 0..MAX_FAILURES {
            state.record_failure(now);
        }
        assert_eq!(state.count, MAX_FAILURES);
        assert!(!state.is_retryable(now + Duration::from_secs(10_000), MAX_FAILURES));
    }

    #[test]
    fn retry_state_clears_on_success() {
        let mut state = FailureState::default();
        state.record_failure(Instant::now());
        assert!(state.count > 0);
        state.clear();
        assert_eq!(state.count, 0);
        assert!(state.next_retry_at.is_none());
    }
}
