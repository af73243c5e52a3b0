//! UDP tracker announce (BEP 15): connect, then announce, each retried with
//! exponential backoff.
//!
//! The source this was modeled on neither validates the response `action`
//! field nor retries on timeout. Both are added here per the redesign
//! decision recorded for this module: action mismatches are rejected, and
//! a timed-out request is retried with `15 * 2^n` second backoff up to
//! `n = 8` before giving up.

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};

use crate::error::TrackerError;

use super::{parse_compact_peers, AnnounceParams, AnnounceResult};

const MAGIC_CONSTANT: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_RETRY_EXPONENT: u32 = 8;

fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_secs(15u64.saturating_mul(1u64 << attempt.min(MAX_RETRY_EXPONENT)))
}

pub async fn announce(
    host_port: &str,
    params: &AnnounceParams<'_>,
    socket_timeout: Duration,
) -> Result<AnnounceResult, TrackerError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(host_port).await?;

    let connection_id = with_retries(|| connect(&socket, socket_timeout)).await?;
    with_retries(|| announce_once(&socket, connection_id, params, socket_timeout)).await
}

async fn with_retries<F, Fut, T>(mut attempt_fn: F) -> Result<T, TrackerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, TrackerError>>,
{
    for attempt in 0..=MAX_RETRY_EXPONENT {
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(TrackerError::UdpTimeout) if attempt < MAX_RETRY_EXPONENT => {
                tokio::time::sleep(retry_backoff(attempt)).await;
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(TrackerError::UdpTimeout)
}

async fn connect(socket: &UdpSocket, socket_timeout: Duration) -> Result<u64, TrackerError> {
    let transaction_id: u32 = rand::thread_rng().gen();
    let mut request = Vec::with_capacity(16);
    request.extend_from_slice(&MAGIC_CONSTANT.to_be_bytes());
    request.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    request.extend_from_slice(&transaction_id.to_be_bytes());
    socket.send(&request).await?;

    let mut buf = [0u8; 16];
    let n = timeout(socket_timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| TrackerError::UdpTimeout)??;
    if n < 16 {
        return Err(TrackerError::Malformed("connect response too short".into()));
    }

    let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let got_transaction_id = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    if got_transaction_id != transaction_id {
        return Err(TrackerError::TransactionMismatch);
    }
    if action != ACTION_CONNECT {
        return Err(TrackerError::ActionMismatch {
            expected: ACTION_CONNECT,
            got: action,
        });
    }
    Ok(u64::from_be_bytes(buf[8..16].try_into().unwrap()))
}

async fn announce_once(
    socket: &UdpSocket,
    connection_id: u64,
    params: &AnnounceParams<'_>,
    socket_timeout: Duration,
) -> Result<AnnounceResult, TrackerError> {
    let transaction_id: u32 = rand::thread_rng().gen();
    let key: u32 = rand::thread_rng().gen();

    let mut request = Vec::with_capacity(98);
    request.extend_from_slice(&connection_id.to_be_bytes());
    request.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    request.extend_from_slice(&transaction_id.to_be_bytes());
    request.extend_from_slice(params.info_hash);
    request.extend_from_slice(params.peer_id);
    request.extend_from_slice(&params.downloaded.to_be_bytes());
    request.extend_from_slice(&params.left.to_be_bytes());
    request.extend_from_slice(&params.uploaded.to_be_bytes());
    request.extend_from_slice(&params.event.as_udp_code().to_be_bytes());
    request.extend_from_slice(&0u32.to_be_bytes()); // ip = 0 (use sender address)
    request.extend_from_slice(&key.to_be_bytes());
    request.extend_from_slice(&(-1i32).to_be_bytes()); // num_want = -1
    request.extend_from_slice(&params.port.to_be_bytes());
    socket.send(&request).await?;

    let mut buf = [0u8; 2048];
    let n = timeout(socket_timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| TrackerError::UdpTimeout)??;
    if n < 20 {
        return Err(TrackerError::Malformed("announce response too short".into()));
    }

    let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let got_transaction_id = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    if got_transaction_id != transaction_id {
        return Err(TrackerError::TransactionMismatch);
    }
    if action != ACTION_ANNOUNCE {
        return Err(TrackerError::ActionMismatch {
            expected: ACTION_ANNOUNCE,
            got: action,
        });
    }

    let interval = u32::from_be_bytes(buf[8..12].try_into().unwrap());
    // buf[12..16] leechers, buf[16..20] seeders: not surfaced by AnnounceResult.
    let peers = parse_compact_peers(&buf[20..n]);

    Ok(AnnounceResult { peers, interval })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_backoff_matches_bep15_scheme() {
        assert_eq!(retry_backoff(0), Duration::from_secs(15));
        assert_eq!(retry_backoff(1), Duration::from_secs(30));
        assert_eq!(retry_backoff(8), Duration::from_secs(15 * 256));
        // exponent is capped at 8, so attempt 9 matches attempt 8.
        assert_eq!(retry_backoff(9), retry_backoff(8));
    }

    #[test]
    fn parses_compact_peers_from_announce_tail() {
        // Scenario 6 from the spec, UDP side: the six bytes after the
        // 20-byte header decode the same way as the HTTP compact form.
        let mut response = vec![0u8; 20];
        response.extend_from_slice(&[0x7f, 0x00, 0x00, 0x01, 0x1a, 0xe1]);
        let peers = parse_compact_peers(&response[20..]);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].ip().to_string(), "127.0.0.1");
        assert_eq!(peers[0].port(), 6881);
    }
}
