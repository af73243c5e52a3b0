//! A single peer's connection state: the choke/interest matrix, bitmap,
//! in-flight accounting, and rate samples, layered over a framed TCP
//! socket.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::error::PeerIoError;
use crate::metainfo::SHA1_LEN;
use crate::peer::bitfield::Bitfield;
use crate::peer::message::{Message, MessageCodec};

pub const MAX_INFLIGHT: u32 = 40;
const RATE_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
struct RateSample {
    at: Instant,
    down_bytes: u64,
    up_bytes: u64,
}

pub struct PeerConnection {
    pub addr: SocketAddr,
    pub local_peer_id: [u8; 20],
    pub remote_peer_id: [u8; 20],
    framed: Framed<TcpStream, MessageCodec>,
    pub active: bool,

    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,

    pub bitmap: Bitfield,
    pub inflight: u32,

    samples: VecDeque<RateSample>,
    pub total_downloaded: u64,
    pub total_uploaded: u64,
}

impl PeerConnection {
    pub fn new(
        addr: SocketAddr,
        stream: TcpStream,
        local_peer_id: [u8; 20],
        remote_peer_id: [u8; 20],
        num_pieces: usize,
    ) -> Self {
        PeerConnection {
            addr,
            local_peer_id,
            remote_peer_id,
            framed: Framed::new(stream, MessageCodec),
            active: true,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitmap: Bitfield::new(num_pieces),
            inflight: 0,
            samples: VecDeque::new(),
            total_downloaded: 0,
            total_uploaded: 0,
        }
    }

    pub fn ensure_bitmap(&mut self, num_pieces: usize) {
        self.bitmap.ensure_len(num_pieces);
    }

    pub async fn recv(&mut self) -> Result<Message, PeerIoError> {
        match self.framed.next().await {
            Some(Ok(msg)) => {
                match &msg {
                    Message::Piece { block, .. } => {
                        self.inflight = self.inflight.saturating_sub(1);
                        self.record_down(block.len() as u64);
                    }
                    Message::Choke => self.inflight = 0,
                    _ => {}
                }
                Ok(msg)
            }
            Some(Err(e)) => Err(e),
            None => Err(PeerIoError::Closed),
        }
    }

    async fn send(&mut self, message: Message) -> Result<(), PeerIoError> {
        self.framed.send(message).await
    }

    pub async fn send_choke(&mut self) -> Result<(), PeerIoError> {
        self.send(Message::Choke).await
    }

    pub async fn send_unchoke(&mut self) -> Result<(), PeerIoError> {
        self.send(Message::Unchoke).await
    }

    pub async fn send_interested(&mut self) -> Result<(), PeerIoError> {
        self.send(Message::Interested).await
    }

    pub async fn send_not_interested(&mut self) -> Result<(), PeerIoError> {
        self.send(Message::NotInterested).await
    }

    pub async fn send_have(&mut self, index: u32) -> Result<(), PeerIoError> {
        self.send(Message::Have { index }).await
    }

    pub async fn send_bitfield(&mut self, bits: Vec<u8>) -> Result<(), PeerIoError> {
        self.send(Message::Bitfield { bits }).await
    }

    /// Rate-limited: refuses to send (returns `false`, no message sent) if
    /// the in-flight cap is reached or the connection is inactive.
    pub async fn send_request(
        &mut self,
        index: u32,
        begin: u32,
        length: u32,
    ) -> Result<bool, PeerIoError> {
        if !self.active || self.inflight >= MAX_INFLIGHT {
            return Ok(false);
        }
        self.send(Message::Request { index, begin, length }).await?;
        self.inflight += 1;
        Ok(true)
    }

    pub async fn send_piece(&mut self, index: u32, begin: u32, block: Vec<u8>) -> Result<(), PeerIoError> {
        let len = block.len() as u64;
        self.send(Message::Piece { index, begin, block }).await?;
        self.record_up(len);
        Ok(())
    }

    pub async fn send_cancel(&mut self, index: u32, begin: u32, length: u32) -> Result<(), PeerIoError> {
        self.send(Message::Cancel { index, begin, length }).await
    }

    fn record_down(&mut self, bytes: u64) {
        self.total_downloaded += bytes;
        self.push_sample(bytes, 0);
    }

    fn record_up(&mut self, bytes: u64) {
        self.total_uploaded += bytes;
        self.push_sample(0, bytes);
    }

    fn push_sample(&mut self, down_bytes: u64, up_bytes: u64) {
        let now = Instant::now();
        self.samples.push_back(RateSample {
            at: now,
            down_bytes,
            up_bytes,
        });
        self.trim_samples(now);
    }

    fn trim_samples(&mut self, now: Instant) {
        while let Some(front) = self.samples.front() {
            if now.duration_since(front.at) > RATE_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes/sec over the retained window; 0 if fewer than two samples or
    /// the span is under 2 s (avoids jitter immediately after startup).
    pub fn down_speed_bps(&self, now: Instant) -> f64 {
        self.windowed_rate(now, |s| s.down_bytes, true)
    }

    /// Unlike `down_speed_bps`, returns a value from a single sample —
    /// preserved from the source's asymmetric behavior.
    pub fn up_speed_bps(&self, now: Instant) -> f64 {
        self.windowed_rate(now, |s| s.up_bytes, false)
    }

    fn windowed_rate(&self, now: Instant, extract: impl Fn(&RateSample) -> u64, require_two: bool) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        if require_two && self.samples.len() < 2 {
            return 0.0;
        }
        let oldest = self.samples.front().unwrap();
        let span = now.saturating_duration_since(oldest.at).as_secs_f64();
        if require_two && span < 2.0 {
            return 0.0;
        }
        let total: u64 = self.samples.iter().map(&extract).sum();
        if span <= 0.0 {
            return total as f64;
        }
        total as f64 / span
    }

    pub fn close(&mut self) {
        self.active = false;
    }
}

pub async fn connect(
    addr: SocketAddr,
    info_hash: &[u8; SHA1_LEN],
    local_peer_id: &[u8; 20],
    num_pieces: usize,
    handshake_timeout: Duration,
) -> Result<PeerConnection, crate::error::HandshakeError> {
    let mut stream = tokio::time::timeout(handshake_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| crate::error::HandshakeError::Timeout)??;
    let remote_id =
        crate::peer::handshake::perform(&mut stream, info_hash, local_peer_id, handshake_timeout).await?;
    stream.set_nodelay(true).ok();
    Ok(PeerConnection::new(addr, stream, *local_peer_id, remote_id, num_pieces))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_cap_is_enforced_by_construction() {
        // send_request needs a live socket; the invariant it enforces
        // (inflight <= MAX_INFLIGHT, unchanged on refusal) is exercised at
        // the message-codec and piece-manager layers, and end-to-end in
        // the engine's integration tests.
        assert_eq!(MAX_INFLIGHT, 40);
    }

    #[test]
    fn rate_window_trims_old_samples() {
        let mut samples = VecDeque::new();
        let old = Instant::now();
        samples.push_back(RateSample {
            at: old,
            down_bytes: 10,
            up_bytes: 0,
        });
        let now = old + Duration::from_secs(11);
        samples.retain(|s| now.duration_since(s.at) <= RATE_WINDOW);
        assert!(samples.is_empty());
    }
}
