//! Availability tracking and rarest-first block scheduling across all
//! pieces of one torrent.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;

use crate::metainfo::Metainfo;
use crate::piece::Piece;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Identifies an in-flight block for the purposes of resolving it later
/// (mirrors what a `Piece`/offset pair already name; kept distinct so
/// callers don't have to reach into piece internals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub piece_index: u32,
    pub offset: u32,
}

pub struct PieceManager {
    pieces: Vec<Piece>,
    /// Piece index -> number of known peers that have it.
    availability: Vec<u32>,
    /// Peer id -> blocks currently requested from that peer.
    inflight_by_peer: HashMap<String, Vec<BlockRef>>,
    pub downloaded_bytes: u64,
    request_timeout: Duration,
}

impl PieceManager {
    pub fn new(meta: &Metainfo) -> Self {
        Self::with_request_timeout(meta, REQUEST_TIMEOUT)
    }

    /// Like [`Self::new`], but with a caller-supplied request timeout
    /// instead of the [`REQUEST_TIMEOUT`] default — lets the engine honor
    /// `Configuration::request_timeout` and lets tests shrink it instead of
    /// waiting on real wall-clock time.
    pub fn with_request_timeout(meta: &Metainfo, request_timeout: Duration) -> Self {
        let pieces = meta
            .pieces
            .iter()
            .enumerate()
            .map(|(i, hash)| {
                let base_offset = i as u64 * meta.piece_length;
                Piece::new(i as u32, *hash, meta.piece_len(i), base_offset)
            })
            .collect::<Vec<_>>();
        let availability = vec![0u32; pieces.len()];
        PieceManager {
            pieces,
            availability,
            inflight_by_peer: HashMap::new(),
            downloaded_bytes: 0,
            request_timeout,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece(&self, index: usize) -> &Piece {
        &self.pieces[index]
    }

    pub fn mark_complete(&mut self, index: usize) {
        self.pieces[index].force_complete();
    }

    pub fn all_complete(&self) -> bool {
        self.pieces.iter().all(Piece::is_complete)
    }

    pub fn completion_bitmap(&self) -> Vec<bool> {
        self.pieces.iter().map(Piece::is_complete).collect()
    }

    pub fn add_have(&mut self, index: usize) {
        if let Some(count) = self.availability.get_mut(index) {
            *count += 1;
        }
    }

    pub fn add_bitmap(&mut self, bitmap: &[bool]) {
        for (i, has) in bitmap.iter().enumerate().take(self.availability.len()) {
            if *has {
                self.availability[i] += 1;
            }
        }
    }

    /// Decrements availability for every piece in `last_bitmap`, saturating
    /// at zero, and forgets any in-flight accounting for `peer_id`.
    pub fn peer_disconnect(&mut self, peer_id: &str, last_bitmap: &[bool]) {
        for (i, has) in last_bitmap.iter().enumerate().take(self.availability.len()) {
            if *has {
                self.availability[i] = self.availability[i].saturating_sub(1);
            }
        }
        self.inflight_by_peer.remove(peer_id);
    }

    /// Returns every in-flight block of `peer_id` to the unrequested state
    /// and clears its in-flight list.
    pub fn on_choke(&mut self, peer_id: &str) {
        if let Some(blocks) = self.inflight_by_peer.remove(peer_id) {
            for block_ref in blocks {
                if let Some(piece) = self.pieces.get_mut(block_ref.piece_index as usize) {
                    if let Some(block) = piece
                        .blocks
                        .iter_mut()
                        .find(|b| b.offset == block_ref.offset)
                    {
                        block.reset();
                    }
                }
            }
        }
    }

    /// Simple first-fit selection, used only in tests as a baseline against
    /// the rarest-first strategy.
    pub fn next_request(&mut self, peer_id: &str, peer_bitmap: &[bool]) -> Option<BlockRef> {
        for (i, piece) in self.pieces.iter_mut().enumerate() {
            if piece.is_complete() || !peer_bitmap.get(i).copied().unwrap_or(false) {
                continue;
            }
            if let Some(block) = piece.next_block() {
                let block_ref = BlockRef {
                    piece_index: block.piece_index,
                    offset: block.offset,
                };
                block.mark_requested(Instant::now());
                self.inflight_by_peer
                    .entry(peer_id.to_string())
                    .or_default()
                    .push(block_ref);
                return Some(block_ref);
            }
        }
        None
    }

    /// Rarest-first selection: among incomplete pieces the peer has, prefer
    /// those with the lowest known availability, breaking ties uniformly at
    /// random; falls back to any free block if every rarest piece has none.
    pub fn next_request_rarest_first(
        &mut self,
        peer_id: &str,
        peer_bitmap: &[bool],
    ) -> Option<BlockRef> {
        let mut candidates: Vec<usize> = (0..self.pieces.len())
            .filter(|&i| !self.pieces[i].is_complete() && peer_bitmap.get(i).copied().unwrap_or(false))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let min_availability = candidates
            .iter()
            .map(|&i| self.availability[i])
            .min()
            .unwrap_or(0);
        let mut rarest: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|&i| self.availability[i] == min_availability)
            .collect();
        rarest.shuffle(&mut rand::thread_rng());

        if let Some(block_ref) = self.try_blocks_from(&rarest, peer_id) {
            return Some(block_ref);
        }

        candidates.shuffle(&mut rand::thread_rng());
        self.try_blocks_from(&candidates, peer_id)
    }

    fn try_blocks_from(&mut self, indices: &[usize], peer_id: &str) -> Option<BlockRef> {
        for &i in indices {
            let piece = &mut self.pieces[i];
            if let Some(block) = piece.next_block() {
                let block_ref = BlockRef {
                    piece_index: block.piece_index,
                    offset: block.offset,
                };
                block.mark_requested(Instant::now());
                self.inflight_by_peer
                    .entry(peer_id.to_string())
                    .or_default()
                    .push(block_ref);
                return Some(block_ref);
            }
        }
        None
    }

    /// Forwards to the owning piece; on acceptance (whether or not the
    /// piece is yet complete) credits `data.len()` to `downloaded_bytes`,
    /// including bytes belonging to pieces that later fail verification.
    /// Returns `None` if the block was ignored (unknown offset, wrong
    /// length, or already received); otherwise `Some(true)` once the piece
    /// completes and verifies, `Some(false)` otherwise.
    pub fn block_received(
        &mut self,
        peer_id: &str,
        piece_index: u32,
        offset: u32,
        data: &[u8],
    ) -> Option<bool> {
        let piece = self.pieces.get_mut(piece_index as usize)?;
        let result = piece.block_received(offset, data).ok()??;
        self.downloaded_bytes += data.len() as u64;
        if let Some(blocks) = self.inflight_by_peer.get_mut(peer_id) {
            blocks.retain(|b| !(b.piece_index == piece_index && b.offset == offset));
        }
        Some(result)
    }

    /// Scans for blocks requested but not received for at least the
    /// configured request timeout and resets them so they can be
    /// rescheduled.
    pub fn tick(&mut self, now: Instant) {
        for piece in &mut self.pieces {
            for block in &mut piece.blocks {
                if block.is_timed_out(now, self.request_timeout) {
                    block.reset();
                }
            }
        }
        for blocks in self.inflight_by_peer.values_mut() {
            blocks.retain(|block_ref| {
                self.pieces[block_ref.piece_index as usize]
                    .blocks
                    .iter()
                    .find(|b| b.offset == block_ref.offset)
                    .map(|b| b.is_requested)
                    .unwrap_or(false)
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, Value};
    use std::collections::BTreeMap;

    fn meta_with_pieces(n: usize, piece_length: u64) -> Metainfo {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::Text("t".into()));
        info.insert(b"piece length".to_vec(), Value::Int(piece_length as i64));
        info.insert(
            b"pieces".to_vec(),
            Value::Bytes(vec![0u8; n * crate::metainfo::SHA1_LEN]),
        );
        info.insert(
            b"length".to_vec(),
            Value::Int((n as u64 * piece_length) as i64),
        );
        let mut top = BTreeMap::new();
        top.insert(b"announce".to_vec(), Value::Text("http://t/a".into()));
        top.insert(b"info".to_vec(), Value::Dict(info));
        Metainfo::from_bytes(&bencode::encode(&Value::Dict(top))).unwrap()
    }

    #[test]
    fn availability_never_goes_negative() {
        let meta = meta_with_pieces(2, 16);
        let mut pm = PieceManager::new(&meta);
        pm.peer_disconnect("p1", &[true, true]);
        assert_eq!(pm.availability, vec![0, 0]);
        pm.add_have(0);
        pm.peer_disconnect("p1", &[true, true]);
        assert_eq!(pm.availability, vec![0, 0]);
    }

    #[test]
    fn rarest_first_prefers_lowest_availability() {
        // Scenario 5 from the spec: availabilities {0:3, 1:2, 2:1}.
        let meta = meta_with_pieces(3, 16);
        let mut pm = PieceManager::new(&meta);
        for _ in 0..3 {
            pm.add_have(0);
        }
        for _ in 0..2 {
            pm.add_have(1);
        }
        pm.add_have(2);

        let bitmap = vec![true, true, true];
        let block_ref = pm.next_request_rarest_first("peer-a", &bitmap).unwrap();
        assert_eq!(block_ref.piece_index, 2);
    }

    #[test]
    fn rarest_first_falls_back_when_rarest_exhausted() {
        let meta = meta_with_pieces(2, 16);
        let mut pm = PieceManager::new(&meta);
        pm.add_have(1); // piece 0 is rarest (availability 0)
        let bitmap = vec![true, true];

        // Exhaust piece 0's only block directly from a different peer.
        pm.next_request_rarest_first("other", &bitmap);
        // Piece 0 has no free blocks left; must fall back to piece 1.
        let block_ref = pm.next_request_rarest_first("peer-a", &bitmap).unwrap();
        assert_eq!(block_ref.piece_index, 1);
    }

    #[test]
    fn on_choke_releases_inflight_blocks() {
        let meta = meta_with_pieces(1, 16);
        let mut pm = PieceManager::new(&meta);
        let block_ref = pm.next_request("peer-a", &[true]).unwrap();
        assert!(pm.pieces[0].blocks[0].is_requested);
        pm.on_choke("peer-a");
        assert!(!pm.pieces[block_ref.piece_index as usize].blocks[0].is_requested);
    }

    #[test]
    fn tick_resets_timed_out_blocks() {
        let meta = meta_with_pieces(1, 16);
        let mut pm = PieceManager::new(&meta);
        pm.next_request("peer-a", &[true]);
        let later = Instant::now() + REQUEST_TIMEOUT + Duration::from_secs(1);
        pm.tick(later);
        assert!(!pm.pieces[0].blocks[0].is_requested);
    }

    #[test]
    fn block_received_credits_downloaded_bytes_even_on_mismatch() {
        let meta = meta_with_pieces(1, 16);
        let mut pm = PieceManager::new(&meta);
        let data = vec![0xAAu8; 16];
        let verified = pm.block_received("peer-a", 0, 0, &data);
        assert_eq!(verified, Some(false)); // expected hash is all-zero, won't match
        assert_eq!(pm.downloaded_bytes, 16);
    }
}
