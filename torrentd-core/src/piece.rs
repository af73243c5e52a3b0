//! A single piece: its blocks, in-memory reassembly buffer, and the
//! scan-first-unrequested selection strategy used to hand out the next
//! block to request.

use sha1::{Digest, Sha1};

use crate::block::{self, Block};
use crate::metainfo::SHA1_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Missing,
    InProgress,
    Complete,
}

#[derive(Debug, Clone)]
pub struct Piece {
    pub index: u32,
    pub expected_sha1: [u8; SHA1_LEN],
    pub length: u64,
    pub base_offset: u64,
    pub blocks: Vec<Block>,
    state: PieceState,
    /// Reassembly scratch space, released once the piece completes.
    buffer: Vec<u8>,
    blocks_received: usize,
}

impl Piece {
    pub fn new(index: u32, expected_sha1: [u8; SHA1_LEN], length: u64, base_offset: u64) -> Self {
        Piece {
            index,
            expected_sha1,
            length,
            base_offset,
            blocks: block::split_into_blocks(index, length),
            state: PieceState::Missing,
            buffer: vec![0u8; length as usize],
            blocks_received: 0,
        }
    }

    pub fn state(&self) -> PieceState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == PieceState::Complete
    }

    /// Marks this piece complete without going through block delivery, for
    /// resuming a torrent whose verify pass already confirmed it on disk.
    pub fn force_complete(&mut self) {
        for b in &mut self.blocks {
            b.is_received = true;
            b.is_requested = false;
        }
        self.blocks_received = self.blocks.len();
        self.buffer.clear();
        self.buffer.shrink_to_fit();
        self.state = PieceState::Complete;
    }

    /// First block that has neither been requested nor received, scanning
    /// in offset order. `None` once every block is requested or received.
    pub fn next_block(&mut self) -> Option<&mut Block> {
        self.blocks
            .iter_mut()
            .find(|b| !b.is_requested && !b.is_received)
    }

    pub fn all_blocks_received(&self) -> bool {
        self.blocks_received == self.blocks.len()
    }

    /// Locates the block at `offset`; ignored (returns `Ok(None)`) if no
    /// such block exists, the lengths disagree, or it was already received.
    /// Otherwise copies `data` into the reassembly buffer and marks the
    /// block received. Once every block has arrived, hashes the buffer:
    /// match -> piece becomes complete, buffer released, `Ok(Some(true))`;
    /// mismatch -> every block resets to unrequested, counter clears,
    /// `Ok(Some(false))`. While blocks remain outstanding, returns
    /// `Ok(Some(false))`.
    pub fn block_received(&mut self, offset: u32, data: &[u8]) -> Result<Option<bool>, ()> {
        let block_idx = self.blocks.iter().position(|b| b.offset == offset);
        let block_idx = match block_idx {
            Some(i) => i,
            None => return Ok(None),
        };
        let block = &self.blocks[block_idx];
        if data.len() as u32 != block.length || block.is_received {
            return Ok(None);
        }

        let start = offset as usize;
        let end = start + data.len();
        self.buffer[start..end].copy_from_slice(data);
        self.blocks[block_idx].mark_received();
        self.blocks_received += 1;
        self.state = PieceState::InProgress;

        if !self.all_blocks_received() {
            return Ok(Some(false));
        }

        let mut hasher = Sha1::new();
        hasher.update(&self.buffer);
        let digest: [u8; SHA1_LEN] = hasher.finalize().into();

        if digest == self.expected_sha1 {
            self.state = PieceState::Complete;
            self.buffer.clear();
            self.buffer.shrink_to_fit();
            Ok(Some(true))
        } else {
            for b in &mut self.blocks {
                b.reset();
                b.is_received = false;
            }
            self.blocks_received = 0;
            self.state = PieceState::Missing;
            Ok(Some(false))
        }
    }
}
