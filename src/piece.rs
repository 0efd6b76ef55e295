//! Piece store
//!
//! Per-piece buffers with per-block bookkeeping. Incoming blocks are
//! copied into place, completed pieces are verified against their
//! published SHA-1 hash, written to the output file, and reflected in
//! our bitfield. A piece that fails verification is reset so its blocks
//! become eligible for re-request.

use std::sync::Arc;

use bitvec::prelude::*;
use sha1::{Digest, Sha1};

use crate::error::{ClientError, ProtocolErrorKind, Result};
use crate::metainfo::{Sha1Hash, TorrentMeta};
use crate::storage::PieceFile;
use crate::wire::BLOCK_SIZE;

fn block_error(message: impl Into<String>) -> ClientError {
    ClientError::protocol(ProtocolErrorKind::PeerProtocol, message)
}

/// Buffer for one piece being assembled
#[derive(Debug)]
pub struct PieceBuffer {
    /// Piece length in bytes (the last piece may be shorter)
    length: u32,
    /// Assembled data, zero-initialized
    data: Vec<u8>,
    /// Per-block receipt flags
    received: Vec<bool>,
    /// Per-block in-flight request flags
    requested: Vec<bool>,
    /// Count of received blocks
    blocks_done: usize,
    /// Hash check passed
    verified: bool,
}

impl PieceBuffer {
    fn new(length: u32) -> Self {
        let num_blocks = (length as usize).div_ceil(BLOCK_SIZE as usize);
        Self {
            length,
            data: vec![0; length as usize],
            received: vec![false; num_blocks],
            requested: vec![false; num_blocks],
            blocks_done: 0,
            verified: false,
        }
    }

    /// Number of blocks in this piece
    pub fn num_blocks(&self) -> usize {
        self.received.len()
    }

    /// Length of the given block (the last block may be shorter)
    pub fn block_length(&self, block: usize) -> u32 {
        let begin = block as u32 * BLOCK_SIZE;
        BLOCK_SIZE.min(self.length - begin)
    }

    /// All blocks received (piece is ready for verification)
    pub fn is_filled(&self) -> bool {
        self.blocks_done == self.num_blocks()
    }

    fn reset(&mut self) {
        self.data.fill(0);
        self.received.fill(false);
        self.requested.fill(false);
        self.blocks_done = 0;
        self.verified = false;
    }
}

/// Store for all pieces of one torrent
pub struct PieceStore {
    meta: Arc<TorrentMeta>,
    pieces: Vec<PieceBuffer>,
    complete: Vec<bool>,
    /// Our bitfield: bit i set iff piece i is verified and written
    have: BitVec<u8, Msb0>,
    file: PieceFile,
    bytes_downloaded: u64,
    verified_bytes: u64,
    /// Last 10%-rounded progress value logged
    last_progress: u64,
}

impl PieceStore {
    /// Create a store with zeroed buffers and the output file at `path`
    pub async fn create(meta: Arc<TorrentMeta>, path: impl Into<std::path::PathBuf>) -> Result<Self> {
        let file = PieceFile::create(path, meta.piece_length).await?;
        let num_pieces = meta.num_pieces();

        let pieces = (0..num_pieces)
            .map(|i| {
                let length = meta.piece_length_at(i).unwrap_or(0);
                PieceBuffer::new(length)
            })
            .collect();

        Ok(Self {
            meta,
            pieces,
            complete: vec![false; num_pieces],
            have: bitvec![u8, Msb0; 0; num_pieces],
            file,
            bytes_downloaded: 0,
            verified_bytes: 0,
            last_progress: 0,
        })
    }

    /// Total number of pieces
    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Do we have (verified and written) the given piece?
    pub fn have_piece(&self, index: usize) -> bool {
        self.complete.get(index).copied().unwrap_or(false)
    }

    /// All pieces verified
    pub fn is_complete(&self) -> bool {
        self.complete.iter().all(|&c| c)
    }

    /// Our bitfield
    pub fn bitfield(&self) -> &BitVec<u8, Msb0> {
        &self.have
    }

    /// Raw bitfield bytes for the wire (ceil(N/8) bytes, spare bits zero)
    pub fn bitfield_bytes(&self) -> Vec<u8> {
        self.have.as_raw_slice().to_vec()
    }

    /// Path of the output file
    pub fn output_path(&self) -> &std::path::Path {
        self.file.path()
    }

    /// Total bytes accepted from peers
    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded
    }

    /// Bytes not yet verified (the tracker's "left" value)
    pub fn bytes_remaining(&self) -> u64 {
        self.meta.length.saturating_sub(self.verified_bytes)
    }

    /// Buffer accessors for the scheduler
    pub fn piece(&self, index: usize) -> Option<&PieceBuffer> {
        self.pieces.get(index)
    }

    /// Is block `b` of piece `index` already received?
    pub fn is_block_received(&self, index: u32, block: u32) -> bool {
        self.pieces
            .get(index as usize)
            .and_then(|p| p.received.get(block as usize))
            .copied()
            .unwrap_or(false)
    }

    /// Is block `b` of piece `index` requested and in flight?
    pub fn is_block_requested(&self, index: u32, block: u32) -> bool {
        self.pieces
            .get(index as usize)
            .and_then(|p| p.requested.get(block as usize))
            .copied()
            .unwrap_or(false)
    }

    /// Mark a block as requested (in flight to some peer)
    pub fn mark_requested(&mut self, index: u32, block: u32) {
        if let Some(piece) = self.pieces.get_mut(index as usize) {
            if let Some(flag) = piece.requested.get_mut(block as usize) {
                *flag = true;
            }
        }
    }

    /// Release a request flag so the block becomes eligible again.
    ///
    /// Used when the requesting session is choked or dropped. A block
    /// that was received in the meantime keeps its state.
    pub fn clear_requested(&mut self, index: u32, block: u32) {
        if let Some(piece) = self.pieces.get_mut(index as usize) {
            let b = block as usize;
            if b < piece.received.len() && !piece.received[b] {
                piece.requested[b] = false;
            }
        }
    }

    /// Accept a block received from a peer.
    ///
    /// Returns `Ok(true)` when this block filled the piece (all blocks
    /// present, verification pending). Duplicate blocks are ignored.
    /// Fails on an out-of-range index, a misaligned offset, or a block
    /// that overruns the piece.
    pub fn accept_block(&mut self, index: u32, begin: u32, block: &[u8]) -> Result<bool> {
        let piece = self
            .pieces
            .get_mut(index as usize)
            .ok_or_else(|| block_error(format!("block for unknown piece {}", index)))?;

        let end = begin as u64 + block.len() as u64;
        if block.is_empty() || end > piece.length as u64 {
            return Err(block_error(format!(
                "block out of bounds: piece={} begin={} len={}",
                index,
                begin,
                block.len()
            )));
        }
        if begin % BLOCK_SIZE != 0 && end != piece.length as u64 {
            return Err(block_error(format!(
                "misaligned block offset {} for piece {}",
                begin, index
            )));
        }

        let b = (begin / BLOCK_SIZE) as usize;
        if b >= piece.num_blocks() {
            return Err(block_error(format!(
                "block index {} out of range for piece {}",
                b, index
            )));
        }

        if piece.received[b] {
            return Ok(false);
        }

        piece.data[begin as usize..end as usize].copy_from_slice(block);
        piece.received[b] = true;
        piece.requested[b] = false;
        piece.blocks_done += 1;
        self.bytes_downloaded += block.len() as u64;

        Ok(piece.is_filled())
    }

    /// Verify a filled piece and commit it to disk.
    ///
    /// On a hash match the piece is written at its final offset, our
    /// bitfield is updated, and `Ok(true)` is returned. On a mismatch
    /// the buffer is zeroed and all block flags cleared so the piece
    /// will be re-requested; returns `Ok(false)`.
    pub async fn verify_and_commit(&mut self, index: u32) -> Result<bool> {
        let expected = *self
            .meta
            .piece_hash(index as usize)
            .ok_or_else(|| block_error(format!("no hash for piece {}", index)))?;

        let piece = self
            .pieces
            .get_mut(index as usize)
            .ok_or_else(|| block_error(format!("unknown piece {}", index)))?;
        if !piece.is_filled() {
            return Err(block_error(format!("piece {} is not filled", index)));
        }

        let mut hasher = Sha1::new();
        hasher.update(&piece.data);
        let actual: Sha1Hash = hasher.finalize().into();

        if actual != expected {
            tracing::warn!("piece {} failed hash verification, resetting", index);
            piece.reset();
            return Ok(false);
        }

        piece.verified = true;
        self.file.write_piece(index, &piece.data).await?;
        self.complete[index as usize] = true;
        self.have.set(index as usize, true);
        self.verified_bytes += self.pieces[index as usize].length as u64;

        tracing::debug!("piece {} verified and written", index);
        self.log_progress();

        Ok(true)
    }

    /// Read a block of a completed piece for serving to a peer.
    ///
    /// Returns `None` when the piece is not complete or the range is
    /// out of bounds.
    pub fn read_block(&self, index: u32, begin: u32, length: u32) -> Option<&[u8]> {
        if !self.have_piece(index as usize) {
            return None;
        }
        let piece = self.pieces.get(index as usize)?;
        let end = begin.checked_add(length)?;
        if end > piece.length {
            return None;
        }
        Some(&piece.data[begin as usize..end as usize])
    }

    fn log_progress(&mut self) {
        let total = self.num_pieces() as u64;
        if total == 0 {
            return;
        }
        let done = self.complete.iter().filter(|&&c| c).count() as u64;
        let percent = done * 100 / total;

        if percent >= self.last_progress + 10 || percent == 100 {
            self.last_progress = percent / 10 * 10;
            tracing::info!(
                "progress: {}% ({}/{} pieces)",
                self.last_progress,
                done,
                total
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_meta(data: &[u8], piece_length: u64) -> Arc<TorrentMeta> {
        let pieces = data
            .chunks(piece_length as usize)
            .map(|chunk| {
                let mut hasher = Sha1::new();
                hasher.update(chunk);
                hasher.finalize().into()
            })
            .collect();

        Arc::new(TorrentMeta {
            info_hash: [7; 20],
            name: "test.bin".to_string(),
            length: data.len() as u64,
            piece_length,
            pieces,
            announce: None,
        })
    }

    async fn make_store(data: &[u8], piece_length: u64) -> (PieceStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let meta = make_meta(data, piece_length);
        let store = PieceStore::create(meta, dir.path().join("out.bin"))
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_single_block_piece() {
        let content = vec![0x5A; 32];
        let (mut store, dir) = make_store(&content, 32).await;

        assert_eq!(store.piece(0).unwrap().num_blocks(), 1);
        assert!(store.accept_block(0, 0, &content).unwrap());
        assert!(store.verify_and_commit(0).await.unwrap());

        assert!(store.is_complete());
        assert!(store.have_piece(0));
        assert_eq!(store.bitfield_bytes(), vec![0x80]);
        assert_eq!(
            tokio::fs::read(dir.path().join("out.bin")).await.unwrap(),
            content
        );
    }

    #[tokio::test]
    async fn test_accept_block_is_idempotent() {
        let content: Vec<u8> = (0..20000u32).map(|i| (i % 251) as u8).collect();
        let (mut store, _dir) = make_store(&content, 20000).await;

        // Two blocks: 16384 + 3616
        assert!(!store.accept_block(0, 0, &content[..16384]).unwrap());
        let downloaded = store.bytes_downloaded();

        // Same block again: no state change, no double counting
        assert!(!store.accept_block(0, 0, &content[..16384]).unwrap());
        assert_eq!(store.bytes_downloaded(), downloaded);

        assert!(store.accept_block(0, 16384, &content[16384..]).unwrap());
        assert_eq!(store.bytes_downloaded(), 20000);
    }

    #[tokio::test]
    async fn test_hash_mismatch_resets_piece() {
        let content = vec![0x11; 32];
        let (mut store, _dir) = make_store(&content, 32).await;

        assert!(store.accept_block(0, 0, &[0xFF; 32]).unwrap());
        assert!(!store.verify_and_commit(0).await.unwrap());

        // Fully reset: not complete, blocks re-eligible
        assert!(!store.have_piece(0));
        assert!(!store.is_block_received(0, 0));
        assert!(!store.is_block_requested(0, 0));

        // Correct data is accepted after the reset
        assert!(store.accept_block(0, 0, &content).unwrap());
        assert!(store.verify_and_commit(0).await.unwrap());
        assert!(store.is_complete());
    }

    #[tokio::test]
    async fn test_rejects_invalid_blocks() {
        let content = vec![1; 40000];
        let (mut store, _dir) = make_store(&content, 40000).await;

        // Unknown piece
        assert!(store.accept_block(9, 0, &[0; 16]).is_err());
        // Overrun
        assert!(store.accept_block(0, 32768, &[0; 16384]).is_err());
        // Misaligned offset that is not the piece tail
        assert!(store.accept_block(0, 100, &[0; 100]).is_err());
    }

    #[tokio::test]
    async fn test_request_flags() {
        let content = vec![2; 50000];
        let (mut store, _dir) = make_store(&content, 50000).await;

        store.mark_requested(0, 1);
        assert!(store.is_block_requested(0, 1));

        store.clear_requested(0, 1);
        assert!(!store.is_block_requested(0, 1));

        // Receipt clears the flag on its own
        store.mark_requested(0, 0);
        store.accept_block(0, 0, &content[..16384]).unwrap();
        assert!(!store.is_block_requested(0, 0));
        assert!(store.is_block_received(0, 0));
    }

    #[tokio::test]
    async fn test_read_block_requires_complete_piece() {
        let content = vec![0xAB; 32];
        let (mut store, _dir) = make_store(&content, 32).await;

        assert!(store.read_block(0, 0, 16).is_none());

        store.accept_block(0, 0, &content).unwrap();
        store.verify_and_commit(0).await.unwrap();

        assert_eq!(store.read_block(0, 0, 16), Some(&content[..16]));
        assert_eq!(store.read_block(0, 16, 16), Some(&content[16..]));
        assert!(store.read_block(0, 17, 16).is_none());
        assert!(store.read_block(1, 0, 1).is_none());
    }

    #[tokio::test]
    async fn test_short_last_block_geometry() {
        let content = vec![9; 20000];
        let (store, _dir) = make_store(&content, 20000).await;

        let piece = store.piece(0).unwrap();
        assert_eq!(piece.num_blocks(), 2);
        assert_eq!(piece.block_length(0), 16384);
        assert_eq!(piece.block_length(1), 3616);
    }
}
