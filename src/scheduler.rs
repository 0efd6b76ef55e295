//! Block request scheduler
//!
//! Decides which (piece, block) to request next from a peer and keeps
//! each session's pipeline full. Selection is deterministic: ascending
//! piece index, then ascending block index, first eligible block wins.
//! A block is eligible when its piece is incomplete, the peer has the
//! piece, and the block is neither received nor already in flight.

use crate::peer::PeerSession;
use crate::piece::PieceStore;
use crate::wire::{Message, BLOCK_SIZE};

/// Issue REQUESTs to `session` until its pipeline is full or no
/// eligible block remains. Returns the number of requests queued.
pub fn fill_pipeline(session: &mut PeerSession, store: &mut PieceStore) -> usize {
    if !session.is_active() || session.peer_choking() || !session.am_interested() {
        return 0;
    }

    let mut queued = 0;
    while session.outstanding() < session.max_pipeline() {
        let Some((piece, block)) = next_eligible(session, store) else {
            break;
        };

        let begin = block * BLOCK_SIZE;
        let length = store
            .piece(piece as usize)
            .map(|p| p.block_length(block as usize))
            .unwrap_or(BLOCK_SIZE);

        store.mark_requested(piece, block);
        session.queue(&Message::Request {
            index: piece,
            begin,
            length,
        });
        session.record_request(piece, block);
        queued += 1;
    }

    if queued > 0 {
        tracing::trace!(
            "queued {} requests to {} (outstanding {})",
            queued,
            session.addr(),
            session.outstanding()
        );
    }
    queued
}

/// First eligible (piece, block) for this peer, in ascending order
fn next_eligible(session: &PeerSession, store: &PieceStore) -> Option<(u32, u32)> {
    for index in 0..store.num_pieces() {
        if store.have_piece(index) || !session.has_piece(index) {
            continue;
        }
        let piece = store.piece(index)?;
        for block in 0..piece.num_blocks() {
            let (i, b) = (index as u32, block as u32);
            if !store.is_block_received(i, b) && !store.is_block_requested(i, b) {
                return Some((i, b));
            }
        }
    }
    None
}

/// Does the peer have any piece we still lack?
pub fn peer_has_needed(session: &PeerSession, store: &PieceStore) -> bool {
    (0..store.num_pieces()).any(|i| !store.have_piece(i) && session.has_piece(i))
}

/// Recompute interest in this peer; queue INTERESTED/NOT_INTERESTED if
/// our state changed. Returns whether we are now interested.
pub fn update_interest(session: &mut PeerSession, store: &PieceStore) -> bool {
    let interested = peer_has_needed(session, store);
    session.set_am_interested(interested);
    interested
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::TorrentMeta;
    use sha1::{Digest, Sha1};
    use std::sync::Arc;

    fn make_meta(length: u64, piece_length: u64) -> Arc<TorrentMeta> {
        let num_pieces = length.div_ceil(piece_length) as usize;
        let hash: [u8; 20] = {
            let mut hasher = Sha1::new();
            hasher.update(b"placeholder");
            hasher.finalize().into()
        };
        Arc::new(TorrentMeta {
            info_hash: [1; 20],
            name: "t".to_string(),
            length,
            piece_length,
            pieces: vec![hash; num_pieces],
            announce: None,
        })
    }

    async fn make_store(length: u64, piece_length: u64) -> (PieceStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::create(make_meta(length, piece_length), dir.path().join("out"))
            .await
            .unwrap();
        (store, dir)
    }

    fn unchoked_session(num_pieces: usize) -> PeerSession {
        let mut session = PeerSession::detached(num_pieces);
        session.set_peer_choking(false);
        session
    }

    #[tokio::test]
    async fn test_requests_ascend_piece_then_block() {
        // Two pieces of two blocks each: 2 * (16384 + 3616)
        let (mut store, _dir) = make_store(2 * 20000, 20000).await;
        let mut session = unchoked_session(2);
        session.replace_bitfield(&[0b1100_0000]);
        update_interest(&mut session, &store);

        let queued = fill_pipeline(&mut session, &mut store);
        assert_eq!(queued, 4);

        // Every block is now flagged, in order
        for (piece, block) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            assert!(store.is_block_requested(piece, block));
        }
        assert_eq!(session.outstanding(), 4);

        // Nothing left to request
        assert_eq!(fill_pipeline(&mut session, &mut store), 0);
    }

    #[tokio::test]
    async fn test_short_final_block_length() {
        let (mut store, _dir) = make_store(20000, 20000).await;
        let mut session = unchoked_session(1);
        session.replace_bitfield(&[0b1000_0000]);
        update_interest(&mut session, &store);

        fill_pipeline(&mut session, &mut store);

        let piece = store.piece(0).unwrap();
        assert_eq!(piece.block_length(0), 16384);
        assert_eq!(piece.block_length(1), 3616);
    }

    #[tokio::test]
    async fn test_pipeline_cap() {
        // 64 blocks available, cap is 50
        let piece_len = 32 * BLOCK_SIZE as u64;
        let (mut store, _dir) = make_store(2 * piece_len, piece_len).await;
        let mut session = unchoked_session(2);
        session.replace_bitfield(&[0b1100_0000]);
        update_interest(&mut session, &store);

        let queued = fill_pipeline(&mut session, &mut store);
        assert_eq!(queued, 50);
        assert_eq!(session.outstanding(), 50);
        assert_eq!(fill_pipeline(&mut session, &mut store), 0);
    }

    #[tokio::test]
    async fn test_respects_choke_and_peer_bitfield() {
        let (mut store, _dir) = make_store(2 * 16384, 16384).await;

        // Choked: nothing is requested
        let mut session = PeerSession::detached(2);
        session.replace_bitfield(&[0b1100_0000]);
        update_interest(&mut session, &store);
        assert_eq!(fill_pipeline(&mut session, &mut store), 0);

        // Unchoked but the peer only has piece 1
        let mut session = unchoked_session(2);
        session.replace_bitfield(&[0b0100_0000]);
        update_interest(&mut session, &store);
        assert_eq!(fill_pipeline(&mut session, &mut store), 1);
        assert!(!store.is_block_requested(0, 0));
        assert!(store.is_block_requested(1, 0));
    }

    #[tokio::test]
    async fn test_blocks_in_flight_elsewhere_are_skipped() {
        let (mut store, _dir) = make_store(2 * 16384, 16384).await;
        store.mark_requested(0, 0);

        let mut session = unchoked_session(2);
        session.replace_bitfield(&[0b1100_0000]);
        update_interest(&mut session, &store);

        assert_eq!(fill_pipeline(&mut session, &mut store), 1);
        assert_eq!(session.outstanding(), 1);
        assert!(store.is_block_requested(1, 0));
    }

    #[tokio::test]
    async fn test_interest_tracks_peer_bitfield() {
        // Store built over real content so a piece can actually complete
        let content = vec![0x42u8; 2 * 16384];
        let pieces = content
            .chunks(16384)
            .map(|chunk| {
                let mut hasher = Sha1::new();
                hasher.update(chunk);
                hasher.finalize().into()
            })
            .collect();
        let meta = Arc::new(TorrentMeta {
            info_hash: [1; 20],
            name: "t".to_string(),
            length: content.len() as u64,
            piece_length: 16384,
            pieces,
            announce: None,
        });
        let dir = tempfile::tempdir().unwrap();
        let mut store = PieceStore::create(meta, dir.path().join("out"))
            .await
            .unwrap();

        let mut session = PeerSession::detached(2);

        // Peer has nothing: not interested
        assert!(!update_interest(&mut session, &store));
        assert!(!session.am_interested());

        // Peer announces a piece we lack
        session.set_peer_bit(1);
        assert!(update_interest(&mut session, &store));
        assert!(session.am_interested());

        // We complete that piece: interest is withdrawn
        store.accept_block(1, 0, &content[16384..]).unwrap();
        assert!(store.verify_and_commit(1).await.unwrap());
        assert!(!update_interest(&mut session, &store));
        assert!(!session.am_interested());
    }
}
