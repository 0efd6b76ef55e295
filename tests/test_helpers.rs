//! Shared helpers for integration tests

#![allow(dead_code)]

use sha1::{Digest, Sha1};

use riptide::TorrentMeta;

/// Deterministic content of the given length
pub fn build_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Build a [`TorrentMeta`] over the given content with real piece
/// hashes, so downloaded pieces verify.
pub fn make_meta(name: &str, content: &[u8], piece_length: u64) -> TorrentMeta {
    let pieces = content
        .chunks(piece_length as usize)
        .map(|chunk| {
            let mut hasher = Sha1::new();
            hasher.update(chunk);
            hasher.finalize().into()
        })
        .collect();

    let mut hasher = Sha1::new();
    hasher.update(name.as_bytes());
    hasher.update(content);
    let info_hash: [u8; 20] = hasher.finalize().into();

    TorrentMeta {
        info_hash,
        name: name.to_string(),
        length: content.len() as u64,
        piece_length,
        pieces,
        announce: None,
    }
}

/// Split content into per-piece byte vectors for a mock peer
pub fn split_pieces(content: &[u8], piece_length: u64) -> Vec<Vec<u8>> {
    content
        .chunks(piece_length as usize)
        .map(|c| c.to_vec())
        .collect()
}
