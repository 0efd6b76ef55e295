//! Metainfo parser
//!
//! Parses single-file .torrent files (BEP 3) into a [`TorrentMeta`]:
//! content name and length, piece geometry, the published piece hashes,
//! the info_hash, and the announce URL. Multi-file torrents are
//! rejected.

use sha1::{Digest, Sha1};

use crate::bencode::{info_dict_bytes, BencodeValue};
use crate::error::{ClientError, ProtocolErrorKind, Result};

/// SHA-1 hash (20 bytes)
pub type Sha1Hash = [u8; 20];

fn invalid(message: impl Into<String>) -> ClientError {
    ClientError::protocol(ProtocolErrorKind::InvalidTorrent, message)
}

/// Parsed metainfo for a single-file torrent.
///
/// Read-only after construction. The last piece has length
/// `length - (num_pieces - 1) * piece_length`; all others have length
/// `piece_length`.
#[derive(Debug, Clone)]
pub struct TorrentMeta {
    /// SHA-1 of the bencoded info dictionary (the swarm identifier)
    pub info_hash: Sha1Hash,
    /// Suggested output file name
    pub name: String,
    /// Total content length in bytes
    pub length: u64,
    /// Bytes per piece (except possibly the last)
    pub piece_length: u64,
    /// Published SHA-1 hash of each piece
    pub pieces: Vec<Sha1Hash>,
    /// Primary tracker announce URL
    pub announce: Option<String>,
}

impl TorrentMeta {
    /// Parse a .torrent file from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        let root = BencodeValue::parse_exact(data)?;
        let dict = root
            .as_dict()
            .ok_or_else(|| invalid("root must be a dictionary"))?;

        let info_hash = {
            let mut hasher = Sha1::new();
            hasher.update(info_dict_bytes(data)?);
            hasher.finalize().into()
        };

        let info = dict
            .get(b"info".as_slice())
            .and_then(|v| v.as_dict())
            .ok_or_else(|| invalid("missing 'info' dictionary"))?;

        if info.contains_key(b"files".as_slice()) {
            return Err(invalid("multi-file torrents are not supported"));
        }

        let name = info
            .get(b"name".as_slice())
            .and_then(|v| v.as_str())
            .ok_or_else(|| invalid("missing 'name' in info"))?
            .to_string();

        // The name becomes the output file name; refuse anything that
        // could escape the download directory.
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
            return Err(invalid(format!("unsafe file name: {:?}", name)));
        }

        let length = info
            .get(b"length".as_slice())
            .and_then(|v| v.as_uint())
            .ok_or_else(|| invalid("missing or invalid 'length'"))?;

        let piece_length = info
            .get(b"piece length".as_slice())
            .and_then(|v| v.as_uint())
            .ok_or_else(|| invalid("missing or invalid 'piece length'"))?;

        if piece_length == 0 {
            return Err(invalid("'piece length' must be greater than zero"));
        }
        if piece_length > u32::MAX as u64 {
            return Err(invalid(format!("'piece length' {} too large", piece_length)));
        }

        let pieces_bytes = info
            .get(b"pieces".as_slice())
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| invalid("missing 'pieces'"))?;

        if pieces_bytes.len() % 20 != 0 {
            return Err(invalid(format!(
                "pieces length {} is not a multiple of 20",
                pieces_bytes.len()
            )));
        }

        let pieces: Vec<Sha1Hash> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let expected = length.div_ceil(piece_length);
        if pieces.len() as u64 != expected {
            return Err(invalid(format!(
                "piece count mismatch: have {}, expected {} for {} bytes in {} byte pieces",
                pieces.len(),
                expected,
                length,
                piece_length
            )));
        }

        let announce = dict
            .get(b"announce".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);

        Ok(Self {
            info_hash,
            name,
            length,
            piece_length,
            pieces,
            announce,
        })
    }

    /// Total number of pieces
    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Length of the given piece (the last piece may be shorter)
    pub fn piece_length_at(&self, index: usize) -> Option<u32> {
        if index >= self.pieces.len() {
            return None;
        }
        let start = index as u64 * self.piece_length;
        let end = (start + self.piece_length).min(self.length);
        Some((end - start) as u32)
    }

    /// Published hash of the given piece
    pub fn piece_hash(&self, index: usize) -> Option<&Sha1Hash> {
        self.pieces.get(index)
    }

    /// The info_hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        self.info_hash.iter().map(|b| format!("{:02x}", b)).collect()
    }
}
