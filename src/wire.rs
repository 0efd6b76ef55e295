//! Peer Wire Protocol codec
//!
//! Encoding and decoding of the fixed 68-byte handshake and the
//! length-prefixed peer messages defined in BEP 3. All multi-byte
//! integers are big-endian. Framing is incremental: partial reads stay
//! buffered until a complete frame is available.

use bytes::{Buf, BytesMut};

use crate::error::{ClientError, ProtocolErrorKind, Result};

/// Protocol string for BitTorrent
const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Size of the handshake frame
pub const HANDSHAKE_LEN: usize = 68;

/// Standard block size (16 KiB)
pub const BLOCK_SIZE: u32 = 16384;

/// Maximum accepted frame length (1 MiB)
const MAX_FRAME_LEN: usize = 1024 * 1024;

fn frame_error(message: impl Into<String>) -> ClientError {
    ClientError::protocol(ProtocolErrorKind::PeerProtocol, message)
}

/// The fixed-size opening frame identifying protocol, swarm, and peer.
///
/// Layout: 1 byte protocol string length (19), 19 bytes protocol string,
/// 8 reserved bytes (zero on send, ignored on receive), 20-byte
/// info_hash, 20-byte peer_id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Encode to the 68-byte wire form
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Decode and validate a received handshake.
    ///
    /// Rejects a wrong protocol string length, a wrong protocol string,
    /// and an info_hash that does not match `expected_info_hash`.
    pub fn decode(raw: &[u8; HANDSHAKE_LEN], expected_info_hash: &[u8; 20]) -> Result<Self> {
        if raw[0] as usize != PROTOCOL_STRING.len() {
            return Err(frame_error(format!(
                "invalid protocol string length: {}",
                raw[0]
            )));
        }
        if &raw[1..20] != PROTOCOL_STRING {
            return Err(frame_error("invalid protocol string"));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&raw[28..48]);
        if &info_hash != expected_info_hash {
            return Err(frame_error("info hash mismatch"));
        }

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&raw[48..68]);

        Ok(Self { info_hash, peer_id })
    }
}

/// Peer wire protocol message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Keep connection alive (zero-length frame, no id)
    KeepAlive,
    /// Refuse the recipient's block requests
    Choke,
    /// Allow the recipient's block requests
    Unchoke,
    /// We would request blocks if unchoked
    Interested,
    /// We would not request blocks
    NotInterested,
    /// Sender has the given piece
    Have { piece: u32 },
    /// Sender's complete piece bitfield (MSB-first within each byte)
    Bitfield { bits: Vec<u8> },
    /// Request a block
    Request { index: u32, begin: u32, length: u32 },
    /// Block data (response to a request)
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// Cancel a pending request
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    /// Get the message id (None for keep-alive)
    pub fn id(&self) -> Option<u8> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(0),
            Self::Unchoke => Some(1),
            Self::Interested => Some(2),
            Self::NotInterested => Some(3),
            Self::Have { .. } => Some(4),
            Self::Bitfield { .. } => Some(5),
            Self::Request { .. } => Some(6),
            Self::Piece { .. } => Some(7),
            Self::Cancel { .. } => Some(8),
        }
    }

    /// Encode the message including its 4-byte length prefix
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::KeepAlive => vec![0, 0, 0, 0],
            Self::Choke => vec![0, 0, 0, 1, 0],
            Self::Unchoke => vec![0, 0, 0, 1, 1],
            Self::Interested => vec![0, 0, 0, 1, 2],
            Self::NotInterested => vec![0, 0, 0, 1, 3],

            Self::Have { piece } => {
                let mut buf = vec![0, 0, 0, 5, 4];
                buf.extend_from_slice(&piece.to_be_bytes());
                buf
            }

            Self::Bitfield { bits } => {
                let len = 1 + bits.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(5);
                buf.extend_from_slice(bits);
                buf
            }

            Self::Request {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 6];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }

            Self::Piece {
                index,
                begin,
                block,
            } => {
                let len = 9 + block.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(7);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
                buf
            }

            Self::Cancel {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 8];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }
        }
    }

    /// Decode a message body (without the length prefix).
    ///
    /// An empty body is a keep-alive. Fails on an unknown id or a
    /// payload size inconsistent with the id.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::KeepAlive);
        }

        let id = data[0];
        let payload = &data[1..];

        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),

            4 => {
                if payload.len() != 4 {
                    return Err(frame_error(format!(
                        "have message has {} payload bytes, expected 4",
                        payload.len()
                    )));
                }
                Ok(Self::Have {
                    piece: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                })
            }

            5 => Ok(Self::Bitfield {
                bits: payload.to_vec(),
            }),

            6 => {
                if payload.len() != 12 {
                    return Err(frame_error(format!(
                        "request message has {} payload bytes, expected 12",
                        payload.len()
                    )));
                }
                Ok(Self::Request {
                    index: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                    begin: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
                    length: u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]),
                })
            }

            7 => {
                if payload.len() < 8 {
                    return Err(frame_error(format!(
                        "piece message has {} payload bytes, expected at least 8",
                        payload.len()
                    )));
                }
                Ok(Self::Piece {
                    index: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                    begin: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
                    block: payload[8..].to_vec(),
                })
            }

            8 => {
                if payload.len() != 12 {
                    return Err(frame_error(format!(
                        "cancel message has {} payload bytes, expected 12",
                        payload.len()
                    )));
                }
                Ok(Self::Cancel {
                    index: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                    begin: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
                    length: u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]),
                })
            }

            other => Err(frame_error(format!("unknown message id: {}", other))),
        }
    }

    /// Extract one complete message from a receive buffer.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// frame; consumed bytes are removed from the buffer. Fails when the
    /// announced frame length exceeds the 1 MiB cap.
    pub fn extract(buf: &mut BytesMut) -> Result<Option<Self>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(frame_error(format!("frame too large: {} bytes", len)));
        }

        if buf.len() < 4 + len {
            return Ok(None);
        }

        buf.advance(4);
        let body = buf.split_to(len);
        Message::decode(&body).map(Some)
    }
}
