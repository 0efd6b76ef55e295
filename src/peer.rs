//! Peer session
//!
//! One [`PeerSession`] owns one TCP connection: its receive and send
//! buffers, the peer's bitfield and choke/interest view, the request
//! pipeline, and the connection state machine. Sessions are exclusively
//! owned by the client loop; all I/O is non-blocking and retried on
//! readiness.
//!
//! State transitions:
//!
//! ```text
//! Connecting        --connect ok--> HandshakeSent      (ours already queued)
//! Connecting        --error/timeout--> Disconnected
//! (inbound accept)  --> HandshakeExpected              (their handshake first)
//! HandshakeSent     --valid handshake--> Active
//! HandshakeExpected --valid handshake--> reply queued, Active
//! any               --EOF / protocol error--> Disconnected
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::{Duration, Instant};

use bitvec::prelude::*;
use bytes::{Buf, BytesMut};
use tokio::io::Interest;
use tokio::net::TcpStream;

use crate::error::Result;
use crate::wire::{Handshake, Message, HANDSHAKE_LEN};

/// Initial receive buffer capacity (one block plus framing)
const RECV_BUF_CAPACITY: usize = 32 * 1024;

type DialFuture = Pin<Box<dyn Future<Output = std::io::Result<TcpStream>> + Send>>;

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Outbound connect in progress
    Connecting,
    /// Our handshake is queued; waiting for the peer's
    HandshakeSent,
    /// Inbound connection; the peer's handshake comes first
    HandshakeExpected,
    /// Handshakes exchanged; normal message flow
    Active,
    /// Terminal; the session is garbage-collected
    Disconnected,
}

/// Progress of a pending outbound connect
#[derive(Debug)]
pub enum DialProgress {
    /// Connected; our handshake is now queued
    Connected,
    /// Still in progress
    Pending,
    /// Connect failed; session is disconnected
    Failed(String),
    /// Connect exceeded the deadline; session is disconnected
    TimedOut,
}

enum Connection {
    /// Outbound connect not yet complete
    Dialing { fut: DialFuture, started: Instant },
    /// Live socket
    Open(TcpStream),
    /// No socket (terminal or test)
    Closed,
}

/// State for one remote peer
pub struct PeerSession {
    addr: SocketAddr,
    conn: Connection,
    state: SessionState,
    recv_buf: BytesMut,
    send_buf: BytesMut,
    /// The peer's bitfield; empty (all zero) until BITFIELD or HAVE
    bitfield: BitVec<u8, Msb0>,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    peer_id: Option<[u8; 20]>,
    /// Blocks requested from this peer and not yet answered
    inflight: Vec<(u32, u32)>,
    max_pipeline: usize,
}

impl PeerSession {
    fn base(addr: SocketAddr, conn: Connection, state: SessionState, num_pieces: usize, max_pipeline: usize) -> Self {
        Self {
            addr,
            conn,
            state,
            recv_buf: BytesMut::with_capacity(RECV_BUF_CAPACITY),
            send_buf: BytesMut::new(),
            bitfield: bitvec![u8, Msb0; 0; num_pieces],
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_id: None,
            inflight: Vec::new(),
            max_pipeline,
        }
    }

    /// Start a non-blocking outbound connect
    pub fn connect(addr: SocketAddr, num_pieces: usize, max_pipeline: usize) -> Self {
        let conn = Connection::Dialing {
            fut: Box::pin(TcpStream::connect(addr)),
            started: Instant::now(),
        };
        Self::base(addr, conn, SessionState::Connecting, num_pieces, max_pipeline)
    }

    /// Wrap an accepted inbound connection
    pub fn accepted(stream: TcpStream, addr: SocketAddr, num_pieces: usize, max_pipeline: usize) -> Self {
        Self::base(
            addr,
            Connection::Open(stream),
            SessionState::HandshakeExpected,
            num_pieces,
            max_pipeline,
        )
    }

    #[cfg(test)]
    pub(crate) fn detached(num_pieces: usize) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        Self::base(addr, Connection::Closed, SessionState::Active, num_pieces, 50)
    }

    /// Poll a pending outbound connect once.
    ///
    /// The connect is checked for completion (the runtime reports the
    /// socket writable and surfaces any `SO_ERROR`); only after a clean
    /// completion is our handshake queued.
    pub async fn drive_connect(&mut self, deadline: Duration, handshake: &Handshake) -> DialProgress {
        let conn = std::mem::replace(&mut self.conn, Connection::Closed);
        let (mut fut, started) = match conn {
            Connection::Dialing { fut, started } => (fut, started),
            other => {
                self.conn = other;
                return DialProgress::Pending;
            }
        };

        match tokio::time::timeout(Duration::ZERO, fut.as_mut()).await {
            Ok(Ok(stream)) => {
                self.conn = Connection::Open(stream);
                self.send_buf.extend_from_slice(&handshake.encode());
                self.state = SessionState::HandshakeSent;
                DialProgress::Connected
            }
            Ok(Err(e)) => {
                self.state = SessionState::Disconnected;
                DialProgress::Failed(e.to_string())
            }
            Err(_) => {
                if started.elapsed() >= deadline {
                    self.state = SessionState::Disconnected;
                    DialProgress::TimedOut
                } else {
                    self.conn = Connection::Dialing { fut, started };
                    DialProgress::Pending
                }
            }
        }
    }

    /// A future that resolves when the socket is ready for the I/O this
    /// session currently wants. `None` when there is no live socket.
    pub fn readiness(&self) -> Option<Pin<Box<dyn Future<Output = ()> + Send + '_>>> {
        let Connection::Open(stream) = &self.conn else {
            return None;
        };
        let mut interest = Interest::READABLE;
        if !self.send_buf.is_empty() {
            interest = interest.add(Interest::WRITABLE);
        }
        Some(Box::pin(async move {
            let _ = stream.ready(interest).await;
        }))
    }

    /// Drain the socket into the receive buffer without blocking.
    ///
    /// Returns `Ok(false)` on EOF.
    pub fn fill_recv_buf(&mut self) -> Result<bool> {
        let Connection::Open(stream) = &self.conn else {
            return Ok(true);
        };
        loop {
            match stream.try_read_buf(&mut self.recv_buf) {
                Ok(0) => return Ok(false),
                Ok(_) => continue,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Queue a message for sending
    pub fn queue(&mut self, msg: &Message) {
        self.send_buf.extend_from_slice(&msg.encode());
    }

    /// Write as much of the send buffer as the socket accepts.
    ///
    /// Leftover bytes stay queued and are retried on the next readiness.
    pub fn flush(&mut self) -> Result<()> {
        let Connection::Open(stream) = &self.conn else {
            return Ok(());
        };
        while !self.send_buf.is_empty() {
            match stream.try_write(&self.send_buf) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "socket closed while writing",
                    )
                    .into())
                }
                Ok(n) => self.send_buf.advance(n),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Take a buffered 68-byte handshake frame, if complete
    pub fn take_handshake(&mut self) -> Option<[u8; HANDSHAKE_LEN]> {
        if self.recv_buf.len() < HANDSHAKE_LEN {
            return None;
        }
        let raw = self.recv_buf.split_to(HANDSHAKE_LEN);
        let mut frame = [0u8; HANDSHAKE_LEN];
        frame.copy_from_slice(&raw);
        Some(frame)
    }

    /// Validate a received handshake and enter `Active`.
    ///
    /// For inbound sessions `reply` carries our handshake, which is
    /// queued before anything else.
    pub fn complete_handshake(
        &mut self,
        raw: &[u8; HANDSHAKE_LEN],
        expected_info_hash: &[u8; 20],
        reply: Option<&Handshake>,
    ) -> Result<()> {
        let handshake = Handshake::decode(raw, expected_info_hash)?;
        if let Some(ours) = reply {
            self.send_buf.extend_from_slice(&ours.encode());
        }
        self.peer_id = Some(handshake.peer_id);
        self.state = SessionState::Active;
        Ok(())
    }

    /// Extract the next complete message from the receive buffer
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        Message::extract(&mut self.recv_buf)
    }

    /// Close the socket and enter the terminal state
    pub fn mark_disconnected(&mut self) {
        self.conn = Connection::Closed;
        self.state = SessionState::Disconnected;
    }

    // Peer bitfield

    /// Record a HAVE: set one bit, bounded by the piece count
    pub fn set_peer_bit(&mut self, piece: u32) {
        if (piece as usize) < self.bitfield.len() {
            self.bitfield.set(piece as usize, true);
        }
    }

    /// Replace the peer bitfield from raw wire bytes.
    ///
    /// A payload of any length is accepted: missing bytes read as zero
    /// and bits beyond the piece count are ignored.
    pub fn replace_bitfield(&mut self, raw: &[u8]) {
        for i in 0..self.bitfield.len() {
            let byte = i / 8;
            let bit = 7 - (i % 8);
            let has = raw
                .get(byte)
                .map(|b| b & (1 << bit) != 0)
                .unwrap_or(false);
            self.bitfield.set(i, has);
        }
    }

    /// Does the peer have the given piece?
    pub fn has_piece(&self, index: usize) -> bool {
        self.bitfield.get(index).map(|b| *b).unwrap_or(false)
    }

    /// The peer's bitfield
    pub fn peer_bitfield(&self) -> &BitVec<u8, Msb0> {
        &self.bitfield
    }

    // Request pipeline

    /// Number of requests sent and not yet answered
    pub fn outstanding(&self) -> usize {
        self.inflight.len()
    }

    /// Pipeline cap for this session
    pub fn max_pipeline(&self) -> usize {
        self.max_pipeline
    }

    /// Record a request now in flight
    pub fn record_request(&mut self, piece: u32, block: u32) {
        self.inflight.push((piece, block));
    }

    /// A PIECE arrived: clear the matching in-flight entry
    pub fn complete_request(&mut self, piece: u32, block: u32) {
        if let Some(pos) = self.inflight.iter().position(|&e| e == (piece, block)) {
            self.inflight.swap_remove(pos);
        }
    }

    /// Drain all in-flight requests (on choke or disconnect) so the
    /// store can release their flags
    pub fn drain_inflight(&mut self) -> Vec<(u32, u32)> {
        std::mem::take(&mut self.inflight)
    }

    // Choke / interest

    /// Queue CHOKE or UNCHOKE and update our side of the relationship
    pub fn set_am_choking(&mut self, choking: bool) {
        if self.am_choking == choking {
            return;
        }
        self.am_choking = choking;
        self.queue(if choking {
            &Message::Choke
        } else {
            &Message::Unchoke
        });
    }

    /// Queue INTERESTED or NOT_INTERESTED and update our side
    pub fn set_am_interested(&mut self, interested: bool) {
        if self.am_interested == interested {
            return;
        }
        self.am_interested = interested;
        self.queue(if interested {
            &Message::Interested
        } else {
            &Message::NotInterested
        });
    }

    pub fn set_peer_choking(&mut self, choking: bool) {
        self.peer_choking = choking;
    }

    pub fn set_peer_interested(&mut self, interested: bool) {
        self.peer_interested = interested;
    }

    // Accessors

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    pub fn peer_id(&self) -> Option<&[u8; 20]> {
        self.peer_id.as_ref()
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("outstanding", &self.inflight.len())
            .finish()
    }
}
