//! Download/seed coordinator
//!
//! A single readiness-driven loop owns every peer session, the piece
//! store, and the listen socket. One tick: check for completion,
//! refresh the tracker, wait for socket readiness (bounded at 20 ms),
//! accept inbound peers, complete pending connects, read handshakes and
//! messages, fill request pipelines, grant upload slots, flush queued
//! writes, and collect dead sessions. Every recoverable fault is
//! contained within one session; the loop only terminates on completion
//! or a fatal error.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};

use crate::config::Config;
use crate::error::{ClientError, ProtocolErrorKind, Result};
use crate::metainfo::TorrentMeta;
use crate::peer::{DialProgress, PeerSession, SessionState};
use crate::piece::PieceStore;
use crate::scheduler;
use crate::tracker::{AnnounceEvent, AnnounceRequest, PeerAddr, TrackerClient};
use crate::upload::UploadSlots;
use crate::wire::{Handshake, Message, BLOCK_SIZE};

/// Interval between status lines while seeding
const SEED_STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// A torrent client: downloads one single-file torrent, then optionally
/// seeds it.
pub struct Client {
    meta: Arc<TorrentMeta>,
    config: Config,
    store: PieceStore,
    sessions: Vec<PeerSession>,
    listener: TcpListener,
    tracker: TrackerClient,
    upload_slots: UploadSlots,
    /// Our side of every handshake
    handshake: Handshake,
    bytes_uploaded: u64,
    started_at: Instant,
    last_tracker_contact: Option<Instant>,
    last_keepalive: Instant,
    skip_tracker: bool,
}

impl Client {
    /// Create a client: bind the listen socket, open the output file,
    /// and allocate the piece store.
    pub async fn new(meta: TorrentMeta, config: Config) -> Result<Self> {
        let meta = Arc::new(meta);
        let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;

        let output = config.download_dir.join(&meta.name);
        let store = PieceStore::create(meta.clone(), output).await?;

        let tracker = TrackerClient::new()?;
        let handshake = Handshake::new(meta.info_hash, *tracker.peer_id());
        let upload_slots = UploadSlots::new(config.upload_slots);

        Ok(Self {
            meta,
            config,
            store,
            sessions: Vec::new(),
            listener,
            tracker,
            upload_slots,
            handshake,
            bytes_uploaded: 0,
            started_at: Instant::now(),
            last_tracker_contact: None,
            last_keepalive: Instant::now(),
            skip_tracker: false,
        })
    }

    /// Skip tracker announces entirely (manual peer mode)
    pub fn set_skip_tracker(&mut self, skip: bool) {
        self.skip_tracker = skip;
    }

    /// Start a connection to a known peer address
    pub fn add_peer(&mut self, addr: SocketAddr) {
        tracing::info!("connecting to peer {}", addr);
        self.sessions.push(PeerSession::connect(
            addr,
            self.meta.num_pieces(),
            self.config.max_pipeline,
        ));
    }

    /// Address the listen socket is bound to
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Path of the output file
    pub fn output_path(&self) -> &Path {
        self.store.output_path()
    }

    /// All pieces verified and written
    pub fn is_complete(&self) -> bool {
        self.store.is_complete()
    }

    /// Total bytes served to peers
    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded
    }

    /// Run the download loop until every piece is verified.
    ///
    /// Returns `Ok(())` on completion. Fatal errors (startup tracker
    /// failure, output file write failure, resource exhaustion) abort
    /// the download; peer-level faults never do.
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(
            "downloading {} ({} bytes, {} pieces of {} bytes)",
            self.meta.name,
            self.meta.length,
            self.meta.num_pieces(),
            self.meta.piece_length
        );

        loop {
            if self.store.is_complete() {
                let elapsed = self.started_at.elapsed();
                tracing::info!(
                    "download complete: {} bytes in {:.1}s",
                    self.meta.length,
                    elapsed.as_secs_f64()
                );
                if !self.skip_tracker {
                    if let Err(e) = self.announce(AnnounceEvent::Completed).await {
                        tracing::warn!("completion announce failed: {}", e);
                    }
                }
                return Ok(());
            }

            self.refresh_tracker().await?;
            self.drive_connects().await;

            if let Some((stream, addr)) = self.wait_readiness().await? {
                self.accept_peer(stream, addr);
            }

            self.pump_sessions().await?;
            self.tick_scheduler();
            self.upload_slots.rebalance(&mut self.sessions);
            self.send_keepalives();
            self.flush_sessions();
            self.collect_disconnected();
        }
    }

    /// Run the seed loop: serve blocks, accept inbound peers, and
    /// re-announce periodically. Runs until the future is dropped.
    pub async fn seed(&mut self) -> Result<()> {
        tracing::info!(
            "seeding {} on port {}",
            self.meta.name,
            self.listen_addr()?.port()
        );
        let mut last_status = Instant::now();

        loop {
            self.refresh_tracker().await?;
            self.drive_connects().await;

            if let Some((stream, addr)) = self.wait_readiness().await? {
                self.accept_peer(stream, addr);
            }

            self.pump_sessions().await?;
            self.upload_slots.rebalance(&mut self.sessions);
            self.send_keepalives();
            self.flush_sessions();
            self.collect_disconnected();

            if last_status.elapsed() >= SEED_STATUS_INTERVAL {
                last_status = Instant::now();
                let active = self.sessions.iter().filter(|s| s.is_active()).count();
                let unchoked = self
                    .sessions
                    .iter()
                    .filter(|s| s.is_active() && !s.am_choking())
                    .count();
                tracing::info!(
                    "seeding: {} active peers ({} unchoked), {:.2} MiB uploaded",
                    active,
                    unchoked,
                    self.bytes_uploaded as f64 / (1024.0 * 1024.0)
                );
            }
        }
    }

    /// Announce the final `stopped` event (clean shutdown)
    pub async fn announce_stopped(&mut self) {
        if self.skip_tracker || self.last_tracker_contact.is_none() {
            return;
        }
        if let Err(e) = self.announce(AnnounceEvent::Stopped).await {
            tracing::debug!("stopped announce failed: {}", e);
        }
    }

    fn build_announce(&self, event: AnnounceEvent) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.meta.info_hash,
            peer_id: *self.tracker.peer_id(),
            port: self.config.listen_port,
            uploaded: self.bytes_uploaded,
            downloaded: self.store.bytes_downloaded(),
            left: self.store.bytes_remaining(),
            event,
        }
    }

    async fn announce(&mut self, event: AnnounceEvent) -> Result<Vec<PeerAddr>> {
        let url = self.meta.announce.clone().ok_or_else(|| {
            ClientError::protocol(ProtocolErrorKind::TrackerError, "no announce URL in metainfo")
        })?;
        let request = self.build_announce(event);
        let response = self.tracker.announce(&url, &request).await?;
        tracing::info!("tracker returned {} peers", response.peers.len());
        Ok(response.peers)
    }

    /// Contact the tracker when due and connect to new peers.
    ///
    /// A failure on the very first announce is fatal; failures on
    /// refresh are logged and retried at the next interval.
    async fn refresh_tracker(&mut self) -> Result<()> {
        if self.skip_tracker {
            return Ok(());
        }
        let first = self.last_tracker_contact.is_none();
        let due = self
            .last_tracker_contact
            .map_or(true, |t| t.elapsed() >= self.config.tracker_interval);
        if !due {
            return Ok(());
        }

        let event = if first {
            AnnounceEvent::Started
        } else {
            AnnounceEvent::None
        };

        match self.announce(event).await {
            Ok(peers) => {
                self.last_tracker_contact = Some(Instant::now());
                self.connect_new_peers(peers);
                Ok(())
            }
            Err(e) if first => Err(e),
            Err(e) => {
                tracing::warn!("tracker refresh failed: {}", e);
                self.last_tracker_contact = Some(Instant::now());
                Ok(())
            }
        }
    }

    /// Start connects to fresh addresses, bounded by the per-refresh
    /// budget and the global peer cap.
    fn connect_new_peers(&mut self, peers: Vec<PeerAddr>) {
        let mut started = 0;
        for peer in peers {
            if started >= self.config.connects_per_refresh
                || self.sessions.len() >= self.config.max_peers
            {
                break;
            }
            let Some(addr) = peer.to_socket_addr() else {
                continue;
            };
            if !addr.is_ipv4() || addr.port() == 0 {
                continue;
            }
            if self.sessions.iter().any(|s| s.addr() == addr) {
                continue;
            }
            self.add_peer(addr);
            started += 1;
        }
    }

    /// Poll every pending outbound connect once
    async fn drive_connects(&mut self) {
        let deadline = self.config.connect_timeout;
        let handshake = self.handshake;
        for session in self
            .sessions
            .iter_mut()
            .filter(|s| s.state() == SessionState::Connecting)
        {
            match session.drive_connect(deadline, &handshake).await {
                DialProgress::Connected => {
                    tracing::debug!("connected to {}", session.addr());
                }
                DialProgress::Pending => {}
                DialProgress::Failed(e) => {
                    tracing::debug!("connect to {} failed: {}", session.addr(), e);
                }
                DialProgress::TimedOut => {
                    tracing::debug!("connect to {} timed out", session.addr());
                }
            }
        }
    }

    /// Wait up to one poll interval for the listener or any session
    /// socket to become ready. Returns an accepted inbound connection
    /// if one arrived.
    async fn wait_readiness(&mut self) -> Result<Option<(TcpStream, SocketAddr)>> {
        let readiness: Vec<_> = self.sessions.iter().filter_map(|s| s.readiness()).collect();
        let socket_wait = async move {
            if readiness.is_empty() {
                futures::future::pending::<()>().await
            } else {
                let _ = futures::future::select_all(readiness).await;
            }
        };

        tokio::select! {
            result = self.listener.accept() => match result {
                Ok((stream, addr)) => Ok(Some((stream, addr))),
                Err(e) if e.kind() == std::io::ErrorKind::OutOfMemory => {
                    Err(ClientError::ResourceLimit {
                        resource: "inbound connections",
                        limit: self.config.max_peers,
                    })
                }
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    Ok(None)
                }
            },
            _ = socket_wait => Ok(None),
            _ = tokio::time::sleep(self.config.poll_interval) => Ok(None),
        }
    }

    /// Register an accepted inbound connection as a session expecting
    /// the peer's handshake first
    fn accept_peer(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.sessions.len() >= self.config.max_peers {
            tracing::debug!("peer cap reached, rejecting inbound {}", addr);
            return;
        }
        tracing::info!("accepted inbound peer {}", addr);
        self.sessions.push(PeerSession::accepted(
            stream,
            addr,
            self.meta.num_pieces(),
            self.config.max_pipeline,
        ));
    }

    /// Read from every session: handshakes first, then framed messages.
    async fn pump_sessions(&mut self) -> Result<()> {
        let our_handshake = self.handshake;
        let info_hash = self.meta.info_hash;
        let mut completed: Vec<u32> = Vec::new();

        let sessions = &mut self.sessions;
        let store = &mut self.store;
        let bytes_uploaded = &mut self.bytes_uploaded;

        for session in sessions.iter_mut() {
            if !matches!(
                session.state(),
                SessionState::HandshakeSent | SessionState::HandshakeExpected | SessionState::Active
            ) {
                continue;
            }

            match session.fill_recv_buf() {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!("peer {} closed the connection", session.addr());
                    session.mark_disconnected();
                    continue;
                }
                Err(e) => {
                    tracing::debug!("peer {} read error: {}", session.addr(), e);
                    session.mark_disconnected();
                    continue;
                }
            }

            if matches!(
                session.state(),
                SessionState::HandshakeSent | SessionState::HandshakeExpected
            ) {
                let Some(frame) = session.take_handshake() else {
                    continue;
                };
                let reply =
                    (session.state() == SessionState::HandshakeExpected).then_some(&our_handshake);
                match session.complete_handshake(&frame, &info_hash, reply) {
                    Ok(()) => {
                        tracing::info!("handshake complete with {}", session.addr());
                        if store.bitfield().any() {
                            session.queue(&Message::Bitfield {
                                bits: store.bitfield_bytes(),
                            });
                        }
                        scheduler::update_interest(session, store);
                    }
                    Err(e) => {
                        tracing::debug!("invalid handshake from {}: {}", session.addr(), e);
                        session.mark_disconnected();
                        continue;
                    }
                }
            }

            while session.is_active() {
                match session.next_message() {
                    Ok(Some(msg)) => {
                        match Self::dispatch(session, store, bytes_uploaded, &mut completed, msg)
                            .await
                        {
                            Ok(()) => {}
                            Err(e @ ClientError::Storage { .. }) => return Err(e),
                            Err(e) => {
                                tracing::debug!("peer {} protocol fault: {}", session.addr(), e);
                                session.mark_disconnected();
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("peer {} framing error: {}", session.addr(), e);
                        session.mark_disconnected();
                    }
                }
            }
        }

        // A verified piece is broadcast after it is written and our
        // bitfield updated, exactly once per session active now.
        for &index in &completed {
            for session in self.sessions.iter_mut().filter(|s| s.is_active()) {
                session.queue(&Message::Have { piece: index });
            }
        }
        if !completed.is_empty() {
            for session in self.sessions.iter_mut() {
                if session.is_active() {
                    scheduler::update_interest(session, &self.store);
                }
            }
        }

        Ok(())
    }

    /// Apply one message to the session and shared state
    async fn dispatch(
        session: &mut PeerSession,
        store: &mut PieceStore,
        bytes_uploaded: &mut u64,
        completed: &mut Vec<u32>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::KeepAlive => {}

            Message::Choke => {
                tracing::debug!("peer {} choked us", session.addr());
                session.set_peer_choking(true);
                // Release our in-flight requests so any peer may pick
                // those blocks up.
                for (piece, block) in session.drain_inflight() {
                    store.clear_requested(piece, block);
                }
            }

            Message::Unchoke => {
                tracing::debug!("peer {} unchoked us", session.addr());
                session.set_peer_choking(false);
                scheduler::fill_pipeline(session, store);
            }

            Message::Interested => {
                tracing::debug!("peer {} is interested", session.addr());
                session.set_peer_interested(true);
                // Slot grants happen on the upload tick this same cycle.
            }

            Message::NotInterested => {
                tracing::debug!("peer {} lost interest", session.addr());
                session.set_peer_interested(false);
                if !session.am_choking() {
                    session.set_am_choking(true);
                }
            }

            Message::Have { piece } => {
                session.set_peer_bit(piece);
                scheduler::update_interest(session, store);
            }

            Message::Bitfield { bits } => {
                session.replace_bitfield(&bits);
                scheduler::update_interest(session, store);
            }

            Message::Piece {
                index,
                begin,
                block,
            } => {
                session.complete_request(index, begin / BLOCK_SIZE);
                if store.accept_block(index, begin, &block)? {
                    if store.verify_and_commit(index).await? {
                        completed.push(index);
                    }
                }
                scheduler::fill_pipeline(session, store);
            }

            Message::Request {
                index,
                begin,
                length,
            } => {
                if session.am_choking() {
                    tracing::trace!("ignoring request from choked peer {}", session.addr());
                    return Ok(());
                }
                if length > BLOCK_SIZE {
                    tracing::debug!(
                        "refusing oversize request from {}: {} bytes",
                        session.addr(),
                        length
                    );
                    return Ok(());
                }
                match store.read_block(index, begin, length) {
                    Some(data) => {
                        let block = data.to_vec();
                        session.queue(&Message::Piece {
                            index,
                            begin,
                            block,
                        });
                        *bytes_uploaded += length as u64;
                        tracing::trace!(
                            "serving piece={} begin={} len={} to {}",
                            index,
                            begin,
                            length,
                            session.addr()
                        );
                    }
                    None => {
                        tracing::debug!(
                            "cannot serve request from {}: piece={} begin={} len={}",
                            session.addr(),
                            index,
                            begin,
                            length
                        );
                    }
                }
            }

            // Outgoing blocks are never buffered per-request, so there
            // is nothing to cancel.
            Message::Cancel { .. } => {}
        }
        Ok(())
    }

    /// Fill the pipeline of every session that may request
    fn tick_scheduler(&mut self) {
        let store = &mut self.store;
        for session in self.sessions.iter_mut() {
            if session.is_active() && !session.peer_choking() && session.am_interested() {
                scheduler::fill_pipeline(session, store);
            }
        }
    }

    /// Keep idle connections alive
    fn send_keepalives(&mut self) {
        if self.last_keepalive.elapsed() < self.config.keepalive_interval {
            return;
        }
        self.last_keepalive = Instant::now();
        for session in self.sessions.iter_mut().filter(|s| s.is_active()) {
            session.queue(&Message::KeepAlive);
        }
    }

    /// Flush queued writes; a write failure drops the session
    fn flush_sessions(&mut self) {
        for session in self.sessions.iter_mut() {
            if matches!(
                session.state(),
                SessionState::HandshakeSent | SessionState::HandshakeExpected | SessionState::Active
            ) {
                if let Err(e) = session.flush() {
                    tracing::debug!("peer {} write error: {}", session.addr(), e);
                    session.mark_disconnected();
                }
            }
        }
    }

    /// Drop sessions in the terminal state, releasing their in-flight
    /// request flags
    fn collect_disconnected(&mut self) {
        let store = &mut self.store;
        self.sessions.retain_mut(|session| {
            if session.state() == SessionState::Disconnected {
                tracing::debug!("dropping session {}", session.addr());
                for (piece, block) in session.drain_inflight() {
                    store.clear_requested(piece, block);
                }
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};

    fn make_meta() -> TorrentMeta {
        let content = vec![1u8; 64];
        let mut hasher = Sha1::new();
        hasher.update(&content);
        TorrentMeta {
            info_hash: [9; 20],
            name: "unit.bin".to_string(),
            length: 64,
            piece_length: 64,
            pieces: vec![hasher.finalize().into()],
            announce: Some("http://tracker.example/announce".to_string()),
        }
    }

    #[tokio::test]
    async fn test_new_binds_listener_and_creates_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::with_port(0);
        config.download_dir = dir.path().to_path_buf();

        let client = Client::new(make_meta(), config).await.unwrap();
        assert!(client.listen_addr().unwrap().port() > 0);
        assert_eq!(client.output_path(), dir.path().join("unit.bin"));
        assert!(!client.is_complete());
    }

    #[tokio::test]
    async fn test_build_announce_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::with_port(0);
        config.download_dir = dir.path().to_path_buf();

        let client = Client::new(make_meta(), config).await.unwrap();
        let request = client.build_announce(AnnounceEvent::Started);
        assert_eq!(request.left, 64);
        assert_eq!(request.downloaded, 0);
        assert_eq!(request.uploaded, 0);
        assert_eq!(request.event, AnnounceEvent::Started);
    }
}
