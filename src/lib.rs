//! # riptide
//!
//! A single-file BitTorrent v1 leecher and seeder.
//!
//! riptide locates peers through an HTTP tracker, speaks the BEP 3 peer
//! wire protocol over TCP, downloads content by pieces and blocks with
//! SHA-1 verification, and serves verified pieces back to the swarm.
//! Everything runs on one readiness-driven loop: sessions are plain
//! records owned by the [`Client`], connects and reads are non-blocking,
//! and a faulty peer costs exactly one session.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use riptide::{Client, Config, TorrentMeta};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let data = std::fs::read("example.torrent")?;
//!     let meta = TorrentMeta::parse(&data)?;
//!
//!     let mut client = Client::new(meta, Config::with_port(6881)).await?;
//!     client.run().await?;
//!
//!     println!("saved to {}", client.output_path().display());
//!     Ok(())
//! }
//! ```

pub mod bencode;
pub mod client;
pub mod config;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod scheduler;
pub mod storage;
pub mod tracker;
pub mod upload;
pub mod wire;

// Re-exports for convenience
pub use client::Client;
pub use config::Config;
pub use error::{ClientError, NetworkErrorKind, ProtocolErrorKind, Result};
pub use metainfo::{Sha1Hash, TorrentMeta};
pub use peer::{PeerSession, SessionState};
pub use piece::PieceStore;
pub use tracker::{AnnounceEvent, AnnounceRequest, AnnounceResponse, PeerAddr, TrackerClient};
pub use upload::UploadSlots;
pub use wire::{Handshake, Message, BLOCK_SIZE};
