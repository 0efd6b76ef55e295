//! Typed error hierarchy for riptide
//!
//! Peer-level faults (malformed frames, bad handshakes, dropped sockets)
//! are contained within one session; the client loop never terminates
//! because of them. Only startup failures and resource exhaustion are
//! treated as fatal.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the client
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network-related errors (connection, timeout, reset, EOF)
    #[error("network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    /// Filesystem errors on the output file
    #[error("storage error at {path:?}: {message}")]
    Storage { path: PathBuf, message: String },

    /// Protocol-level errors (peer wire, bencode, metainfo, tracker)
    #[error("protocol error: {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
    },

    /// Resource limits exceeded (fatal)
    #[error("resource limit exceeded: {resource} (limit: {limit})")]
    ResourceLimit {
        resource: &'static str,
        limit: usize,
    },
}

/// Network error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Connection refused by the remote
    ConnectionRefused,
    /// Connection reset or closed mid-stream
    ConnectionReset,
    /// Operation timed out
    Timeout,
    /// Other network error
    Other,
}

/// Protocol error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Peer wire protocol violation (bad frame, bad handshake)
    PeerProtocol,
    /// Invalid metainfo file
    InvalidTorrent,
    /// Tracker error
    TrackerError,
    /// Bencode parsing error
    BencodeParse,
}

impl ClientError {
    /// Create a network error
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self::Network {
            kind,
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            message: message.into(),
        }
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::ConnectionRefused => NetworkErrorKind::ConnectionRefused,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => NetworkErrorKind::ConnectionReset,
            ErrorKind::TimedOut => NetworkErrorKind::Timeout,
            _ => NetworkErrorKind::Other,
        };
        Self::Network {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            NetworkErrorKind::Timeout
        } else if err.is_connect() {
            NetworkErrorKind::ConnectionRefused
        } else {
            NetworkErrorKind::Other
        };
        Self::Network {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        Self::Protocol {
            kind: ProtocolErrorKind::TrackerError,
            message: err.to_string(),
        }
    }
}
