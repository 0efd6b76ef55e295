//! Tracker client
//!
//! HTTP announce (BEP 3) against the torrent's tracker. The tracker is
//! stateless per call: each announce reports our transfer totals and
//! yields a fresh peer list. Both the compact (6 bytes per peer) and
//! the dictionary peer formats are understood.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use rand::Rng;

use crate::bencode::BencodeValue;
use crate::error::{ClientError, NetworkErrorKind, ProtocolErrorKind, Result};
use crate::metainfo::Sha1Hash;

/// Timeout for one tracker request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Clamp bounds for the announce interval reported by the tracker
const MIN_ANNOUNCE_INTERVAL: u32 = 60;
const MAX_ANNOUNCE_INTERVAL: u32 = 3600;

fn tracker_error(message: impl Into<String>) -> ClientError {
    ClientError::protocol(ProtocolErrorKind::TrackerError, message)
}

/// Announce event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// Regular periodic announce
    None,
    /// Download has started
    Started,
    /// Download has stopped
    Stopped,
    /// Download has completed
    Completed,
}

impl AnnounceEvent {
    fn as_query_value(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }
}

/// Announce request parameters
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: Sha1Hash,
    pub peer_id: [u8; 20],
    /// Port we accept peer connections on
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Bytes left to download
    pub left: u64,
    pub event: AnnounceEvent,
}

/// Announce response from the tracker
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Suggested seconds between announces (clamped to [60, 3600])
    pub interval: u32,
    /// Peers currently in the swarm
    pub peers: Vec<PeerAddr>,
}

/// Peer address from a tracker response
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub ip: String,
    pub port: u16,
}

impl PeerAddr {
    /// Resolve to a socket address
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.ip, self.port)
            .to_socket_addrs()
            .ok()?
            .next()
    }
}

/// HTTP tracker client
pub struct TrackerClient {
    http: reqwest::Client,
    peer_id: [u8; 20],
}

impl TrackerClient {
    /// Create a client with a fresh random peer id
    pub fn new() -> Result<Self> {
        Self::with_peer_id(generate_peer_id())
    }

    /// Create a client with a specific peer id
    pub fn with_peer_id(peer_id: [u8; 20]) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                ClientError::network(
                    NetworkErrorKind::Other,
                    format!("failed to create HTTP client: {}", e),
                )
            })?;
        Ok(Self { http, peer_id })
    }

    /// Our peer id
    pub fn peer_id(&self) -> &[u8; 20] {
        &self.peer_id
    }

    /// Announce to an HTTP tracker and return its peer list
    pub async fn announce(
        &self,
        tracker_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let parsed = url::Url::parse(tracker_url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(tracker_error(format!(
                "unsupported tracker protocol: {}",
                tracker_url
            )));
        }

        // info_hash and peer_id are raw bytes; percent-encode them by
        // hand so the query survives untouched.
        let mut url = tracker_url.to_string();
        url.push(if url.contains('?') { '&' } else { '?' });

        url.push_str("info_hash=");
        for byte in &request.info_hash {
            url.push_str(&format!("%{:02X}", byte));
        }
        url.push_str("&peer_id=");
        for byte in &request.peer_id {
            url.push_str(&format!("%{:02X}", byte));
        }

        url.push_str(&format!("&port={}", request.port));
        url.push_str(&format!("&uploaded={}", request.uploaded));
        url.push_str(&format!("&downloaded={}", request.downloaded));
        url.push_str(&format!("&left={}", request.left));
        url.push_str("&compact=1");

        let event = request.event.as_query_value();
        if !event.is_empty() {
            url.push_str(&format!("&event={}", event));
        }

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(tracker_error(format!(
                "tracker returned status {}",
                response.status()
            )));
        }

        let body = response.bytes().await?;
        self.parse_response(&body)
    }

    /// Parse a bencoded announce response
    fn parse_response(&self, data: &[u8]) -> Result<AnnounceResponse> {
        let root = BencodeValue::parse_exact(data)
            .map_err(|_| tracker_error("invalid tracker response encoding"))?;
        let dict = root
            .as_dict()
            .ok_or_else(|| tracker_error("tracker response must be a dictionary"))?;

        if let Some(reason) = dict
            .get(b"failure reason".as_slice())
            .and_then(|v| v.as_str())
        {
            return Err(tracker_error(format!("tracker failure: {}", reason)));
        }

        let interval = dict
            .get(b"interval".as_slice())
            .and_then(|v| v.as_uint())
            .ok_or_else(|| tracker_error("missing 'interval' in tracker response"))?
            as u32;
        let interval = interval.clamp(MIN_ANNOUNCE_INTERVAL, MAX_ANNOUNCE_INTERVAL);

        let peers = self.parse_peers(dict.get(b"peers".as_slice()))?;

        Ok(AnnounceResponse { interval, peers })
    }

    /// Parse the peer list (compact bytes or dictionary list)
    fn parse_peers(&self, value: Option<&BencodeValue>) -> Result<Vec<PeerAddr>> {
        let Some(value) = value else {
            return Ok(Vec::new());
        };

        match value {
            // Compact format: 4 IP bytes + 2 port bytes per peer
            BencodeValue::Bytes(data) => {
                if data.len() % 6 != 0 {
                    return Err(tracker_error("invalid compact peers length"));
                }
                Ok(data
                    .chunks_exact(6)
                    .map(|chunk| PeerAddr {
                        ip: format!("{}.{}.{}.{}", chunk[0], chunk[1], chunk[2], chunk[3]),
                        port: u16::from_be_bytes([chunk[4], chunk[5]]),
                    })
                    .collect())
            }

            // Dictionary format
            BencodeValue::List(list) => {
                let mut peers = Vec::new();
                for item in list {
                    let dict = item
                        .as_dict()
                        .ok_or_else(|| tracker_error("peer entry must be a dictionary"))?;
                    let ip = dict
                        .get(b"ip".as_slice())
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| tracker_error("peer missing 'ip'"))?
                        .to_string();
                    let port = dict
                        .get(b"port".as_slice())
                        .and_then(|v| v.as_uint())
                        .ok_or_else(|| tracker_error("peer missing 'port'"))?
                        as u16;
                    peers.push(PeerAddr { ip, port });
                }
                Ok(peers)
            }

            _ => Err(tracker_error("invalid peers format")),
        }
    }
}

/// Generate an Azureus-style peer id: "-RT0001-" plus random digits
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[0..8].copy_from_slice(b"-RT0001-");
    let mut rng = rand::thread_rng();
    for byte in &mut peer_id[8..] {
        *byte = rng.gen_range(b'0'..=b'9');
    }
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_peer_id() {
        let peer_id = generate_peer_id();
        assert_eq!(&peer_id[0..8], b"-RT0001-");
        assert!(peer_id[8..].iter().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn test_event_query_values() {
        assert_eq!(AnnounceEvent::None.as_query_value(), "");
        assert_eq!(AnnounceEvent::Started.as_query_value(), "started");
        assert_eq!(AnnounceEvent::Stopped.as_query_value(), "stopped");
        assert_eq!(AnnounceEvent::Completed.as_query_value(), "completed");
    }

    #[test]
    fn test_parse_compact_peers() {
        let client = TrackerClient::new().unwrap();

        let data = vec![
            127, 0, 0, 1, 0x1A, 0xE1, // 127.0.0.1:6881
            192, 168, 1, 1, 0x1A, 0xE2, // 192.168.1.1:6882
        ];
        let value = BencodeValue::Bytes(data);
        let peers = client.parse_peers(Some(&value)).unwrap();

        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].ip, "127.0.0.1");
        assert_eq!(peers[0].port, 6881);
        assert_eq!(peers[1].ip, "192.168.1.1");
        assert_eq!(peers[1].port, 6882);

        // Length not a multiple of six
        let value = BencodeValue::Bytes(vec![1, 2, 3]);
        assert!(client.parse_peers(Some(&value)).is_err());
    }

    #[test]
    fn test_parse_dict_response() {
        let client = TrackerClient::new().unwrap();

        let body = b"d8:intervali900e5:peersld2:ip9:127.0.0.14:porti6881eeee";
        let response = client.parse_response(body).unwrap();
        assert_eq!(response.interval, 900);
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].port, 6881);
    }

    #[test]
    fn test_interval_clamping() {
        let client = TrackerClient::new().unwrap();

        let body = b"d8:intervali5e5:peers0:e";
        let response = client.parse_response(body).unwrap();
        assert_eq!(response.interval, MIN_ANNOUNCE_INTERVAL);

        let body = b"d8:intervali90000e5:peers0:e";
        let response = client.parse_response(body).unwrap();
        assert_eq!(response.interval, MAX_ANNOUNCE_INTERVAL);
    }

    #[test]
    fn test_failure_reason() {
        let client = TrackerClient::new().unwrap();
        let body = b"d14:failure reason9:not founde";
        let err = client.parse_response(body).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_peer_addr_to_socket() {
        let peer = PeerAddr {
            ip: "127.0.0.1".to_string(),
            port: 6881,
        };
        let addr = peer.to_socket_addr().unwrap();
        assert_eq!(addr.port(), 6881);
        assert!(addr.is_ipv4());
    }
}
