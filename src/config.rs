//! Client configuration
//!
//! All tunables for the download/seed loop live here.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a torrent client session
#[derive(Debug, Clone)]
pub struct Config {
    /// Port to listen on for inbound peer connections
    pub listen_port: u16,
    /// Directory the output file is written into
    pub download_dir: PathBuf,
    /// Maximum number of peer sessions (inbound + outbound)
    pub max_peers: usize,
    /// Maximum new outbound connects initiated per tracker refresh
    pub connects_per_refresh: usize,
    /// Number of peers allowed to download from us at once
    pub upload_slots: usize,
    /// Maximum outstanding block requests per peer
    pub max_pipeline: usize,
    /// Interval between tracker announces
    pub tracker_interval: Duration,
    /// Timeout for an outbound connect to complete
    pub connect_timeout: Duration,
    /// Upper bound on one readiness wait in the event loop
    pub poll_interval: Duration,
    /// Interval between keep-alives to active peers
    pub keepalive_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            download_dir: PathBuf::from("."),
            max_peers: 50,
            connects_per_refresh: 4,
            upload_slots: 4,
            max_pipeline: 50,
            tracker_interval: Duration::from_secs(1800),
            connect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            keepalive_interval: Duration::from_secs(120),
        }
    }
}

impl Config {
    /// Default configuration listening on the given port
    pub fn with_port(port: u16) -> Self {
        Self {
            listen_port: port,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_peers, 50);
        assert_eq!(config.upload_slots, 4);
        assert_eq!(config.max_pipeline, 50);
        assert_eq!(config.tracker_interval, Duration::from_secs(1800));
    }

    #[test]
    fn test_with_port() {
        let config = Config::with_port(6999);
        assert_eq!(config.listen_port, 6999);
        assert_eq!(config.max_peers, Config::default().max_peers);
    }
}
