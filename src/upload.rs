//! Upload slot manager
//!
//! A fixed number of interested peers may download from us at once.
//! Slots are granted in session insertion order; a slot frees up when
//! its peer disconnects or loses interest. There is no rate-based
//! rotation and no optimistic unchoke.

use crate::peer::PeerSession;

/// Default number of unchoked peers
const DEFAULT_SLOTS: usize = 4;

/// Grants upload slots under a fixed cap
#[derive(Debug, Clone)]
pub struct UploadSlots {
    slots: usize,
}

impl Default for UploadSlots {
    fn default() -> Self {
        Self {
            slots: DEFAULT_SLOTS,
        }
    }
}

impl UploadSlots {
    pub fn new(slots: usize) -> Self {
        Self { slots }
    }

    /// Unchoke interested peers, in insertion order, while the total
    /// number of unchoked active sessions stays within the cap.
    ///
    /// Returns the number of unchoked sessions after the pass.
    pub fn rebalance(&self, sessions: &mut [PeerSession]) -> usize {
        let mut unchoked = sessions
            .iter()
            .filter(|s| s.is_active() && !s.am_choking())
            .count();

        for session in sessions.iter_mut() {
            if unchoked >= self.slots {
                break;
            }
            if session.is_active() && session.peer_interested() && session.am_choking() {
                session.set_am_choking(false);
                unchoked += 1;
                tracing::debug!(
                    "unchoked {} ({}/{} slots)",
                    session.addr(),
                    unchoked,
                    self.slots
                );
            }
        }

        unchoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interested_session() -> PeerSession {
        let mut session = PeerSession::detached(4);
        session.set_peer_interested(true);
        session
    }

    #[test]
    fn test_unchokes_up_to_cap() {
        let mut sessions: Vec<PeerSession> = (0..6).map(|_| interested_session()).collect();

        let slots = UploadSlots::default();
        assert_eq!(slots.rebalance(&mut sessions), 4);

        // First four in insertion order were granted slots
        for (i, session) in sessions.iter().enumerate() {
            assert_eq!(session.am_choking(), i >= 4, "session {}", i);
        }
    }

    #[test]
    fn test_ignores_uninterested_peers() {
        let mut sessions = vec![
            PeerSession::detached(4),
            interested_session(),
            PeerSession::detached(4),
            interested_session(),
        ];

        let slots = UploadSlots::default();
        assert_eq!(slots.rebalance(&mut sessions), 2);
        assert!(sessions[0].am_choking());
        assert!(!sessions[1].am_choking());
        assert!(sessions[2].am_choking());
        assert!(!sessions[3].am_choking());
    }

    #[test]
    fn test_counts_existing_unchoked_against_cap() {
        let mut sessions: Vec<PeerSession> = (0..6).map(|_| interested_session()).collect();

        // Peers 4 and 5 already hold slots
        sessions[4].set_am_choking(false);
        sessions[5].set_am_choking(false);

        let slots = UploadSlots::default();
        assert_eq!(slots.rebalance(&mut sessions), 4);

        // Only two new grants in insertion order; the cap holds overall
        assert!(!sessions[0].am_choking());
        assert!(!sessions[1].am_choking());
        assert!(sessions[2].am_choking());
        assert!(sessions[3].am_choking());

        let unchoked = sessions.iter().filter(|s| !s.am_choking()).count();
        assert_eq!(unchoked, 4);
    }

    #[test]
    fn test_rebalance_is_stable() {
        let mut sessions: Vec<PeerSession> = (0..3).map(|_| interested_session()).collect();

        let slots = UploadSlots::new(2);
        assert_eq!(slots.rebalance(&mut sessions), 2);
        // A second pass changes nothing
        assert_eq!(slots.rebalance(&mut sessions), 2);
        assert!(!sessions[0].am_choking());
        assert!(!sessions[1].am_choking());
        assert!(sessions[2].am_choking());
    }
}
