use swarmcast_core::{PeerIdentity, StationObserver, StationStatus};

/// Prints station changes to the terminal
pub struct TerminalObserver;

impl StationObserver for TerminalObserver {
    fn peer_count_changed(&self, count: usize) {
        tracing::debug!("Peer count is now {}", count);
    }

    fn status_changed(&self, status: &StationStatus) {
        let text = status.info_text();
        if text.is_empty() {
            println!("Station idle");
        } else {
            println!("{}", text);
        }
    }

    fn peer_established(&self, peer: &PeerIdentity) {
        println!("Peer {} connected", peer.short());
    }

    fn failure(&self, message: &str) {
        eprintln!("error: {}", message);
    }
}
