//! Discovery substrate
//!
//! Peers find each other by topic key and get a framed, ordered, reliable
//! connection per remote peer. [`Swarm`] does this on a LAN with TCP and
//! mDNS; [`MemoryNetwork`] does it in-process.

pub mod connection;
pub mod discovery;
pub mod memory;
pub mod swarm;
pub mod wire;

pub use connection::TcpConnection;
pub use discovery::{detect_local_ip, discovery_key, DiscoveredPeer, TopicAnnouncement};
pub use memory::{MemoryConnection, MemoryNetwork, MemorySubstrate};
pub use swarm::Swarm;
pub use wire::{WireError, MAX_FRAME_LEN};
