//! In-process substrate
//!
//! Nodes that join the same topic on one [`MemoryNetwork`] are linked
//! directly when one accepts and the other initiates. Delivery is ordered
//! and lossless, which makes station scenarios deterministic in tests.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use swarmcast_core::{
    Connection, ConnectionId, JoinOptions, PeerIdentity, Substrate, SubstrateEvent, TopicKey,
    TransportError, WireMessage,
};
use tokio::sync::mpsc;
use tracing::debug;

struct Endpoint {
    identity: PeerIdentity,
    connection_id: ConnectionId,
    events: mpsc::UnboundedSender<SubstrateEvent>,
}

struct Link {
    ends: [Endpoint; 2],
    closed: AtomicBool,
}

impl Link {
    fn touches(&self, identity: &PeerIdentity) -> bool {
        self.ends.iter().any(|end| end.identity == *identity)
    }

    /// Terminate both ends with an `Error` event instead of `Closed`
    fn fail(&self, error: &str) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        for side in 0..2 {
            let end = &self.ends[side];
            let _ = end.events.send(SubstrateEvent::Error {
                identity: self.ends[1 - side].identity,
                connection_id: end.connection_id,
                error: error.to_string(),
            });
        }
        true
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for side in 0..2 {
            let end = &self.ends[side];
            let _ = end.events.send(SubstrateEvent::Closed {
                identity: self.ends[1 - side].identity,
                connection_id: end.connection_id,
            });
        }
    }
}

/// Connection handle for one end of a [`Link`]
pub struct MemoryConnection {
    link: Arc<Link>,
    side: usize,
}

impl Connection for MemoryConnection {
    fn remote_identity(&self) -> PeerIdentity {
        self.link.ends[1 - self.side].identity
    }

    fn write(&self, message: WireMessage) -> Result<(), TransportError> {
        if self.link.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let remote = &self.link.ends[1 - self.side];
        remote
            .events
            .send(SubstrateEvent::Data {
                identity: self.link.ends[self.side].identity,
                connection_id: remote.connection_id,
                message,
            })
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        self.link.close();
    }
}

struct Member {
    node: u64,
    identity: PeerIdentity,
    topic: TopicKey,
    options: JoinOptions,
    events: mpsc::UnboundedSender<SubstrateEvent>,
}

#[derive(Default)]
struct NetworkState {
    members: Vec<Member>,
    links: Vec<(Arc<Link>, [u64; 2])>,
    next_node: u64,
    next_connection: ConnectionId,
}

/// Shared in-process "LAN"
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn substrate(&self) -> MemorySubstrate {
        self.substrate_with_identity(PeerIdentity::random())
    }

    pub fn substrate_with_identity(&self, identity: PeerIdentity) -> MemorySubstrate {
        let mut state = self.lock();
        state.next_node += 1;
        MemorySubstrate {
            network: self.clone(),
            identity,
            node: state.next_node,
        }
    }

    /// Break every open link of `identity` the way a socket error would.
    /// Returns how many links failed.
    pub fn fail_links(&self, identity: PeerIdentity, error: &str) -> usize {
        let links: Vec<Arc<Link>> = self
            .lock()
            .links
            .iter()
            .filter(|(link, _)| link.touches(&identity))
            .map(|(link, _)| link.clone())
            .collect();
        let failed = links.iter().filter(|link| link.fail(error)).count();
        debug!("Failed {} links of {}", failed, identity.short());
        failed
    }

    /// Links that have not been closed
    pub fn open_links(&self) -> usize {
        self.lock()
            .links
            .iter()
            .filter(|(link, _)| !link.closed.load(Ordering::SeqCst))
            .count()
    }
}

pub struct MemorySubstrate {
    network: MemoryNetwork,
    identity: PeerIdentity,
    node: u64,
}

#[async_trait]
impl Substrate for MemorySubstrate {
    fn local_identity(&self) -> PeerIdentity {
        self.identity
    }

    async fn join(
        &mut self,
        topic: TopicKey,
        options: JoinOptions,
        events: mpsc::UnboundedSender<SubstrateEvent>,
    ) -> Result<()> {
        let mut state = self.network.lock();

        let mut pending = Vec::new();
        for other in state.members.iter().filter(|m| m.topic == topic && m.node != self.node) {
            let compatible = (options.client && other.options.server)
                || (options.server && other.options.client);
            if compatible && other.identity != self.identity {
                pending.push((other.node, other.identity, other.events.clone()));
            }
        }

        for (other_node, other_identity, other_events) in pending {
            let own_id = state.next_connection + 1;
            let other_id = state.next_connection + 2;
            state.next_connection += 2;

            let link = Arc::new(Link {
                ends: [
                    Endpoint {
                        identity: self.identity,
                        connection_id: own_id,
                        events: events.clone(),
                    },
                    Endpoint {
                        identity: other_identity,
                        connection_id: other_id,
                        events: other_events,
                    },
                ],
                closed: AtomicBool::new(false),
            });
            for side in 0..2 {
                let end = &link.ends[side];
                let _ = end.events.send(SubstrateEvent::Connected {
                    connection_id: end.connection_id,
                    connection: Arc::new(MemoryConnection {
                        link: link.clone(),
                        side,
                    }),
                });
            }
            debug!(
                "Linked {} <-> {} on topic {}",
                self.identity.short(),
                other_identity.short(),
                topic.short()
            );
            state.links.push((link, [self.node, other_node]));
        }

        state.members.push(Member {
            node: self.node,
            identity: self.identity,
            topic,
            options,
            events,
        });
        Ok(())
    }

    async fn destroy(&mut self) {
        let links: Vec<Arc<Link>> = {
            let mut state = self.network.lock();
            state.members.retain(|m| m.node != self.node);
            let node = self.node;
            let (mine, rest): (Vec<_>, Vec<_>) = state
                .links
                .drain(..)
                .partition(|(_, nodes)| nodes.contains(&node));
            state.links = rest;
            mine.into_iter().map(|(link, _)| link).collect()
        };
        for link in links {
            link.close();
        }
    }
}
