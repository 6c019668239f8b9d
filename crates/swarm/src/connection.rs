use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use swarmcast_core::{
    Connection, ConnectionId, PeerIdentity, SubstrateEvent, TransportError, WireMessage,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::wire::{read_message, write_message, MAX_FRAME_LEN};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Live connections of one swarm, plus identities being dialed
#[derive(Default)]
pub(crate) struct ConnectionTable {
    connections: Mutex<HashMap<ConnectionId, Arc<TcpConnection>>>,
    dialing: Mutex<HashSet<PeerIdentity>>,
}

impl ConnectionTable {
    fn insert(&self, connection: Arc<TcpConnection>) {
        lock(&self.connections).insert(connection.connection_id, connection);
    }

    fn remove(&self, connection_id: ConnectionId) {
        lock(&self.connections).remove(&connection_id);
    }

    pub(crate) fn is_connected(&self, identity: &PeerIdentity) -> bool {
        lock(&self.connections)
            .values()
            .any(|c| c.identity == *identity)
    }

    /// Claim `identity` for an outbound dial; false if already connected or dialing
    pub(crate) fn begin_dial(&self, identity: PeerIdentity) -> bool {
        if self.is_connected(&identity) {
            return false;
        }
        lock(&self.dialing).insert(identity)
    }

    pub(crate) fn end_dial(&self, identity: &PeerIdentity) {
        lock(&self.dialing).remove(identity);
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.connections).len()
    }

    pub(crate) fn close_all(&self) {
        let all: Vec<_> = lock(&self.connections).drain().map(|(_, c)| c).collect();
        for connection in all {
            connection.close();
        }
        lock(&self.dialing).clear();
    }
}

/// One framed TCP stream to a remote peer
pub struct TcpConnection {
    identity: PeerIdentity,
    connection_id: ConnectionId,
    outbound: mpsc::UnboundedSender<WireMessage>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl TcpConnection {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Connection for TcpConnection {
    fn remote_identity(&self) -> PeerIdentity {
        self.identity
    }

    fn write(&self, message: WireMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if message.len() > MAX_FRAME_LEN {
            return Err(TransportError::TooLarge(message.len()));
        }
        self.outbound
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown.send(true);
        }
    }
}

/// Start reader and writer tasks for an already handshaken stream.
/// `Connected` is emitted before any `Data` for this connection.
pub(crate) fn spawn_connection(
    stream: TcpStream,
    identity: PeerIdentity,
    connection_id: ConnectionId,
    events: mpsc::UnboundedSender<SubstrateEvent>,
    table: Arc<ConnectionTable>,
) -> Arc<TcpConnection> {
    let (mut reader, mut writer) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WireMessage>();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let connection = Arc::new(TcpConnection {
        identity,
        connection_id,
        outbound: outbound_tx,
        shutdown: shutdown_tx,
        closed: AtomicBool::new(false),
    });
    table.insert(connection.clone());

    let _ = events.send(SubstrateEvent::Connected {
        connection_id,
        connection: connection.clone(),
    });

    let mut writer_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                message = outbound_rx.recv() => match message {
                    Some(message) => {
                        if let Err(e) = write_message(&mut writer, &message).await {
                            debug!("Write to {} failed: {}", identity.short(), e);
                            break;
                        }
                    }
                    None => break,
                },
                _ = writer_shutdown.changed() => {
                    // Flush whatever was queued before the close, e.g. a stop sentinel
                    while let Ok(message) = outbound_rx.try_recv() {
                        if write_message(&mut writer, &message).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
    });

    let reader_connection = connection.clone();
    let mut reader_shutdown = shutdown_rx;
    tokio::spawn(async move {
        let event = loop {
            tokio::select! {
                result = read_message(&mut reader) => match result {
                    Ok(Some(message)) => {
                        let _ = events.send(SubstrateEvent::Data {
                            identity,
                            connection_id,
                            message,
                        });
                    }
                    Ok(None) => {
                        debug!("Peer {} closed conn {}", identity.short(), connection_id);
                        break SubstrateEvent::Closed { identity, connection_id };
                    }
                    Err(e) => {
                        warn!("Connection {} to {} failed: {}", connection_id, identity.short(), e);
                        break SubstrateEvent::Error {
                            identity,
                            connection_id,
                            error: e.to_string(),
                        };
                    }
                },
                _ = reader_shutdown.changed() => {
                    break SubstrateEvent::Closed { identity, connection_id };
                }
            }
        };
        reader_connection.close();
        table.remove(connection_id);
        let _ = events.send(event);
    });

    connection
}
