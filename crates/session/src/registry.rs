//! Session registry
//!
//! Single owner of every [`PeerSession`], keyed by peer identity. Events are
//! resolved by identity and connection id each time, so anything addressed
//! to a session that has since been replaced or removed is dropped.

use bytes::Bytes;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use swarmcast_core::{
    AudioFormat, Connection, ConnectionId, PeerIdentity, Role, StationObserver, TransportError,
    WireMessage,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::{Recovery, SessionError};
use crate::media::{MediaEngine, MediaEvent, MediaSource, PathContext, PathState, SourceId};
use crate::peer::{PeerSession, SessionEvent};

pub struct SessionRegistry {
    sessions: HashMap<PeerIdentity, PeerSession>,
    engine: Arc<dyn MediaEngine>,
    media_events: mpsc::UnboundedSender<MediaEvent>,
    observer: Arc<dyn StationObserver>,
    format: AudioFormat,
}

impl SessionRegistry {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        media_events: mpsc::UnboundedSender<MediaEvent>,
        observer: Arc<dyn StationObserver>,
        format: AudioFormat,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            engine,
            media_events,
            observer,
            format,
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn established_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_established()).count()
    }

    pub fn contains(&self, identity: &PeerIdentity) -> bool {
        self.sessions.contains_key(identity)
    }

    pub fn get(&self, identity: &PeerIdentity) -> Option<&PeerSession> {
        self.sessions.get(identity)
    }

    pub fn identities(&self) -> Vec<PeerIdentity> {
        self.sessions.keys().copied().collect()
    }

    fn notify(&self) {
        self.observer.peer_count_changed(self.sessions.len());
    }

    fn resolve(
        &mut self,
        identity: &PeerIdentity,
        connection_id: ConnectionId,
    ) -> Option<&mut PeerSession> {
        match self.sessions.get_mut(identity) {
            Some(session) if session.connection_id() == connection_id => Some(session),
            Some(session) => {
                debug!(
                    "Dropping event for {} conn {} (current conn {})",
                    identity.short(),
                    connection_id,
                    session.connection_id()
                );
                None
            }
            None => None,
        }
    }

    /// Register a session for a new connection and start negotiation.
    /// An existing session for the same identity is replaced.
    pub async fn on_peer_connected(
        &mut self,
        connection_id: ConnectionId,
        transport: Arc<dyn Connection>,
        role: Role,
        source: Option<&MediaSource>,
    ) -> Result<&PeerSession, SessionError> {
        let identity = transport.remote_identity();
        let media = self.engine.create_path(PathContext {
            identity,
            connection_id,
            role,
            events: self.media_events.clone(),
        })?;
        let session = PeerSession::new(connection_id, transport, role, media, self.format);

        let session = match self.sessions.entry(identity) {
            Entry::Occupied(mut entry) => {
                let mut previous = entry.insert(session);
                info!(
                    "Replacing session for {} (conn {} -> {})",
                    identity.short(),
                    previous.connection_id(),
                    connection_id
                );
                previous.close();
                entry.into_mut()
            }
            Entry::Vacant(entry) => {
                info!("Peer {} connected as {:?}", identity.short(), role);
                entry.insert(session)
            }
        };

        if let Err(e) = session.start(source).await {
            warn!("Failed to start session with {}: {}", identity.short(), e);
            if let Some(mut failed) = self.sessions.remove(&identity) {
                failed.close();
            }
            self.notify();
            return Err(e);
        }

        self.notify();
        self.sessions
            .get(&identity)
            .ok_or(SessionError::Transport(TransportError::Closed))
    }

    /// Tear down the session for `identity`. With a connection id, only a
    /// session on that exact connection is removed.
    pub fn on_peer_disconnected(
        &mut self,
        identity: &PeerIdentity,
        connection_id: Option<ConnectionId>,
    ) -> bool {
        let current = match self.sessions.get(identity) {
            Some(session) => session.connection_id(),
            None => return false,
        };
        if connection_id.is_some_and(|id| id != current) {
            debug!(
                "Ignoring close of stale conn {:?} for {}",
                connection_id,
                identity.short()
            );
            return false;
        }
        if let Some(mut session) = self.sessions.remove(identity) {
            session.close();
            info!("Peer {} disconnected", identity.short());
            self.notify();
            return true;
        }
        false
    }

    /// Apply the recovery for a transport fault on one connection. Faults
    /// on a replaced connection are ignored like a stale close.
    pub fn on_transport_error(
        &mut self,
        identity: &PeerIdentity,
        connection_id: ConnectionId,
        error: TransportError,
    ) -> bool {
        let fault = SessionError::from(error);
        match fault.recovery() {
            Recovery::TearDownSession => {
                warn!(
                    "Transport fault on conn {} to {}: {}",
                    connection_id,
                    identity.short(),
                    fault
                );
                self.on_peer_disconnected(identity, Some(connection_id))
            }
            Recovery::DropMessage | Recovery::SkipPass => {
                debug!("Ignoring {} fault from {}", fault.kind().category(), identity.short());
                false
            }
        }
    }

    pub async fn dispatch(
        &mut self,
        identity: &PeerIdentity,
        connection_id: ConnectionId,
        message: WireMessage,
    ) -> Option<SessionEvent> {
        let session = self.resolve(identity, connection_id)?;
        session.handle_message(message).await
    }

    pub fn on_media_event(&mut self, event: MediaEvent) {
        let identity = event.identity();
        let Some(session) = self.resolve(&identity, event.connection_id()) else {
            return;
        };
        match event {
            MediaEvent::LocalCandidate { candidate, .. } => {
                session.send_local_candidate(candidate);
            }
            MediaEvent::StateChanged { state, .. } => {
                session.note_path_state(state);
                if state == PathState::Failed {
                    warn!("Media path to {} failed", identity.short());
                }
            }
        }
    }

    /// Write one encoded frame to every established session fed by `source`
    pub fn broadcast_audio(&self, frame: &Bytes, source: SourceId) -> usize {
        self.sessions
            .values()
            .filter(|s| s.source() == Some(source))
            .filter(|s| s.send_audio(frame.clone()))
            .count()
    }

    /// Send the stop sentinel to every live session
    pub fn broadcast_stop(&self) -> usize {
        let sent = self.sessions.values().filter(|s| s.send_stop()).count();
        debug!("Stop sentinel sent to {} peers", sent);
        sent
    }

    /// Move every outbound session onto `source`
    pub async fn replace_source(&mut self, source: &MediaSource) -> usize {
        let mut replaced = 0;
        for session in self.sessions.values_mut() {
            if session.role() != Role::Responder {
                continue;
            }
            match session.replace_source(source).await {
                Ok(()) => replaced += 1,
                Err(e) => warn!(
                    "Failed to switch {} to '{}': {}",
                    session.identity().short(),
                    source.label,
                    e
                ),
            }
        }
        replaced
    }

    /// Tear down every session, notifying once per removal
    pub fn clear(&mut self) {
        for identity in self.identities() {
            if let Some(mut session) = self.sessions.remove(&identity) {
                session.close();
                self.notify();
            }
        }
    }
}
