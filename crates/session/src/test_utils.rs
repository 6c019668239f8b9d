//! Test doubles for the session layer

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use swarmcast_core::{
    ConnectionId, PeerIdentity, StationObserver, TransportError, WireMessage,
};

use crate::errors::SessionError;
use crate::media::{
    Direction, MediaEngine, MediaPath, MediaSource, PathContext, PathState,
};
use crate::protocol::{ControlMessage, IceCandidate, SessionDescription};

/// Connection that records every write
pub struct MockConnection {
    identity: PeerIdentity,
    sent: Mutex<Vec<WireMessage>>,
    closed: AtomicBool,
}

impl MockConnection {
    pub fn new(identity: PeerIdentity) -> Self {
        Self {
            identity,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn sent(&self) -> Vec<WireMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Control messages written so far, decoded
    pub fn sent_control(&self) -> Vec<ControlMessage> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                WireMessage::Text(t) => ControlMessage::parse(&t).ok(),
                WireMessage::Binary(_) => None,
            })
            .collect()
    }

    pub fn sent_binary(&self) -> Vec<bytes::Bytes> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                WireMessage::Binary(b) => Some(b),
                WireMessage::Text(_) => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl swarmcast_core::Connection for MockConnection {
    fn remote_identity(&self) -> PeerIdentity {
        self.identity
    }

    fn write(&self, message: WireMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct PathLog {
    calls: Vec<&'static str>,
    candidates: Vec<String>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    track: Option<MediaSource>,
    direction: Option<Direction>,
    reject_candidates: Vec<String>,
    fail_remote: bool,
    closed: bool,
}

/// Media path that records calls; clones share the same log
#[derive(Clone, Default)]
pub struct MockMediaPath {
    log: Arc<Mutex<PathLog>>,
}

impl MockMediaPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_candidate(&self, candidate: &str) {
        self.log
            .lock()
            .unwrap()
            .reject_candidates
            .push(candidate.to_string());
    }

    pub fn fail_remote_description(&self) {
        self.log.lock().unwrap().fail_remote = true;
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().calls.clone()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.log.lock().unwrap().candidates.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.log.lock().unwrap().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.log.lock().unwrap().remote.clone()
    }

    pub fn track(&self) -> Option<MediaSource> {
        self.log.lock().unwrap().track.clone()
    }

    pub fn direction(&self) -> Option<Direction> {
        self.log.lock().unwrap().direction
    }

    pub fn is_closed(&self) -> bool {
        self.log.lock().unwrap().closed
    }

    fn record(&self, call: &'static str) {
        self.log.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl MediaPath for MockMediaPath {
    async fn create_offer(&mut self) -> Result<SessionDescription, SessionError> {
        self.record("create_offer");
        Ok(SessionDescription::offer("mock-offer"))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, SessionError> {
        self.record("create_answer");
        Ok(SessionDescription::answer("mock-answer"))
    }

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), SessionError> {
        self.record("set_local");
        self.log.lock().unwrap().local = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), SessionError> {
        self.record("set_remote");
        let mut log = self.log.lock().unwrap();
        if log.fail_remote {
            return Err(SessionError::InvalidDescription("mock failure".into()));
        }
        log.remote = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), SessionError> {
        self.record("add_candidate");
        let mut log = self.log.lock().unwrap();
        assert!(
            log.remote.is_some(),
            "candidate applied before remote description"
        );
        if log.reject_candidates.contains(&candidate.candidate) {
            return Err(SessionError::InvalidCandidate(candidate.candidate));
        }
        log.candidates.push(candidate.candidate);
        Ok(())
    }

    fn add_track(&mut self, source: &MediaSource) -> Result<(), SessionError> {
        self.record("add_track");
        self.log.lock().unwrap().track = Some(source.clone());
        Ok(())
    }

    fn add_transceiver(&mut self, direction: Direction) -> Result<(), SessionError> {
        self.record("add_transceiver");
        self.log.lock().unwrap().direction = Some(direction);
        Ok(())
    }

    async fn replace_track(&mut self, source: &MediaSource) -> Result<(), SessionError> {
        self.record("replace_track");
        self.log.lock().unwrap().track = Some(source.clone());
        Ok(())
    }

    fn state(&self) -> PathState {
        if self.is_closed() {
            PathState::Closed
        } else {
            PathState::New
        }
    }

    fn close(&mut self) {
        self.record("close");
        self.log.lock().unwrap().closed = true;
    }
}

/// Engine handing out [`MockMediaPath`]s and keeping a handle to each
#[derive(Default)]
pub struct MockEngine {
    paths: Mutex<Vec<(PeerIdentity, ConnectionId, MockMediaPath)>>,
    fail: AtomicBool,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn path(
        &self,
        identity: PeerIdentity,
        connection_id: ConnectionId,
    ) -> Option<MockMediaPath> {
        self.paths
            .lock()
            .unwrap()
            .iter()
            .find(|(i, c, _)| *i == identity && *c == connection_id)
            .map(|(_, _, p)| p.clone())
    }

    pub fn created(&self) -> usize {
        self.paths.lock().unwrap().len()
    }
}

impl MediaEngine for MockEngine {
    fn create_path(&self, context: PathContext) -> Result<Box<dyn MediaPath>, SessionError> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(SessionError::Media("mock engine failure".into()));
        }
        let path = MockMediaPath::new();
        self.paths
            .lock()
            .unwrap()
            .push((context.identity, context.connection_id, path.clone()));
        Ok(Box::new(path))
    }
}

/// Observer that records every peer-count notification
#[derive(Default)]
pub struct CountingObserver {
    counts: Mutex<Vec<usize>>,
    established: Mutex<Vec<PeerIdentity>>,
}

impl CountingObserver {
    pub fn counts(&self) -> Vec<usize> {
        self.counts.lock().unwrap().clone()
    }

    pub fn established(&self) -> Vec<PeerIdentity> {
        self.established.lock().unwrap().clone()
    }
}

impl StationObserver for CountingObserver {
    fn peer_count_changed(&self, count: usize) {
        self.counts.lock().unwrap().push(count);
    }

    fn peer_established(&self, peer: &PeerIdentity) {
        self.established.lock().unwrap().push(*peer);
    }
}

pub fn identity(byte: u8) -> PeerIdentity {
    PeerIdentity::from_bytes([byte; 32])
}
