use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use swarmcast_core::{AudioFormat, Connection, ConnectionId, PeerIdentity, Role, WireMessage};
use tracing::{debug, info, warn};

use crate::errors::{Recovery, SessionError};
use crate::framing::{FrameAssembler, Inbound};
use crate::media::{Direction, MediaPath, MediaSource, PathState, SourceId};
use crate::negotiation::{Negotiation, NegotiationState};
use crate::protocol::{ControlMessage, IceCandidate};

/// Something the station has to act on after a message was handled
#[derive(Debug, PartialEq)]
pub enum SessionEvent {
    /// Negotiation reached `Established`; raised once per session
    Established,
    /// Decoded inbound frames ready for playback
    Audio(Vec<Vec<f32>>),
    /// Remote sent the stop sentinel
    Stopped,
}

/// All per-peer state, owned by the registry
pub struct PeerSession {
    identity: PeerIdentity,
    connection_id: ConnectionId,
    transport: Arc<dyn Connection>,
    negotiation: Negotiation,
    media: Option<Box<dyn MediaPath>>,
    assembler: FrameAssembler,
    source: Option<SourceId>,
    path_state: PathState,
    created_at: Instant,
}

impl PeerSession {
    pub fn new(
        connection_id: ConnectionId,
        transport: Arc<dyn Connection>,
        role: Role,
        media: Box<dyn MediaPath>,
        format: AudioFormat,
    ) -> Self {
        Self {
            identity: transport.remote_identity(),
            connection_id,
            transport,
            negotiation: Negotiation::new(role),
            media: Some(media),
            assembler: FrameAssembler::new(format),
            source: None,
            path_state: PathState::New,
            created_at: Instant::now(),
        }
    }

    pub fn identity(&self) -> PeerIdentity {
        self.identity
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn role(&self) -> Role {
        self.negotiation.role()
    }

    pub fn state(&self) -> NegotiationState {
        self.negotiation.state()
    }

    pub fn is_established(&self) -> bool {
        self.negotiation.is_established()
    }

    pub fn queued_candidates(&self) -> usize {
        self.negotiation.queued_candidates()
    }

    pub fn applied_candidates(&self) -> usize {
        self.negotiation.applied_candidates()
    }

    /// Outbound capture source, responder side only
    pub fn source(&self) -> Option<SourceId> {
        self.source
    }

    pub fn pending_audio_bytes(&self) -> usize {
        self.assembler.pending()
    }

    pub fn path_state(&self) -> PathState {
        self.path_state
    }

    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }

    fn log_fault(&self, context: &str, error: &SessionError) {
        match error.recovery() {
            Recovery::DropMessage | Recovery::SkipPass => warn!(
                "{} from {} dropped ({}): {}",
                context,
                self.identity.short(),
                error.kind().category(),
                error
            ),
            Recovery::TearDownSession => {
                warn!("{} for {} failed: {}", context, self.identity.short(), error)
            }
        }
    }

    /// Prepare the media path for this session's role and, as initiator,
    /// send the offer
    pub async fn start(&mut self, source: Option<&MediaSource>) -> Result<(), SessionError> {
        let media = self
            .media
            .as_deref_mut()
            .ok_or_else(|| SessionError::Media("media path released".to_string()))?;
        match self.negotiation.role() {
            Role::Initiator => {
                media.add_transceiver(Direction::RecvOnly)?;
                self.negotiation
                    .initiate(media, self.transport.as_ref())
                    .await?;
                info!("Sent offer to {}", self.identity.short());
            }
            Role::Responder => {
                if let Some(source) = source {
                    media.add_track(source)?;
                    self.source = Some(source.id);
                } else {
                    warn!(
                        "No capture source for {}; answering without a track",
                        self.identity.short()
                    );
                }
            }
        }
        Ok(())
    }

    /// Dispatch one inbound message by kind
    pub async fn handle_message(&mut self, message: WireMessage) -> Option<SessionEvent> {
        match message {
            WireMessage::Text(text) => self.handle_control(&text).await,
            WireMessage::Binary(bytes) => self.handle_audio(&bytes),
        }
    }

    async fn handle_control(&mut self, text: &str) -> Option<SessionEvent> {
        let message = match ControlMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                self.log_fault("Control message", &e);
                return None;
            }
        };
        let kind = message.kind();
        debug!("Received {} from {}", kind, self.identity.short());

        let Some(media) = self.media.as_deref_mut() else {
            debug!("Dropping {} for released session", kind);
            return None;
        };
        let was_established = self.negotiation.is_established();

        let result = match message {
            ControlMessage::Offer { offer } => self
                .negotiation
                .on_offer(offer, media, self.transport.as_ref())
                .await
                .map(|_| ()),
            ControlMessage::Answer { answer } => {
                self.negotiation.on_answer(answer, media).await.map(|_| ())
            }
            ControlMessage::Candidate { candidate } => self
                .negotiation
                .on_candidate(candidate, media)
                .await
                .map(|_| ()),
        };
        if let Err(e) = result {
            self.log_fault(kind, &e);
            return None;
        }

        if !was_established && self.negotiation.is_established() {
            info!(
                "Session with {} established after {:?}",
                self.identity.short(),
                self.created_at.elapsed()
            );
            return Some(SessionEvent::Established);
        }
        None
    }

    fn handle_audio(&mut self, bytes: &[u8]) -> Option<SessionEvent> {
        match self.assembler.push(bytes) {
            Inbound::Stop => {
                debug!("Stop sentinel from {}", self.identity.short());
                Some(SessionEvent::Stopped)
            }
            Inbound::Frames { frames, fault } => {
                if let Some(e) = fault {
                    self.log_fault("Audio frame", &e);
                }
                if frames.is_empty() {
                    None
                } else {
                    Some(SessionEvent::Audio(frames))
                }
            }
        }
    }

    /// Forward a locally gathered candidate; `None` ends gathering
    pub fn send_local_candidate(&self, candidate: Option<IceCandidate>) {
        let Some(candidate) = candidate else {
            debug!("Candidate gathering complete for {}", self.identity.short());
            return;
        };
        if self.negotiation.state() == NegotiationState::Closed {
            return;
        }
        let message = ControlMessage::Candidate { candidate };
        match message.to_wire() {
            Ok(wire) => {
                if let Err(e) = self.transport.write(wire) {
                    warn!("Failed to send candidate to {}: {}", self.identity.short(), e);
                }
            }
            Err(e) => warn!("Failed to encode candidate: {}", e),
        }
    }

    pub fn note_path_state(&mut self, state: PathState) {
        if self.path_state == state {
            return;
        }
        info!(
            "ICE connection state for {}: {} -> {}",
            self.identity.short(),
            self.path_state.as_str(),
            state.as_str()
        );
        self.path_state = state;
    }

    fn write_binary(&self, payload: Bytes) -> bool {
        match self.transport.write(WireMessage::Binary(payload)) {
            Ok(()) => true,
            Err(e) => {
                debug!("Audio write to {} failed: {}", self.identity.short(), e);
                false
            }
        }
    }

    /// Write one encoded frame; only established sessions carry audio
    pub fn send_audio(&self, frame: Bytes) -> bool {
        if !self.is_established() || self.media.is_none() {
            return false;
        }
        self.write_binary(frame)
    }

    /// Send the stop sentinel, whether or not negotiation has finished
    pub fn send_stop(&self) -> bool {
        if self.media.is_none() {
            return false;
        }
        self.write_binary(Bytes::new())
    }

    /// Point the outbound track at a new capture source
    pub async fn replace_source(&mut self, source: &MediaSource) -> Result<(), SessionError> {
        if self.role() != Role::Responder {
            return Ok(());
        }
        let media = self
            .media
            .as_deref_mut()
            .ok_or_else(|| SessionError::Media("media path released".to_string()))?;
        media.replace_track(source).await?;
        self.source = Some(source.id);
        Ok(())
    }

    /// Release the media path and drop all per-session buffers
    pub fn close(&mut self) {
        if let Some(mut media) = self.media.take() {
            media.close();
        }
        self.negotiation.close();
        self.assembler.reset();
        self.transport.close();
        debug!(
            "Closed session with {} (conn {})",
            self.identity.short(),
            self.connection_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::encode_block;
    use crate::protocol::SessionDescription;
    use crate::test_utils::{identity, MockConnection, MockMediaPath};

    const FORMAT: AudioFormat = AudioFormat {
        sample_rate: 48000,
        channels: 1,
        frame_len: 4,
    };

    fn session(role: Role) -> (PeerSession, Arc<MockConnection>, MockMediaPath) {
        let conn = Arc::new(MockConnection::new(identity(1)));
        let path = MockMediaPath::new();
        let session = PeerSession::new(3, conn.clone(), role, Box::new(path.clone()), FORMAT);
        (session, conn, path)
    }

    fn control(message: ControlMessage) -> WireMessage {
        message.to_wire().unwrap()
    }

    #[tokio::test]
    async fn test_initiator_start_sends_offer() {
        let (mut session, conn, path) = session(Role::Initiator);
        session.start(None).await.unwrap();

        assert_eq!(path.direction(), Some(Direction::RecvOnly));
        assert_eq!(session.state(), NegotiationState::OfferSent);
        assert!(matches!(
            conn.sent_control().as_slice(),
            [ControlMessage::Offer { .. }]
        ));
    }

    #[tokio::test]
    async fn test_responder_established_once() {
        let (mut session, conn, path) = session(Role::Responder);
        let source = MediaSource {
            id: 5,
            label: "mic".into(),
        };
        session.start(Some(&source)).await.unwrap();
        assert_eq!(path.track(), Some(source));
        assert_eq!(session.source(), Some(5));

        let offer = control(ControlMessage::Offer {
            offer: SessionDescription::offer("o"),
        });
        assert_eq!(
            session.handle_message(offer.clone()).await,
            Some(SessionEvent::Established)
        );
        assert_eq!(session.handle_message(offer).await, None);
        assert_eq!(conn.sent_control().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_control_dropped() {
        let (mut session, conn, _path) = session(Role::Responder);
        assert_eq!(
            session
                .handle_message(WireMessage::Text("{\"type\":42}".into()))
                .await,
            None
        );
        assert_eq!(session.state(), NegotiationState::Idle);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_audio_and_stop() {
        let (mut session, _conn, _path) = session(Role::Initiator);
        let frame = encode_block(&[0.1, 0.2, 0.3, 0.4, 0.5]);
        match session.handle_message(WireMessage::Binary(frame)).await {
            Some(SessionEvent::Audio(frames)) => assert_eq!(frames, vec![vec![0.1, 0.2, 0.3, 0.4]]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.pending_audio_bytes(), 4);

        assert_eq!(
            session.handle_message(WireMessage::stop_sentinel()).await,
            Some(SessionEvent::Stopped)
        );
        assert_eq!(session.pending_audio_bytes(), 0);
    }

    #[tokio::test]
    async fn test_send_audio_only_when_established() {
        let (mut session, conn, _path) = session(Role::Responder);
        assert!(!session.send_audio(encode_block(&[1.0])));

        session
            .handle_message(control(ControlMessage::Offer {
                offer: SessionDescription::offer("o"),
            }))
            .await;
        assert!(session.send_audio(encode_block(&[1.0])));
        assert!(session.send_stop());
        let binary = conn.sent_binary();
        assert_eq!(binary.len(), 2);
        assert!(binary[1].is_empty());
    }

    #[tokio::test]
    async fn test_local_candidates_forwarded_except_end_marker() {
        let (session, conn, _path) = session(Role::Initiator);
        session.send_local_candidate(Some(IceCandidate::new("candidate:1")));
        session.send_local_candidate(None);
        let sent = conn.sent_control();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), "candidate");
    }

    #[tokio::test]
    async fn test_close_releases_media_once() {
        let (mut session, conn, path) = session(Role::Responder);
        session.close();
        session.close();
        assert!(!session.has_media());
        assert!(conn.is_closed());
        assert_eq!(session.state(), NegotiationState::Closed);
        assert_eq!(path.calls().iter().filter(|c| **c == "close").count(), 1);
    }
}
