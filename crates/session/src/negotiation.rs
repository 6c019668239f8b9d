//! Offer/answer negotiation
//!
//! Drives one media path from `Idle` to `Established`. Remote candidates that
//! arrive before the remote description are parked in a [`CandidateQueue`]
//! and applied, in order and exactly once, right after the description is
//! set. Messages that are not legal in the current state are rejected
//! without touching the state.

use swarmcast_core::{Connection, Role};
use tracing::{debug, info, warn};

use crate::candidates::CandidateQueue;
use crate::errors::SessionError;
use crate::media::MediaPath;
use crate::protocol::{ControlMessage, IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Established,
    Closed,
}

impl NegotiationState {
    /// Position along the forward path; transitions never decrease it
    fn rank(&self) -> u8 {
        match self {
            NegotiationState::Idle => 0,
            NegotiationState::OfferSent | NegotiationState::OfferReceived => 1,
            NegotiationState::AnswerSent | NegotiationState::AnswerReceived => 2,
            NegotiationState::Established => 3,
            NegotiationState::Closed => 4,
        }
    }
}

/// What happened to an inbound candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Queued,
    /// The media path refused it; the session carries on
    Rejected,
}

#[derive(Debug)]
pub struct Negotiation {
    role: Role,
    state: NegotiationState,
    remote_set: bool,
    queue: CandidateQueue,
    applied_candidates: usize,
}

impl Negotiation {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: NegotiationState::Idle,
            remote_set: false,
            queue: CandidateQueue::new(),
            applied_candidates: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == NegotiationState::Established
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_set
    }

    pub fn queued_candidates(&self) -> usize {
        self.queue.len()
    }

    /// Candidates successfully handed to the media path so far
    pub fn applied_candidates(&self) -> usize {
        self.applied_candidates
    }

    fn advance(&mut self, next: NegotiationState) {
        debug_assert!(
            next.rank() > self.state.rank(),
            "negotiation moved backwards: {:?} -> {:?}",
            self.state,
            next
        );
        debug!("Negotiation {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn unexpected(&self, message: &'static str) -> SessionError {
        SessionError::UnexpectedMessage {
            state: self.state,
            message,
        }
    }

    fn send(transport: &dyn Connection, message: &ControlMessage) {
        let wire = match message.to_wire() {
            Ok(wire) => wire,
            Err(e) => {
                warn!("Failed to encode {}: {}", message.kind(), e);
                return;
            }
        };
        if let Err(e) = transport.write(wire) {
            // The transport reports its own close; nothing to undo here
            warn!(
                "Failed to send {} to {}: {}",
                message.kind(),
                transport.remote_identity().short(),
                e
            );
        }
    }

    /// Create and send the local offer (initiator side)
    pub async fn initiate(
        &mut self,
        path: &mut dyn MediaPath,
        transport: &dyn Connection,
    ) -> Result<NegotiationState, SessionError> {
        if self.state != NegotiationState::Idle {
            return Err(self.unexpected("initiate"));
        }
        let offer = path.create_offer().await?;
        path.set_local_description(offer.clone()).await?;
        Self::send(transport, &ControlMessage::Offer { offer });
        self.advance(NegotiationState::OfferSent);
        Ok(self.state)
    }

    /// Apply a remote offer and answer it (responder side)
    pub async fn on_offer(
        &mut self,
        offer: SessionDescription,
        path: &mut dyn MediaPath,
        transport: &dyn Connection,
    ) -> Result<NegotiationState, SessionError> {
        match self.state {
            NegotiationState::Idle => {}
            NegotiationState::Established | NegotiationState::Closed => {
                warn!("Ignoring offer while {:?}", self.state);
                return Err(self.unexpected("offer"));
            }
            _ => return Err(self.unexpected("offer")),
        }

        path.set_remote_description(offer).await?;
        self.remote_set = true;
        self.advance(NegotiationState::OfferReceived);
        self.drain_candidates(path).await;

        // A failure past this point leaves the session in OfferReceived
        let answer = path.create_answer().await?;
        path.set_local_description(answer.clone()).await?;
        Self::send(transport, &ControlMessage::Answer { answer });
        self.advance(NegotiationState::AnswerSent);

        // The answer is applied locally, so the path is usable now
        self.advance(NegotiationState::Established);
        info!("Negotiation established as {:?}", self.role);
        Ok(self.state)
    }

    /// Apply the remote answer to our outstanding offer
    pub async fn on_answer(
        &mut self,
        answer: SessionDescription,
        path: &mut dyn MediaPath,
    ) -> Result<NegotiationState, SessionError> {
        if self.state != NegotiationState::OfferSent {
            return Err(self.unexpected("answer"));
        }

        path.set_remote_description(answer).await?;
        self.remote_set = true;
        self.advance(NegotiationState::AnswerReceived);
        self.drain_candidates(path).await;

        self.advance(NegotiationState::Established);
        info!("Negotiation established as {:?}", self.role);
        Ok(self.state)
    }

    pub async fn on_candidate(
        &mut self,
        candidate: IceCandidate,
        path: &mut dyn MediaPath,
    ) -> Result<CandidateDisposition, SessionError> {
        if self.state == NegotiationState::Closed {
            return Err(self.unexpected("candidate"));
        }
        if !self.remote_set {
            self.queue.enqueue(candidate);
            debug!("Queued remote candidate ({} pending)", self.queue.len());
            return Ok(CandidateDisposition::Queued);
        }
        Ok(self.apply_candidate(candidate, path).await)
    }

    async fn apply_candidate(
        &mut self,
        candidate: IceCandidate,
        path: &mut dyn MediaPath,
    ) -> CandidateDisposition {
        match path.add_ice_candidate(candidate).await {
            Ok(()) => {
                self.applied_candidates += 1;
                CandidateDisposition::Applied
            }
            Err(e) => {
                warn!("Failed to apply remote candidate: {}", e);
                CandidateDisposition::Rejected
            }
        }
    }

    async fn drain_candidates(&mut self, path: &mut dyn MediaPath) {
        let pending = self.queue.drain();
        if pending.is_empty() {
            return;
        }
        debug!("Applying {} queued candidates", pending.len());
        for candidate in pending {
            self.apply_candidate(candidate, path).await;
        }
    }

    /// Terminal transition; the owner releases the media path
    pub fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        let dropped = self.queue.discard();
        if dropped > 0 {
            debug!("Discarded {} queued candidates on close", dropped);
        }
        self.advance(NegotiationState::Closed);
    }
}
