//! Per-peer session layer
//!
//! Everything between "a transport connection to a peer exists" and "decoded
//! audio frames are ready to play": control message protocol, offer/answer
//! negotiation with candidate queuing, the media primitive seam, the audio
//! framing codec, and the registry that owns one session per remote peer.

pub mod candidates;
pub mod errors;
pub mod framing;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod protocol;
pub mod registry;

#[cfg(test)]
pub mod test_utils;

pub use candidates::CandidateQueue;
pub use errors::{FaultKind, Recovery, SessionError};
pub use framing::{decode_frame, encode_block, FrameAssembler, Inbound};
pub use media::{
    Direction, MediaEngine, MediaEvent, MediaPath, MediaSource, PathContext, PathState,
    PcmEngine, SourceId,
};
pub use negotiation::{CandidateDisposition, Negotiation, NegotiationState};
pub use peer::{PeerSession, SessionEvent};
pub use protocol::{ControlMessage, IceCandidate, SdpType, SessionDescription};
pub use registry::SessionRegistry;
