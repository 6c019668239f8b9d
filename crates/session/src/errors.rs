//! Fault taxonomy for the session layer
//!
//! Every failure maps to one [`FaultKind`], and each kind has a fixed
//! [`Recovery`] that sessions and the registry act on. Nothing here is fatal
//! to the process: the worst outcome is tearing down a single peer session.
//! Device faults belong to the station and never reach this layer.

use swarmcast_core::TransportError;
use thiserror::Error;

use crate::negotiation::NegotiationState;

/// Fault categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Connection closed or errored
    Transport,
    /// Malformed or out-of-state control message, or a rejected description/candidate
    Negotiation,
    /// Binary frame could not be decoded
    Decode,
}

/// What the caller does after a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Remove the session and release its media path
    TearDownSession,
    /// Log and drop the message; the session stays usable
    DropMessage,
    /// Discard the frame and stop this decode pass; buffered bytes are kept
    SkipPass,
}

impl FaultKind {
    pub fn category(&self) -> &'static str {
        match self {
            FaultKind::Transport => "transport",
            FaultKind::Negotiation => "negotiation",
            FaultKind::Decode => "decode",
        }
    }

    pub fn recovery(&self) -> Recovery {
        match self {
            FaultKind::Transport => Recovery::TearDownSession,
            FaultKind::Negotiation => Recovery::DropMessage,
            FaultKind::Decode => Recovery::SkipPass,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("malformed control message: {0}")]
    MalformedMessage(String),

    #[error("unexpected {message} in state {state:?}")]
    UnexpectedMessage {
        state: NegotiationState,
        message: &'static str,
    },

    #[error("media path rejected operation: {0}")]
    Media(String),

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("corrupt audio frame: {0}")]
    Decode(String),
}

impl SessionError {
    pub fn kind(&self) -> FaultKind {
        match self {
            SessionError::MalformedMessage(_)
            | SessionError::UnexpectedMessage { .. }
            | SessionError::Media(_)
            | SessionError::InvalidDescription(_)
            | SessionError::InvalidCandidate(_) => FaultKind::Negotiation,
            SessionError::Transport(_) => FaultKind::Transport,
            SessionError::Decode(_) => FaultKind::Decode,
        }
    }

    pub fn recovery(&self) -> Recovery {
        self.kind().recovery()
    }
}
