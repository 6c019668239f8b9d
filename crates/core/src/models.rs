use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::traits::Connection;

/// Length in bytes of topic keys and peer identities
pub const KEY_LEN: usize = 32;

/// Error type for malformed hex keys
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseKeyError {
    #[error("key must be {expected} hex characters, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("key is not valid hex: {0}")]
    Hex(String),
}

fn decode_key(input: &str) -> Result<[u8; KEY_LEN], ParseKeyError> {
    let trimmed = input.trim();
    if trimmed.len() != KEY_LEN * 2 {
        return Err(ParseKeyError::Length {
            expected: KEY_LEN * 2,
            actual: trimmed.len(),
        });
    }
    let mut out = [0u8; KEY_LEN];
    hex::decode_to_slice(trimmed, &mut out).map_err(|e| ParseKeyError::Hex(e.to_string()))?;
    Ok(out)
}

macro_rules! key_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; KEY_LEN]);

        impl $name {
            pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
                Self(bytes)
            }

            /// Generate a fresh random key
            pub fn random() -> Self {
                Self(rand::random())
            }

            pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// First eight hex characters, for log lines
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl FromStr for $name {
            type Err = ParseKeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                decode_key(s).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }
    };
}

key_type!(
    /// Shared 32-byte key peers use to find each other on the substrate
    TopicKey
);

key_type!(
    /// Remote peer identifier, derived from the substrate's per-connection public key
    PeerIdentity
);

/// Substrate-assigned id distinguishing successive connections from the same peer
pub type ConnectionId = u64;

/// Which side of the offer/answer exchange a session plays
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Creates the offer (listener side)
    Initiator,
    /// Answers the offer (broadcaster side)
    Responder,
}

/// Process-wide station mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StationState {
    #[default]
    Idle,
    Broadcasting,
    Listening,
}

impl StationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StationState::Idle => "idle",
            StationState::Broadcasting => "broadcasting",
            StationState::Listening => "listening",
        }
    }

    /// Session role for connections accepted in this mode
    pub fn session_role(&self) -> Option<Role> {
        match self {
            StationState::Idle => None,
            StationState::Broadcasting => Some(Role::Responder),
            StationState::Listening => Some(Role::Initiator),
        }
    }
}

/// Snapshot of the station exposed to the presentation layer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StationStatus {
    pub state: StationState,
    pub topic: Option<TopicKey>,
    pub peer_count: usize,
}

impl StationStatus {
    pub fn is_broadcasting(&self) -> bool {
        self.state == StationState::Broadcasting
    }

    pub fn is_listening(&self) -> bool {
        self.state == StationState::Listening
    }

    /// Station id text; only a broadcaster shows its key
    pub fn station_id(&self) -> Option<String> {
        match (self.state, self.topic) {
            (StationState::Broadcasting, Some(topic)) => Some(topic.to_hex()),
            _ => None,
        }
    }

    /// Human readable station info block
    pub fn info_text(&self) -> String {
        match self.state {
            StationState::Idle => String::new(),
            StationState::Broadcasting => format!(
                "Station ID: {}\nConnected Peers: {}",
                self.station_id().unwrap_or_default(),
                self.peer_count
            ),
            StationState::Listening => format!("Connected Peers: {}", self.peer_count),
        }
    }
}

/// One message on a substrate connection. Boundaries are preserved end to end.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    /// UTF-8 control document
    Text(String),
    /// Raw audio bytes; an empty payload is the stop sentinel
    Binary(Bytes),
}

impl WireMessage {
    pub fn stop_sentinel() -> Self {
        WireMessage::Binary(Bytes::new())
    }

    pub fn is_stop_sentinel(&self) -> bool {
        matches!(self, WireMessage::Binary(b) if b.is_empty())
    }

    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(s) => s.len(),
            WireMessage::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Roles requested when joining a topic
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoinOptions {
    /// Accept inbound connections
    pub server: bool,
    /// Dial peers announcing the topic
    pub client: bool,
}

impl JoinOptions {
    pub const ACCEPT: Self = Self {
        server: true,
        client: false,
    };
    pub const INITIATE: Self = Self {
        server: false,
        client: true,
    };
}

/// Events raised by the discovery substrate
#[derive(Clone)]
pub enum SubstrateEvent {
    Connected {
        connection_id: ConnectionId,
        connection: Arc<dyn Connection>,
    },
    Data {
        identity: PeerIdentity,
        connection_id: ConnectionId,
        message: WireMessage,
    },
    Closed {
        identity: PeerIdentity,
        connection_id: ConnectionId,
    },
    Error {
        identity: PeerIdentity,
        connection_id: ConnectionId,
        error: String,
    },
}

impl fmt::Debug for SubstrateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubstrateEvent::Connected {
                connection_id,
                connection,
            } => f
                .debug_struct("Connected")
                .field("identity", &connection.remote_identity())
                .field("connection_id", connection_id)
                .finish(),
            SubstrateEvent::Data {
                identity,
                connection_id,
                message,
            } => f
                .debug_struct("Data")
                .field("identity", identity)
                .field("connection_id", connection_id)
                .field("len", &message.len())
                .finish(),
            SubstrateEvent::Closed {
                identity,
                connection_id,
            } => f
                .debug_struct("Closed")
                .field("identity", identity)
                .field("connection_id", connection_id)
                .finish(),
            SubstrateEvent::Error {
                identity,
                connection_id,
                error,
            } => f
                .debug_struct("Error")
                .field("identity", identity)
                .field("connection_id", connection_id)
                .field("error", error)
                .finish(),
        }
    }
}
