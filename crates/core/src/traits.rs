use crate::config::AudioFormat;
use crate::models::{
    JoinOptions, PeerIdentity, StationStatus, SubstrateEvent, TopicKey, WireMessage,
};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Errors surfaced by a substrate connection handle
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("message of {0} bytes exceeds the frame limit")]
    TooLarge(usize),
    /// The connection failed underneath us
    #[error("{0}")]
    Io(String),
}

/// Duplex, ordered, reliable byte stream to one remote peer
///
/// Writes are fire-and-forget: a successful return only means the message was
/// queued. Delivery failures show up later as `Closed`/`Error` events.
pub trait Connection: Send + Sync {
    fn remote_identity(&self) -> PeerIdentity;

    fn write(&self, message: WireMessage) -> Result<(), TransportError>;

    /// Tear the connection down; a `Closed` event follows
    fn close(&self);
}

/// Peer discovery and connection establishment keyed by topic
#[async_trait]
pub trait Substrate: Send {
    /// Identity this node presents to remote peers
    fn local_identity(&self) -> PeerIdentity;

    /// Start announcing and/or looking up `topic`. Events for every
    /// connection made under this join are delivered on `events`.
    async fn join(
        &mut self,
        topic: TopicKey,
        options: JoinOptions,
        events: mpsc::UnboundedSender<SubstrateEvent>,
    ) -> Result<()>;

    /// Leave every topic and close all connections
    async fn destroy(&mut self);
}

/// A running capture: fixed-size sample blocks plus a stop switch
pub struct CaptureStream {
    pub device_name: String,
    pub blocks: mpsc::Receiver<Vec<f32>>,
    pub stop: mpsc::Sender<()>,
}

/// Local audio input
#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Open `device` (or the default input) and start delivering blocks of
    /// exactly `format.frame_len * format.channels` samples
    async fn start(&self, device: Option<&str>, format: AudioFormat) -> Result<CaptureStream>;

    /// Names of the available input devices
    fn list_devices(&self) -> Result<Vec<String>>;
}

/// Local audio output
#[async_trait]
pub trait AudioPlayback: Send {
    async fn open(&mut self, format: AudioFormat) -> Result<()>;

    /// Queue one decoded frame for rendering
    async fn play(&mut self, samples: &[f32]) -> Result<()>;

    /// Drop everything queued (remote stopped)
    async fn reset(&mut self);

    async fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Presentation-layer hooks
pub trait StationObserver: Send + Sync {
    fn peer_count_changed(&self, count: usize);

    fn status_changed(&self, _status: &StationStatus) {}

    fn peer_established(&self, _peer: &PeerIdentity) {}

    /// An operation failed in a way the user can act on
    fn failure(&self, _message: &str) {}
}
