//! Media primitive seam
//!
//! A [`MediaEngine`] hands out one [`MediaPath`] per peer session. The path
//! owns description and candidate handling; the built-in [`PcmEngine`]
//! describes raw f32 PCM carried over the session's own transport.

use async_trait::async_trait;
use std::net::IpAddr;
use swarmcast_core::{AudioFormat, ConnectionId, PeerIdentity, Role};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::SessionError;
use crate::protocol::{IceCandidate, SdpType, SessionDescription};

/// Identifier of a capture source attached to outbound paths
pub type SourceId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSource {
    pub id: SourceId,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendOnly,
    RecvOnly,
    SendRecv,
    Inactive,
}

impl Direction {
    pub fn as_attr(&self) -> &'static str {
        match self {
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::SendRecv => "sendrecv",
            Direction::Inactive => "inactive",
        }
    }

    fn from_attr(attr: &str) -> Option<Self> {
        match attr {
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "sendrecv" => Some(Direction::SendRecv),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }

    /// Direction seen from the other end
    pub fn reverse(&self) -> Self {
        match self {
            Direction::SendOnly => Direction::RecvOnly,
            Direction::RecvOnly => Direction::SendOnly,
            other => *other,
        }
    }
}

/// Connectivity state of a media path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    New,
    Checking,
    Connected,
    Failed,
    Closed,
}

impl PathState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PathState::New => "new",
            PathState::Checking => "checking",
            PathState::Connected => "connected",
            PathState::Failed => "failed",
            PathState::Closed => "closed",
        }
    }
}

/// Asynchronous notifications from a media path
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// A gathered local candidate; `None` marks the end of gathering
    LocalCandidate {
        identity: PeerIdentity,
        connection_id: ConnectionId,
        candidate: Option<IceCandidate>,
    },
    StateChanged {
        identity: PeerIdentity,
        connection_id: ConnectionId,
        state: PathState,
    },
}

impl MediaEvent {
    pub fn identity(&self) -> PeerIdentity {
        match self {
            MediaEvent::LocalCandidate { identity, .. }
            | MediaEvent::StateChanged { identity, .. } => *identity,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        match self {
            MediaEvent::LocalCandidate { connection_id, .. }
            | MediaEvent::StateChanged { connection_id, .. } => *connection_id,
        }
    }
}

/// Everything a path needs to report back to the session that owns it
#[derive(Debug, Clone)]
pub struct PathContext {
    pub identity: PeerIdentity,
    pub connection_id: ConnectionId,
    pub role: Role,
    pub events: mpsc::UnboundedSender<MediaEvent>,
}

impl PathContext {
    fn emit_candidate(&self, candidate: Option<IceCandidate>) {
        let _ = self.events.send(MediaEvent::LocalCandidate {
            identity: self.identity,
            connection_id: self.connection_id,
            candidate,
        });
    }

    fn emit_state(&self, state: PathState) {
        let _ = self.events.send(MediaEvent::StateChanged {
            identity: self.identity,
            connection_id: self.connection_id,
            state,
        });
    }
}

/// Per-session media handle
#[async_trait]
pub trait MediaPath: Send {
    async fn create_offer(&mut self) -> Result<SessionDescription, SessionError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, SessionError>;

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), SessionError>;

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), SessionError>;

    /// Only valid once the remote description is set
    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), SessionError>;

    /// Attach an outbound source
    fn add_track(&mut self, source: &MediaSource) -> Result<(), SessionError>;

    fn add_transceiver(&mut self, direction: Direction) -> Result<(), SessionError>;

    /// Swap the outbound source without renegotiating
    async fn replace_track(&mut self, source: &MediaSource) -> Result<(), SessionError>;

    fn state(&self) -> PathState;

    /// Release the path; idempotent
    fn close(&mut self);
}

pub trait MediaEngine: Send + Sync {
    fn create_path(&self, context: PathContext) -> Result<Box<dyn MediaPath>, SessionError>;
}

/// PCM parameters advertised in a description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_len: Option<usize>,
    pub direction: Direction,
}

const PAYLOAD_TYPE: u8 = 96;
const ENCODING: &str = "L32F";

/// Parse and validate an SDP-style PCM description
pub fn parse_description(sdp: &str) -> Result<PcmParams, SessionError> {
    let mut lines = sdp.lines().map(str::trim).filter(|l| !l.is_empty());
    if lines.next() != Some("v=0") {
        return Err(SessionError::InvalidDescription(
            "missing version line".to_string(),
        ));
    }

    let mut has_audio = false;
    let mut rate_channels = None;
    let mut frame_len = None;
    let mut direction = Direction::SendRecv;

    for line in lines {
        if line.starts_with("m=audio ") {
            has_audio = true;
        } else if let Some(map) = line.strip_prefix("a=rtpmap:") {
            let codec = map
                .split_whitespace()
                .nth(1)
                .ok_or_else(|| SessionError::InvalidDescription(format!("bad rtpmap '{}'", line)))?;
            let mut parts = codec.split('/');
            if parts.next() != Some(ENCODING) {
                return Err(SessionError::InvalidDescription(format!(
                    "unsupported encoding '{}'",
                    codec
                )));
            }
            let rate = parts
                .next()
                .and_then(|r| r.parse::<u32>().ok())
                .filter(|r| *r > 0)
                .ok_or_else(|| {
                    SessionError::InvalidDescription(format!("bad rate in '{}'", codec))
                })?;
            let channels = match parts.next() {
                Some(c) => c
                    .parse::<u16>()
                    .ok()
                    .filter(|c| *c > 0)
                    .ok_or_else(|| {
                        SessionError::InvalidDescription(format!("bad channels in '{}'", codec))
                    })?,
                None => 1,
            };
            rate_channels = Some((rate, channels));
        } else if let Some(len) = line.strip_prefix("a=framelen:") {
            frame_len = len.parse::<usize>().ok();
        } else if let Some(dir) = line.strip_prefix("a=").and_then(Direction::from_attr) {
            direction = dir;
        }
    }

    if !has_audio {
        return Err(SessionError::InvalidDescription(
            "no audio section".to_string(),
        ));
    }
    let (sample_rate, channels) = rate_channels
        .ok_or_else(|| SessionError::InvalidDescription("no rtpmap".to_string()))?;

    Ok(PcmParams {
        sample_rate,
        channels,
        frame_len,
        direction,
    })
}

/// Media engine for raw PCM over the peer transport
#[derive(Debug, Clone)]
pub struct PcmEngine {
    format: AudioFormat,
    ice_servers: Vec<String>,
    host_addresses: Vec<IpAddr>,
}

impl PcmEngine {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            ice_servers: Vec::new(),
            host_addresses: Vec::new(),
        }
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    /// Addresses advertised as host candidates
    pub fn with_host_addresses(mut self, addresses: Vec<IpAddr>) -> Self {
        self.host_addresses = addresses;
        self
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }
}

impl MediaEngine for PcmEngine {
    fn create_path(&self, context: PathContext) -> Result<Box<dyn MediaPath>, SessionError> {
        debug!(
            "Creating media path for {} (conn {}, {} ICE servers)",
            context.identity.short(),
            context.connection_id,
            self.ice_servers.len()
        );
        Ok(Box::new(PcmMediaPath::new(
            context,
            self.format,
            self.host_addresses.clone(),
        )))
    }
}

pub struct PcmMediaPath {
    context: PathContext,
    format: AudioFormat,
    host_addresses: Vec<IpAddr>,
    direction: Option<Direction>,
    track: Option<MediaSource>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_params: Option<PcmParams>,
    remote_candidates: Vec<IceCandidate>,
    state: PathState,
}

impl PcmMediaPath {
    pub fn new(context: PathContext, format: AudioFormat, host_addresses: Vec<IpAddr>) -> Self {
        Self {
            context,
            format,
            host_addresses,
            direction: None,
            track: None,
            local: None,
            remote: None,
            remote_params: None,
            remote_candidates: Vec::new(),
            state: PathState::New,
        }
    }

    pub fn remote_params(&self) -> Option<PcmParams> {
        self.remote_params
    }

    pub fn remote_candidates(&self) -> &[IceCandidate] {
        &self.remote_candidates
    }

    pub fn track(&self) -> Option<&MediaSource> {
        self.track.as_ref()
    }

    fn build_sdp(&self, direction: Direction) -> String {
        let mut lines = vec![
            "v=0".to_string(),
            format!("o=- {} 2 IN IP4 0.0.0.0", self.context.connection_id),
            "s=swarmcast".to_string(),
            "t=0 0".to_string(),
            format!("m=audio 9 TCP/PCM {}", PAYLOAD_TYPE),
            "c=IN IP4 0.0.0.0".to_string(),
            "a=mid:0".to_string(),
            format!(
                "a=rtpmap:{} {}/{}/{}",
                PAYLOAD_TYPE, ENCODING, self.format.sample_rate, self.format.channels
            ),
            format!("a=ptime:{:.0}", self.format.frame_ms()),
            format!("a=framelen:{}", self.format.frame_len),
            format!("a={}", direction.as_attr()),
        ];
        if let Some(track) = &self.track {
            lines.push(format!("a=msid:{} audio", track.id));
        }
        let mut sdp = lines.join("\r\n");
        sdp.push_str("\r\n");
        sdp
    }

    fn set_state(&mut self, state: PathState) {
        if self.state != state {
            self.state = state;
            self.context.emit_state(state);
        }
    }

    fn gather(&self) {
        for (index, address) in self.host_addresses.iter().enumerate() {
            let priority = 2_130_706_431u32.saturating_sub(index as u32);
            let candidate = IceCandidate::new(format!(
                "candidate:{} 1 tcp {} {} 9 typ host tcptype passive",
                index + 1,
                priority,
                address
            ));
            self.context.emit_candidate(Some(candidate));
        }
        self.context.emit_candidate(None);
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.state == PathState::Closed {
            return Err(SessionError::Media("media path is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaPath for PcmMediaPath {
    async fn create_offer(&mut self) -> Result<SessionDescription, SessionError> {
        self.ensure_open()?;
        let direction = self
            .direction
            .ok_or_else(|| SessionError::Media("no track or transceiver to offer".to_string()))?;
        Ok(SessionDescription::offer(self.build_sdp(direction)))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, SessionError> {
        self.ensure_open()?;
        let remote = match (&self.remote, self.remote_params) {
            (Some(desc), Some(params)) if desc.sdp_type == SdpType::Offer => params,
            _ => {
                return Err(SessionError::Media(
                    "cannot answer without a remote offer".to_string(),
                ))
            }
        };
        let direction = remote.direction.reverse();
        if direction == Direction::SendOnly && self.track.is_none() {
            warn!(
                "Answering {} as sendonly without an attached track",
                self.context.identity.short()
            );
        }
        self.direction = Some(direction);
        Ok(SessionDescription::answer(self.build_sdp(direction)))
    }

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        let expected = if self.remote.is_some() {
            SdpType::Answer
        } else {
            SdpType::Offer
        };
        if description.sdp_type != expected {
            return Err(SessionError::InvalidDescription(format!(
                "local {:?} does not match negotiation direction",
                description.sdp_type
            )));
        }
        parse_description(&description.sdp)?;
        self.local = Some(description);
        self.set_state(PathState::Checking);
        self.gather();
        if self.remote.is_some() {
            self.set_state(PathState::Connected);
        }
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        let expected = if self.local.is_some() {
            SdpType::Answer
        } else {
            SdpType::Offer
        };
        if description.sdp_type != expected {
            return Err(SessionError::InvalidDescription(format!(
                "remote {:?} does not match negotiation direction",
                description.sdp_type
            )));
        }
        let params = parse_description(&description.sdp)?;
        if params.sample_rate != self.format.sample_rate {
            warn!(
                "Sample rate mismatch with {}: remote {} Hz, local {} Hz (no resampling)",
                self.context.identity.short(),
                params.sample_rate,
                self.format.sample_rate
            );
        }
        if let Some(len) = params.frame_len.filter(|len| *len != self.format.frame_len) {
            warn!(
                "Frame length mismatch with {}: remote {}, local {}",
                self.context.identity.short(),
                len,
                self.format.frame_len
            );
        }
        self.remote_params = Some(params);
        self.remote = Some(description);
        if self.local.is_some() {
            self.set_state(PathState::Connected);
        }
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.remote.is_none() {
            return Err(SessionError::Media(
                "remote description not set".to_string(),
            ));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(SessionError::InvalidCandidate(candidate.candidate));
        }
        self.remote_candidates.push(candidate);
        Ok(())
    }

    fn add_track(&mut self, source: &MediaSource) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.track = Some(source.clone());
        self.direction = Some(Direction::SendOnly);
        Ok(())
    }

    fn add_transceiver(&mut self, direction: Direction) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.direction = Some(direction);
        Ok(())
    }

    async fn replace_track(&mut self, source: &MediaSource) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.track.is_none() {
            return Err(SessionError::Media("no track to replace".to_string()));
        }
        self.track = Some(source.clone());
        Ok(())
    }

    fn state(&self) -> PathState {
        self.state
    }

    fn close(&mut self) {
        if self.state != PathState::Closed {
            self.remote_candidates.clear();
            self.set_state(PathState::Closed);
        }
    }
}
