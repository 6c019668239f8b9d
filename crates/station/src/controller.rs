//! Station controller
//!
//! Owns the process-wide station mode and every collaborator: the discovery
//! substrate, the capture device, playback and the session registry. All
//! state changes happen in [`StationController::handle_event`] or one of
//! the user operations; I/O tasks only feed the event channels.

use std::sync::Arc;
use swarmcast_core::{
    AudioCapture, AudioFormat, AudioPlayback, JoinOptions, StationConfig, StationObserver,
    StationState, StationStatus, Substrate, SubstrateEvent, TopicKey, TransportError,
};
use swarmcast_session::{
    encode_block, MediaEngine, MediaEvent, MediaSource, SessionEvent, SessionRegistry, SourceId,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::StationError;

/// Everything the controller reacts to besides user commands
#[derive(Debug)]
pub enum StationEvent {
    Substrate(SubstrateEvent),
    Media(MediaEvent),
    /// One fixed-size block from the active capture
    Captured { source: SourceId, samples: Vec<f32> },
    /// The capture device stopped delivering on its own
    CaptureEnded { source: SourceId },
}

struct ActiveCapture {
    source: MediaSource,
    stop: mpsc::Sender<()>,
    forwarder: JoinHandle<()>,
}

impl ActiveCapture {
    fn release(self) {
        let _ = self.stop.try_send(());
        self.forwarder.abort();
        debug!("Released capture '{}'", self.source.label);
    }
}

pub struct StationController {
    format: AudioFormat,
    state: StationState,
    topic: Option<TopicKey>,
    substrate: Box<dyn Substrate>,
    capture: Arc<dyn AudioCapture>,
    playback: Box<dyn AudioPlayback>,
    registry: SessionRegistry,
    observer: Arc<dyn StationObserver>,
    substrate_tx: mpsc::UnboundedSender<SubstrateEvent>,
    substrate_rx: mpsc::UnboundedReceiver<SubstrateEvent>,
    media_rx: mpsc::UnboundedReceiver<MediaEvent>,
    capture_tx: mpsc::UnboundedSender<StationEvent>,
    capture_rx: mpsc::UnboundedReceiver<StationEvent>,
    active_capture: Option<ActiveCapture>,
    device_preference: Option<String>,
    next_source_id: SourceId,
}

impl StationController {
    pub fn new(
        config: &StationConfig,
        substrate: Box<dyn Substrate>,
        engine: Arc<dyn MediaEngine>,
        capture: Arc<dyn AudioCapture>,
        playback: Box<dyn AudioPlayback>,
        observer: Arc<dyn StationObserver>,
    ) -> Self {
        let format = config.audio.format();
        let (substrate_tx, substrate_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let registry = SessionRegistry::new(engine, media_tx, observer.clone(), format);

        Self {
            format,
            state: StationState::Idle,
            topic: None,
            substrate,
            capture,
            playback,
            registry,
            observer,
            substrate_tx,
            substrate_rx,
            media_rx,
            capture_tx,
            capture_rx,
            active_capture: None,
            device_preference: config.audio.input_device.clone(),
            next_source_id: 1,
        }
    }

    pub fn state(&self) -> StationState {
        self.state
    }

    pub fn topic(&self) -> Option<TopicKey> {
        self.topic
    }

    pub fn peer_count(&self) -> usize {
        self.registry.count()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn device_preference(&self) -> Option<&str> {
        self.device_preference.as_deref()
    }

    /// Label of the device currently feeding sessions, if broadcasting
    pub fn capture_device(&self) -> Option<&str> {
        self.active_capture.as_ref().map(|c| c.source.label.as_str())
    }

    pub fn status(&self) -> StationStatus {
        StationStatus {
            state: self.state,
            topic: self.topic,
            peer_count: self.registry.count(),
        }
    }

    fn publish_status(&self) {
        self.observer.status_changed(&self.status());
    }

    fn ensure_idle(&self) -> Result<(), StationError> {
        match self.state {
            StationState::Idle => Ok(()),
            busy => Err(StationError::Busy(busy)),
        }
    }

    /// Start broadcasting on `key`. The capture device is acquired before
    /// anything is announced; a device fault leaves the station idle.
    pub async fn create_station(&mut self, key: TopicKey) -> Result<(), StationError> {
        self.ensure_idle()?;

        let device = self.device_preference.clone();
        let capture = match self.start_capture(device.as_deref()).await {
            Ok(capture) => capture,
            Err(e) => {
                self.observer.failure(&format!("Could not open audio input: {:#}", e));
                return Err(StationError::Device(e));
            }
        };

        if let Err(e) = self
            .substrate
            .join(key, JoinOptions::ACCEPT, self.substrate_tx.clone())
            .await
        {
            capture.release();
            self.observer.failure(&format!("Could not announce station: {:#}", e));
            return Err(StationError::Substrate(e));
        }

        info!(
            "Broadcasting station {} from '{}'",
            key.short(),
            capture.source.label
        );
        self.active_capture = Some(capture);
        self.state = StationState::Broadcasting;
        self.topic = Some(key);
        self.publish_status();
        Ok(())
    }

    /// Start listening to the station on `key`
    pub async fn join_station(&mut self, key: TopicKey) -> Result<(), StationError> {
        self.ensure_idle()?;

        if let Err(e) = self.playback.open(self.format).await {
            self.observer.failure(&format!("Could not open audio output: {:#}", e));
            return Err(StationError::Device(e));
        }

        if let Err(e) = self
            .substrate
            .join(key, JoinOptions::INITIATE, self.substrate_tx.clone())
            .await
        {
            self.playback.close().await;
            self.observer.failure(&format!("Could not look up station: {:#}", e));
            return Err(StationError::Substrate(e));
        }

        info!("Listening to station {}", key.short());
        self.state = StationState::Listening;
        self.topic = Some(key);
        self.publish_status();
        Ok(())
    }

    /// Stop whatever the station is doing. Calling this while idle is a no-op.
    pub async fn leave_station(&mut self) {
        if self.state == StationState::Idle {
            return;
        }

        if self.state == StationState::Broadcasting {
            self.registry.broadcast_stop();
        }
        self.substrate.destroy().await;
        self.registry.clear();

        if let Some(capture) = self.active_capture.take() {
            capture.release();
        }
        self.playback.close().await;

        info!("Left station ({})", self.state.as_str());
        self.state = StationState::Idle;
        self.topic = None;
        self.publish_status();
    }

    /// Switch the capture device. While broadcasting, the new device is
    /// acquired first and every outbound session is moved onto it; if that
    /// fails the old device keeps running and the preference is unchanged.
    pub async fn apply_audio_source(
        &mut self,
        device: Option<String>,
    ) -> Result<(), StationError> {
        let capture_lost =
            self.state == StationState::Broadcasting && self.active_capture.is_none();
        if device == self.device_preference && !capture_lost {
            debug!("Audio source unchanged ({:?})", device);
            return Ok(());
        }

        if self.state != StationState::Broadcasting {
            info!("Audio source preference set to {:?}", device);
            self.device_preference = device;
            return Ok(());
        }

        let capture = match self.start_capture(device.as_deref()).await {
            Ok(capture) => capture,
            Err(e) => {
                self.observer.failure(&format!("Could not switch audio input: {:#}", e));
                return Err(StationError::Device(e));
            }
        };

        let moved = self.registry.replace_source(&capture.source).await;
        info!(
            "Switched audio input to '{}' for {} peers",
            capture.source.label, moved
        );
        if let Some(previous) = self.active_capture.replace(capture) {
            previous.release();
        }
        self.device_preference = device;
        Ok(())
    }

    async fn start_capture(&mut self, device: Option<&str>) -> anyhow::Result<ActiveCapture> {
        let stream = self.capture.start(device, self.format).await?;

        let source = MediaSource {
            id: self.next_source_id,
            label: stream.device_name.clone(),
        };
        self.next_source_id += 1;

        let events = self.capture_tx.clone();
        let id = source.id;
        let mut blocks = stream.blocks;
        let forwarder = tokio::spawn(async move {
            while let Some(samples) = blocks.recv().await {
                if events
                    .send(StationEvent::Captured { source: id, samples })
                    .is_err()
                {
                    return;
                }
            }
            let _ = events.send(StationEvent::CaptureEnded { source: id });
        });

        Ok(ActiveCapture {
            source,
            stop: stream.stop,
            forwarder,
        })
    }

    /// Wait for the next event from any collaborator
    pub async fn next_event(&mut self) -> Option<StationEvent> {
        tokio::select! {
            Some(event) = self.substrate_rx.recv() => Some(StationEvent::Substrate(event)),
            Some(event) = self.media_rx.recv() => Some(StationEvent::Media(event)),
            Some(event) = self.capture_rx.recv() => Some(event),
            else => None,
        }
    }

    /// Handle every event that is already queued; returns how many ran
    pub async fn pump(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let event = if let Ok(event) = self.substrate_rx.try_recv() {
                StationEvent::Substrate(event)
            } else if let Ok(event) = self.media_rx.try_recv() {
                StationEvent::Media(event)
            } else if let Ok(event) = self.capture_rx.try_recv() {
                event
            } else {
                return handled;
            };
            self.handle_event(event).await;
            handled += 1;
        }
    }

    pub async fn handle_event(&mut self, event: StationEvent) {
        let peers_before = self.registry.count();

        match event {
            StationEvent::Substrate(event) => self.on_substrate_event(event).await,
            StationEvent::Media(event) => self.registry.on_media_event(event),
            StationEvent::Captured { source, samples } => self.on_captured(source, &samples),
            StationEvent::CaptureEnded { source } => self.on_capture_ended(source),
        }

        if self.registry.count() != peers_before {
            self.publish_status();
        }
    }

    async fn on_substrate_event(&mut self, event: SubstrateEvent) {
        match event {
            SubstrateEvent::Connected {
                connection_id,
                connection,
            } => {
                let Some(role) = self.state.session_role() else {
                    debug!(
                        "Closing conn {} from {} while idle",
                        connection_id,
                        connection.remote_identity().short()
                    );
                    connection.close();
                    return;
                };
                let source = self.active_capture.as_ref().map(|c| c.source.clone());
                if let Err(e) = self
                    .registry
                    .on_peer_connected(connection_id, connection, role, source.as_ref())
                    .await
                {
                    debug!("Session for conn {} not started: {}", connection_id, e);
                }
            }
            SubstrateEvent::Data {
                identity,
                connection_id,
                message,
            } => {
                let Some(event) = self.registry.dispatch(&identity, connection_id, message).await
                else {
                    return;
                };
                match event {
                    SessionEvent::Established => self.observer.peer_established(&identity),
                    SessionEvent::Audio(frames) => self.play(frames).await,
                    SessionEvent::Stopped => {
                        debug!("Station {} stopped sending", identity.short());
                        self.playback.reset().await;
                    }
                }
            }
            SubstrateEvent::Closed {
                identity,
                connection_id,
            } => {
                self.registry
                    .on_peer_disconnected(&identity, Some(connection_id));
            }
            SubstrateEvent::Error {
                identity,
                connection_id,
                error,
            } => {
                self.registry
                    .on_transport_error(&identity, connection_id, TransportError::Io(error));
            }
        }
    }

    async fn play(&mut self, frames: Vec<Vec<f32>>) {
        if !self.playback.is_open() {
            return;
        }
        for frame in frames {
            if let Err(e) = self.playback.play(&frame).await {
                warn!("Playback failed: {:#}", e);
                break;
            }
        }
    }

    fn on_captured(&self, source: SourceId, samples: &[f32]) {
        match &self.active_capture {
            Some(active) if active.source.id == source => {
                let frame = encode_block(samples);
                self.registry.broadcast_audio(&frame, source);
            }
            _ => {}
        }
    }

    fn on_capture_ended(&mut self, source: SourceId) {
        let ended = matches!(&self.active_capture, Some(active) if active.source.id == source);
        if !ended {
            return;
        }
        if let Some(capture) = self.active_capture.take() {
            warn!("Audio input '{}' stopped delivering", capture.source.label);
            self.observer
                .failure(&format!("Audio input '{}' stopped", capture.source.label));
            self.registry.broadcast_stop();
            capture.release();
        }
    }
}
