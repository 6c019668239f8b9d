//! End-to-end station scenarios over the in-memory substrate

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use swarmcast_core::{
    AudioCapture, AudioFormat, AudioPlayback, CaptureStream, PeerIdentity, StationConfig,
    StationObserver, StationState, StationStatus, Substrate, TopicKey,
};
use swarmcast_session::PcmEngine;
use swarmcast_station::{spawn_station, StationController, StationError, StationHandle};
use swarmcast_swarm::MemoryNetwork;
use tokio::sync::mpsc;

const FRAME_LEN: usize = 256;

#[derive(Default)]
struct CaptureLog {
    started: Vec<Option<String>>,
    feeds: Vec<mpsc::Sender<Vec<f32>>>,
    stops: Vec<mpsc::Receiver<()>>,
}

#[derive(Clone, Default)]
struct MockCapture {
    log: Arc<Mutex<CaptureLog>>,
}

impl MockCapture {
    fn started(&self) -> Vec<Option<String>> {
        self.log.lock().unwrap().started.clone()
    }

    fn feed(&self, index: usize) -> mpsc::Sender<Vec<f32>> {
        self.log.lock().unwrap().feeds[index].clone()
    }

    fn was_stopped(&self, index: usize) -> bool {
        self.log.lock().unwrap().stops[index].try_recv().is_ok()
    }

    /// Drop every feed, as if the devices were unplugged
    fn unplug(&self) {
        self.log.lock().unwrap().feeds.clear();
    }
}

#[async_trait]
impl AudioCapture for MockCapture {
    async fn start(&self, device: Option<&str>, _format: AudioFormat) -> Result<CaptureStream> {
        if device == Some("missing") {
            bail!("Input device 'missing' not found");
        }
        let (feed, blocks) = mpsc::channel(16);
        let (stop, stopped) = mpsc::channel(1);
        let mut log = self.log.lock().unwrap();
        log.started.push(device.map(str::to_owned));
        log.feeds.push(feed);
        log.stops.push(stopped);
        Ok(CaptureStream {
            device_name: device.unwrap_or("default").to_string(),
            blocks,
            stop,
        })
    }

    fn list_devices(&self) -> Result<Vec<String>> {
        Ok(vec!["default".into(), "mic-b".into()])
    }
}

#[derive(Default)]
struct PlaybackLog {
    open: bool,
    frames: Vec<Vec<f32>>,
    resets: usize,
}

#[derive(Clone, Default)]
struct MockPlayback {
    log: Arc<Mutex<PlaybackLog>>,
}

impl MockPlayback {
    fn frames(&self) -> Vec<Vec<f32>> {
        self.log.lock().unwrap().frames.clone()
    }

    fn resets(&self) -> usize {
        self.log.lock().unwrap().resets
    }
}

#[async_trait]
impl AudioPlayback for MockPlayback {
    async fn open(&mut self, _format: AudioFormat) -> Result<()> {
        self.log.lock().unwrap().open = true;
        Ok(())
    }

    async fn play(&mut self, samples: &[f32]) -> Result<()> {
        self.log.lock().unwrap().frames.push(samples.to_vec());
        Ok(())
    }

    async fn reset(&mut self) {
        self.log.lock().unwrap().resets += 1;
    }

    async fn close(&mut self) {
        self.log.lock().unwrap().open = false;
    }

    fn is_open(&self) -> bool {
        self.log.lock().unwrap().open
    }
}

#[derive(Default)]
struct RecordingObserver {
    counts: Mutex<Vec<usize>>,
    established: Mutex<Vec<PeerIdentity>>,
    failures: Mutex<Vec<String>>,
    statuses: Mutex<Vec<StationStatus>>,
}

impl RecordingObserver {
    fn counts(&self) -> Vec<usize> {
        self.counts.lock().unwrap().clone()
    }

    fn established(&self) -> usize {
        self.established.lock().unwrap().len()
    }

    fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }

    fn last_status(&self) -> Option<StationStatus> {
        self.statuses.lock().unwrap().last().cloned()
    }
}

impl StationObserver for RecordingObserver {
    fn peer_count_changed(&self, count: usize) {
        self.counts.lock().unwrap().push(count);
    }

    fn status_changed(&self, status: &StationStatus) {
        self.statuses.lock().unwrap().push(status.clone());
    }

    fn peer_established(&self, peer: &PeerIdentity) {
        self.established.lock().unwrap().push(*peer);
    }

    fn failure(&self, message: &str) {
        self.failures.lock().unwrap().push(message.to_string());
    }
}

struct Station {
    handle: StationHandle,
    identity: PeerIdentity,
    capture: MockCapture,
    playback: MockPlayback,
    observer: Arc<RecordingObserver>,
}

struct Parts {
    controller: StationController,
    identity: PeerIdentity,
    capture: MockCapture,
    playback: MockPlayback,
    observer: Arc<RecordingObserver>,
}

fn config(input_device: Option<&str>) -> StationConfig {
    let mut config = StationConfig::default();
    config.audio.frame_len = FRAME_LEN;
    config.audio.input_device = input_device.map(str::to_owned);
    config
}

fn parts(network: &MemoryNetwork, input_device: Option<&str>) -> Parts {
    let config = config(input_device);
    let capture = MockCapture::default();
    let playback = MockPlayback::default();
    let observer = Arc::new(RecordingObserver::default());
    let substrate = network.substrate();
    let identity = substrate.local_identity();
    let controller = StationController::new(
        &config,
        Box::new(substrate),
        Arc::new(PcmEngine::new(config.audio.format())),
        Arc::new(capture.clone()),
        Box::new(playback.clone()),
        observer.clone(),
    );
    Parts {
        controller,
        identity,
        capture,
        playback,
        observer,
    }
}

fn station(network: &MemoryNetwork, input_device: Option<&str>) -> Station {
    let parts = parts(network, input_device);
    let (handle, _task) = spawn_station(parts.controller);
    Station {
        handle,
        identity: parts.identity,
        capture: parts.capture,
        playback: parts.playback,
        observer: parts.observer,
    }
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Drive a controller by hand until `condition` holds
async fn pump_until(
    controller: &mut StationController,
    what: &str,
    condition: impl Fn(&StationController) -> bool,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition(controller) {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        controller.pump().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn ramp(offset: f32) -> Vec<f32> {
    (0..FRAME_LEN)
        .map(|i| offset + i as f32 / FRAME_LEN as f32)
        .collect()
}

#[tokio::test]
async fn test_listener_joins_broadcaster_and_leaves() {
    let network = MemoryNetwork::new();
    let key = TopicKey::random();
    let broadcaster = station(&network, None);
    let listener = station(&network, None);

    broadcaster.handle.create_station(key).await.unwrap();
    listener.handle.join_station(key).await.unwrap();

    wait_for("listener established", || listener.observer.established() == 1).await;
    wait_for("broadcaster established", || broadcaster.observer.established() == 1).await;
    assert_eq!(broadcaster.observer.counts(), vec![1]);
    assert_eq!(listener.observer.counts(), vec![1]);

    let status = broadcaster.handle.status().await.unwrap();
    assert_eq!(status.state, StationState::Broadcasting);
    assert_eq!(status.peer_count, 1);
    assert_eq!(
        status.info_text(),
        format!("Station ID: {}\nConnected Peers: 1", key.to_hex())
    );

    let frame = ramp(-0.5);
    broadcaster.capture.feed(0).send(frame.clone()).await.unwrap();
    wait_for("frame played", || !listener.playback.frames().is_empty()).await;
    assert_eq!(listener.playback.frames(), vec![frame]);

    listener.handle.leave_station().await.unwrap();
    wait_for("broadcaster count drops", || {
        broadcaster.observer.counts() == vec![1, 0]
    })
    .await;
    assert_eq!(listener.observer.established(), 1);
    assert_eq!(
        listener.handle.status().await.unwrap().state,
        StationState::Idle
    );
    assert_eq!(network.open_links(), 0);
}

#[tokio::test]
async fn test_broadcaster_leave_sends_stop_to_listener() {
    let network = MemoryNetwork::new();
    let key = TopicKey::random();
    let broadcaster = station(&network, None);
    let listener = station(&network, None);

    broadcaster.handle.create_station(key).await.unwrap();
    listener.handle.join_station(key).await.unwrap();
    wait_for("broadcaster established", || broadcaster.observer.established() == 1).await;

    broadcaster.handle.leave_station().await.unwrap();
    wait_for("listener reset", || listener.playback.resets() == 1).await;
    wait_for("listener count drops", || listener.observer.counts() == vec![1, 0]).await;
    assert!(broadcaster.capture.was_stopped(0));

    let status = listener.handle.status().await.unwrap();
    assert_eq!(status.state, StationState::Listening);
    assert_eq!(status.info_text(), "Connected Peers: 0");
}

#[tokio::test]
async fn test_capture_loss_sends_stop_to_listener() {
    let network = MemoryNetwork::new();
    let key = TopicKey::random();
    let broadcaster = station(&network, None);
    let listener = station(&network, None);

    broadcaster.handle.create_station(key).await.unwrap();
    listener.handle.join_station(key).await.unwrap();
    wait_for("broadcaster established", || broadcaster.observer.established() == 1).await;
    wait_for("listener established", || listener.observer.established() == 1).await;

    broadcaster.capture.unplug();
    wait_for("failure reported", || broadcaster.observer.failures().len() == 1).await;
    wait_for("listener reset", || listener.playback.resets() == 1).await;
    assert!(broadcaster.capture.was_stopped(0));

    // The device is gone but the sessions stay up
    assert_eq!(listener.observer.counts(), vec![1]);
    let status = broadcaster.handle.status().await.unwrap();
    assert_eq!(status.state, StationState::Broadcasting);
    assert_eq!(status.peer_count, 1);
}

#[tokio::test]
async fn test_transport_error_drops_only_that_listener() {
    let network = MemoryNetwork::new();
    let key = TopicKey::random();
    let broadcaster = station(&network, None);
    let first = station(&network, None);
    let second = station(&network, None);

    broadcaster.handle.create_station(key).await.unwrap();
    first.handle.join_station(key).await.unwrap();
    second.handle.join_station(key).await.unwrap();
    wait_for("broadcaster established twice", || {
        broadcaster.observer.established() == 2
    })
    .await;
    wait_for("second established", || second.observer.established() == 1).await;
    assert_eq!(broadcaster.observer.counts(), vec![1, 2]);

    assert_eq!(network.fail_links(first.identity, "connection reset by peer"), 1);
    wait_for("broadcaster count drops", || {
        broadcaster.observer.counts() == vec![1, 2, 1]
    })
    .await;
    wait_for("first listener count drops", || first.observer.counts() == vec![1, 0]).await;
    assert_eq!(broadcaster.handle.status().await.unwrap().peer_count, 1);

    let frame = ramp(0.5);
    broadcaster.capture.feed(0).send(frame.clone()).await.unwrap();
    wait_for("second listener plays", || !second.playback.frames().is_empty()).await;
    assert_eq!(second.playback.frames(), vec![frame]);
    assert!(first.playback.frames().is_empty());
    assert_eq!(second.observer.counts(), vec![1]);
    assert_eq!(network.open_links(), 1);
}

#[tokio::test]
async fn test_controller_tracks_capture_device_across_loss() {
    let network = MemoryNetwork::new();
    let parts = parts(&network, None);
    let mut controller = parts.controller;
    let key = TopicKey::random();

    controller.create_station(key).await.unwrap();
    assert_eq!(controller.state(), StationState::Broadcasting);
    assert_eq!(controller.topic(), Some(key));
    assert_eq!(controller.capture_device(), Some("default"));
    assert_eq!(controller.device_preference(), None);

    controller
        .apply_audio_source(Some("mic-b".into()))
        .await
        .unwrap();
    assert_eq!(controller.capture_device(), Some("mic-b"));
    assert_eq!(controller.device_preference(), Some("mic-b"));

    parts.capture.unplug();
    pump_until(&mut controller, "capture loss handled", |c| {
        c.capture_device().is_none()
    })
    .await;
    assert_eq!(controller.device_preference(), Some("mic-b"));
    assert_eq!(parts.observer.failures().len(), 1);

    // Selecting the lost device again reopens it
    controller
        .apply_audio_source(Some("mic-b".into()))
        .await
        .unwrap();
    assert_eq!(controller.capture_device(), Some("mic-b"));
    assert_eq!(parts.capture.started().len(), 3);

    controller.leave_station().await;
    assert_eq!(controller.state(), StationState::Idle);
    assert_eq!(controller.peer_count(), 0);
    assert_eq!(controller.registry().count(), 0);
    assert!(parts.playback.frames().is_empty());
}

#[tokio::test]
async fn test_leave_is_idempotent() {
    let network = MemoryNetwork::new();
    let broadcaster = station(&network, None);

    broadcaster.handle.leave_station().await.unwrap();
    broadcaster
        .handle
        .create_station(TopicKey::random())
        .await
        .unwrap();
    broadcaster.handle.leave_station().await.unwrap();
    broadcaster.handle.leave_station().await.unwrap();

    let status = broadcaster.observer.last_status().unwrap();
    assert_eq!(status.state, StationState::Idle);
    assert_eq!(status.info_text(), "");
    assert!(broadcaster.observer.counts().is_empty());
}

#[tokio::test]
async fn test_second_station_operation_is_rejected() {
    let network = MemoryNetwork::new();
    let broadcaster = station(&network, None);
    broadcaster
        .handle
        .create_station(TopicKey::random())
        .await
        .unwrap();

    let again = broadcaster.handle.create_station(TopicKey::random()).await;
    assert!(matches!(again, Err(StationError::Busy(StationState::Broadcasting))));
    let join = broadcaster.handle.join_station(TopicKey::random()).await;
    assert!(matches!(join, Err(StationError::Busy(StationState::Broadcasting))));
    assert_eq!(broadcaster.capture.started().len(), 1);
}

#[tokio::test]
async fn test_missing_input_device_keeps_station_idle() {
    let network = MemoryNetwork::new();
    let key = TopicKey::random();
    let broadcaster = station(&network, Some("missing"));
    let listener = station(&network, None);

    let result = broadcaster.handle.create_station(key).await;
    assert!(matches!(result, Err(StationError::Device(_))));
    assert_eq!(broadcaster.observer.failures().len(), 1);
    assert_eq!(
        broadcaster.handle.status().await.unwrap().state,
        StationState::Idle
    );

    // Nothing was announced, so a listener finds no one
    listener.handle.join_station(key).await.unwrap();
    assert_eq!(network.open_links(), 0);
}

#[tokio::test]
async fn test_apply_audio_source_moves_sessions_to_new_device() {
    let network = MemoryNetwork::new();
    let key = TopicKey::random();
    let broadcaster = station(&network, None);
    let listener = station(&network, None);

    broadcaster.handle.create_station(key).await.unwrap();
    listener.handle.join_station(key).await.unwrap();
    wait_for("broadcaster established", || broadcaster.observer.established() == 1).await;

    broadcaster
        .handle
        .apply_audio_source(Some("mic-b".into()))
        .await
        .unwrap();
    assert_eq!(broadcaster.capture.started(), vec![None, Some("mic-b".into())]);
    assert!(broadcaster.capture.was_stopped(0));

    // Blocks from the released device are ignored
    let _ = broadcaster.capture.feed(0).send(ramp(0.0)).await;
    let frame = ramp(0.25);
    broadcaster.capture.feed(1).send(frame.clone()).await.unwrap();
    wait_for("frame played", || !listener.playback.frames().is_empty()).await;
    assert_eq!(listener.playback.frames(), vec![frame]);

    // Same device again is a no-op
    broadcaster
        .handle
        .apply_audio_source(Some("mic-b".into()))
        .await
        .unwrap();
    assert_eq!(broadcaster.capture.started().len(), 2);

    // A failing device leaves the running capture in place
    let failed = broadcaster
        .handle
        .apply_audio_source(Some("missing".into()))
        .await;
    assert!(matches!(failed, Err(StationError::Device(_))));
    assert!(!broadcaster.capture.was_stopped(1));
    assert_eq!(broadcaster.observer.counts(), vec![1]);
}

#[tokio::test]
async fn test_apply_audio_source_while_idle_only_saves_preference() {
    let network = MemoryNetwork::new();
    let broadcaster = station(&network, None);

    broadcaster
        .handle
        .apply_audio_source(Some("mic-b".into()))
        .await
        .unwrap();
    assert!(broadcaster.capture.started().is_empty());

    broadcaster
        .handle
        .create_station(TopicKey::random())
        .await
        .unwrap();
    assert_eq!(broadcaster.capture.started(), vec![Some("mic-b".into())]);
}

#[tokio::test]
async fn test_shutdown_stops_the_task() {
    let network = MemoryNetwork::new();
    let broadcaster = station(&network, None);
    broadcaster
        .handle
        .create_station(TopicKey::random())
        .await
        .unwrap();

    broadcaster.handle.shutdown().await.unwrap();
    assert!(broadcaster.capture.was_stopped(0));
    assert!(matches!(
        broadcaster.handle.status().await,
        Err(StationError::Stopped)
    ));
}
