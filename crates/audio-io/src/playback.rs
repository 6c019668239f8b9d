use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use swarmcast_core::{AudioFormat, AudioPlayback};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::convert::{remix, SampleRing};
use crate::device::{choose_config, find_output_device, ConfigOption};

/// Decoded frames the output ring can hold before dropping
const RING_FRAMES: usize = 8;

fn lock(ring: &Mutex<SampleRing>) -> MutexGuard<'_, SampleRing> {
    ring.lock().unwrap_or_else(PoisonError::into_inner)
}

struct OpenOutput {
    format: AudioFormat,
    device_channels: u16,
    ring: Arc<Mutex<SampleRing>>,
    stop: std_mpsc::Sender<()>,
}

/// Speaker output through cpal
pub struct CpalPlayback {
    device: Option<String>,
    output: Option<OpenOutput>,
    scratch: Vec<f32>,
}

impl CpalPlayback {
    pub fn new(device: Option<String>) -> Self {
        Self {
            device,
            output: None,
            scratch: Vec::new(),
        }
    }

    /// Samples waiting for the device
    pub fn queued(&self) -> usize {
        self.output
            .as_ref()
            .map(|o| lock(&o.ring).len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl AudioPlayback for CpalPlayback {
    async fn open(&mut self, format: AudioFormat) -> Result<()> {
        self.close().await;

        let requested = self.device.clone();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(u16, Arc<Mutex<SampleRing>>)>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("swarmcast-playback".into())
            .spawn(move || {
                let (stream, channels, ring) = match open_output(requested.as_deref(), format) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok((channels, ring)));

                // Returns on an explicit stop or when the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Playback thread exiting");
            })?;

        let (device_channels, ring) = ready_rx
            .await
            .map_err(|_| anyhow!("Playback thread exited before the stream opened"))??;

        self.output = Some(OpenOutput {
            format,
            device_channels,
            ring,
            stop: stop_tx,
        });
        Ok(())
    }

    async fn play(&mut self, samples: &[f32]) -> Result<()> {
        let Some(output) = &self.output else {
            bail!("Playback is not open");
        };
        remix(
            samples,
            output.format.channels,
            output.device_channels,
            &mut self.scratch,
        );
        let dropped = lock(&output.ring).push(&self.scratch);
        if dropped > 0 {
            warn!("Playback buffer overflow, dropped {} samples", dropped);
        }
        Ok(())
    }

    async fn reset(&mut self) {
        if let Some(output) = &self.output {
            lock(&output.ring).clear();
        }
    }

    async fn close(&mut self) {
        if let Some(output) = self.output.take() {
            let _ = output.stop.send(());
            info!("Playback closed");
        }
    }

    fn is_open(&self) -> bool {
        self.output.is_some()
    }
}

fn open_output(
    requested: Option<&str>,
    format: AudioFormat,
) -> Result<(cpal::Stream, u16, Arc<Mutex<SampleRing>>)> {
    let host = cpal::default_host();
    let device = find_output_device(&host, requested)?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let options = device.supported_output_configs()?.map(ConfigOption::from);
    let (config, sample_format) = choose_config(options, format)?;
    let capacity = format.frame_len * config.channels as usize * RING_FRAMES;
    let ring = Arc::new(Mutex::new(SampleRing::new(capacity)));
    info!(
        "Playing to '{}': {} Hz, {} ch, {:?}",
        name, config.sample_rate.0, config.channels, sample_format
    );

    let stream = match sample_format {
        SampleFormat::F32 => build_output::<f32>(&device, &config, ring.clone())?,
        SampleFormat::I16 => build_output::<i16>(&device, &config, ring.clone())?,
        SampleFormat::U16 => build_output::<u16>(&device, &config, ring.clone())?,
        other => bail!("Unsupported sample format: {:?}", other),
    };
    stream.play()?;

    Ok((stream, config.channels, ring))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    ring: Arc<Mutex<SampleRing>>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let mut scratch = Vec::new();
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            scratch.resize(data.len(), 0.0);
            lock(&ring).pop_into(&mut scratch);
            for (out, sample) in data.iter_mut().zip(&scratch) {
                *out = T::from_sample_(*sample);
            }
        },
        |err| warn!("Playback stream error: {}", err),
        None,
    )?;
    Ok(stream)
}
