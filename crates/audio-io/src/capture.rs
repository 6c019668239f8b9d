use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample, StreamConfig};
use dasp_sample::ToSample;
use swarmcast_core::{AudioCapture, AudioFormat, CaptureStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::convert::{remix, to_f32, BlockChunker};
use crate::device::{choose_config, find_input_device, list_input_devices, ConfigOption};

/// Blocks buffered between the device callback and the station
const DEFAULT_BLOCK_QUEUE: usize = 32;

/// Microphone / line-in capture through cpal
///
/// Each capture owns a dedicated thread that holds the `cpal::Stream`
/// until the stop channel fires, the block receiver is dropped, or the
/// device goes away.
pub struct CpalCapture {
    block_queue: usize,
}

impl CpalCapture {
    pub fn new() -> Self {
        Self {
            block_queue: DEFAULT_BLOCK_QUEUE,
        }
    }
}

impl Default for CpalCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioCapture for CpalCapture {
    async fn start(&self, device: Option<&str>, format: AudioFormat) -> Result<CaptureStream> {
        let requested = device.map(str::to_owned);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<String>>();
        let (block_tx, block_rx) = mpsc::channel(self.block_queue);
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let stream_stop = stop_tx.clone();

        std::thread::Builder::new()
            .name("swarmcast-capture".into())
            .spawn(move || {
                let stream =
                    match open_input(requested.as_deref(), format, block_tx, stream_stop) {
                        Ok((stream, name)) => {
                            let _ = ready_tx.send(Ok(name));
                            stream
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };

                let _ = stop_rx.blocking_recv();
                drop(stream);
                debug!("Capture thread exiting");
            })?;

        let device_name = ready_rx
            .await
            .map_err(|_| anyhow!("Capture thread exited before the stream opened"))??;

        Ok(CaptureStream {
            device_name,
            blocks: block_rx,
            stop: stop_tx,
        })
    }

    fn list_devices(&self) -> Result<Vec<String>> {
        list_input_devices()
    }
}

fn open_input(
    requested: Option<&str>,
    format: AudioFormat,
    blocks: mpsc::Sender<Vec<f32>>,
    stop: mpsc::Sender<()>,
) -> Result<(cpal::Stream, String)> {
    let host = cpal::default_host();
    let device = find_input_device(&host, requested)?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let options = device.supported_input_configs()?.map(ConfigOption::from);
    let (config, sample_format) = choose_config(options, format)?;
    info!(
        "Capturing from '{}': {} Hz, {} ch, {:?}",
        name, config.sample_rate.0, config.channels, sample_format
    );

    let stream = match sample_format {
        SampleFormat::F32 => build_input::<f32>(&device, &config, format, blocks, stop)?,
        SampleFormat::I16 => build_input::<i16>(&device, &config, format, blocks, stop)?,
        SampleFormat::U16 => build_input::<u16>(&device, &config, format, blocks, stop)?,
        other => bail!("Unsupported sample format: {:?}", other),
    };
    stream.play()?;

    Ok((stream, name))
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    format: AudioFormat,
    blocks: mpsc::Sender<Vec<f32>>,
    stop: mpsc::Sender<()>,
) -> Result<cpal::Stream>
where
    T: SizedSample + ToSample<f32> + Copy,
{
    let device_channels = config.channels;
    let mut chunker = BlockChunker::new(format.frame_samples());
    let mut converted = Vec::new();
    let mut remixed = Vec::new();
    let data_stop = stop.clone();

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            to_f32(data, &mut converted);
            remix(&converted, device_channels, format.channels, &mut remixed);
            for block in chunker.push(&remixed) {
                match blocks.try_send(block) {
                    Ok(()) => {}
                    // Consumer is behind; this block is lost
                    Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Closed(_)) => {
                        let _ = data_stop.try_send(());
                        break;
                    }
                }
            }
        },
        move |err| match err {
            cpal::StreamError::DeviceNotAvailable => {
                warn!("Capture device is no longer available");
                let _ = stop.try_send(());
            }
            other => warn!("Capture stream error: {}", other),
        },
        None,
    )?;

    Ok(stream)
}
