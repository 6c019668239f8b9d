use anyhow::{anyhow, Result};
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{BufferSize, SampleFormat, SampleRate, StreamConfig, SupportedStreamConfigRange};
use swarmcast_core::AudioFormat;

pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    Ok(host
        .input_devices()?
        .filter_map(|d| d.name().ok())
        .collect())
}

pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    Ok(host
        .output_devices()?
        .filter_map(|d| d.name().ok())
        .collect())
}

pub fn default_input_device_name() -> Option<String> {
    cpal::default_host()
        .default_input_device()
        .and_then(|d| d.name().ok())
}

pub(crate) fn find_input_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device> {
    match name {
        None | Some("default") => host
            .default_input_device()
            .ok_or_else(|| anyhow!("No default input device available")),
        Some(name) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| anyhow!("Input device '{}' not found", name)),
    }
}

pub(crate) fn find_output_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device> {
    if let Some(name) = name.filter(|n| *n != "default") {
        if let Some(device) = host
            .output_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
        {
            return Ok(device);
        }
        tracing::warn!("Output device '{}' not found, using default", name);
    }
    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device available"))
}

fn format_rank(format: SampleFormat) -> Option<u8> {
    match format {
        SampleFormat::F32 => Some(0),
        SampleFormat::I16 => Some(1),
        SampleFormat::U16 => Some(2),
        _ => None,
    }
}

/// One supported rate range of a device, as reported by cpal
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConfigOption {
    pub channels: u16,
    pub min_rate: u32,
    pub max_rate: u32,
    pub sample_format: SampleFormat,
}

impl From<SupportedStreamConfigRange> for ConfigOption {
    fn from(range: SupportedStreamConfigRange) -> Self {
        Self {
            channels: range.channels(),
            min_rate: range.min_sample_rate().0,
            max_rate: range.max_sample_rate().0,
            sample_format: range.sample_format(),
        }
    }
}

/// Pick a device config that runs at the requested rate. Matching channel
/// counts win over sample format; among formats f32 is preferred.
pub(crate) fn choose_config(
    options: impl IntoIterator<Item = ConfigOption>,
    format: AudioFormat,
) -> Result<(StreamConfig, SampleFormat)> {
    let rate = format.sample_rate;
    let best = options
        .into_iter()
        .filter(|o| o.min_rate <= rate && rate <= o.max_rate)
        .filter_map(|o| format_rank(o.sample_format).map(|rank| (o, rank)))
        .min_by_key(|(o, rank)| (o.channels != format.channels, *rank))
        .map(|(o, _)| o)
        .ok_or_else(|| anyhow!("No device config supports {} Hz", rate))?;
    let config = StreamConfig {
        channels: best.channels,
        sample_rate: SampleRate(rate),
        buffer_size: BufferSize::Default,
    };
    Ok((config, best.sample_format))
}
