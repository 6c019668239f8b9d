use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Samples per frame on the wire
pub const DEFAULT_FRAME_LEN: usize = 4096;
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;
pub const DEFAULT_SERVICE_TYPE: &str = "_swarmcast._tcp.local.";
/// Bytes per f32 sample
pub const BYTES_PER_SAMPLE: usize = 4;

/// PCM layout shared by capture, codec and playback
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel in one frame
    pub frame_len: usize,
}

impl AudioFormat {
    /// Interleaved samples in one frame
    pub fn frame_samples(&self) -> usize {
        self.frame_len * self.channels as usize
    }

    /// Bytes in one encoded frame
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples() * BYTES_PER_SAMPLE
    }

    /// Duration of one frame in milliseconds
    pub fn frame_ms(&self) -> f64 {
        self.frame_len as f64 * 1000.0 / self.sample_rate as f64
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 1,
            frame_len: DEFAULT_FRAME_LEN,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_len: usize,
    /// Preferred capture device; `None` selects the system default
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        let format = AudioFormat::default();
        Self {
            sample_rate: format.sample_rate,
            channels: format.channels,
            frame_len: format.frame_len,
            input_device: None,
            output_device: None,
        }
    }
}

impl AudioConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            frame_len: self.frame_len,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// mDNS service type announced by broadcasters
    pub service_type: String,
    /// TCP port for inbound peers; 0 picks an ephemeral port
    pub listen_port: u16,
    pub connect_timeout_ms: u64,
    /// ICE server URLs handed to the media primitive
    pub ice_servers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            listen_port: 0,
            connect_timeout_ms: 5000,
            ice_servers: Vec::new(),
        }
    }
}

/// Top-level configuration file
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub audio: AudioConfig,
    pub network: NetworkConfig,
}

impl StationConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: StationConfig = toml::from_str(input).context("parsing station config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            bail!("audio.sample_rate must be positive");
        }
        if self.audio.channels == 0 {
            bail!("audio.channels must be positive");
        }
        if self.audio.frame_len == 0 {
            bail!("audio.frame_len must be positive");
        }
        if !self.network.service_type.ends_with(".local.") {
            bail!(
                "network.service_type '{}' must end with '.local.'",
                self.network.service_type
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_frame_bytes() {
        let format = AudioFormat::default();
        assert_eq!(format.frame_bytes(), 16384);
        assert_eq!(format.frame_samples(), 4096);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = StationConfig::from_toml_str(
            r#"
            [audio]
            frame_len = 1024
            input_device = "USB Mic"
            "#,
        )
        .unwrap();

        assert_eq!(config.audio.frame_len, 1024);
        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.audio.input_device.as_deref(), Some("USB Mic"));
        assert_eq!(config.network, NetworkConfig::default());
    }

    #[test]
    fn test_rejects_zero_frame_len() {
        let result = StationConfig::from_toml_str("[audio]\nframe_len = 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_non_local_service_type() {
        let result =
            StationConfig::from_toml_str("[network]\nservice_type = \"_swarmcast._tcp\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = StationConfig::load(Path::new("/nonexistent/swarmcast.toml")).unwrap();
        assert_eq!(config, StationConfig::default());
    }
}
