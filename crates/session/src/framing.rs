//! Audio framing codec
//!
//! Outbound blocks are raw little-endian f32 samples with no header. Inbound
//! chunks may split or merge frames arbitrarily, so they are accumulated and
//! cut into fixed-size frames. An empty chunk is the stop sentinel.

use bytes::{Buf, Bytes, BytesMut};
use swarmcast_core::{AudioFormat, BYTES_PER_SAMPLE};
use tracing::warn;

use crate::errors::SessionError;

/// Serialize one block of samples for the wire
pub fn encode_block(samples: &[f32]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out.freeze()
}

/// Decode one full frame; non-finite samples mark the frame as corrupt
pub fn decode_frame(bytes: &[u8]) -> Result<Vec<f32>, SessionError> {
    if bytes.len() % BYTES_PER_SAMPLE != 0 {
        return Err(SessionError::Decode(format!(
            "{} bytes is not a whole number of samples",
            bytes.len()
        )));
    }
    let mut samples = Vec::with_capacity(bytes.len() / BYTES_PER_SAMPLE);
    for (index, chunk) in bytes.chunks_exact(BYTES_PER_SAMPLE).enumerate() {
        let sample = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if !sample.is_finite() {
            return Err(SessionError::Decode(format!(
                "non-finite sample at index {}",
                index
            )));
        }
        samples.push(sample);
    }
    Ok(samples)
}

/// Result of feeding one inbound chunk
#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// Remote stopped; the accumulator has been reset
    Stop,
    Frames {
        frames: Vec<Vec<f32>>,
        /// Set when a corrupt frame ended the pass early
        fault: Option<SessionError>,
    },
}

/// Per-session accumulator for inbound audio bytes
#[derive(Debug)]
pub struct FrameAssembler {
    frame_bytes: usize,
    buffer: BytesMut,
    frames_decoded: u64,
    frames_dropped: u64,
}

impl FrameAssembler {
    pub fn new(format: AudioFormat) -> Self {
        Self::with_frame_bytes(format.frame_bytes())
    }

    pub fn with_frame_bytes(frame_bytes: usize) -> Self {
        Self {
            frame_bytes: frame_bytes.max(BYTES_PER_SAMPLE),
            buffer: BytesMut::with_capacity(frame_bytes * 2),
            frames_decoded: 0,
            frames_dropped: 0,
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Append `chunk` and extract every complete frame
    pub fn push(&mut self, chunk: &[u8]) -> Inbound {
        if chunk.is_empty() {
            self.reset();
            return Inbound::Stop;
        }
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while self.buffer.len() >= self.frame_bytes {
            let decoded = decode_frame(&self.buffer[..self.frame_bytes]);
            self.buffer.advance(self.frame_bytes);
            match decoded {
                Ok(frame) => {
                    self.frames_decoded += 1;
                    frames.push(frame);
                }
                Err(e) => {
                    self.frames_dropped += 1;
                    warn!(
                        "Dropping corrupt audio frame ({} bytes still buffered): {}",
                        self.buffer.len(),
                        e
                    );
                    return Inbound::Frames {
                        frames,
                        fault: Some(e),
                    };
                }
            }
        }
        Inbound::Frames {
            frames,
            fault: None,
        }
    }
}
