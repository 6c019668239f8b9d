use dasp_sample::ToSample;
use std::collections::VecDeque;

/// Convert device samples of any supported format to f32 in [-1.0, 1.0]
pub fn to_f32<T: ToSample<f32> + Copy>(input: &[T], output: &mut Vec<f32>) {
    output.clear();
    output.extend(input.iter().map(|s| ToSample::<f32>::to_sample_(*s)));
}

/// Change the interleaved channel count. Downmixing to mono averages all
/// channels; other conversions repeat or drop channels.
pub fn remix(input: &[f32], from: u16, to: u16, output: &mut Vec<f32>) {
    output.clear();
    let (from, to) = (from.max(1) as usize, to.max(1) as usize);
    if from == to {
        output.extend_from_slice(input);
        return;
    }
    let frames = input.chunks_exact(from);
    if to == 1 {
        output.extend(frames.map(|frame| frame.iter().sum::<f32>() / from as f32));
        return;
    }
    for frame in frames {
        for ch in 0..to {
            output.push(frame[ch % from]);
        }
    }
}

/// Re-chunks a continuous sample stream into fixed-size blocks
#[derive(Debug)]
pub struct BlockChunker {
    block_len: usize,
    pending: Vec<f32>,
}

impl BlockChunker {
    pub fn new(block_len: usize) -> Self {
        let block_len = block_len.max(1);
        Self {
            block_len,
            pending: Vec::with_capacity(block_len),
        }
    }

    pub fn push(&mut self, mut samples: &[f32]) -> Vec<Vec<f32>> {
        let mut blocks = Vec::new();
        while !samples.is_empty() {
            let take = (self.block_len - self.pending.len()).min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];
            if self.pending.len() == self.block_len {
                let full = std::mem::replace(&mut self.pending, Vec::with_capacity(self.block_len));
                blocks.push(full);
            }
        }
        blocks
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Bounded sample FIFO between the decoder and the output callback
#[derive(Debug)]
pub struct SampleRing {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Queue samples; returns how many did not fit
    pub fn push(&mut self, input: &[f32]) -> usize {
        let room = self.capacity - self.samples.len();
        let take = input.len().min(room);
        self.samples.extend(&input[..take]);
        input.len() - take
    }

    /// Fill `output`, padding with silence; returns samples actually read
    pub fn pop_into(&mut self, output: &mut [f32]) -> usize {
        let read = output.len().min(self.samples.len());
        for (slot, sample) in output.iter_mut().zip(self.samples.drain(..read)) {
            *slot = sample;
        }
        output[read..].fill(0.0);
        read
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
