//! Acoustic echo cancellation
//!
//! [`NlmsEchoCanceller`] is a normalized-LMS adaptive FIR filter that models
//! the speaker-to-microphone path from a reference signal (what was actually
//! played) and subtracts the predicted echo from the microphone signal.
//! [`ReferenceHold`] pairs each microphone frame with a reference frame,
//! reusing the last one seen when playback momentarily falls behind.

use std::time::Duration;

use crate::audio::buffer::FrameRingBuffer;
use crate::audio::dsp;

/// Length of one adaptation chunk
const CHUNK_MS: u32 = 8;

/// Adaptation step size
const DEFAULT_STEP: f32 = 0.3;

/// Regularization added to the reference energy per tap
const ENERGY_FLOOR: f32 = 1e-6;

pub const MIN_SAMPLE_RATE: u32 = 8_000;
pub const MAX_SAMPLE_RATE: u32 = 48_000;
pub const MIN_FILTER_LENGTH: usize = 1;
pub const MAX_FILTER_LENGTH: usize = 10;

/// Echo canceller contract.
///
/// `process` handles any slice length: whole chunks are filtered, a trailing
/// partial chunk is copied through unchanged. Until `initialize` succeeds the
/// output is an exact copy of the microphone input.
pub trait EchoCanceller: Send {
    /// Configure for `sample_rate` with a tail of `filter_length` chunks.
    /// Returns false on invalid parameters, leaving the canceller in
    /// passthrough.
    fn initialize(&mut self, sample_rate: u32, filter_length: usize) -> bool;

    fn is_initialized(&self) -> bool;

    /// Samples per adaptation chunk, 0 when uninitialized
    fn chunk_size(&self) -> usize;

    /// Cancel `reference` echo from `mic` into `output`
    fn process(&mut self, mic: &[i16], reference: &[i16], output: &mut [i16]);
}

/// Copy `mic` into `output` as far as both reach
#[inline]
pub fn passthrough(mic: &[i16], output: &mut [i16]) {
    let n = mic.len().min(output.len());
    output[..n].copy_from_slice(&mic[..n]);
}

/// Canceller that never initializes
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEchoCanceller;

impl EchoCanceller for NullEchoCanceller {
    fn initialize(&mut self, _sample_rate: u32, _filter_length: usize) -> bool {
        false
    }

    fn is_initialized(&self) -> bool {
        false
    }

    fn chunk_size(&self) -> usize {
        0
    }

    fn process(&mut self, mic: &[i16], _reference: &[i16], output: &mut [i16]) {
        passthrough(mic, output);
    }
}

/// Normalized LMS adaptive echo canceller
pub struct NlmsEchoCanceller {
    step: f32,
    chunk: usize,
    weights: Vec<f32>,
    /// Reference history stored twice so the tap window is always contiguous
    history: Vec<f32>,
    pos: usize,
    initialized: bool,
}

impl NlmsEchoCanceller {
    pub fn new() -> Self {
        Self::with_step(DEFAULT_STEP)
    }

    /// Create with a custom adaptation step (0 < step < 2)
    pub fn with_step(step: f32) -> Self {
        Self {
            step,
            chunk: 0,
            weights: Vec::new(),
            history: Vec::new(),
            pos: 0,
            initialized: false,
        }
    }

    /// Number of filter taps
    pub fn taps(&self) -> usize {
        self.weights.len()
    }

    fn filter_chunk(&mut self, mic: &[i16], reference: &[i16], output: &mut [i16]) {
        let taps = self.weights.len();
        let floor = ENERGY_FLOOR * taps as f32;

        for (i, (&m, out)) in mic.iter().zip(output.iter_mut()).enumerate() {
            let x = reference.get(i).copied().unwrap_or(0) as f32 / 32768.0;

            self.pos = if self.pos == 0 { taps - 1 } else { self.pos - 1 };
            self.history[self.pos] = x;
            self.history[self.pos + taps] = x;

            let window = &self.history[self.pos..self.pos + taps];
            let mut estimate = 0.0f32;
            let mut energy = 0.0f32;
            for (w, h) in self.weights.iter().zip(window) {
                estimate += w * h;
                energy += h * h;
            }

            let error = m as f32 / 32768.0 - estimate;
            let scale = self.step * error / (energy + floor);
            for (w, h) in self.weights.iter_mut().zip(window) {
                *w += scale * h;
            }

            *out = (error * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }
    }
}

impl Default for NlmsEchoCanceller {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoCanceller for NlmsEchoCanceller {
    fn initialize(&mut self, sample_rate: u32, filter_length: usize) -> bool {
        let valid = (MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&sample_rate)
            && (MIN_FILTER_LENGTH..=MAX_FILTER_LENGTH).contains(&filter_length);

        if !valid {
            tracing::warn!(
                "Echo canceller rejected sample_rate={} filter_length={}, using passthrough",
                sample_rate,
                filter_length
            );
            self.initialized = false;
            self.chunk = 0;
            self.weights.clear();
            self.history.clear();
            return false;
        }

        let chunk = (sample_rate * CHUNK_MS / 1000) as usize;
        let taps = chunk * filter_length;

        self.chunk = chunk;
        self.weights = vec![0.0; taps];
        self.history = vec![0.0; taps * 2];
        self.pos = 0;
        self.initialized = true;

        tracing::info!(
            "Echo canceller initialized: {} Hz, chunk {} samples, {} taps",
            sample_rate,
            chunk,
            taps
        );
        true
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn chunk_size(&self) -> usize {
        self.chunk
    }

    fn process(&mut self, mic: &[i16], reference: &[i16], output: &mut [i16]) {
        if !self.initialized {
            passthrough(mic, output);
            return;
        }

        let n = mic.len().min(output.len());
        let full = n - n % self.chunk;

        let mut start = 0;
        while start < full {
            let end = start + self.chunk;
            let reference = reference.get(start..end.min(reference.len())).unwrap_or(&[]);
            self.filter_chunk(&mic[start..end], reference, &mut output[start..end]);
            start = end;
        }

        output[full..n].copy_from_slice(&mic[full..n]);
    }
}

/// Where a reference frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceSource {
    /// Newest frame taken from the reference buffer
    Fresh,
    /// Reused the last frame seen
    HeldOver,
    /// No reference seen since the last clear
    Silence,
}

/// Picks the reference frame to pair with each microphone frame.
///
/// Older queued reference frames are skipped in favor of the newest whole
/// frame; on shortage the previous frame is reused.
pub struct ReferenceHold {
    last: Vec<u8>,
    valid: bool,
}

impl ReferenceHold {
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            last: vec![0u8; frame_bytes],
            valid: false,
        }
    }

    /// Fill `out` with the reference frame for the current microphone frame
    pub fn next_frame(&mut self, buffer: &FrameRingBuffer, lock_timeout: Duration, out: &mut [i16]) -> ReferenceSource {
        let frame_len = self.last.len();
        let last = &mut self.last;

        let fresh = buffer
            .with_ring_for(lock_timeout, |ring| {
                let frames = ring.available() / frame_len;
                if frames == 0 {
                    return false;
                }
                ring.discard((frames - 1) * frame_len);
                ring.read(last) == frame_len
            })
            .unwrap_or(false);

        let source = if fresh {
            self.valid = true;
            ReferenceSource::Fresh
        } else if self.valid {
            ReferenceSource::HeldOver
        } else {
            ReferenceSource::Silence
        };

        if source == ReferenceSource::Silence {
            out.fill(0);
        } else {
            let n = dsp::decode_s16le(&self.last, out);
            out[n..].fill(0);
        }

        source
    }

    /// Forget the held frame (new session)
    pub fn clear(&mut self) {
        self.valid = false;
        self.last.fill(0);
    }
}
