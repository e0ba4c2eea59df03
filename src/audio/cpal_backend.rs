//! Host audio backend on cpal
//!
//! Presents a pair of cpal streams as a [`DuplexBackend`]. cpal streams are
//! not `Send` on every host, so a holder thread builds them, keeps them alive
//! while the backend is open, and drops them on close. Audio crosses the
//! thread boundary through two preallocated ring buffers; the callbacks only
//! touch them with bounded lock waits and never allocate.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};

use crate::audio::buffer::{create_shared_buffer, FrameRingBuffer, SharedRingBuffer};
use crate::audio::device::{resolve_device, AudioDevice, Direction};
use crate::audio::driver::DuplexBackend;
use crate::audio::dsp::SampleWidth;
use crate::constants::{FRAME_BYTES, FRAME_SAMPLES, LOCK_TIMEOUT, SAMPLE_RATE};
use crate::error::AudioError;

/// Capture ring between the cpal callback and `read` (16 frames of the
/// widest sample format)
const CAPTURE_BUFFER_BYTES: usize = FRAME_SAMPLES * 4 * 16;

/// Samples converted per lock acquisition in the input callback
const CAPTURE_CHUNK_SAMPLES: usize = 256;

/// Playback ring between `write` and the cpal callback (4 frames)
const OUTPUT_BUFFER_BYTES: usize = FRAME_BYTES * 4;

/// How long `open` waits for the holder thread to report
const STREAM_READY_TIMEOUT: Duration = Duration::from_secs(5);

const HOLDER_POLL: Duration = Duration::from_millis(50);

/// Stream parameters chosen for one direction
#[derive(Debug, Clone)]
struct StreamPlan {
    device_id: Option<String>,
    config: StreamConfig,
    format: SampleFormat,
}

/// Samples the input callback knows how to forward
trait CaptureSample: SizedSample + Send + 'static {
    /// Bytes written per sample
    const WIDTH: usize;

    /// Write the sample little-endian into `out[..Self::WIDTH]`
    fn put_le(self, out: &mut [u8]);
}

impl CaptureSample for i16 {
    const WIDTH: usize = 2;

    fn put_le(self, out: &mut [u8]) {
        out[..2].copy_from_slice(&self.to_le_bytes());
    }
}

impl CaptureSample for i32 {
    const WIDTH: usize = 4;

    fn put_le(self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.to_le_bytes());
    }
}

impl CaptureSample for f32 {
    const WIDTH: usize = 2;

    fn put_le(self, out: &mut [u8]) {
        let sample = (self * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        out[..2].copy_from_slice(&sample.to_le_bytes());
    }
}

/// Samples the output callback can render from s16
trait PlaybackSample: SizedSample + Send + 'static {
    fn from_s16(sample: i16) -> Self;
}

impl PlaybackSample for i16 {
    fn from_s16(sample: i16) -> Self {
        sample
    }
}

impl PlaybackSample for i32 {
    fn from_s16(sample: i16) -> Self {
        (sample as i32) << 16
    }
}

impl PlaybackSample for f32 {
    fn from_s16(sample: i16) -> Self {
        sample as f32 / 32768.0
    }
}

/// cpal-backed duplex channel
pub struct CpalBackend {
    input: Option<StreamPlan>,
    output: Option<StreamPlan>,
    running: Arc<AtomicBool>,
    holder: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<AudioError>>,
    capture: SharedRingBuffer,
    playback: SharedRingBuffer,
    capture_overruns: Arc<AtomicU64>,
}

impl CpalBackend {
    /// Resolve devices and pick stream formats. A missing or unusable device
    /// disables that direction instead of failing.
    pub fn new(input_id: Option<&str>, output_id: Option<&str>) -> Self {
        let input = plan_stream(input_id, Direction::Input)
            .map_err(|e| tracing::warn!("Capture disabled: {}", e))
            .ok();
        let output = plan_stream(output_id, Direction::Output)
            .map_err(|e| tracing::warn!("Playback disabled: {}", e))
            .ok();

        Self {
            input,
            output,
            running: Arc::new(AtomicBool::new(false)),
            holder: None,
            error_rx: None,
            capture: create_shared_buffer(CAPTURE_BUFFER_BYTES),
            playback: create_shared_buffer(OUTPUT_BUFFER_BYTES),
            capture_overruns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Input callbacks that lost samples because `read` fell behind or the
    /// capture ring was contended
    pub fn capture_overruns(&self) -> u64 {
        self.capture_overruns.load(Ordering::Relaxed)
    }

    fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl DuplexBackend for CpalBackend {
    fn open(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let input = self.input.clone();
        let output = self.output.clone();
        let running = self.running.clone();
        let capture = self.capture.clone();
        let playback = self.playback.clone();
        let overruns = self.capture_overruns.clone();

        self.capture.reset();
        self.playback.reset();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("cpal-streams".to_string())
            .spawn(move || {
                let streams = build_streams(input, output, capture, playback, error_tx, overruns);
                let streams = match streams {
                    Ok(streams) => streams,
                    Err(e) => {
                        running.store(false, Ordering::SeqCst);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                while running.load(Ordering::Relaxed) {
                    thread::park_timeout(HOLDER_POLL);
                }
                drop(streams);
                tracing::debug!("cpal streams released");
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                AudioError::Thread(e.to_string())
            })?;

        let ready = match ready_rx.recv_timeout(STREAM_READY_TIMEOUT) {
            Ok(result) => result,
            Err(_) => Err(AudioError::StreamError("cpal streams did not start in time".to_string())),
        };

        if let Err(e) = ready {
            self.running.store(false, Ordering::SeqCst);
            handle.thread().unpark();
            let _ = handle.join();
            return Err(e);
        }

        self.holder = Some(handle);
        self.error_rx = Some(error_rx);
        tracing::info!(
            "cpal backend open (input: {:?}, output: {:?})",
            self.input.as_ref().map(|p| &p.config),
            self.output.as_ref().map(|p| &p.config)
        );
        Ok(())
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.holder.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
        self.error_rx = None;
    }

    fn has_capture(&self) -> bool {
        self.input.is_some()
    }

    fn has_playback(&self) -> bool {
        self.output.is_some()
    }

    fn capture_width(&self) -> SampleWidth {
        match self.input.as_ref().map(|p| p.format) {
            Some(SampleFormat::I32) => SampleWidth::S32,
            _ => SampleWidth::S16,
        }
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, AudioError> {
        if let Some(err) = self.check_errors() {
            return Err(err);
        }
        if self.input.is_none() || !self.running.load(Ordering::Relaxed) {
            return Err(AudioError::StreamError("capture stream not open".to_string()));
        }

        let deadline = Instant::now() + timeout;
        let mut filled = 0;

        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let n = self.capture.read(&mut buf[filled..], remaining);
            if n == 0 {
                break;
            }
            filled += n;
        }

        Ok(filled)
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, AudioError> {
        if let Some(err) = self.check_errors() {
            return Err(err);
        }
        Ok(self.playback.write_timeout(data, timeout))
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Choose a stream configuration at the intercom rate with the fewest
/// channels, preferring 16-bit integer samples
fn plan_stream(id: Option<&str>, direction: Direction) -> Result<StreamPlan, AudioError> {
    let device = resolve_device(id, direction)?;
    let rate = cpal::SampleRate(SAMPLE_RATE);

    let rank = |format: SampleFormat| match format {
        SampleFormat::I16 => Some(0),
        SampleFormat::F32 => Some(1),
        SampleFormat::I32 => Some(2),
        _ => None,
    };

    let best = device
        .supported_configs()?
        .into_iter()
        .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .filter_map(|c| rank(c.sample_format()).map(|r| (c.channels(), r, c)))
        .min_by_key(|(channels, r, _)| (*channels, *r))
        .map(|(_, _, c)| c.with_sample_rate(rate));

    let Some(supported) = best else {
        return Err(AudioError::UnsupportedFormat(format!(
            "{} does not support {} Hz in a usable sample format",
            device.name, SAMPLE_RATE
        )));
    };

    Ok(StreamPlan {
        device_id: id.map(str::to_string),
        format: supported.sample_format(),
        config: supported.config(),
    })
}

fn build_streams(
    input: Option<StreamPlan>,
    output: Option<StreamPlan>,
    capture: SharedRingBuffer,
    playback: SharedRingBuffer,
    error_tx: Sender<AudioError>,
    overruns: Arc<AtomicU64>,
) -> Result<Vec<cpal::Stream>, AudioError> {
    let mut streams = Vec::new();

    if let Some(plan) = input {
        let device = resolve_device(plan.device_id.as_deref(), Direction::Input)?;
        let stream = match plan.format {
            SampleFormat::I16 => build_input::<i16>(device, &plan.config, capture, error_tx.clone(), overruns)?,
            SampleFormat::I32 => build_input::<i32>(device, &plan.config, capture, error_tx.clone(), overruns)?,
            _ => build_input::<f32>(device, &plan.config, capture, error_tx.clone(), overruns)?,
        };
        streams.push(stream);
    }

    if let Some(plan) = output {
        let device = resolve_device(plan.device_id.as_deref(), Direction::Output)?;
        let stream = match plan.format {
            SampleFormat::I16 => build_output::<i16>(device, &plan.config, playback, error_tx)?,
            SampleFormat::I32 => build_output::<i32>(device, &plan.config, playback, error_tx)?,
            _ => build_output::<f32>(device, &plan.config, playback, error_tx)?,
        };
        streams.push(stream);
    }

    for stream in &streams {
        stream.play().map_err(|e| AudioError::CpalError(e.to_string()))?;
    }

    Ok(streams)
}

fn build_input<T: CaptureSample>(
    device: AudioDevice,
    config: &StreamConfig,
    capture: SharedRingBuffer,
    error_tx: Sender<AudioError>,
    overruns: Arc<AtomicU64>,
) -> Result<cpal::Stream, AudioError> {
    let channels = config.channels.max(1) as usize;
    let mut scratch = [0u8; CAPTURE_CHUNK_SAMPLES * 4];

    device
        .into_inner()
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !forward_capture(data, channels, &mut scratch, &capture) {
                    overruns.fetch_add(1, Ordering::Relaxed);
                }
            },
            move |err| {
                let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::CpalError(e.to_string()))
}

fn build_output<T: PlaybackSample>(
    device: AudioDevice,
    config: &StreamConfig,
    playback: SharedRingBuffer,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError> {
    let channels = config.channels.max(1) as usize;
    let mut scratch = [0u8; OUTPUT_BUFFER_BYTES];

    device
        .into_inner()
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                render_playback(data, channels, &mut scratch, &playback);
            },
            move |err| {
                let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::CpalError(e.to_string()))
}

/// Push the first channel of `data` into the capture ring, a chunk per lock
/// acquisition. Returns false if any samples were lost.
fn forward_capture<T: CaptureSample>(
    data: &[T],
    channels: usize,
    scratch: &mut [u8; CAPTURE_CHUNK_SAMPLES * 4],
    capture: &FrameRingBuffer,
) -> bool {
    let mut intact = true;

    for frames in data.chunks(CAPTURE_CHUNK_SAMPLES * channels) {
        let mut n = 0;
        for frame in frames.chunks_exact(channels) {
            frame[0].put_le(&mut scratch[n..]);
            n += T::WIDTH;
        }
        // Keep the newest audio when the reader falls behind
        if capture.try_write_overwrite_for(&scratch[..n], LOCK_TIMEOUT) != Some(false) {
            intact = false;
        }
    }

    intact
}

/// Fill `data` from the playback ring, copying each sample to every channel.
/// Silence on shortage or contention.
fn render_playback<T: PlaybackSample>(
    data: &mut [T],
    channels: usize,
    scratch: &mut [u8; OUTPUT_BUFFER_BYTES],
    playback: &FrameRingBuffer,
) {
    for block in data.chunks_mut(OUTPUT_BUFFER_BYTES / 2 * channels) {
        let frames = block.len() / channels;
        let n = playback.try_read_for(&mut scratch[..frames * 2], LOCK_TIMEOUT);

        for (i, frame) in block.chunks_exact_mut(channels).enumerate() {
            let sample = if i * 2 + 1 < n {
                i16::from_le_bytes([scratch[i * 2], scratch[i * 2 + 1]])
            } else {
                0
            };
            frame.fill(T::from_s16(sample));
        }
    }
}
