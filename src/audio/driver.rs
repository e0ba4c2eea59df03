//! Duplex audio driver
//!
//! Owns one bidirectional hardware channel and runs a realtime thread that
//! alternates between playing a frame and capturing a frame. Playback is fed
//! from an internal ring buffer and falls back to silence so the hardware
//! clock never stalls; captured frames are converted, optionally echo
//! cancelled against what was actually played, amplified and handed to the
//! registered callback.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TryRecvError};
use parking_lot::Mutex;

use crate::audio::aec::{EchoCanceller, ReferenceHold};
use crate::audio::buffer::{create_shared_buffer, SharedRingBuffer};
use crate::audio::dsp::{self, SampleWidth};
use crate::audio::{AudioHardware, FrameCallback, Microphone, Speaker};
use crate::constants::{
    DRIVER_STOP_TIMEOUT, FRAME_BYTES, FRAME_SAMPLES, LOCK_TIMEOUT, SAMPLE_RATE, SPEAKER_BUFFER_SIZE,
};
use crate::error::AudioError;

/// How long one hardware read or write may block
const IO_TIMEOUT: Duration = Duration::from_millis(32);

/// Pause after a hardware error before retrying
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Hardware errors between repeated warnings
const ERROR_LOG_INTERVAL: u64 = 100;

/// Register-level duplex hardware channel.
///
/// `read` and `write` block for at most `timeout` and report how many bytes
/// were transferred; either direction may be absent.
pub trait DuplexBackend: Send + 'static {
    fn open(&mut self) -> Result<(), AudioError>;

    fn close(&mut self);

    fn has_capture(&self) -> bool;

    fn has_playback(&self) -> bool;

    /// Width of captured samples
    fn capture_width(&self) -> SampleWidth;

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, AudioError>;

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, AudioError>;
}

/// Driver settings
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Gain applied to captured audio before the callback
    pub mic_gain: f32,
    /// Speaker volume, 1.0 is unity
    pub volume: f32,
    /// Run the in-driver echo canceller, if one is installed
    pub aec_enabled: bool,
    /// Echo tail in 8 ms chunks
    pub aec_filter_length: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            mic_gain: 1.0,
            volume: 1.0,
            aec_enabled: false,
            aec_filter_length: 4,
        }
    }
}

/// Settings the driver thread reads on every frame
struct LiveSettings {
    mic_gain: AtomicU32,
    volume: AtomicU32,
    aec_enabled: AtomicBool,
}

impl LiveSettings {
    fn mic_gain(&self) -> f32 {
        f32::from_bits(self.mic_gain.load(Ordering::Relaxed))
    }

    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }
}

type Parts = (Box<dyn DuplexBackend>, Option<Box<dyn EchoCanceller>>);

struct Worker {
    handle: JoinHandle<Parts>,
    done: Receiver<()>,
}

/// Bidirectional audio driver implementing [`Microphone`] and [`Speaker`]
pub struct DuplexAudioDriver {
    parts: Mutex<Option<Parts>>,
    worker: Mutex<Option<Worker>>,
    has_capture: bool,
    has_playback: bool,
    capture_width: SampleWidth,
    aec_filter_length: usize,
    aec_ready: bool,
    running: Arc<AtomicBool>,
    failed: AtomicBool,
    playback: SharedRingBuffer,
    reference: SharedRingBuffer,
    reference_drops: Arc<AtomicU64>,
    callback: Arc<Mutex<Option<FrameCallback>>>,
    settings: Arc<LiveSettings>,
}

impl DuplexAudioDriver {
    pub fn new(backend: Box<dyn DuplexBackend>, config: DriverConfig) -> Self {
        Self {
            has_capture: backend.has_capture(),
            has_playback: backend.has_playback(),
            capture_width: backend.capture_width(),
            aec_filter_length: config.aec_filter_length,
            aec_ready: false,
            parts: Mutex::new(Some((backend, None))),
            worker: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            failed: AtomicBool::new(false),
            playback: create_shared_buffer(SPEAKER_BUFFER_SIZE),
            reference: create_shared_buffer(SPEAKER_BUFFER_SIZE),
            reference_drops: Arc::new(AtomicU64::new(0)),
            callback: Arc::new(Mutex::new(None)),
            settings: Arc::new(LiveSettings {
                mic_gain: AtomicU32::new(config.mic_gain.to_bits()),
                volume: AtomicU32::new(config.volume.to_bits()),
                aec_enabled: AtomicBool::new(config.aec_enabled),
            }),
        }
    }

    /// Install an echo canceller that uses the played frames as reference.
    /// It is initialized for the wire sample rate here; on failure frames pass
    /// through unchanged.
    pub fn with_echo_canceller(mut self, mut echo: Box<dyn EchoCanceller>) -> Self {
        self.aec_ready = echo.initialize(SAMPLE_RATE, self.aec_filter_length);
        if !self.aec_ready {
            tracing::warn!("In-driver echo canceller failed to initialize, capture passes through");
        }
        if let Some(parts) = self.parts.lock().as_mut() {
            parts.1 = Some(echo);
        }
        self
    }

    pub fn has_capture(&self) -> bool {
        self.has_capture
    }

    pub fn has_playback(&self) -> bool {
        self.has_playback
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Queue s16le audio for playback. Returns the number of bytes accepted,
    /// 0 when the ring lock is contended.
    pub fn enqueue_playback(&self, data: &[u8]) -> usize {
        if self.is_failed() || !self.has_playback {
            return 0;
        }
        self.playback.try_write_for(data, LOCK_TIMEOUT).unwrap_or(0)
    }

    /// Played frames that could not be mirrored into the echo reference
    pub fn reference_drops(&self) -> u64 {
        self.reference_drops.load(Ordering::Relaxed)
    }

    pub fn set_mic_gain(&self, gain: f32) {
        self.settings.mic_gain.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn mic_gain(&self) -> f32 {
        self.settings.mic_gain()
    }

    pub fn set_aec_enabled(&self, enabled: bool) {
        self.settings.aec_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Open the hardware and spawn the driver thread
    pub fn start(&self) -> Result<(), AudioError> {
        if self.is_failed() {
            return Err(AudioError::Failed);
        }

        let mut worker = self.worker.lock();
        if self.is_running() {
            return Ok(());
        }

        // A thread left behind by a slow stop hands its parts back once done
        if let Some(previous) = worker.take() {
            match previous.done.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => self.reclaim(previous),
                Err(TryRecvError::Empty) => {
                    *worker = Some(previous);
                    tracing::warn!("Duplex driver thread from the last stop is still running");
                    return Err(AudioError::Thread("previous driver thread has not exited yet".to_string()));
                }
            }
            if self.is_failed() {
                return Err(AudioError::Failed);
            }
        }

        let Some((mut backend, echo)) = self.parts.lock().take() else {
            self.failed.store(true, Ordering::SeqCst);
            return Err(AudioError::Failed);
        };

        if !self.has_capture && !self.has_playback {
            tracing::warn!("Duplex driver has no audio path, marking failed");
            self.failed.store(true, Ordering::SeqCst);
            return Err(AudioError::NoAudioPath);
        }

        if let Err(e) = backend.open() {
            tracing::warn!("Failed to open duplex audio hardware: {}", e);
            self.failed.store(true, Ordering::SeqCst);
            return Err(e);
        }

        self.playback.reset();
        self.reference.reset();
        self.running.store(true, Ordering::SeqCst);

        let (done_tx, done_rx) = bounded::<()>(1);
        let mut ctx = LoopContext {
            running: self.running.clone(),
            has_capture: self.has_capture,
            has_playback: self.has_playback,
            width: self.capture_width,
            playback: self.playback.clone(),
            reference: self.reference.clone(),
            reference_drops: self.reference_drops.clone(),
            callback: self.callback.clone(),
            settings: self.settings.clone(),
        };

        let spawned = thread::Builder::new()
            .name("intercom-duplex".to_string())
            .spawn(move || {
                let mut backend = backend;
                let mut echo = echo;
                ctx.run(backend.as_mut(), echo.as_deref_mut());
                let _ = done_tx.send(());
                (backend, echo)
            });

        match spawned {
            Ok(handle) => {
                *worker = Some(Worker { handle, done: done_rx });
                tracing::info!(
                    "Duplex driver started (capture: {}, playback: {})",
                    self.has_capture,
                    self.has_playback
                );
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.failed.store(true, Ordering::SeqCst);
                Err(AudioError::Thread(e.to_string()))
            }
        }
    }

    /// Stop the driver thread. Waits a bounded time and never deadlocks.
    ///
    /// A thread that misses the deadline is kept; the next `start` or `stop`
    /// takes its hardware back once it has exited.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        let mut slot = self.worker.lock();
        let Some(worker) = slot.take() else {
            return;
        };

        match worker.done.recv_timeout(DRIVER_STOP_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => self.reclaim(worker),
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    "Duplex driver thread did not exit within {:?}, leaving it to finish",
                    DRIVER_STOP_TIMEOUT
                );
                *slot = Some(worker);
            }
        }
    }

    /// Join a finished driver thread and close its backend
    fn reclaim(&self, worker: Worker) {
        match worker.handle.join() {
            Ok((mut backend, echo)) => {
                backend.close();
                *self.parts.lock() = Some((backend, echo));
                tracing::info!("Duplex driver stopped");
            }
            Err(_) => {
                tracing::warn!("Duplex driver thread panicked, marking failed");
                self.failed.store(true, Ordering::SeqCst);
            }
        }
    }
}

impl Drop for DuplexAudioDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Microphone for DuplexAudioDriver {
    fn set_frame_callback(&self, callback: FrameCallback) {
        *self.callback.lock() = Some(callback);
    }

    /// Conversion to 16 bit happens inside the driver
    fn sample_width(&self) -> SampleWidth {
        SampleWidth::S16
    }
}

impl Speaker for DuplexAudioDriver {
    fn play(&self, data: &[u8]) -> usize {
        self.enqueue_playback(data)
    }

    fn volume(&self) -> f32 {
        self.settings.volume()
    }

    fn set_volume(&self, volume: f32) {
        self.settings.volume.store(volume.max(0.0).to_bits(), Ordering::Relaxed);
    }
}

impl AudioHardware for DuplexAudioDriver {
    fn start(&self) -> Result<(), AudioError> {
        DuplexAudioDriver::start(self)
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn has_echo_canceller(&self) -> bool {
        self.aec_ready
    }

    fn set_aec_enabled(&self, enabled: bool) {
        DuplexAudioDriver::set_aec_enabled(self, enabled)
    }
}

/// State moved onto the driver thread
struct LoopContext {
    running: Arc<AtomicBool>,
    has_capture: bool,
    has_playback: bool,
    width: SampleWidth,
    playback: SharedRingBuffer,
    reference: SharedRingBuffer,
    reference_drops: Arc<AtomicU64>,
    callback: Arc<Mutex<Option<FrameCallback>>>,
    settings: Arc<LiveSettings>,
}

impl LoopContext {
    fn run(&mut self, backend: &mut dyn DuplexBackend, mut echo: Option<&mut (dyn EchoCanceller + 'static)>) {
        let mut raw = vec![0u8; FRAME_SAMPLES * self.width.bytes()];
        let mut filled = 0usize;
        let mut samples = vec![0i16; FRAME_SAMPLES];
        let mut cleaned = vec![0i16; FRAME_SAMPLES];
        let mut reference = vec![0i16; FRAME_SAMPLES];
        let mut out = vec![0u8; FRAME_BYTES];
        let mut play = vec![0u8; FRAME_BYTES];
        let mut hold = ReferenceHold::new(FRAME_BYTES);
        let mut errors = 0u64;

        while self.running.load(Ordering::Relaxed) {
            if self.has_playback {
                if self.playback.try_read_exact_for(&mut play, LOCK_TIMEOUT) {
                    dsp::scale_s16le_in_place(&mut play, self.settings.volume());
                } else {
                    play.fill(0);
                }
                if self.reference.try_write_overwrite_for(&play, LOCK_TIMEOUT).is_none() {
                    self.reference_drops.fetch_add(1, Ordering::Relaxed);
                }

                if let Err(e) = backend.write(&play, IO_TIMEOUT) {
                    errors += 1;
                    if errors % ERROR_LOG_INTERVAL == 1 {
                        tracing::warn!("Duplex playback error ({} so far): {}", errors, e);
                    }
                    thread::sleep(ERROR_BACKOFF);
                }
            }

            if !self.has_capture {
                continue;
            }

            match backend.read(&mut raw[filled..], IO_TIMEOUT) {
                Ok(n) => filled += n,
                Err(e) => {
                    errors += 1;
                    if errors % ERROR_LOG_INTERVAL == 1 {
                        tracing::warn!("Duplex capture error ({} so far): {}", errors, e);
                    }
                    thread::sleep(ERROR_BACKOFF);
                    continue;
                }
            }

            if filled < raw.len() {
                continue;
            }
            filled = 0;

            dsp::decode_capture(&raw, self.width, &mut samples);

            match echo.as_deref_mut() {
                Some(aec) if aec.is_initialized() && self.settings.aec_enabled.load(Ordering::Relaxed) => {
                    hold.next_frame(&self.reference, LOCK_TIMEOUT, &mut reference);
                    aec.process(&samples, &reference, &mut cleaned);
                }
                _ => cleaned.copy_from_slice(&samples),
            }

            dsp::apply_gain_in_place(&mut cleaned, self.settings.mic_gain());
            dsp::encode_s16le(&cleaned, &mut out);

            if let Some(callback) = self.callback.lock().as_mut() {
                callback(&out);
            }
        }

        tracing::debug!("Duplex driver loop exited");
    }
}
