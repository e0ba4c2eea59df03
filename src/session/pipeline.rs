//! The session's single data-path thread
//!
//! Each iteration receives at most one datagram into the jitter buffer,
//! plays a bounded number of frames once the prebuffer threshold is met, and
//! sends a bounded number of microphone frames (echo cancelled when enabled).
//! Nothing here blocks on I/O; between iterations the thread parks on the
//! session wakeup with a short timeout.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::aec::{EchoCanceller, ReferenceHold};
use crate::audio::buffer::{JitterBuffer, SharedRingBuffer};
use crate::audio::dsp;
use crate::audio::Speaker;
use crate::constants::{
    FRAME_BYTES, FRAME_SAMPLES, LOCK_TIMEOUT, MAX_DATAGRAM_BYTES, MAX_PLAYBACK_FRAMES_PER_ITERATION,
    MAX_TX_FRAMES_PER_ITERATION, STATS_LOG_INTERVAL,
};
use crate::error::SessionError;
use crate::network::DatagramTransport;
use crate::session::capture::CaptureConsumer;
use crate::session::state::SessionShared;

/// Wait between iterations while idle
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Wait after an iteration that moved no audio
const STREAMING_WAIT: Duration = Duration::from_millis(1);

/// Everything the pipeline thread owns
pub struct Pipeline {
    shared: Arc<SessionShared>,
    transport: Arc<dyn DatagramTransport>,
    speaker: Option<Arc<dyn Speaker>>,
    capture: CaptureConsumer,
    reference: SharedRingBuffer,
    echo: Box<dyn EchoCanceller>,
    jitter: JitterBuffer,
    hold: ReferenceHold,
    epoch: u64,
    recv_buf: Vec<u8>,
    play_frame: Vec<u8>,
    mic_frame: Vec<u8>,
    send_frame: Vec<u8>,
    mic_samples: Vec<i16>,
    ref_samples: Vec<i16>,
    out_samples: Vec<i16>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shared: Arc<SessionShared>,
        transport: Arc<dyn DatagramTransport>,
        speaker: Option<Arc<dyn Speaker>>,
        capture: CaptureConsumer,
        reference: SharedRingBuffer,
        echo: Box<dyn EchoCanceller>,
        buffer_size: usize,
        prebuffer_size: usize,
    ) -> Self {
        let epoch = shared.epoch();
        Self {
            shared,
            transport,
            speaker,
            capture,
            reference,
            echo,
            jitter: JitterBuffer::new(buffer_size, prebuffer_size),
            hold: ReferenceHold::new(FRAME_BYTES),
            epoch,
            recv_buf: vec![0u8; MAX_DATAGRAM_BYTES],
            play_frame: vec![0u8; FRAME_BYTES],
            mic_frame: vec![0u8; FRAME_BYTES],
            send_frame: vec![0u8; FRAME_BYTES],
            mic_samples: vec![0i16; FRAME_SAMPLES],
            ref_samples: vec![0i16; FRAME_SAMPLES],
            out_samples: vec![0i16; FRAME_SAMPLES],
        }
    }

    /// Move the pipeline onto its own thread
    pub fn spawn(self) -> Result<JoinHandle<()>, SessionError> {
        thread::Builder::new()
            .name("intercom-pipeline".to_string())
            .spawn(move || self.run())
            .map_err(|e| SessionError::Spawn(e.to_string()))
    }

    /// Loop until the session shuts down
    pub fn run(mut self) {
        tracing::debug!("Pipeline thread started");

        while !self.shared.is_shutdown() {
            let busy = self.run_once();
            let wait = if self.shared.is_streaming() {
                STREAMING_WAIT
            } else {
                IDLE_WAIT
            };
            if !busy {
                self.shared.wakeup.wait(wait);
            }
        }

        tracing::debug!("Pipeline thread exiting");
    }

    /// One pass over receive, playback and transmit. Returns true if any
    /// audio moved.
    pub fn run_once(&mut self) -> bool {
        self.sync_epoch();
        if !self.shared.is_streaming() {
            return false;
        }

        let received = self.receive();
        let played = self.play();
        let sent = self.transmit();

        received || played > 0 || sent > 0
    }

    /// Drop per-session state when a start or stop happened since the last pass
    fn sync_epoch(&mut self) {
        let epoch = self.shared.epoch();
        if epoch == self.epoch {
            return;
        }

        tracing::debug!("Session epoch {} -> {}, resetting jitter buffer", self.epoch, epoch);
        self.epoch = epoch;
        self.jitter.reset();
        self.hold.clear();
        self.shared.metrics.set_buffer_fill(0);
    }

    fn receive(&mut self) -> bool {
        let n = self.transport.receive(&mut self.recv_buf);
        if n == 0 {
            return false;
        }

        let metrics = &self.shared.metrics;
        let packets = metrics.record_rx_packet();
        if self.jitter.push(&self.recv_buf[..n]) < n {
            metrics.record_rx_drop();
            tracing::trace!("Jitter buffer overflow, {} bytes received", n);
        }
        metrics.set_buffer_fill(self.jitter.available());

        if packets % STATS_LOG_INTERVAL == 0 {
            tracing::debug!(
                "RX: {} packets, {} drops, buffer {}/{} bytes",
                packets,
                metrics.rx_drops(),
                self.jitter.available(),
                self.jitter.capacity()
            );
        }
        true
    }

    fn play(&mut self) -> usize {
        let was_primed = self.jitter.is_primed();
        let mut played = 0;

        while played < MAX_PLAYBACK_FRAMES_PER_ITERATION && self.jitter.pop_frame(&mut self.play_frame) {
            if let Some(speaker) = &self.speaker {
                let metrics = &self.shared.metrics;
                // Contended reference write: the echo reference misses a frame
                if self
                    .reference
                    .try_write_overwrite_for(&self.play_frame, LOCK_TIMEOUT)
                    .is_none()
                {
                    metrics.record_rx_drop();
                }
                if speaker.play(&self.play_frame) < FRAME_BYTES {
                    metrics.record_rx_drop();
                    tracing::trace!("Speaker backpressure, frame dropped");
                }
            }
            played += 1;
        }

        if !was_primed && self.jitter.is_primed() {
            tracing::info!("Prebuffer reached ({} bytes), starting playback", self.jitter.prebuffer());
        }
        if played > 0 {
            self.shared.metrics.set_buffer_fill(self.jitter.available());
        }
        played
    }

    fn transmit(&mut self) -> usize {
        let use_aec = self.shared.aec_enabled() && self.echo.is_initialized();
        let mut sent = 0;

        for _ in 0..MAX_TX_FRAMES_PER_ITERATION {
            if !self.capture.pop_frame(&mut self.mic_frame) {
                break;
            }
            // A stop or restart raced with the pop
            if self.shared.epoch() != self.epoch {
                break;
            }

            let frame = if use_aec {
                dsp::decode_s16le(&self.mic_frame, &mut self.mic_samples);
                self.hold.next_frame(&self.reference, LOCK_TIMEOUT, &mut self.ref_samples);
                self.echo.process(&self.mic_samples, &self.ref_samples, &mut self.out_samples);
                dsp::encode_s16le(&self.out_samples, &mut self.send_frame);
                &self.send_frame
            } else {
                &self.mic_frame
            };

            if self.transport.send(frame) {
                let metrics = &self.shared.metrics;
                let packets = metrics.record_tx_packet();
                if packets % STATS_LOG_INTERVAL == 0 {
                    tracing::debug!("TX: {} packets, {} drops", packets, metrics.tx_drops());
                }
            }
            sent += 1;
        }

        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::aec::{NlmsEchoCanceller, NullEchoCanceller};
    use crate::audio::buffer::{create_shared_buffer, WriteOutcome};
    use crate::audio::dsp::SampleWidth;
    use crate::error::NetworkError;
    use crate::session::capture::{capture_channel, CaptureProducer};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::net::SocketAddr;

    #[derive(Default)]
    struct MockTransport {
        inbound: Mutex<VecDeque<Vec<u8>>>,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl DatagramTransport for MockTransport {
        fn open(&self, _listen_port: u16, _peer: SocketAddr) -> Result<(), NetworkError> {
            Ok(())
        }

        fn send(&self, data: &[u8]) -> bool {
            self.sent.lock().push(data.to_vec());
            true
        }

        fn receive(&self, buf: &mut [u8]) -> usize {
            match self.inbound.lock().pop_front() {
                Some(datagram) => {
                    buf[..datagram.len()].copy_from_slice(&datagram);
                    datagram.len()
                }
                None => 0,
            }
        }

        fn close(&self) {}

        fn is_open(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct RecordingSpeaker {
        frames: Mutex<Vec<Vec<u8>>>,
        full: std::sync::atomic::AtomicBool,
    }

    impl Speaker for RecordingSpeaker {
        fn play(&self, data: &[u8]) -> usize {
            if self.full.load(std::sync::atomic::Ordering::SeqCst) {
                return 0;
            }
            self.frames.lock().push(data.to_vec());
            data.len()
        }

        fn volume(&self) -> f32 {
            1.0
        }

        fn set_volume(&self, _volume: f32) {}
    }

    struct Harness {
        shared: Arc<SessionShared>,
        transport: Arc<MockTransport>,
        speaker: Arc<RecordingSpeaker>,
        producer: CaptureProducer,
        reference: SharedRingBuffer,
        pipeline: Pipeline,
    }

    fn harness(echo: Box<dyn EchoCanceller>) -> Harness {
        let shared = Arc::new(SessionShared::new(1.0, false, false));
        let transport = Arc::new(MockTransport::default());
        let speaker = Arc::new(RecordingSpeaker::default());
        let reference = create_shared_buffer(8192);
        let (producer, consumer) = capture_channel(create_shared_buffer(8192), shared.clone(), SampleWidth::S16);

        let pipeline = Pipeline::new(
            shared.clone(),
            transport.clone(),
            Some(speaker.clone()),
            consumer,
            reference.clone(),
            echo,
            8192,
            2048,
        );

        Harness {
            shared,
            transport,
            speaker,
            producer,
            reference,
            pipeline,
        }
    }

    #[test]
    fn test_idle_pipeline_does_nothing() {
        let mut h = harness(Box::new(NullEchoCanceller));
        h.transport.inbound.lock().push_back(vec![0u8; 512]);
        assert!(!h.pipeline.run_once());
        assert_eq!(h.transport.inbound.lock().len(), 1);
    }

    #[test]
    fn test_prebuffer_gates_playback() {
        let mut h = harness(Box::new(NullEchoCanceller));
        h.shared.begin_streaming();

        for i in 0..3u8 {
            h.transport.inbound.lock().push_back(vec![i; 512]);
            h.pipeline.run_once();
        }
        assert!(h.speaker.frames.lock().is_empty());
        assert_eq!(h.shared.metrics.buffer_fill(), 1536);

        h.transport.inbound.lock().push_back(vec![3u8; 512]);
        h.pipeline.run_once();
        assert_eq!(h.speaker.frames.lock().len(), 2);
        h.pipeline.run_once();
        assert_eq!(h.speaker.frames.lock().len(), 4);

        let frames = h.speaker.frames.lock();
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame[0], i as u8);
        }
        assert_eq!(h.shared.metrics.rx_packets(), 4);
        assert_eq!(h.shared.metrics.buffer_fill(), 0);
        assert_eq!(h.reference.available(), 2048);
    }

    #[test]
    fn test_jitter_overflow_counts_one_drop_per_datagram() {
        let mut h = harness(Box::new(NullEchoCanceller));
        h.pipeline.jitter = JitterBuffer::new(1024, 1024);
        h.shared.begin_streaming();
        h.pipeline.sync_epoch();

        // Fill past capacity before anything can be released
        h.pipeline.jitter.push(&[0u8; 800]);
        h.transport.inbound.lock().push_back(vec![1u8; 512]);
        h.pipeline.run_once();

        assert_eq!(h.shared.metrics.rx_drops(), 1);
        assert_eq!(h.shared.metrics.rx_packets(), 1);
    }

    #[test]
    fn test_transmits_at_most_two_frames_per_iteration() {
        let mut h = harness(Box::new(NullEchoCanceller));
        h.shared.begin_streaming();

        for i in 0..3u8 {
            assert_eq!(h.producer.push(&[i * 2; 512]), WriteOutcome::Committed);
        }

        h.pipeline.run_once();
        assert_eq!(h.transport.sent.lock().len(), 2);
        h.pipeline.run_once();
        assert_eq!(h.transport.sent.lock().len(), 3);

        let sent = h.transport.sent.lock();
        assert_eq!(sent[2], vec![4u8; 512]);
        assert_eq!(h.shared.metrics.tx_packets(), 3);
    }

    #[test]
    fn test_epoch_change_resets_jitter_buffer() {
        let mut h = harness(Box::new(NullEchoCanceller));
        h.shared.begin_streaming();

        h.transport.inbound.lock().push_back(vec![7u8; 1000]);
        h.pipeline.run_once();
        assert_eq!(h.pipeline.jitter.available(), 1000);

        h.shared.end_streaming();
        h.shared.begin_streaming();
        h.pipeline.run_once();
        assert_eq!(h.pipeline.jitter.available(), 0);
        assert!(!h.pipeline.jitter.is_primed());
    }

    #[test]
    fn test_aec_disabled_sends_mic_unchanged() {
        let mut echo = NlmsEchoCanceller::new();
        assert!(echo.initialize(16_000, 4));
        let mut h = harness(Box::new(echo));
        h.shared.begin_streaming();

        let mut frame = vec![0u8; 512];
        dsp::encode_s16le(&[1234i16; 256], &mut frame);
        h.producer.push(&frame);
        h.pipeline.run_once();

        assert_eq!(h.transport.sent.lock()[0], frame);
    }

    #[test]
    fn test_aec_enabled_cancels_played_reference() {
        let mut echo = NlmsEchoCanceller::new();
        assert!(echo.initialize(16_000, 1));
        let mut h = harness(Box::new(echo));
        h.shared.set_aec_enabled(true);
        h.shared.begin_streaming();

        // The microphone hears exactly what is in the reference
        let mut seed = 99u32;
        let mut last_rms = f64::MAX;
        for round in 0..200 {
            let samples: Vec<i16> = (0..256)
                .map(|_| {
                    seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                    ((seed >> 16) as i16) / 4
                })
                .collect();
            let mut bytes = vec![0u8; 512];
            dsp::encode_s16le(&samples, &mut bytes);

            h.reference.write_overwrite(&bytes);
            h.producer.push(&bytes);
            h.pipeline.run_once();

            if round == 199 {
                let sent = h.transport.sent.lock();
                let mut out = vec![0i16; 256];
                dsp::decode_s16le(sent.last().unwrap(), &mut out);
                let sum: f64 = out.iter().map(|&s| (s as f64).powi(2)).sum();
                last_rms = (sum / 256.0).sqrt();
            }
        }

        assert_eq!(h.transport.sent.lock().len(), 200);
        assert!(last_rms < 300.0, "residual rms {}", last_rms);
    }

    #[test]
    fn test_speaker_backpressure_counts_rx_drops() {
        let mut h = harness(Box::new(NullEchoCanceller));
        h.speaker.full.store(true, std::sync::atomic::Ordering::SeqCst);
        h.shared.begin_streaming();

        for i in 0..6u8 {
            h.transport.inbound.lock().push_back(vec![i; 512]);
            h.pipeline.run_once();
        }

        // Prebuffer releases from the fourth datagram on, two frames per pass
        assert!(h.speaker.frames.lock().is_empty());
        assert_eq!(h.shared.metrics.rx_packets(), 6);
        assert_eq!(h.shared.metrics.rx_drops(), 6);
        assert_eq!(h.shared.metrics.tx_drops(), 0);
    }
}
