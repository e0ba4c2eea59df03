//! Streaming session orchestration
//!
//! [`StreamSession`] wires an [`AudioTopology`] to a [`DatagramTransport`]:
//! captured frames flow through the capture channel to the pipeline thread
//! and out to the peer; received datagrams flow through the jitter buffer to
//! the speaker. The session is either Idle or Streaming. Every transition
//! bumps the session epoch, which invalidates in-flight work from the
//! previous state. Audio hardware is brought up once at construction and is
//! never torn down by `stop`.

pub mod capture;
pub mod metrics;
pub mod pipeline;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::audio::aec::EchoCanceller;
use crate::audio::buffer::{create_shared_buffer, SharedRingBuffer};
use crate::audio::{AudioMode, AudioTopology};
use crate::config::AppConfig;
use crate::constants::{DEFAULT_BUFFER_SIZE, DEFAULT_PREBUFFER_SIZE, DEFAULT_UDP_PORT, FRAME_BYTES, SAMPLE_RATE};
use crate::error::{Error, SessionError};
use crate::network::{DatagramTransport, PeerEndpoint};

pub use capture::{capture_channel, CaptureConsumer, CaptureProducer};
pub use metrics::{MetricsSnapshot, SessionMetrics};
pub use pipeline::Pipeline;
pub use state::{SessionShared, StreamState, Wakeup};

/// Session parameters
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Local UDP port for incoming audio
    pub listen_port: u16,
    /// Initial peer for `start_configured`
    pub peer: Option<PeerEndpoint>,
    /// Jitter, capture and reference buffer capacity in bytes
    pub buffer_size: usize,
    /// Bytes buffered before playback begins
    pub prebuffer_size: usize,
    pub mic_gain: f32,
    pub dc_offset_removal: bool,
    pub aec_enabled: bool,
    pub aec_sample_rate: u32,
    pub aec_filter_length: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_UDP_PORT,
            peer: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            prebuffer_size: DEFAULT_PREBUFFER_SIZE,
            mic_gain: 4.0,
            dc_offset_removal: false,
            aec_enabled: false,
            aec_sample_rate: SAMPLE_RATE,
            aec_filter_length: 4,
        }
    }
}

impl SessionConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            listen_port: config.network.listen_port,
            peer: config.peer(),
            buffer_size: config.buffers.buffer_size,
            prebuffer_size: config.buffers.prebuffer_size,
            mic_gain: config.audio.mic_gain,
            dc_offset_removal: config.audio.dc_offset_removal,
            aec_enabled: config.aec.enabled,
            aec_sample_rate: config.aec.sample_rate,
            aec_filter_length: config.aec.filter_length,
        }
    }

    /// Buffers must hold at least one frame, and the prebuffer must leave
    /// room for the stream to keep flowing once playback starts
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.buffer_size < FRAME_BYTES {
            return Err(SessionError::InvalidConfig(format!(
                "buffer_size {} is smaller than one {}-byte frame",
                self.buffer_size, FRAME_BYTES
            )));
        }
        if self.prebuffer_size >= self.buffer_size {
            return Err(SessionError::InvalidConfig(format!(
                "prebuffer_size ({}) must be less than buffer_size ({})",
                self.prebuffer_size, self.buffer_size
            )));
        }
        Ok(())
    }
}

/// Lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started { peer: SocketAddr },
    Stopped,
}

/// Full-duplex streaming session
pub struct StreamSession {
    config: SessionConfig,
    shared: Arc<SessionShared>,
    topology: AudioTopology,
    transport: Arc<dyn DatagramTransport>,
    mic_buffer: SharedRingBuffer,
    reference: SharedRingBuffer,
    aec_ready: bool,
    /// Current peer; the lock also serializes start and stop
    control: Mutex<Option<SocketAddr>>,
    /// Peer of the last successful start, else the configured one
    remembered: Mutex<Option<PeerEndpoint>>,
    subscribers: Mutex<Vec<Sender<SessionEvent>>>,
    pipeline: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSession {
    /// Build the session and spawn its pipeline thread.
    ///
    /// Audio hardware is started here. If that fails the session is created
    /// anyway but stays in [`StreamState::Failed`] and refuses to stream.
    pub fn new(
        config: SessionConfig,
        topology: AudioTopology,
        transport: Arc<dyn DatagramTransport>,
        mut echo: Box<dyn EchoCanceller>,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let shared = Arc::new(SessionShared::new(
            config.mic_gain,
            config.dc_offset_removal,
            config.aec_enabled,
        ));
        let mic_buffer = create_shared_buffer(config.buffer_size);
        let reference = create_shared_buffer(config.buffer_size);

        // Cancellation in the driver sees the frames actually played, so it
        // replaces the pipeline canceller when available
        let hardware_aec = topology.hardware.as_ref().is_some_and(|hw| hw.has_echo_canceller());
        let aec_ready = if hardware_aec {
            if let Some(hardware) = &topology.hardware {
                hardware.set_aec_enabled(config.aec_enabled);
            }
            true
        } else {
            echo.initialize(config.aec_sample_rate, config.aec_filter_length)
        };
        if config.aec_enabled && !aec_ready {
            tracing::warn!("Echo cancellation requested but unavailable, sending microphone audio as is");
        }

        if let Err(e) = topology.start_hardware() {
            tracing::warn!("Audio hardware failed to start: {}", e);
            shared.mark_failed();
        }

        let (producer, consumer) = match &topology.microphone {
            Some(mic) => capture_channel(mic_buffer.clone(), shared.clone(), mic.sample_width()),
            None => capture_channel(mic_buffer.clone(), shared.clone(), Default::default()),
        };
        if let Some(mic) = &topology.microphone {
            let mut producer = producer;
            mic.set_frame_callback(Box::new(move |raw| {
                producer.push(raw);
            }));
        }

        let handle = Pipeline::new(
            shared.clone(),
            transport.clone(),
            topology.speaker.clone(),
            consumer,
            reference.clone(),
            echo,
            config.buffer_size,
            config.prebuffer_size,
        )
        .spawn()?;

        let remembered = Mutex::new(config.peer.clone());
        let session = Self {
            config,
            shared,
            topology,
            transport,
            mic_buffer,
            reference,
            aec_ready,
            control: Mutex::new(None),
            remembered,
            subscribers: Mutex::new(Vec::new()),
            pipeline: Mutex::new(Some(handle)),
        };
        session.log_config();
        Ok(session)
    }

    /// Start streaming to `peer`. Returns the resolved peer address.
    pub fn start(&self, peer: &PeerEndpoint) -> Result<SocketAddr, Error> {
        let mut current = self.control.lock();

        if self.shared.is_failed() {
            tracing::warn!("Cannot start: audio hardware failed");
            return Err(SessionError::Failed.into());
        }
        if self.shared.is_streaming() {
            tracing::warn!("Cannot start: already streaming");
            return Err(SessionError::AlreadyStreaming.into());
        }

        let addr = peer.resolve().map_err(|e| {
            tracing::warn!("Cannot start: {}", e);
            e
        })?;

        self.transport.open(self.config.listen_port, addr).map_err(|e| {
            tracing::warn!("Cannot start: {}", e);
            e
        })?;

        self.shared.metrics.reset();
        self.mic_buffer.reset();
        self.reference.reset();
        self.shared.request_dc_reset();
        self.shared.begin_streaming();
        *current = Some(addr);
        *self.remembered.lock() = Some(peer.clone());
        self.shared.wakeup.notify();

        tracing::info!(
            "Streaming to {} ({}, listening on port {})",
            addr,
            self.mode(),
            self.config.listen_port
        );
        self.emit(SessionEvent::Started { peer: addr });
        Ok(addr)
    }

    /// Start streaming to a fixed host and port
    pub fn start_to(&self, host: &str, port: u16) -> Result<SocketAddr, Error> {
        self.start(&PeerEndpoint::fixed(host, port))
    }

    /// Start streaming to the peer last started with, or the configured
    /// one. A dynamic peer is resolved again.
    pub fn start_configured(&self) -> Result<SocketAddr, Error> {
        let peer = self.remembered.lock().clone().ok_or(SessionError::NoPeer)?;
        self.start(&peer)
    }

    /// Stop streaming. No-op when idle.
    pub fn stop(&self) {
        let mut current = self.control.lock();
        if !self.shared.is_streaming() {
            return;
        }

        self.shared.end_streaming();
        self.transport.close();
        self.mic_buffer.reset();
        self.reference.reset();
        self.shared.metrics.set_buffer_fill(0);
        self.shared.wakeup.notify();

        if let Some(peer) = current.take() {
            tracing::info!("Stopped streaming to {}", peer);
        }
        self.emit(SessionEvent::Stopped);
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.is_streaming()
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Peer of the running stream
    pub fn peer(&self) -> Option<SocketAddr> {
        *self.control.lock()
    }

    pub fn mode(&self) -> AudioMode {
        self.topology.mode()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn tx_packets(&self) -> u64 {
        self.shared.metrics.tx_packets()
    }

    pub fn rx_packets(&self) -> u64 {
        self.shared.metrics.rx_packets()
    }

    pub fn tx_drops(&self) -> u64 {
        self.shared.metrics.tx_drops()
    }

    pub fn rx_drops(&self) -> u64 {
        self.shared.metrics.rx_drops()
    }

    /// Jitter buffer fill in bytes
    pub fn buffer_fill(&self) -> usize {
        self.shared.metrics.buffer_fill()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn reset_counters(&self) {
        self.shared.metrics.reset();
    }

    /// Set the capture gain. Negative or non-finite values are ignored.
    pub fn set_mic_gain(&self, gain: f32) -> bool {
        if !gain.is_finite() || gain < 0.0 {
            return false;
        }
        self.shared.set_mic_gain(gain);
        true
    }

    pub fn mic_gain(&self) -> f32 {
        self.shared.mic_gain()
    }

    pub fn set_dc_offset_removal(&self, enabled: bool) {
        self.shared.set_dc_offset_removal(enabled);
        if enabled {
            self.shared.request_dc_reset();
        }
    }

    pub fn dc_offset_removal(&self) -> bool {
        self.shared.dc_offset_removal()
    }

    pub fn set_aec_enabled(&self, enabled: bool) {
        if enabled && !self.aec_ready {
            tracing::warn!("Echo cancellation enabled but not initialized, audio passes through");
        }
        self.shared.set_aec_enabled(enabled);
        if let Some(hardware) = &self.topology.hardware {
            hardware.set_aec_enabled(enabled);
        }
    }

    pub fn is_aec_enabled(&self) -> bool {
        self.shared.aec_enabled()
    }

    /// Whether echo cancellation is enabled and actually running
    pub fn is_aec_active(&self) -> bool {
        self.aec_ready && self.shared.aec_enabled()
    }

    /// Speaker volume, `None` without a speaker
    pub fn volume(&self) -> Option<f32> {
        self.topology.speaker.as_ref().map(|s| s.volume())
    }

    /// Set the speaker volume. Returns false without a speaker.
    pub fn set_volume(&self, volume: f32) -> bool {
        match &self.topology.speaker {
            Some(speaker) if volume.is_finite() => {
                speaker.set_volume(volume.max(0.0));
                true
            }
            _ => false,
        }
    }

    /// Receive lifecycle events from now on
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    fn emit(&self, event: SessionEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn log_config(&self) {
        tracing::info!("Stream session:");
        tracing::info!("  Mode: {}", self.mode());
        tracing::info!("  Listen port: {}", self.config.listen_port);
        if let Some(peer) = &self.config.peer {
            tracing::info!("  Peer: {:?}", peer);
        }
        tracing::info!(
            "  Buffer: {} bytes, prebuffer: {} bytes",
            self.config.buffer_size,
            self.config.prebuffer_size
        );
        tracing::info!(
            "  Mic gain: {:.1}, DC removal: {}",
            self.mic_gain(),
            self.dc_offset_removal()
        );
        tracing::info!(
            "  AEC: {} (filter length {}, {})",
            if self.is_aec_enabled() { "enabled" } else { "disabled" },
            self.config.aec_filter_length,
            if self.aec_ready { "ready" } else { "passthrough" }
        );
        if self.shared.is_failed() {
            tracing::warn!("  Audio hardware FAILED, streaming unavailable");
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.stop();
        if let Some(mic) = &self.topology.microphone {
            mic.set_frame_callback(Box::new(|_| {}));
        }

        self.shared.request_shutdown();
        if let Some(handle) = self.pipeline.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("Pipeline thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::aec::NullEchoCanceller;
    use crate::audio::dsp::SampleWidth;
    use crate::audio::{AudioHardware, FrameCallback, Microphone, Speaker};
    use crate::error::{AudioError, NetworkError};
    use crate::network::UdpTransport;
    use std::net::UdpSocket;
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct MockMic {
        callback: Mutex<Option<FrameCallback>>,
    }

    impl MockMic {
        fn emit(&self, data: &[u8]) {
            if let Some(callback) = self.callback.lock().as_mut() {
                callback(data);
            }
        }
    }

    impl Microphone for MockMic {
        fn set_frame_callback(&self, callback: FrameCallback) {
            *self.callback.lock() = Some(callback);
        }

        fn sample_width(&self) -> SampleWidth {
            SampleWidth::S16
        }
    }

    #[derive(Default)]
    struct MockSpeaker {
        played: Mutex<Vec<u8>>,
        volume: Mutex<f32>,
    }

    impl Speaker for MockSpeaker {
        fn play(&self, data: &[u8]) -> usize {
            self.played.lock().extend_from_slice(data);
            data.len()
        }

        fn volume(&self) -> f32 {
            *self.volume.lock()
        }

        fn set_volume(&self, volume: f32) {
            *self.volume.lock() = volume;
        }
    }

    struct BrokenHardware;

    impl AudioHardware for BrokenHardware {
        fn start(&self) -> Result<(), AudioError> {
            Err(AudioError::StreamError("codec not responding".into()))
        }

        fn is_failed(&self) -> bool {
            true
        }
    }

    fn free_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    fn config(listen_port: u16) -> SessionConfig {
        SessionConfig {
            listen_port,
            mic_gain: 1.0,
            ..Default::default()
        }
    }

    fn network_only(listen_port: u16) -> StreamSession {
        StreamSession::new(
            config(listen_port),
            AudioTopology::none(),
            Arc::new(UdpTransport::new()),
            Box::new(NullEchoCanceller),
        )
        .unwrap()
    }

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_start_stop_lifecycle_and_events() {
        let session = network_only(free_port());
        let events = session.subscribe();
        assert_eq!(session.state(), StreamState::Idle);
        assert_eq!(session.mode(), AudioMode::None);

        session.stop();
        assert!(events.try_recv().is_err());

        let addr = session.start_to("127.0.0.1", free_port()).unwrap();
        assert!(session.is_streaming());
        assert_eq!(session.peer(), Some(addr));
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Started { peer: addr });

        assert!(matches!(
            session.start_to("127.0.0.1", 9999),
            Err(Error::Session(SessionError::AlreadyStreaming))
        ));

        session.stop();
        session.stop();
        assert_eq!(session.state(), StreamState::Idle);
        assert_eq!(session.peer(), None);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Stopped);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_bad_peer_leaves_session_idle() {
        let session = network_only(free_port());
        assert!(matches!(
            session.start_to("", 12346),
            Err(Error::Network(NetworkError::EmptyPeer))
        ));
        assert!(matches!(
            session.start_configured(),
            Err(Error::Session(SessionError::NoPeer))
        ));
        assert_eq!(session.state(), StreamState::Idle);

        // Retryable afterwards
        let addr = session.start_to("127.0.0.1", free_port()).unwrap();

        // The last peer is remembered for a plain restart
        session.stop();
        assert_eq!(session.start_configured().unwrap(), addr);
    }

    #[test]
    fn test_failed_hardware_refuses_to_stream() {
        let topology = AudioTopology {
            microphone: None,
            speaker: None,
            hardware: Some(Arc::new(BrokenHardware)),
        };
        let session = StreamSession::new(
            config(free_port()),
            topology,
            Arc::new(UdpTransport::new()),
            Box::new(NullEchoCanceller),
        )
        .unwrap();

        assert_eq!(session.state(), StreamState::Failed);
        assert!(matches!(
            session.start_to("127.0.0.1", free_port()),
            Err(Error::Session(SessionError::Failed))
        ));
    }

    #[test]
    fn test_settings() {
        let speaker = Arc::new(MockSpeaker::default());
        let topology = AudioTopology::separate(None, Some(speaker.clone()));
        let session = StreamSession::new(
            config(free_port()),
            topology,
            Arc::new(UdpTransport::new()),
            Box::new(NullEchoCanceller),
        )
        .unwrap();

        assert_eq!(session.mode(), AudioMode::RxOnly);
        assert!(session.set_mic_gain(2.5));
        assert!(!session.set_mic_gain(-1.0));
        assert!(!session.set_mic_gain(f32::NAN));
        assert_eq!(session.mic_gain(), 2.5);

        assert!(session.set_volume(0.25));
        assert_eq!(session.volume(), Some(0.25));

        session.set_aec_enabled(true);
        assert!(session.is_aec_enabled());
        assert!(!session.is_aec_active());
    }

    #[test]
    fn test_loopback_between_two_sessions() {
        let (port_a, port_b) = (free_port(), free_port());

        let mic = Arc::new(MockMic::default());
        let a = StreamSession::new(
            config(port_a),
            AudioTopology::separate(Some(mic.clone()), None),
            Arc::new(UdpTransport::new()),
            Box::new(NullEchoCanceller),
        )
        .unwrap();

        let speaker = Arc::new(MockSpeaker::default());
        let b = StreamSession::new(
            config(port_b),
            AudioTopology::separate(None, Some(speaker.clone())),
            Arc::new(UdpTransport::new()),
            Box::new(NullEchoCanceller),
        )
        .unwrap();

        b.start_to("127.0.0.1", port_a).unwrap();
        a.start_to("127.0.0.1", port_b).unwrap();

        for _ in 0..8 {
            mic.emit(&[0x01u8; 512]);
            thread::sleep(Duration::from_millis(2));
        }

        assert!(wait_for(|| speaker.played.lock().len() >= 2048));
        assert!(a.tx_packets() >= 4);
        assert!(b.rx_packets() >= 4);
        assert!(speaker.played.lock().iter().all(|&b| b == 0x01));

        // Frames captured while stopped are never buffered
        a.stop();
        mic.emit(&[0x02u8; 512]);
        assert_eq!(a.mic_buffer.available(), 0);

        a.reset_counters();
        assert_eq!(a.metrics(), MetricsSnapshot::default());
        b.stop();
    }

    #[test]
    fn test_rejects_unusable_buffer_sizes() {
        let build = |buffer_size, prebuffer_size| {
            StreamSession::new(
                SessionConfig {
                    buffer_size,
                    prebuffer_size,
                    ..config(free_port())
                },
                AudioTopology::none(),
                Arc::new(UdpTransport::new()),
                Box::new(NullEchoCanceller),
            )
        };

        assert!(matches!(build(2048, 4096), Err(SessionError::InvalidConfig(_))));
        assert!(matches!(build(2048, 2048), Err(SessionError::InvalidConfig(_))));
        assert!(matches!(build(0, 0), Err(SessionError::InvalidConfig(_))));
        assert!(matches!(build(256, 0), Err(SessionError::InvalidConfig(_))));
        assert!(build(2048, 1024).is_ok());
    }

    #[derive(Default)]
    struct CancellingHardware {
        aec: std::sync::atomic::AtomicBool,
    }

    impl AudioHardware for CancellingHardware {
        fn start(&self) -> Result<(), AudioError> {
            Ok(())
        }

        fn is_failed(&self) -> bool {
            false
        }

        fn has_echo_canceller(&self) -> bool {
            true
        }

        fn set_aec_enabled(&self, enabled: bool) {
            self.aec.store(enabled, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn test_aec_setting_reaches_hardware_canceller() {
        let hardware = Arc::new(CancellingHardware::default());
        let topology = AudioTopology {
            microphone: None,
            speaker: None,
            hardware: Some(hardware.clone()),
        };
        let session = StreamSession::new(
            SessionConfig {
                aec_enabled: true,
                ..config(free_port())
            },
            topology,
            Arc::new(UdpTransport::new()),
            Box::new(NullEchoCanceller),
        )
        .unwrap();

        assert!(hardware.aec.load(std::sync::atomic::Ordering::SeqCst));
        assert!(session.is_aec_active());

        session.set_aec_enabled(false);
        assert!(!hardware.aec.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!session.is_aec_active());
    }
}
