//! # Duplex Intercom
//!
//! Low-latency full-duplex audio intercom over UDP with acoustic echo
//! cancellation.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                                DEVICE                                    │
//! │                                                                          │
//! │  ┌────────────────────────────────────────────┐                          │
//! │  │        DuplexAudioDriver (driver thread)   │                          │
//! │  │  capture ──► 32→16 bit ─► AEC ─► gain ──┐  │ ◄── enqueue_playback ─┐  │
//! │  │  playback ◄── playback ring / silence    │  │                       │  │
//! │  └──────────────────────────────────────────┼─┘                       │  │
//! │                                             │ frame callback          │  │
//! │                                             ▼                         │  │
//! │                  ┌────────────────────────────────────┐               │  │
//! │                  │ CaptureProducer (epoch-guarded)    │               │  │
//! │                  │  DC removal ─► gain ─► mic ring    │               │  │
//! │                  └─────────────────┬──────────────────┘               │  │
//! │                                    │                                  │  │
//! │  ┌─────────────────────────────────▼──────────────────────────────┐   │  │
//! │  │                 StreamSession pipeline thread                  │   │  │
//! │  │                                                                │   │  │
//! │  │  mic frame ──► EchoCanceller ◄── reference ring (hold-over)    │   │  │
//! │  │                    │                    ▲                      │   │  │
//! │  │                    ▼                    │                      │   │  │
//! │  │             transport.send     jitter buffer ─► prebuffer gate ┼───┘  │
//! │  │                    │                    ▲                      │      │
//! │  └────────────────────┼────────────────────┼──────────────────────┘      │
//! │                       │                    │ transport.receive           │
//! └───────────────────────┼────────────────────┼─────────────────────────────┘
//!                         ▼  raw s16le PCM     │
//!                        UDP  ◄──────────────► UDP   (remote peer)
//! ```
//!
//! Every buffer is allocated once at construction. The session epoch and the
//! streaming flag are the only state shared across threads without a buffer
//! lock; everything on the per-frame path uses bounded lock waits and never
//! blocks on I/O.

pub mod audio;
pub mod config;
pub mod control;
pub mod error;
pub mod network;
pub mod session;

pub use error::{Error, Result};
pub use session::{StreamSession, StreamState};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Sample rate of the wire format and of every internal buffer
    pub const SAMPLE_RATE: u32 = 16_000;

    /// Samples per frame (16 ms at 16 kHz)
    pub const FRAME_SAMPLES: usize = 256;

    /// Bytes per frame of s16le mono audio
    pub const FRAME_BYTES: usize = FRAME_SAMPLES * std::mem::size_of::<i16>();

    /// Default UDP port for audio streaming (local and remote)
    pub const DEFAULT_UDP_PORT: u16 = 12346;

    /// Default HTTP port for the control API
    pub const DEFAULT_HTTP_PORT: u16 = 8080;

    /// Default jitter/capture/reference buffer capacity in bytes
    pub const DEFAULT_BUFFER_SIZE: usize = 8192;

    /// Default prebuffer threshold in bytes (64 ms)
    pub const DEFAULT_PREBUFFER_SIZE: usize = 2048;

    /// Largest datagram payload accepted from the network
    pub const MAX_DATAGRAM_BYTES: usize = 1024;

    /// Kernel send/receive buffer size for the UDP sockets
    pub const SOCKET_BUFFER_BYTES: usize = 16 * 1024;

    /// Longest a hot-path thread waits for a ring buffer lock
    pub const LOCK_TIMEOUT: Duration = Duration::from_millis(2);

    /// Mic frames sent per pipeline iteration at most
    pub const MAX_TX_FRAMES_PER_ITERATION: usize = 2;

    /// Jitter frames played per pipeline iteration at most
    pub const MAX_PLAYBACK_FRAMES_PER_ITERATION: usize = 2;

    /// Upper bound on how long `DuplexAudioDriver::stop` waits for its thread
    pub const DRIVER_STOP_TIMEOUT: Duration = Duration::from_millis(1500);

    /// Playback ring capacity inside the duplex driver
    pub const SPEAKER_BUFFER_SIZE: usize = 8192;

    /// Packets between periodic debug statistics lines
    pub const STATS_LOG_INTERVAL: u64 = 500;
}
