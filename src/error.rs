//! Error types for the intercom engine

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Backend has neither a capture nor a playback path")]
    NoAudioPath,

    #[error("Audio component failed during setup")]
    Failed,

    #[error("Audio thread error: {0}")]
    Thread(String),

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket creation failed: {0}")]
    SocketFailed(String),

    #[error("Socket bind failed on port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    #[error("Remote peer address is empty")]
    EmptyPeer,

    #[error("Invalid remote peer address: {0}")]
    InvalidPeer(String),

    #[error("Peer could not be resolved: {0}")]
    Unresolved(String),
}

/// Stream session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session is already streaming")]
    AlreadyStreaming,

    #[error("Session failed during setup and cannot stream")]
    Failed,

    #[error("No remote peer configured")]
    NoPeer,

    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),

    #[error("Pipeline thread could not be spawned: {0}")]
    Spawn(String),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
