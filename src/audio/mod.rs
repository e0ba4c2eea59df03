//! Audio subsystem module
//!
//! Hardware is reached through small capability traits so the session can run
//! against a duplex driver, a separate microphone/speaker pair, or nothing at
//! all (network-only testing).

pub mod aec;
pub mod buffer;
pub mod cpal_backend;
pub mod device;
pub mod driver;
pub mod dsp;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::AudioError;

pub use aec::{EchoCanceller, NlmsEchoCanceller, NullEchoCanceller, ReferenceHold};
pub use buffer::{create_shared_buffer, FrameRingBuffer, JitterBuffer, SharedRingBuffer};
pub use cpal_backend::CpalBackend;
pub use device::{list_devices, AudioDeviceInfo};
pub use driver::{DriverConfig, DuplexAudioDriver, DuplexBackend};
pub use dsp::SampleWidth;

/// Receives raw captured bytes, one hardware frame per call
pub type FrameCallback = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// A source of captured audio frames
pub trait Microphone: Send + Sync {
    /// Register the sink for captured frames, replacing any previous one
    fn set_frame_callback(&self, callback: FrameCallback);

    /// Width of the samples handed to the callback
    fn sample_width(&self) -> SampleWidth;
}

/// A sink for s16le playback audio
pub trait Speaker: Send + Sync {
    /// Queue audio for playback. Returns the number of bytes accepted.
    fn play(&self, data: &[u8]) -> usize;

    fn volume(&self) -> f32;

    fn set_volume(&self, volume: f32);
}

/// Hardware that must be brought up once before audio flows
pub trait AudioHardware: Send + Sync {
    fn start(&self) -> Result<(), AudioError>;

    /// Whether bring-up failed permanently
    fn is_failed(&self) -> bool;

    /// Whether the hardware cancels echo itself, against what it plays
    fn has_echo_canceller(&self) -> bool {
        false
    }

    fn set_aec_enabled(&self, _enabled: bool) {}
}

/// Which directions of audio are available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioMode {
    FullDuplex,
    TxOnly,
    RxOnly,
    None,
}

impl fmt::Display for AudioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AudioMode::FullDuplex => "Full Duplex",
            AudioMode::TxOnly => "TX Only",
            AudioMode::RxOnly => "RX Only",
            AudioMode::None => "None",
        };
        f.write_str(name)
    }
}

/// The audio collaborators a session is wired to
#[derive(Clone, Default)]
pub struct AudioTopology {
    pub microphone: Option<Arc<dyn Microphone>>,
    pub speaker: Option<Arc<dyn Speaker>>,
    pub hardware: Option<Arc<dyn AudioHardware>>,
}

impl AudioTopology {
    /// One driver serving both directions
    pub fn duplex(driver: Arc<DuplexAudioDriver>) -> Self {
        let microphone = driver.has_capture().then(|| driver.clone() as Arc<dyn Microphone>);
        let speaker = driver.has_playback().then(|| driver.clone() as Arc<dyn Speaker>);

        Self {
            microphone,
            speaker,
            hardware: Some(driver),
        }
    }

    /// Independent microphone and speaker components, either optional
    pub fn separate(microphone: Option<Arc<dyn Microphone>>, speaker: Option<Arc<dyn Speaker>>) -> Self {
        Self {
            microphone,
            speaker,
            hardware: None,
        }
    }

    /// No local audio
    pub fn none() -> Self {
        Self::default()
    }

    /// Bring up the hardware, if any
    pub fn start_hardware(&self) -> Result<(), AudioError> {
        match &self.hardware {
            Some(hardware) => {
                hardware.start()?;
                if hardware.is_failed() {
                    return Err(AudioError::Failed);
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn mode(&self) -> AudioMode {
        match (self.microphone.is_some(), self.speaker.is_some()) {
            (true, true) => AudioMode::FullDuplex,
            (true, false) => AudioMode::TxOnly,
            (false, true) => AudioMode::RxOnly,
            (false, false) => AudioMode::None,
        }
    }
}

impl fmt::Debug for AudioTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioTopology")
            .field("mode", &self.mode())
            .field("hardware", &self.hardware.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSpeaker;

    impl Speaker for NullSpeaker {
        fn play(&self, data: &[u8]) -> usize {
            data.len()
        }

        fn volume(&self) -> f32 {
            1.0
        }

        fn set_volume(&self, _volume: f32) {}
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(AudioMode::FullDuplex.to_string(), "Full Duplex");
        assert_eq!(AudioMode::TxOnly.to_string(), "TX Only");
        assert_eq!(AudioMode::RxOnly.to_string(), "RX Only");
        assert_eq!(AudioMode::None.to_string(), "None");
    }

    #[test]
    fn test_topology_mode() {
        assert_eq!(AudioTopology::none().mode(), AudioMode::None);
        assert!(AudioTopology::none().start_hardware().is_ok());

        let speaker: Arc<dyn Speaker> = Arc::new(NullSpeaker);
        assert_eq!(AudioTopology::separate(None, Some(speaker)).mode(), AudioMode::RxOnly);
    }
}
