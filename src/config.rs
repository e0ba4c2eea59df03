//! Application configuration
//!
//! Loaded from a TOML file; every field has a default so a partial file (or
//! none at all) yields a usable configuration.

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::audio::aec::{MAX_FILTER_LENGTH, MAX_SAMPLE_RATE, MIN_FILTER_LENGTH, MIN_SAMPLE_RATE};
use crate::constants::{
    DEFAULT_BUFFER_SIZE, DEFAULT_HTTP_PORT, DEFAULT_PREBUFFER_SIZE, DEFAULT_UDP_PORT, SAMPLE_RATE,
};
use crate::error::{Error, Result};
use crate::network::PeerEndpoint;

const CONFIG_FILE_NAME: &str = "intercom.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub buffers: BufferConfig,
    pub audio: AudioConfig,
    pub aec: AecConfig,
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_port: u16,
    /// Empty means no configured peer
    pub remote_host: String,
    pub remote_port: u16,
    /// Start streaming to the configured peer on launch
    pub autostart: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_UDP_PORT,
            remote_host: String::new(),
            remote_port: DEFAULT_UDP_PORT,
            autostart: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    pub buffer_size: usize,
    pub prebuffer_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            prebuffer_size: DEFAULT_PREBUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Device id (`input:<name>`) or `default`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_device: Option<String>,
    /// Device id (`output:<name>`) or `default`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_device: Option<String>,
    pub mic_gain: f32,
    pub dc_offset_removal: bool,
    pub volume: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            mic_gain: 4.0,
            dc_offset_removal: false,
            volume: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AecConfig {
    pub enabled: bool,
    pub sample_rate: u32,
    /// Echo tail in 8 ms chunks
    pub filter_length: usize,
}

impl Default for AecConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: SAMPLE_RATE,
            filter_length: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

impl AppConfig {
    /// Parse and validate a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or the default location if none is given. A missing
    /// default file yields the defaults; a missing explicit file is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, text)?;
        Ok(())
    }

    /// Platform configuration directory location
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "intercom", "duplex-intercom")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    pub fn validate(&self) -> Result<()> {
        let port_ok = |port: u16| port >= 1024;

        if !port_ok(self.network.listen_port) {
            return Err(Error::Config(format!(
                "network.listen_port {} must be in 1024..=65535",
                self.network.listen_port
            )));
        }
        if !port_ok(self.network.remote_port) {
            return Err(Error::Config(format!(
                "network.remote_port {} must be in 1024..=65535",
                self.network.remote_port
            )));
        }
        if self.network.autostart && self.network.remote_host.trim().is_empty() {
            return Err(Error::Config("network.autostart needs network.remote_host".to_string()));
        }

        let buffers = &self.buffers;
        if !(2048..=65536).contains(&buffers.buffer_size) {
            return Err(Error::Config(format!(
                "buffers.buffer_size {} must be in 2048..=65536",
                buffers.buffer_size
            )));
        }
        if !(512..=32768).contains(&buffers.prebuffer_size) {
            return Err(Error::Config(format!(
                "buffers.prebuffer_size {} must be in 512..=32768",
                buffers.prebuffer_size
            )));
        }
        if buffers.prebuffer_size >= buffers.buffer_size {
            return Err(Error::Config(format!(
                "buffers.prebuffer_size ({}) must be less than buffers.buffer_size ({})",
                buffers.prebuffer_size, buffers.buffer_size
            )));
        }

        if !self.audio.mic_gain.is_finite() || self.audio.mic_gain < 0.0 {
            return Err(Error::Config(format!("audio.mic_gain {} is invalid", self.audio.mic_gain)));
        }
        if !self.audio.volume.is_finite() || self.audio.volume < 0.0 {
            return Err(Error::Config(format!("audio.volume {} is invalid", self.audio.volume)));
        }

        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.aec.sample_rate) {
            return Err(Error::Config(format!(
                "aec.sample_rate {} must be in {}..={}",
                self.aec.sample_rate, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
            )));
        }
        if !(MIN_FILTER_LENGTH..=MAX_FILTER_LENGTH).contains(&self.aec.filter_length) {
            return Err(Error::Config(format!(
                "aec.filter_length {} must be in {}..={}",
                self.aec.filter_length, MIN_FILTER_LENGTH, MAX_FILTER_LENGTH
            )));
        }

        Ok(())
    }

    /// The configured peer, if a remote host is set
    pub fn peer(&self) -> Option<PeerEndpoint> {
        let host = self.network.remote_host.trim();
        (!host.is_empty()).then(|| PeerEndpoint::fixed(host, self.network.remote_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.network.listen_port, 12346);
        assert_eq!(config.buffers.buffer_size, 8192);
        assert_eq!(config.buffers.prebuffer_size, 2048);
        assert_eq!(config.audio.mic_gain, 4.0);
        assert_eq!(config.aec.filter_length, 4);
        assert!(config.peer().is_none());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [network]
            remote_host = "192.168.1.50"

            [aec]
            enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.network.remote_port, 12346);
        assert!(config.aec.enabled);
        assert_eq!(config.aec.sample_rate, 16_000);
        assert!(matches!(
            config.peer(),
            Some(PeerEndpoint::Fixed { ref host, port: 12346 }) if host == "192.168.1.50"
        ));
    }

    #[test]
    fn test_validation_rules() {
        let mut config = AppConfig::default();
        config.buffers.prebuffer_size = 8192;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.buffers.buffer_size = 1024;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.network.listen_port = 80;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.aec.filter_length = 11;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.aec.sample_rate = 4000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.mic_gain = f32::INFINITY;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.network.autostart = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("intercom-config-{}", std::process::id()));
        let path = dir.join("intercom.toml");

        let mut config = AppConfig::default();
        config.network.remote_host = "intercom-kitchen.local".to_string();
        config.audio.dc_offset_removal = true;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded, config);

        fs::remove_dir_all(&dir).ok();
        assert!(AppConfig::load_or_default(Some(&path)).is_err());
    }
}
