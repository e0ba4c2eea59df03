//! Audio device enumeration and lookup
//!
//! Device ids carry a direction prefix (`input:<name>` / `output:<name>`) so a
//! single string identifies the endpoint in configuration files and in the
//! control API.

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use crate::constants::SAMPLE_RATE;
use crate::error::AudioError;

/// Rates probed when describing a device
const PROBE_RATES: [u32; 6] = [8_000, 16_000, 22_050, 32_000, 44_100, 48_000];

/// Serializable description of an audio endpoint
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
    /// Whether the device can run at the intercom sample rate natively
    pub supports_intercom_rate: bool,
}

/// Which side of a device to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// Wrapper around a cpal device
pub struct AudioDevice {
    inner: cpal::Device,
    pub name: String,
    pub direction: Direction,
}

impl AudioDevice {
    pub fn from_cpal(device: cpal::Device, direction: Direction) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        Self {
            inner: device,
            name,
            direction,
        }
    }

    pub fn inner(&self) -> &cpal::Device {
        &self.inner
    }

    pub fn into_inner(self) -> cpal::Device {
        self.inner
    }

    /// Supported stream configurations for this device's direction
    pub fn supported_configs(&self) -> Result<Vec<cpal::SupportedStreamConfigRange>, AudioError> {
        let configs = match self.direction {
            Direction::Input => self.inner.supported_input_configs().map(|iter| iter.collect()),
            Direction::Output => self.inner.supported_output_configs().map(|iter| iter.collect()),
        };
        configs.map_err(|e| AudioError::DeviceNotFound(e.to_string()))
    }
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<AudioDeviceInfo> = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            let Ok(name) = device.name() else { continue };
            let (sample_rates, channels) = device_capabilities(&device, Direction::Input);

            devices.push(AudioDeviceInfo {
                id: format!("input:{}", name),
                is_default: default_input_name.as_ref() == Some(&name),
                name,
                is_input: true,
                is_output: false,
                supports_intercom_rate: sample_rates.contains(&SAMPLE_RATE),
                sample_rates,
                channels,
            });
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            let Ok(name) = device.name() else { continue };
            let is_default = default_output_name.as_ref() == Some(&name);

            // Duplex-capable endpoints show up once
            if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                existing.is_output = true;
                existing.is_default |= is_default;
                continue;
            }

            let (sample_rates, channels) = device_capabilities(&device, Direction::Output);
            devices.push(AudioDeviceInfo {
                id: format!("output:{}", name),
                name,
                is_input: false,
                is_output: true,
                is_default,
                supports_intercom_rate: sample_rates.contains(&SAMPLE_RATE),
                sample_rates,
                channels,
            });
        }
    }

    devices
}

fn device_capabilities(device: &cpal::Device, direction: Direction) -> (Vec<u32>, Vec<u16>) {
    let configs: Vec<cpal::SupportedStreamConfigRange> = match direction {
        Direction::Input => device
            .supported_input_configs()
            .map(|iter| iter.collect())
            .unwrap_or_default(),
        Direction::Output => device
            .supported_output_configs()
            .map(|iter| iter.collect())
            .unwrap_or_default(),
    };

    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();
    for config in &configs {
        for rate in PROBE_RATES {
            let covered = cpal::SampleRate(rate) >= config.min_sample_rate()
                && cpal::SampleRate(rate) <= config.max_sample_rate();
            if covered && !sample_rates.contains(&rate) {
                sample_rates.push(rate);
            }
        }
        if !channels.contains(&config.channels()) {
            channels.push(config.channels());
        }
    }

    sample_rates.sort_unstable();
    channels.sort_unstable();
    (sample_rates, channels)
}

/// Split a device id into its direction and name. Ids without a prefix are
/// taken as input devices.
pub fn parse_device_id(id: &str) -> (Direction, &str) {
    if let Some(name) = id.strip_prefix("input:") {
        (Direction::Input, name)
    } else if let Some(name) = id.strip_prefix("output:") {
        (Direction::Output, name)
    } else {
        (Direction::Input, id)
    }
}

/// Get a device by its id
pub fn get_device_by_id(id: &str) -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();
    let (direction, name) = parse_device_id(id);

    let devices = match direction {
        Direction::Input => host.input_devices(),
        Direction::Output => host.output_devices(),
    }
    .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    devices
        .into_iter()
        .find(|device| device.name().map(|n| n == name).unwrap_or(false))
        .map(|device| AudioDevice::from_cpal(device, direction))
        .ok_or_else(|| AudioError::DeviceNotFound(id.to_string()))
}

/// Get default input device
pub fn get_default_input_device() -> Result<AudioDevice, AudioError> {
    cpal::default_host()
        .default_input_device()
        .map(|d| AudioDevice::from_cpal(d, Direction::Input))
        .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string()))
}

/// Get default output device
pub fn get_default_output_device() -> Result<AudioDevice, AudioError> {
    cpal::default_host()
        .default_output_device()
        .map(|d| AudioDevice::from_cpal(d, Direction::Output))
        .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()))
}

/// Resolve a configured device: an id, the literal `default`, or nothing
/// (also the default)
pub fn resolve_device(id: Option<&str>, direction: Direction) -> Result<AudioDevice, AudioError> {
    match id {
        Some(id) if !id.is_empty() && id != "default" => get_device_by_id(id),
        _ => match direction {
            Direction::Input => get_default_input_device(),
            Direction::Output => get_default_output_device(),
        },
    }
}
