//! Audio device enumeration and capability probing

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use crate::error::AudioError;

/// Native format of one device direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// What the host can open, per direction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceProbe {
    pub input: Option<DeviceFormat>,
    pub output: Option<DeviceFormat>,
    pub input_name: Option<String>,
    pub output_name: Option<String>,
}

/// Device listing entry for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// Wrapper around a cpal device
pub struct AudioDevice {
    inner: cpal::Device,
    pub name: String,
}

impl AudioDevice {
    pub fn from_cpal(device: cpal::Device) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        Self {
            inner: device,
            name,
        }
    }

    pub fn into_inner(self) -> cpal::Device {
        self.inner
    }

    pub fn input_format(&self) -> Result<DeviceFormat, AudioError> {
        let config = self
            .inner
            .default_input_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
        Ok(DeviceFormat {
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
        })
    }

    pub fn output_format(&self) -> Result<DeviceFormat, AudioError> {
        let config = self
            .inner
            .default_output_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
        Ok(DeviceFormat {
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
        })
    }
}

/// Default input device of the default host
pub fn default_input_device() -> Result<AudioDevice, AudioError> {
    cpal::default_host()
        .default_input_device()
        .map(AudioDevice::from_cpal)
        .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string()))
}

/// Default output device of the default host
pub fn default_output_device() -> Result<AudioDevice, AudioError> {
    cpal::default_host()
        .default_output_device()
        .map(AudioDevice::from_cpal)
        .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()))
}

/// Probe both default devices. A missing direction is reported, not an error.
pub fn probe_default_devices() -> DeviceProbe {
    let mut probe = DeviceProbe::default();

    match default_input_device().and_then(|d| Ok((d.input_format()?, d.name))) {
        Ok((format, name)) => {
            probe.input = Some(format);
            probe.input_name = Some(name);
        }
        Err(e) => tracing::warn!("No usable input device: {}", e),
    }
    match default_output_device().and_then(|d| Ok((d.output_format()?, d.name))) {
        Ok((format, name)) => {
            probe.output = Some(format);
            probe.output_name = Some(name);
        }
        Err(e) => tracing::warn!("No usable output device: {}", e),
    }
    probe
}

/// List all devices of the default host
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<AudioDeviceInfo> = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = device_capabilities(&device, true);
                devices.push(AudioDeviceInfo {
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            let Ok(name) = device.name() else { continue };
            let is_default = default_output_name.as_ref() == Some(&name);
            if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                existing.is_output = true;
                existing.is_default |= is_default;
                continue;
            }
            let (sample_rates, channels) = device_capabilities(&device, false);
            devices.push(AudioDeviceInfo {
                name,
                is_input: false,
                is_output: true,
                is_default,
                sample_rates,
                channels,
            });
        }
    }

    devices
}

fn device_capabilities(device: &cpal::Device, is_input: bool) -> (Vec<u32>, Vec<u16>) {
    let configs: Vec<cpal::SupportedStreamConfigRange> = if is_input {
        device
            .supported_input_configs()
            .map(|c| c.collect())
            .unwrap_or_default()
    } else {
        device
            .supported_output_configs()
            .map(|c| c.collect())
            .unwrap_or_default()
    };

    let mut rates = Vec::new();
    let mut channels = Vec::new();
    for config in configs {
        for rate in [16000u32, 44100, 48000, 96000] {
            let sr = cpal::SampleRate(rate);
            if sr >= config.min_sample_rate() && sr <= config.max_sample_rate() && !rates.contains(&rate) {
                rates.push(rate);
            }
        }
        if !channels.contains(&config.channels()) {
            channels.push(config.channels());
        }
    }
    rates.sort_unstable();
    channels.sort_unstable();
    (rates, channels)
}
