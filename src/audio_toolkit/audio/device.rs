use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait};

/// An input device paired with its human-readable name, as shown in
/// device pickers and matched against the configured microphone.
pub struct CpalDeviceInfo {
    pub name: String,
    pub device: cpal::Device,
}

pub fn list_input_devices() -> Result<Vec<CpalDeviceInfo>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .context("failed to enumerate input devices")?;

    let mut result = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            result.push(CpalDeviceInfo { name, device });
        }
    }
    Ok(result)
}

/// Resolve a configured device name, falling back to the default input
/// device when the name is absent or no longer present.
pub fn resolve_input_device(name: Option<&str>) -> Option<cpal::Device> {
    let host = cpal::default_host();
    if let Some(name) = name {
        if let Ok(devices) = host.input_devices() {
            for device in devices {
                if device.name().map(|n| n == name).unwrap_or(false) {
                    return Some(device);
                }
            }
        }
        log::debug!("Input device '{}' not found, using default", name);
    }
    host.default_input_device()
}
