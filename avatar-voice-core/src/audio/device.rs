//! Audio device enumeration and name resolution.

use serde::{Deserialize, Serialize};

/// Which side of the audio path a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Metadata about one audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub direction: DeviceDirection,
    /// Whether this is the system default for its direction.
    pub is_default: bool,
    /// Heuristic flag for inputs that likely capture system output audio.
    pub is_loopback_like: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "monitor of",
];

/// Best-effort check for inputs that record the speakers instead of a mic.
///
/// Capturing those would make the avatar hear its own voice.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
fn sort_devices(list: &mut [DeviceInfo]) {
    list.sort_by_key(|d| (!d.is_default, d.is_loopback_like, d.name.to_ascii_lowercase()));
}

#[cfg(feature = "audio-cpal")]
mod cpal_impl {
    use cpal::traits::{DeviceTrait, HostTrait};
    use tracing::warn;

    use super::{is_loopback_like_name, sort_devices, DeviceDirection, DeviceInfo};
    use crate::error::{Result, VoiceError};

    fn describe(
        devices: impl Iterator<Item = cpal::Device>,
        default_name: Option<String>,
        direction: DeviceDirection,
    ) -> Vec<DeviceInfo> {
        let mut list: Vec<DeviceInfo> = devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Device {}", idx + 1));
                DeviceInfo {
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    is_loopback_like: direction == DeviceDirection::Input
                        && is_loopback_like_name(&name),
                    name,
                    direction,
                }
            })
            .collect();
        sort_devices(&mut list);
        list
    }

    pub fn list_input_devices() -> Vec<DeviceInfo> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());
        match host.input_devices() {
            Ok(devices) => describe(devices, default_name, DeviceDirection::Input),
            Err(e) => {
                warn!("failed to enumerate input devices: {e}");
                Vec::new()
            }
        }
    }

    pub fn list_output_devices() -> Vec<DeviceInfo> {
        let host = cpal::default_host();
        let default_name = host.default_output_device().and_then(|d| d.name().ok());
        match host.output_devices() {
            Ok(devices) => describe(devices, default_name, DeviceDirection::Output),
            Err(e) => {
                warn!("failed to enumerate output devices: {e}");
                Vec::new()
            }
        }
    }

    fn find_named(
        devices: std::result::Result<impl Iterator<Item = cpal::Device>, cpal::DevicesError>,
        preferred: &str,
    ) -> Option<cpal::Device> {
        match devices {
            Ok(mut devices) => {
                let found = devices.find(|d| d.name().map(|n| n == preferred).unwrap_or(false));
                if found.is_none() {
                    warn!("preferred device '{preferred}' not found, falling back to default");
                }
                found
            }
            Err(e) => {
                warn!("failed to list devices while resolving preference: {e}");
                None
            }
        }
    }

    /// Preferred name, then the system default, then the first device listed.
    pub fn resolve_input_device(preferred: Option<&str>) -> Result<cpal::Device> {
        let host = cpal::default_host();
        if let Some(device) = preferred.and_then(|name| find_named(host.input_devices(), name)) {
            return Ok(device);
        }
        if let Some(device) = host.default_input_device() {
            return Ok(device);
        }
        let mut devices = host
            .input_devices()
            .map_err(|e| VoiceError::AudioDevice(e.to_string()))?;
        let fallback = devices.next().ok_or(VoiceError::NoDefaultInputDevice)?;
        warn!("no default input device, falling back to first available input");
        Ok(fallback)
    }

    pub fn resolve_output_device(preferred: Option<&str>) -> Result<cpal::Device> {
        let host = cpal::default_host();
        if let Some(device) = preferred.and_then(|name| find_named(host.output_devices(), name)) {
            return Ok(device);
        }
        if let Some(device) = host.default_output_device() {
            return Ok(device);
        }
        let mut devices = host
            .output_devices()
            .map_err(|e| VoiceError::AudioDevice(e.to_string()))?;
        let fallback = devices.next().ok_or(VoiceError::NoDefaultOutputDevice)?;
        warn!("no default output device, falling back to first available output");
        Ok(fallback)
    }
}

#[cfg(feature = "audio-cpal")]
pub use cpal_impl::{list_input_devices, list_output_devices};
#[cfg(feature = "audio-cpal")]
pub(crate) use cpal_impl::{resolve_input_device, resolve_output_device};

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    Vec::new()
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    Vec::new()
}
