use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use log::{debug, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no input device available")]
    NoDevice,
    #[error("failed to enumerate input devices: {0}")]
    Enumerate(String),
    #[error("no usable stream configuration: {0}")]
    Configure(String),
    #[error("failed to open input stream: {0}")]
    Stream(String),
    #[error("failed to initialize resampler: {0}")]
    Resampler(String),
}

pub struct CpalDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub device: cpal::Device,
}

pub fn list_input_devices() -> Result<Vec<CpalDeviceInfo>, DeviceError> {
    let host = cpal::default_host();
    let default_name = host
        .default_input_device()
        .and_then(|d| d.name().ok())
        .unwrap_or_default();

    let devices = host
        .input_devices()
        .map_err(|e| DeviceError::Enumerate(e.to_string()))?;

    let mut infos = Vec::new();
    for device in devices {
        let name = device
            .name()
            .unwrap_or_else(|_| "Unknown Device".to_string());
        let is_default = name == default_name;
        infos.push(CpalDeviceInfo {
            name,
            is_default,
            device,
        });
    }
    Ok(infos)
}

pub struct SelectedDevice {
    pub device: cpal::Device,
    pub name: String,
    /// The configured device was absent and the system default was used
    /// instead. The caller persists this back to configuration.
    pub fell_back: bool,
}

/// Select the named input device, falling back to the system default when the
/// name is unset or no longer present.
pub fn select_input_device(preferred: Option<&str>) -> Result<SelectedDevice, DeviceError> {
    if let Some(wanted) = preferred {
        match list_input_devices() {
            Ok(devices) => {
                for info in devices {
                    if info.name == wanted {
                        return Ok(SelectedDevice {
                            name: info.name,
                            device: info.device,
                            fell_back: false,
                        });
                    }
                }
                warn!("Input device '{}' not found, using system default", wanted);
            }
            Err(e) => {
                warn!("Failed to list input devices, using default: {}", e);
            }
        }
    }

    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(DeviceError::NoDevice)?;
    let name = device
        .name()
        .map_err(|e| DeviceError::Enumerate(e.to_string()))?;
    Ok(SelectedDevice {
        device,
        name,
        fell_back: preferred.is_some(),
    })
}

pub struct CaptureConfig {
    pub stream: StreamConfig,
    pub sample_format: SampleFormat,
    /// Rate frames actually arrive at; differs from the target when the
    /// device refused it, in which case every buffer is resampled.
    pub capture_rate: u32,
}

/// Negotiate a capture configuration: the target rate when the device
/// supports it, otherwise the device's default rate (resampled downstream).
pub fn negotiate_capture_config(
    device: &cpal::Device,
    target_rate: u32,
) -> Result<CaptureConfig, DeviceError> {
    let supported = device
        .supported_input_configs()
        .map_err(|e| DeviceError::Configure(e.to_string()))?;

    for range in supported {
        if range.min_sample_rate().0 <= target_rate && target_rate <= range.max_sample_rate().0 {
            let cfg = range.with_sample_rate(SampleRate(target_rate));
            let sample_format = cfg.sample_format();
            debug!("Capturing natively at {} Hz ({:?})", target_rate, sample_format);
            return Ok(CaptureConfig {
                stream: cfg.into(),
                sample_format,
                capture_rate: target_rate,
            });
        }
    }

    let default = device
        .default_input_config()
        .map_err(|e| DeviceError::Configure(e.to_string()))?;
    let capture_rate = default.sample_rate().0;
    let sample_format = default.sample_format();
    debug!(
        "Target rate {} Hz unsupported, capturing at {} Hz and resampling",
        target_rate, capture_rate
    );
    Ok(CaptureConfig {
        stream: default.into(),
        sample_format,
        capture_rate,
    })
}
